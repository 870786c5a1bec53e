use super::SignatureOutput;
use crate::errors::WalletError;
use base64::Engine as _;
use bincode::Options as _;
use eyre::Context as _;
use solana_keypair::Keypair;
use solana_sdk::{signature::Signature, transaction::VersionedTransaction};
use solana_signer::Signer as _;

/// Largest serialized transaction the network accepts (one packet).
const MAX_TRANSACTION_BYTES: u64 = 1232;

fn keypair(secret: &[u8]) -> eyre::Result<Keypair> {
    Keypair::try_from(secret).map_err(|e| eyre::eyre!("load solana key: {e}"))
}

pub fn address_of(secret: &[u8]) -> eyre::Result<String> {
    Ok(keypair(secret)?.pubkey().to_string())
}

pub fn decode_transaction(tx_b64: &str) -> Result<VersionedTransaction, WalletError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(tx_b64.trim())
        .map_err(|e| WalletError::invalid_params(format!("transaction is not base64: {e}")))?;
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_TRANSACTION_BYTES)
        .deserialize(&bytes)
        .map_err(|e| WalletError::invalid_params(format!("undecodable transaction: {e}")))
}

pub fn encode_transaction(tx: &VersionedTransaction) -> eyre::Result<String> {
    let bytes = bincode::serialize(tx).context("serialize transaction")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Add one signature per local key to a pre-built transaction. Each key must
/// be one of the message's required signers; signatures from other parties
/// already present are left alone.
pub fn sign_transaction(secrets: &[&[u8]], tx_b64: &str) -> eyre::Result<SignatureOutput> {
    let mut tx = decode_transaction(tx_b64)?;
    let message = tx.message.serialize();
    let required = usize::from(tx.message.header().num_required_signatures);
    if tx.signatures.len() != required {
        tx.signatures.resize(required, Signature::default());
    }

    let mut issued = Vec::with_capacity(secrets.len());
    for secret in secrets {
        let kp = keypair(secret)?;
        let pk = kp.pubkey();
        let slot = tx
            .message
            .static_account_keys()
            .iter()
            .take(required)
            .position(|k| k.to_bytes() == pk.to_bytes())
            .ok_or_else(|| {
                WalletError::invalid_params(format!("{pk} is not a required signer"))
            })?;
        let sig = kp.sign_message(&message);
        let dst = tx
            .signatures
            .get_mut(slot)
            .ok_or_else(|| eyre::eyre!("signature slot {slot} out of range"))?;
        *dst = sig;
        issued.push(sig.to_string());
    }

    Ok(SignatureOutput::SolanaTransaction {
        transaction: encode_transaction(&tx)?,
        signatures: issued,
    })
}

pub fn sign_message(secret: &[u8], message: &[u8]) -> eyre::Result<SignatureOutput> {
    let kp = keypair(secret)?;
    Ok(SignatureOutput::SolanaMessage {
        signature: kp.sign_message(message).to_string(),
        public_key: kp.pubkey().to_string(),
    })
}

/// The 64 raw bytes behind a base58 signature.
pub fn signature_bytes(signature: &str) -> eyre::Result<Vec<u8>> {
    let sig: Signature = signature
        .parse()
        .map_err(|e| eyre::eyre!("parse signature: {e}"))?;
    Ok(sig.as_ref().to_vec())
}
