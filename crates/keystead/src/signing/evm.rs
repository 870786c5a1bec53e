use super::{EvmTransaction, Quantity, SignatureOutput};
use crate::errors::WalletError;
use alloy::{
    consensus::{SignableTransaction as _, TxEip1559, TxEnvelope, TxLegacy},
    eips::{eip2718::Encodable2718 as _, eip2930::AccessList},
    primitives::{Address, Bytes, TxKind, B256, U256},
    signers::{local::PrivateKeySigner, SignerSync as _},
};
use eyre::Context as _;
use std::str::FromStr as _;

fn signer(secret: &[u8]) -> eyre::Result<PrivateKeySigner> {
    PrivateKeySigner::from_slice(secret).map_err(|e| eyre::eyre!("load evm key: {e}"))
}

/// Checksummed address of a stored secp256k1 secret.
pub fn address_of(secret: &[u8]) -> eyre::Result<String> {
    Ok(signer(secret)?.address().to_checksum(None))
}

pub fn parse_address(s: &str) -> Result<Address, WalletError> {
    Address::from_str(s.trim())
        .map_err(|e| WalletError::invalid_params(format!("invalid address {s:?}: {e}")))
}

pub(crate) fn parse_data(data: Option<&str>) -> Result<Bytes, WalletError> {
    let Some(d) = data.map(str::trim).filter(|d| !d.is_empty() && *d != "0x") else {
        return Ok(Bytes::new());
    };
    hex::decode(d.strip_prefix("0x").unwrap_or(d))
        .map(Bytes::from)
        .map_err(|e| WalletError::invalid_params(format!("data is not hex: {e}")))
}

enum FeeMode {
    Eip1559 { max_fee: u128, priority: u128 },
    Legacy { gas_price: u128 },
}

fn fee_mode(tx: &EvmTransaction) -> Result<FeeMode, WalletError> {
    match (
        &tx.max_fee_per_gas,
        &tx.max_priority_fee_per_gas,
        &tx.gas_price,
    ) {
        (Some(max_fee), Some(priority), _) => Ok(FeeMode::Eip1559 {
            max_fee: max_fee.to_u128()?,
            priority: priority.to_u128()?,
        }),
        (Some(_), None, _) | (None, Some(_), _) => Err(WalletError::invalid_params(
            "maxFeePerGas and maxPriorityFeePerGas must be given together",
        )),
        (None, None, Some(gas_price)) => Ok(FeeMode::Legacy {
            gas_price: gas_price.to_u128()?,
        }),
        (None, None, None) => Err(WalletError::invalid_params(
            "gasPrice or maxFeePerGas/maxPriorityFeePerGas is required",
        )),
    }
}

fn required<'a>(field: &'static str, q: Option<&'a Quantity>) -> Result<&'a Quantity, WalletError> {
    q.ok_or_else(|| WalletError::invalid_params(format!("{field} is required")))
}

/// Sign a fully specified transaction. Nothing is defaulted except an empty
/// value and calldata; nonce, gas limit and fees must be supplied.
pub fn sign_transaction(
    secret: &[u8],
    chain_id: u64,
    tx: &EvmTransaction,
) -> eyre::Result<SignatureOutput> {
    let signer = signer(secret)?;
    if let Some(from) = &tx.from {
        if parse_address(from)? != signer.address() {
            return Err(WalletError::invalid_params("from does not match the signing account").into());
        }
    }
    if let Some(requested) = &tx.chain_id {
        if requested.to_u64()? != chain_id {
            return Err(WalletError::invalid_params(format!(
                "chainId {} does not match network chain {chain_id}",
                requested.to_u64()?
            ))
            .into());
        }
    }

    let nonce = required("nonce", tx.nonce.as_ref())?.to_u64()?;
    let gas_limit = required("gasLimit", tx.gas_limit.as_ref())?.to_u64()?;
    let to = match tx.to.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => TxKind::Call(parse_address(s)?),
        _ => TxKind::Create,
    };
    let value = tx
        .value
        .as_ref()
        .map(Quantity::to_u256)
        .transpose()?
        .unwrap_or(U256::ZERO);
    let input = parse_data(tx.data.as_deref())?;

    let (envelope, tx_hash): (TxEnvelope, B256) = match fee_mode(tx)? {
        FeeMode::Eip1559 { max_fee, priority } => {
            let consensus_tx = TxEip1559 {
                chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
                to,
                value,
                input,
                access_list: AccessList::default(),
            };
            let sig = signer
                .sign_hash_sync(&consensus_tx.signature_hash())
                .context("sign eip1559")?;
            let signed = consensus_tx.into_signed(sig);
            let hash = *signed.hash();
            (TxEnvelope::Eip1559(signed), hash)
        }
        FeeMode::Legacy { gas_price } => {
            let consensus_tx = TxLegacy {
                chain_id: Some(chain_id),
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                input,
            };
            let sig = signer
                .sign_hash_sync(&consensus_tx.signature_hash())
                .context("sign legacy")?;
            let signed = consensus_tx.into_signed(sig);
            let hash = *signed.hash();
            (TxEnvelope::Legacy(signed), hash)
        }
    };

    Ok(SignatureOutput::EvmTransaction {
        raw_transaction: format!("0x{}", hex::encode(envelope.encoded_2718())),
        tx_hash: format!("{tx_hash:#x}"),
    })
}

/// EIP-191 `personal_sign`: 65-byte r||s||v as `0x` hex.
pub fn sign_message(secret: &[u8], message: &[u8]) -> eyre::Result<SignatureOutput> {
    let sig = signer(secret)?
        .sign_message_sync(message)
        .context("sign message")?;
    Ok(SignatureOutput::EvmMessage {
        signature: format!("0x{}", hex::encode(sig.as_bytes())),
    })
}
