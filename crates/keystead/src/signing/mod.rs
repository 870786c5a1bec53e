pub mod evm;
pub mod solana;

use crate::{
    errors::WalletError,
    keystore::SecretVault,
    network::NetworkRegistry,
    wallet::{Account, AccountBook, ChainFamily},
};
use alloy::primitives::{ruint::UintTryFrom, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr as _;

/// A JSON quantity: a number, a decimal string or a `0x` hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(u64),
    Text(String),
}

impl Quantity {
    pub fn to_u256(&self) -> Result<U256, WalletError> {
        match self {
            Self::Number(n) => Ok(U256::from(*n)),
            Self::Text(s) => U256::from_str(s.trim())
                .map_err(|e| WalletError::invalid_params(format!("invalid quantity {s:?}: {e}"))),
        }
    }

    pub fn to_u64(&self) -> Result<u64, WalletError> {
        u64::try_from(self.to_u256()?)
            .map_err(|_overflow| WalletError::invalid_params("quantity exceeds u64"))
    }

    pub fn to_u128(&self) -> Result<u128, WalletError> {
        u128::try_from(self.to_u256()?)
            .map_err(|_overflow| WalletError::invalid_params("quantity exceeds u128"))
    }

    pub fn hex<T>(v: T) -> Self
    where
        U256: UintTryFrom<T>,
    {
        Self::Text(format!("{:#x}", U256::from(v)))
    }
}

/// Ethereum-family transaction fields as a page or UI supplies them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvmTransaction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(alias = "gas", skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<Quantity>,
}

impl EvmTransaction {
    pub const fn has_fees(&self) -> bool {
        self.gas_price.is_some()
            || (self.max_fee_per_gas.is_some() && self.max_priority_fee_per_gas.is_some())
    }

    /// Everything a signer needs without consulting the chain.
    pub const fn is_complete(&self) -> bool {
        self.nonce.is_some() && self.gas_limit.is_some() && self.has_fees()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignPayload {
    EvmTransaction(EvmTransaction),
    /// EIP-191 personal message.
    EvmMessage(Vec<u8>),
    /// Base64 bincode `VersionedTransaction`, optionally co-signed by more
    /// local accounts.
    SolanaTransaction {
        transaction: String,
        co_signers: Vec<String>,
    },
    SolanaMessage(Vec<u8>),
}

impl SignPayload {
    pub const fn chain(&self) -> ChainFamily {
        match self {
            Self::EvmTransaction(_) | Self::EvmMessage(_) => ChainFamily::Ethereum,
            Self::SolanaTransaction { .. } | Self::SolanaMessage(_) => ChainFamily::Solana,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::EvmTransaction(_) => "evm_transaction",
            Self::EvmMessage(_) => "evm_message",
            Self::SolanaTransaction { .. } => "solana_transaction",
            Self::SolanaMessage(_) => "solana_message",
        }
    }
}

/// What a signature request returns. Signatures and signed payloads only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SignatureOutput {
    #[serde(rename_all = "camelCase")]
    EvmTransaction {
        raw_transaction: String,
        tx_hash: String,
    },
    EvmMessage { signature: String },
    SolanaTransaction {
        transaction: String,
        signatures: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    SolanaMessage {
        signature: String,
        public_key: String,
    },
}

/// Message bytes for `personal_sign`, `eth_sign` and Ethereum UI signing.
///
/// Follows the injected-provider convention: a `0x`-prefixed hex string is
/// signed as the bytes it encodes, so `"0x6869"` signs `hi` and not the six
/// characters. Anything else, including malformed hex, is signed as UTF-8
/// text. Solana messages never pass through here.
pub fn message_bytes(s: &str) -> Vec<u8> {
    s.strip_prefix("0x")
        .and_then(|h| hex::decode(h).ok())
        .unwrap_or_else(|| s.as_bytes().to_vec())
}

/// Gatekeeper between inbound requests and the vault's signing keys.
///
/// Checks run in a fixed order: the account must live on the requested chain,
/// and that chain must be the active network; then the wallet must be
/// unlocked. Only then is the vault consulted.
#[derive(Debug)]
pub struct SigningMediator<'a> {
    pub unlocked: bool,
    pub networks: &'a NetworkRegistry,
    pub accounts: &'a AccountBook,
    pub vault: &'a SecretVault,
}

impl SigningMediator<'_> {
    pub fn request_signature(
        &self,
        chain: &str,
        address: &str,
        payload: &SignPayload,
    ) -> eyre::Result<SignatureOutput> {
        let network = self.networks.by_id(chain)?;
        let account = self.resolve(network.family, address)?;
        if self.networks.selected().id != network.id {
            return Err(WalletError::AccountNotFound(format!(
                "{address} is not an account of the active network {}",
                self.networks.selected().id
            ))
            .into());
        }
        if payload.chain() != network.family {
            return Err(WalletError::invalid_params(format!(
                "{} payload cannot be signed on {}",
                payload.label(),
                network.id
            ))
            .into());
        }

        let mut signers = vec![account];
        if let SignPayload::SolanaTransaction { co_signers, .. } = payload {
            for co in co_signers {
                let extra = self.resolve(network.family, co)?;
                if !signers.iter().any(|s| s.key_ref == extra.key_ref) {
                    signers.push(extra);
                }
            }
        }

        if !self.unlocked {
            return Err(WalletError::WalletLocked.into());
        }

        let out = self.vault.sign_with(network, &signers, payload)?;
        tracing::info!(
            network = %network.id,
            address = %account.address,
            kind = payload.label(),
            signers = signers.len(),
            "signature issued"
        );
        Ok(out)
    }

    fn resolve(&self, chain: ChainFamily, address: &str) -> Result<&Account, WalletError> {
        self.accounts
            .find(chain, address)
            .ok_or_else(|| WalletError::AccountNotFound(format!("{address} on {chain}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryKvStore,
        testkit::{self, ABANDON},
    };
    use eyre::ContextCompat as _;
    use solana_keypair::Keypair;
    use solana_sdk::pubkey::Pubkey;
    use solana_signer::Signer as _;
    use std::sync::Arc;

    #[test]
    fn quantities_parse_hex_decimal_and_numbers() -> eyre::Result<()> {
        assert_eq!(Quantity::Number(21_000).to_u64()?, 21_000);
        assert_eq!(Quantity::Text("0x5208".to_owned()).to_u64()?, 21_000);
        assert_eq!(Quantity::Text("21000".to_owned()).to_u64()?, 21_000);
        assert_eq!(Quantity::hex(255_u64), Quantity::Text("0xff".to_owned()));
        assert!(Quantity::Text("lots".to_owned()).to_u64().is_err(), "garbage");
        assert!(
            Quantity::Text(format!("{:#x}", U256::MAX)).to_u64().is_err(),
            "overflow"
        );
        Ok(())
    }

    #[test]
    fn evm_transaction_accepts_gas_alias() -> eyre::Result<()> {
        let tx: EvmTransaction = serde_json::from_value(serde_json::json!({
            "to": "0x0000000000000000000000000000000000000001",
            "gas": "0x5208",
            "gasPrice": 1_000_000_000_u64,
            "nonce": 0
        }))?;
        assert_eq!(tx.gas_limit, Some(Quantity::Text("0x5208".to_owned())));
        assert!(tx.is_complete(), "nonce, gas and legacy fee present");
        Ok(())
    }

    #[test]
    fn message_bytes_decodes_hex_or_text() {
        assert_eq!(message_bytes("0x6869"), b"hi".to_vec());
        assert_eq!(message_bytes("hi"), b"hi".to_vec());
        assert_eq!(message_bytes("0xnothex"), b"0xnothex".to_vec());
    }

    #[test]
    fn co_signers_must_be_wallet_accounts() -> eyre::Result<()> {
        let mut m = testkit::machine(&Arc::new(MemoryKvStore::default()))?;
        m.recover(ABANDON, &testkit::pw("correct-horse-battery"))?;
        m.finish_setup()?;
        m.switch_network("solana")?;
        let owner = m
            .page_accounts(ChainFamily::Solana)?
            .into_iter()
            .next()
            .context("solana account")?;
        let owner_key = Pubkey::from_str(&owner)?;
        let stranger = Keypair::new().pubkey();

        let payload = SignPayload::SolanaTransaction {
            transaction: testkit::unsigned_solana_tx(&[owner_key, stranger])?,
            co_signers: vec![stranger.to_string()],
        };
        let e = m
            .request_signature("solana", &owner, &payload)
            .err()
            .context("stranger co-signer accepted")?;
        assert!(
            matches!(e.downcast_ref::<WalletError>(), Some(WalletError::AccountNotFound(_))),
            "{e:#}"
        );

        let payload = SignPayload::SolanaTransaction {
            transaction: testkit::unsigned_solana_tx(&[owner_key])?,
            co_signers: vec![owner.clone()],
        };
        let SignatureOutput::SolanaTransaction { signatures, .. } =
            m.request_signature("solana", &owner, &payload)?
        else {
            eyre::bail!("wrong output shape");
        };
        assert_eq!(signatures.len(), 1, "the signer is not repeated as its own co-signer");
        Ok(())
    }
}
