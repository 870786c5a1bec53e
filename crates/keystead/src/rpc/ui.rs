//! Messages from the trusted UI. These may carry passwords and return the
//! recovery phrase, so they are only accepted on operator-owned or
//! authenticated connections.

use crate::{
    chains::ChainRpc,
    errors::{self, ErrorEnvelope, WalletError},
    lifecycle::{SetupKind, SetupPhase},
    service::WalletHandle,
    signing::{message_bytes, EvmTransaction, Quantity, SignPayload},
    wallet::{validate_phrase, ChainFamily},
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;
use zeroize::Zeroizing;

/// A string field that goes straight into a secret wrapper.
pub struct SecretField(SecretString);

impl<'de> Deserialize<'de> for SecretField {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(Self(SecretString::from(s)))
    }
}

impl fmt::Debug for SecretField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretField(<redacted>)")
    }
}

impl SecretField {
    fn into_secret(self) -> SecretString {
        self.0
    }

    fn into_words(self) -> Zeroizing<String> {
        Zeroizing::new(self.0.expose_secret().to_owned())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendParams {
    /// Decimal amount in the native unit; an alternative to `value` in wei.
    pub amount: Option<String>,
    /// Base64 pre-built transaction, for Solana networks.
    pub transaction: Option<String>,
    pub co_signers: Vec<String>,
    #[serde(flatten)]
    pub tx: EvmTransaction,
}

#[derive(Debug, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum UiMessage {
    CreateWallet {
        password: SecretField,
    },
    UnlockWallet {
        password: SecretField,
    },
    LockWallet,
    RecoverWallet {
        seed_phrase: SecretField,
        password: SecretField,
    },
    GetWalletState,
    SwitchNetwork {
        network: String,
    },
    SendTransaction {
        params: SendParams,
    },
    SignMessage {
        address: String,
        message: String,
    },
    EstimateGas {
        params: EvmTransaction,
    },
    CompleteSetup,
    BeginSetup,
    ChooseSetup {
        kind: SetupKind,
    },
    AcknowledgeBackup,
    ConfirmSeed {
        words: SecretField,
    },
    ResumeSetup {
        #[serde(default)]
        password: Option<SecretField>,
    },
    DiscardSetup,
    WipeWallet {
        #[serde(default)]
        password: Option<SecretField>,
    },
    GetNetworks,
    /// Checks a phrase before the recover form submits it. Nothing is stored.
    ValidatePhrase {
        seed_phrase: SecretField,
    },
    AddAccount {
        chain: ChainFamily,
        password: SecretField,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl UiResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn err(id: Option<Value>, e: ErrorEnvelope) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(e.message),
            code: Some(e.code),
        }
    }
}

pub async fn handle<C: ChainRpc>(wallet: &WalletHandle, chains: &C, raw: Value) -> UiResponse {
    let id = raw.get("id").cloned();
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let out = match serde_json::from_value::<UiMessage>(raw) {
        Ok(UiMessage::Unknown) => Err(WalletError::UnknownMethod(kind.clone()).into()),
        Ok(msg) => dispatch(wallet, chains, msg).await,
        Err(e) => Err(WalletError::invalid_params(format!("{kind}: {e}")).into()),
    };
    match out {
        Ok(v) => UiResponse::ok(id, v),
        Err(e) => {
            tracing::debug!(kind, error = %e, "ui request failed");
            UiResponse::err(id, ErrorEnvelope::from_report(&e))
        }
    }
}

async fn state(wallet: &WalletHandle) -> eyre::Result<Value> {
    Ok(serde_json::to_value(wallet.status().await?)?)
}

async fn dispatch<C: ChainRpc>(wallet: &WalletHandle, chains: &C, msg: UiMessage) -> eyre::Result<Value> {
    match msg {
        UiMessage::CreateWallet { password } => {
            let created = wallet.create_wallet(password.into_secret()).await?;
            Ok(json!({
                "mnemonic": created.mnemonic.as_str(),
                "accounts": created.accounts.addresses(),
                "phase": SetupPhase::ViewingSeed,
            }))
        }
        UiMessage::UnlockWallet { password } => {
            wallet.unlock(password.into_secret()).await?;
            state(wallet).await
        }
        UiMessage::LockWallet => {
            wallet.lock().await?;
            state(wallet).await
        }
        UiMessage::RecoverWallet {
            seed_phrase,
            password,
        } => {
            let accounts = wallet
                .recover(seed_phrase.into_words(), password.into_secret())
                .await?;
            Ok(json!({ "accounts": accounts.addresses(), "phase": SetupPhase::Complete }))
        }
        UiMessage::GetWalletState => state(wallet).await,
        UiMessage::SwitchNetwork { network } => {
            Ok(serde_json::to_value(wallet.switch_network(network).await?)?)
        }
        UiMessage::SendTransaction { params } => send_transaction(wallet, chains, params).await,
        UiMessage::SignMessage { address, message } => {
            let (_, network) = wallet.networks().await?;
            let payload = match network.family {
                ChainFamily::Ethereum => SignPayload::EvmMessage(message_bytes(&message)),
                ChainFamily::Solana => SignPayload::SolanaMessage(message.into_bytes()),
            };
            Ok(serde_json::to_value(wallet.sign(network.id, address, payload).await?)?)
        }
        UiMessage::EstimateGas { params } => estimate_gas(wallet, chains, params).await,
        UiMessage::CompleteSetup => {
            wallet.finish_setup().await?;
            state(wallet).await
        }
        UiMessage::BeginSetup => {
            wallet.begin_setup().await?;
            state(wallet).await
        }
        UiMessage::ChooseSetup { kind } => Ok(json!({ "phase": wallet.choose(kind).await? })),
        UiMessage::AcknowledgeBackup => {
            wallet.acknowledge_backup().await?;
            state(wallet).await
        }
        UiMessage::ConfirmSeed { words } => {
            wallet.confirm_seed(words.into_words()).await?;
            state(wallet).await
        }
        UiMessage::ResumeSetup { password } => {
            let resumed = wallet
                .resume_setup(password.map(SecretField::into_secret))
                .await?;
            Ok(json!({
                "phase": resumed.phase,
                "mnemonic": resumed.mnemonic.as_deref().map(String::as_str),
            }))
        }
        UiMessage::DiscardSetup => {
            wallet.discard_setup().await?;
            state(wallet).await
        }
        UiMessage::WipeWallet { password } => {
            wallet.wipe(password.map(SecretField::into_secret)).await?;
            state(wallet).await
        }
        UiMessage::GetNetworks => {
            let (networks, selected) = wallet.networks().await?;
            Ok(json!({ "networks": networks, "selected": selected.id }))
        }
        UiMessage::ValidatePhrase { seed_phrase } => {
            Ok(json!({ "valid": validate_phrase(&seed_phrase.into_words()) }))
        }
        UiMessage::AddAccount { chain, password } => {
            Ok(serde_json::to_value(wallet.add_account(chain, password.into_secret()).await?)?)
        }
        UiMessage::Unknown => Err(WalletError::UnknownMethod(String::new()).into()),
    }
}

fn parse_amount(amount: &str) -> Result<Quantity, WalletError> {
    alloy::primitives::utils::parse_ether(amount.trim())
        .map(Quantity::hex)
        .map_err(|e| WalletError::invalid_params(format!("invalid amount {amount:?}: {e}")))
}

/// Prepare against the chain, sign in the actor, then broadcast. The network
/// is fixed when the request arrives; a later switch makes the signature
/// step fail instead of redirecting the send.
async fn send_transaction<C: ChainRpc>(
    wallet: &WalletHandle,
    chains: &C,
    params: SendParams,
) -> eyre::Result<Value> {
    let status = wallet.status().await?;
    if status.is_locked {
        return Err(WalletError::WalletLocked.into());
    }
    let network = status.network;
    let from = params
        .tx
        .from
        .clone()
        .or(status.address)
        .ok_or_else(|| WalletError::AccountNotFound(format!("no {} account", network.family)))?;

    match network.family {
        ChainFamily::Ethereum => {
            let mut tx = params.tx;
            if let Some(amount) = params.amount.as_deref() {
                if tx.value.is_some() {
                    return Err(WalletError::invalid_params("give either value or amount, not both").into());
                }
                tx.value = Some(parse_amount(amount)?);
            }
            tx.from = Some(from.clone());
            let tx = chains
                .prepare_evm_transaction(&network, &from, tx)
                .await
                .map_err(errors::from_collaborator)?;
            let signed = wallet
                .sign(network.id.clone(), from.clone(), SignPayload::EvmTransaction(tx))
                .await?;
            let hash = chains
                .broadcast(&network, &signed)
                .await
                .map_err(errors::from_collaborator)?;
            Ok(json!({ "hash": hash, "network": network.id }))
        }
        ChainFamily::Solana => {
            let transaction = params.transaction.ok_or_else(|| {
                WalletError::invalid_params("transaction (base64) is required on solana networks")
            })?;
            let payload = SignPayload::SolanaTransaction {
                transaction,
                co_signers: params.co_signers,
            };
            let signed = wallet.sign(network.id.clone(), from, payload).await?;
            let signature = chains
                .broadcast(&network, &signed)
                .await
                .map_err(errors::from_collaborator)?;
            Ok(json!({ "signature": signature, "network": network.id }))
        }
    }
}

async fn estimate_gas<C: ChainRpc>(
    wallet: &WalletHandle,
    chains: &C,
    mut tx: EvmTransaction,
) -> eyre::Result<Value> {
    let status = wallet.status().await?;
    let network = status.network;
    if network.family != ChainFamily::Ethereum {
        return Err(WalletError::invalid_params(format!(
            "gas estimates need an ethereum network; {} is selected",
            network.id
        ))
        .into());
    }
    if tx.from.is_none() {
        tx.from = status.address;
    }
    let gas = chains
        .estimate_gas(&network, &tx)
        .await
        .map_err(errors::from_collaborator)?;
    Ok(json!({ "gasLimit": Quantity::hex(gas), "network": network.id }))
}
