//! Requests from untrusted page contexts.
//!
//! Every method a page may call is a variant of [`EthCall`] or [`SolCall`];
//! anything else is refused before the wallet is consulted. Responses carry
//! addresses, chain ids, signatures and transaction hashes only.

use crate::{
    chains::ChainRpc,
    errors::{self, ErrorEnvelope, WalletError},
    network::Network,
    service::{self, WalletHandle},
    signing::{self, message_bytes, EvmTransaction, Quantity, SignPayload, SignatureOutput},
    wallet::ChainFamily,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::Instrument as _;
use uuid::Uuid;

pub const REQUEST_TYPE: &str = "WEB3_WALLET_REQUEST";
pub const RESPONSE_TYPE: &str = "WEB3_WALLET_RESPONSE";

#[derive(Debug, Clone, Deserialize)]
pub struct PageEnvelope {
    pub provider: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PageResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl PageResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            kind: RESPONSE_TYPE,
            id,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn err(id: Value, e: ErrorEnvelope) -> Self {
        Self {
            kind: RESPONSE_TYPE,
            id,
            result: None,
            error: Some(e.message),
            code: Some(e.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthCall {
    RequestAccounts,
    Accounts,
    ChainId,
    NetVersion,
    /// `personal_sign` and `eth_sign` differ only in parameter order.
    Sign { address: String, message: String },
    SignTransaction(EvmTransaction),
    SendTransaction(EvmTransaction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolCall {
    Connect,
    Disconnect,
    SignTransaction(String),
    SignAllTransactions(Vec<String>),
    SignMessage(SolMessage),
}

/// A Solana message to sign. Injected providers send the raw bytes as a
/// number array and expect the signature back the same way; text is signed
/// as its UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SolMessage {
    Bytes(Vec<u8>),
    Text(String),
}

impl SolMessage {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Text(s) => s.as_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCall {
    Ethereum(EthCall),
    Solana(SolCall),
}

fn param<T: DeserializeOwned>(params: &[Value], i: usize, name: &str) -> Result<T, WalletError> {
    let v = params
        .get(i)
        .cloned()
        .ok_or_else(|| WalletError::invalid_params(format!("missing {name}")))?;
    serde_json::from_value(v).map_err(|e| WalletError::invalid_params(format!("{name}: {e}")))
}

/// Solana transactions arrive either as a bare base64 string or as
/// `{ "transaction": "<base64>" }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum SolTx {
    Bare(String),
    Wrapped { transaction: String },
}

impl From<SolTx> for String {
    fn from(t: SolTx) -> Self {
        match t {
            SolTx::Bare(s) | SolTx::Wrapped { transaction: s } => s,
        }
    }
}

impl PageCall {
    pub fn parse(provider: &str, method: &str, params: &Value) -> Result<Self, WalletError> {
        let family = ChainFamily::from_provider(provider)
            .ok_or_else(|| WalletError::UnknownProvider(provider.to_owned()))?;
        let params: &[Value] = match params {
            Value::Array(a) => a,
            Value::Null => &[],
            _ => return Err(WalletError::invalid_params("params must be an array")),
        };
        let unknown = || WalletError::UnknownMethod(format!("{provider}.{method}"));
        Ok(match family {
            ChainFamily::Ethereum => Self::Ethereum(match method {
                "eth_requestAccounts" => EthCall::RequestAccounts,
                "eth_accounts" => EthCall::Accounts,
                "eth_chainId" => EthCall::ChainId,
                "net_version" => EthCall::NetVersion,
                "personal_sign" => EthCall::Sign {
                    message: param(params, 0, "message")?,
                    address: param(params, 1, "address")?,
                },
                "eth_sign" => EthCall::Sign {
                    address: param(params, 0, "address")?,
                    message: param(params, 1, "message")?,
                },
                "eth_signTransaction" => EthCall::SignTransaction(param(params, 0, "transaction")?),
                "eth_sendTransaction" => EthCall::SendTransaction(param(params, 0, "transaction")?),
                _ => return Err(unknown()),
            }),
            ChainFamily::Solana => Self::Solana(match method {
                "connect" => SolCall::Connect,
                "disconnect" => SolCall::Disconnect,
                "signTransaction" => {
                    SolCall::SignTransaction(param::<SolTx>(params, 0, "transaction")?.into())
                }
                "signAllTransactions" => SolCall::SignAllTransactions(
                    param::<Vec<SolTx>>(params, 0, "transactions")?
                        .into_iter()
                        .map(String::from)
                        .collect(),
                ),
                "signMessage" => SolCall::SignMessage(param(params, 0, "message")?),
                _ => return Err(unknown()),
            }),
        })
    }
}

/// Request ids in flight on one connection.
#[derive(Debug, Clone, Default)]
pub struct PendingIds(Arc<Mutex<HashSet<String>>>);

/// Releases its id when dropped.
#[derive(Debug)]
pub struct Claim {
    ids: PendingIds,
    key: String,
}

impl PendingIds {
    /// `None` when the id is already in flight.
    pub fn claim(&self, id: &Value) -> Option<Claim> {
        let key = id.to_string();
        let mut ids = self.0.lock().ok()?;
        ids.insert(key.clone()).then(|| Claim {
            ids: self.clone(),
            key,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.0.lock().map_or(0, |ids| ids.len())
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.0.lock() {
            ids.remove(&self.key);
        }
    }
}

/// Answer one page request. Each request gets a fresh tag for log correlation.
pub async fn route<C: ChainRpc>(wallet: &WalletHandle, chains: &C, envelope: PageEnvelope) -> PageResponse {
    let span = tracing::debug_span!(
        "page_request",
        tag = %Uuid::new_v4(),
        provider = %envelope.provider,
        method = %envelope.method,
    );
    async move {
        let out = match PageCall::parse(&envelope.provider, &envelope.method, &envelope.params) {
            Ok(call) => dispatch(wallet, chains, call).await,
            Err(e) => Err(e.into()),
        };
        match out {
            Ok(v) => PageResponse::ok(envelope.id, v),
            Err(e) => {
                tracing::debug!(error = %format!("{e:#}"), "page request failed");
                PageResponse::err(envelope.id, ErrorEnvelope::from_report(&e).redacted())
            }
        }
    }
    .instrument(span)
    .await
}

async fn dispatch<C: ChainRpc>(wallet: &WalletHandle, chains: &C, call: PageCall) -> eyre::Result<Value> {
    match call {
        PageCall::Ethereum(c) => ethereum(wallet, chains, c).await,
        PageCall::Solana(c) => solana(wallet, c).await,
    }
}

fn evm_chain_id(network: &Network) -> Result<u64, WalletError> {
    network
        .chain_id
        .ok_or_else(|| WalletError::UnsupportedNetwork(network.id.clone()))
}

async fn prepared(
    wallet: &WalletHandle,
    chains: &impl ChainRpc,
    tx: EvmTransaction,
) -> eyre::Result<(Network, SignatureOutput)> {
    let network = wallet.provider_network(ChainFamily::Ethereum).await?;
    let from = tx
        .from
        .clone()
        .ok_or_else(|| WalletError::invalid_params("transaction.from is required"))?;
    let tx = chains
        .prepare_evm_transaction(&network, &from, tx)
        .await
        .map_err(errors::from_collaborator)?;
    let signed = wallet
        .sign(network.id.clone(), from, SignPayload::EvmTransaction(tx))
        .await?;
    Ok((network, signed))
}

async fn ethereum<C: ChainRpc>(wallet: &WalletHandle, chains: &C, call: EthCall) -> eyre::Result<Value> {
    match call {
        EthCall::RequestAccounts => Ok(json!(wallet.page_accounts(ChainFamily::Ethereum).await?)),
        EthCall::Accounts => match wallet.page_accounts(ChainFamily::Ethereum).await {
            Ok(accounts) => Ok(json!(accounts)),
            Err(e) if service::is_wallet_error(&e, &WalletError::WalletLocked) => Ok(json!([])),
            Err(e) => Err(e),
        },
        EthCall::ChainId => {
            let network = wallet.provider_network(ChainFamily::Ethereum).await?;
            Ok(json!(Quantity::hex(evm_chain_id(&network)?)))
        }
        EthCall::NetVersion => {
            let network = wallet.provider_network(ChainFamily::Ethereum).await?;
            Ok(json!(evm_chain_id(&network)?.to_string()))
        }
        EthCall::Sign { address, message } => {
            let network = wallet.provider_network(ChainFamily::Ethereum).await?;
            let payload = SignPayload::EvmMessage(message_bytes(&message));
            match wallet.sign(network.id, address, payload).await? {
                SignatureOutput::EvmMessage { signature } => Ok(json!(signature)),
                other => Ok(serde_json::to_value(other)?),
            }
        }
        EthCall::SignTransaction(tx) => {
            let (_, signed) = prepared(wallet, chains, tx).await?;
            match signed {
                SignatureOutput::EvmTransaction {
                    raw_transaction, ..
                } => Ok(json!(raw_transaction)),
                other => Ok(serde_json::to_value(other)?),
            }
        }
        EthCall::SendTransaction(tx) => {
            let (network, signed) = prepared(wallet, chains, tx).await?;
            let hash = chains
                .broadcast(&network, &signed)
                .await
                .map_err(errors::from_collaborator)?;
            Ok(json!(hash))
        }
    }
}

/// The account a Solana page acts as.
async fn solana_signer(wallet: &WalletHandle) -> eyre::Result<(Network, String)> {
    let network = wallet.provider_network(ChainFamily::Solana).await?;
    let address = wallet
        .page_accounts(ChainFamily::Solana)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| WalletError::AccountNotFound("no solana account".to_owned()))?;
    Ok((network, address))
}

async fn solana(wallet: &WalletHandle, call: SolCall) -> eyre::Result<Value> {
    match call {
        SolCall::Connect => {
            let accounts = wallet.page_accounts(ChainFamily::Solana).await?;
            let first = accounts
                .first()
                .ok_or_else(|| WalletError::AccountNotFound("no solana account".to_owned()))?;
            Ok(json!({ "publicKey": first }))
        }
        // Connections hold no per-page grant.
        SolCall::Disconnect => Ok(Value::Null),
        SolCall::SignTransaction(transaction) => {
            let (network, address) = solana_signer(wallet).await?;
            let payload = SignPayload::SolanaTransaction {
                transaction,
                co_signers: vec![],
            };
            Ok(serde_json::to_value(wallet.sign(network.id, address, payload).await?)?)
        }
        SolCall::SignAllTransactions(transactions) => {
            let (network, address) = solana_signer(wallet).await?;
            let mut out = Vec::with_capacity(transactions.len());
            for transaction in transactions {
                let payload = SignPayload::SolanaTransaction {
                    transaction,
                    co_signers: vec![],
                };
                out.push(
                    wallet
                        .sign(network.id.clone(), address.clone(), payload)
                        .await?,
                );
            }
            Ok(serde_json::to_value(out)?)
        }
        SolCall::SignMessage(message) => {
            let (network, address) = solana_signer(wallet).await?;
            let payload = SignPayload::SolanaMessage(message.as_bytes().to_vec());
            let signed = wallet.sign(network.id, address, payload).await?;
            match (message, signed) {
                (
                    SolMessage::Bytes(_),
                    SignatureOutput::SolanaMessage {
                        signature,
                        public_key,
                    },
                ) => Ok(json!({
                    "signature": signing::solana::signature_bytes(&signature)?,
                    "publicKey": public_key,
                })),
                (_, other) => Ok(serde_json::to_value(other)?),
            }
        }
    }
}
