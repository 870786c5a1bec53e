use crate::errors::WalletError;
use eyre::Context as _;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::{signature::Signature, transaction::VersionedTransaction};
use std::time::Duration;

pub fn rpc_for_url(url: &str) -> RpcClient {
    RpcClient::new_with_timeout_and_commitment(
        url.to_owned(),
        Duration::from_secs(20),
        CommitmentConfig::confirmed(),
    )
}

/// Refuse to broadcast anything a node would reject for missing or bad
/// signatures.
pub fn ensure_fully_signed(tx: &VersionedTransaction) -> Result<(), WalletError> {
    let checks = tx.verify_with_results();
    if checks.is_empty() || !checks.iter().all(|ok| *ok) {
        let missing = checks.iter().filter(|ok| !**ok).count();
        return Err(WalletError::invalid_params(format!(
            "transaction has {missing} missing or invalid signature(s)"
        )));
    }
    Ok(())
}

pub async fn send(rpc: &RpcClient, tx: &VersionedTransaction) -> eyre::Result<Signature> {
    rpc.send_transaction(tx).await.context("send transaction")
}
