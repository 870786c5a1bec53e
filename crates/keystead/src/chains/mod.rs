pub mod evm;
pub mod solana;

use crate::{
    config::RetryConfig,
    errors::WalletError,
    network::{Network, NetworkObserver},
    retry::{self, BackoffConfig},
    signing::{self, EvmTransaction, SignatureOutput},
    wallet::ChainFamily,
};
use solana_client::nonblocking::rpc_client::RpcClient;
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

/// The network-facing half of a send. Sees transactions and signatures,
/// never key material, and is never called from inside the wallet actor.
pub trait ChainRpc: Send + Sync + 'static {
    /// Fill nonce, fees and gas limit where the caller left them out.
    fn prepare_evm_transaction(
        &self,
        network: &Network,
        from: &str,
        tx: EvmTransaction,
    ) -> impl Future<Output = eyre::Result<EvmTransaction>> + Send;

    fn estimate_gas(
        &self,
        network: &Network,
        tx: &EvmTransaction,
    ) -> impl Future<Output = eyre::Result<u64>> + Send;

    /// Returns the transaction hash (EVM) or the fee payer's signature (Solana).
    fn broadcast(
        &self,
        network: &Network,
        signed: &SignatureOutput,
    ) -> impl Future<Output = eyre::Result<String>> + Send;
}

#[derive(Clone)]
enum Client {
    Evm(evm::EvmProvider),
    Solana(Arc<RpcClient>),
}

/// HTTP JSON-RPC clients, one per endpoint URL, dropped whenever the user
/// switches to a network so the next call reconnects.
pub struct LiveChains {
    backoff: BackoffConfig,
    clients: Mutex<BTreeMap<String, Client>>,
}

impl fmt::Debug for LiveChains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveChains")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl LiveChains {
    pub fn new(retry: &RetryConfig) -> Self {
        Self {
            backoff: BackoffConfig::from(retry),
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    fn cache(&self) -> eyre::Result<MutexGuard<'_, BTreeMap<String, Client>>> {
        self.clients
            .lock()
            .map_err(|e| eyre::eyre!("rpc client cache poisoned: {e}"))
    }

    fn evm_client(&self, url: &str) -> eyre::Result<evm::EvmProvider> {
        let mut cache = self.cache()?;
        if let Some(Client::Evm(p)) = cache.get(url) {
            return Ok(p.clone());
        }
        let p = evm::provider_for_url(url)?;
        cache.insert(url.to_owned(), Client::Evm(p.clone()));
        Ok(p)
    }

    fn solana_client(&self, url: &str) -> eyre::Result<Arc<RpcClient>> {
        let mut cache = self.cache()?;
        if let Some(Client::Solana(c)) = cache.get(url) {
            return Ok(Arc::clone(c));
        }
        let c = Arc::new(solana::rpc_for_url(url));
        cache.insert(url.to_owned(), Client::Solana(Arc::clone(&c)));
        Ok(c)
    }

    async fn with_evm<T, Fut>(
        &self,
        network: &Network,
        label: &'static str,
        f: impl Fn(evm::EvmProvider) -> Fut + Sync + Send,
    ) -> eyre::Result<T>
    where
        T: Send,
        Fut: Future<Output = eyre::Result<T>> + Send,
    {
        let urls = network.rpc_urls();
        retry::try_all_with_backoff(
            &urls,
            &self.backoff,
            |u| {
                let client = self.evm_client(u);
                let f = &f;
                async move { f(client?).await }
            },
            label,
        )
        .await
    }

    async fn with_solana<T, Fut>(
        &self,
        network: &Network,
        label: &'static str,
        f: impl Fn(Arc<RpcClient>) -> Fut + Sync + Send,
    ) -> eyre::Result<T>
    where
        T: Send,
        Fut: Future<Output = eyre::Result<T>> + Send,
    {
        let urls = network.rpc_urls();
        retry::try_all_with_backoff(
            &urls,
            &self.backoff,
            |u| {
                let client = self.solana_client(u);
                let f = &f;
                async move { f(client?).await }
            },
            label,
        )
        .await
    }
}

fn require_family(network: &Network, family: ChainFamily) -> Result<(), WalletError> {
    if network.family != family {
        return Err(WalletError::invalid_params(format!(
            "{} is not a {family} network",
            network.id
        )));
    }
    Ok(())
}

impl ChainRpc for LiveChains {
    async fn prepare_evm_transaction(
        &self,
        network: &Network,
        from: &str,
        tx: EvmTransaction,
    ) -> eyre::Result<EvmTransaction> {
        require_family(network, ChainFamily::Ethereum)?;
        if tx.is_complete() {
            return Ok(tx);
        }
        let chain_id = network
            .chain_id
            .ok_or_else(|| WalletError::UnsupportedNetwork(network.id.clone()))?;
        let from = signing::evm::parse_address(from)?;
        self.with_evm(network, "prepare transaction", |p| {
            let tx = tx.clone();
            async move { evm::fill_missing(&p, from, chain_id, tx).await }
        })
        .await
    }

    async fn estimate_gas(&self, network: &Network, tx: &EvmTransaction) -> eyre::Result<u64> {
        require_family(network, ChainFamily::Ethereum)?;
        // Malformed fields are the caller's problem, not the node's.
        evm::to_request(tx)?;
        self.with_evm(network, "estimate gas", |p| {
            let tx = tx.clone();
            async move { evm::estimate_gas(&p, &tx).await }
        })
        .await
    }

    async fn broadcast(&self, network: &Network, signed: &SignatureOutput) -> eyre::Result<String> {
        match signed {
            SignatureOutput::EvmTransaction {
                raw_transaction,
                tx_hash,
            } => {
                require_family(network, ChainFamily::Ethereum)?;
                let raw = evm::decode_raw(raw_transaction)?;
                self.with_evm(network, "send transaction", |p| {
                    let raw = raw.clone();
                    async move { evm::send_raw(&p, &raw).await }
                })
                .await?;
                tracing::info!(network = %network.id, %tx_hash, "transaction broadcast");
                Ok(tx_hash.clone())
            }
            SignatureOutput::SolanaTransaction { transaction, .. } => {
                require_family(network, ChainFamily::Solana)?;
                let tx = signing::solana::decode_transaction(transaction)?;
                solana::ensure_fully_signed(&tx)?;
                let sig = self
                    .with_solana(network, "send transaction", |rpc| {
                        let tx = tx.clone();
                        async move { solana::send(&rpc, &tx).await }
                    })
                    .await?;
                tracing::info!(network = %network.id, signature = %sig, "transaction broadcast");
                Ok(sig.to_string())
            }
            SignatureOutput::EvmMessage { .. } | SignatureOutput::SolanaMessage { .. } => {
                Err(WalletError::invalid_params("a message signature cannot be broadcast").into())
            }
        }
    }
}

impl NetworkObserver for LiveChains {
    fn network_selected(&self, network: &Network) {
        let urls = network.rpc_urls();
        match self.clients.lock() {
            Ok(mut cache) => {
                let before = cache.len();
                cache.retain(|url, _| !urls.contains(url));
                tracing::debug!(
                    network = %network.id,
                    dropped = before.saturating_sub(cache.len()),
                    "rpc clients reset"
                );
            }
            Err(e) => tracing::warn!(error = %e, "rpc client cache poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{signing::Quantity, testkit};

    fn cached_len(chains: &LiveChains) -> usize {
        chains.cache().map_or(0, |c| c.len())
    }

    #[tokio::test]
    async fn complete_transactions_skip_the_network() -> eyre::Result<()> {
        let chains = LiveChains::new(&RetryConfig::default());
        let net = testkit::network("ganache")?;
        let tx = EvmTransaction {
            to: Some("0x0000000000000000000000000000000000000001".to_owned()),
            gas_limit: Some(Quantity::Number(21_000)),
            gas_price: Some(Quantity::Number(1)),
            nonce: Some(Quantity::Number(0)),
            ..EvmTransaction::default()
        };
        let out = chains
            .prepare_evm_transaction(&net, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94", tx.clone())
            .await?;
        assert_eq!(out, tx);
        Ok(())
    }

    #[tokio::test]
    async fn messages_and_wrong_families_are_refused() -> eyre::Result<()> {
        let chains = LiveChains::new(&RetryConfig::default());
        let eth = testkit::network("ethereum")?;
        let sol = testkit::network("solana")?;
        let msg = SignatureOutput::EvmMessage {
            signature: "0x00".to_owned(),
        };
        assert!(chains.broadcast(&eth, &msg).await.is_err(), "message");
        let evm_tx = SignatureOutput::EvmTransaction {
            raw_transaction: "0x02".to_owned(),
            tx_hash: "0x00".to_owned(),
        };
        let e = chains
            .broadcast(&sol, &evm_tx)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("wrong family"))?;
        assert!(
            matches!(e.downcast_ref::<WalletError>(), Some(WalletError::InvalidParams(_))),
            "{e:#}"
        );
        Ok(())
    }

    #[test]
    fn switching_networks_drops_their_clients() -> eyre::Result<()> {
        let chains = LiveChains::new(&RetryConfig::default());
        let ganache = testkit::network("ganache")?;
        let devnet = testkit::network("solana-devnet")?;
        chains.evm_client(&ganache.rpc_url)?;
        chains.solana_client(&devnet.rpc_url)?;
        assert_eq!(cached_len(&chains), 2);

        chains.network_selected(&ganache);
        assert_eq!(cached_len(&chains), 1, "only the selected network reconnects");
        Ok(())
    }
}
