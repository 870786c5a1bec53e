use crate::{
    config::{KeysteadConfig, NetworkEntry},
    errors::WalletError,
    store::{self, KvStore, StateKey},
    wallet::ChainFamily,
};
use serde::Serialize;
use std::sync::Arc;

/// Network ids that denote Solana clusters. Every other configured network
/// must carry an EIP-155 chain id and is Ethereum-family.
pub const SOLANA_NETWORK_IDS: &[&str] = &["solana", "solana-devnet", "solana-testnet", "solana-localnet"];

pub fn infer_family(id: &str, chain_id: Option<u64>) -> eyre::Result<ChainFamily> {
    if SOLANA_NETWORK_IDS.contains(&id) {
        return Ok(ChainFamily::Solana);
    }
    if chain_id.is_some() {
        return Ok(ChainFamily::Ethereum);
    }
    eyre::bail!("network {id} is neither a known solana cluster nor has a chain_id")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub id: String,
    pub display_name: String,
    pub family: ChainFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub rpc_url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallback_rpc_urls: Vec<String>,
    pub native_symbol: String,
    pub decimals: u8,
    pub explorer_url: String,
}

impl Network {
    pub fn from_entry(e: &NetworkEntry) -> eyre::Result<Self> {
        Ok(Self {
            id: e.id.clone(),
            display_name: e.name.clone(),
            family: infer_family(&e.id, e.chain_id)?,
            chain_id: e.chain_id,
            rpc_url: e.rpc_url.clone(),
            fallback_rpc_urls: e.fallback_rpc_urls.clone(),
            native_symbol: e.symbol.clone(),
            decimals: e.decimals,
            explorer_url: e.explorer_url.clone(),
        })
    }

    /// Primary URL first, then fallbacks.
    pub fn rpc_urls(&self) -> Vec<String> {
        crate::retry::endpoint_list(&self.rpc_url, &self.fallback_rpc_urls)
    }
}

/// Told about every successful network switch; owns the live RPC clients.
pub trait NetworkObserver: Send + Sync + std::fmt::Debug {
    fn network_selected(&self, network: &Network);
}

/// Immutable table of networks plus a pointer to the selected one.
#[derive(Debug)]
pub struct NetworkRegistry {
    table: Arc<[Network]>,
    selected: usize,
    store: Arc<dyn KvStore>,
    observer: Option<Arc<dyn NetworkObserver>>,
}

impl NetworkRegistry {
    /// The persisted selection wins over the configured default when it still
    /// names a configured network.
    pub fn load(cfg: &KeysteadConfig, store: Arc<dyn KvStore>) -> eyre::Result<Self> {
        let table = cfg
            .networks
            .iter()
            .map(Network::from_entry)
            .collect::<eyre::Result<Vec<_>>>()?;
        for (i, n) in table.iter().enumerate() {
            if table.iter().skip(i + 1).any(|m| m.id == n.id) {
                eyre::bail!("duplicate network id {}", n.id);
            }
        }
        let table: Arc<[Network]> = table.into();

        let persisted: Option<String> = store::load_json(store.as_ref(), StateKey::SelectedNetwork)?;
        let position = |id: &str| table.iter().position(|n| n.id == id);
        let selected = persisted
            .as_deref()
            .and_then(position)
            .or_else(|| position(&cfg.default_network))
            .ok_or_else(|| eyre::eyre!("default network {} not configured", cfg.default_network))?;

        Ok(Self {
            table,
            selected,
            store,
            observer: None,
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn NetworkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn by_id(&self, id: &str) -> Result<&Network, WalletError> {
        self.table
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| WalletError::UnsupportedNetwork(id.to_owned()))
    }

    #[expect(clippy::indexing_slicing, reason = "selected is always a position in table")]
    pub fn selected(&self) -> &Network {
        &self.table[self.selected]
    }

    pub fn all(&self) -> &[Network] {
        &self.table
    }

    /// Validate, persist, move the pointer, then let the RPC side reconnect.
    pub fn switch_to(&mut self, id: &str) -> eyre::Result<&Network> {
        let idx = self
            .table
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| WalletError::UnsupportedNetwork(id.to_owned()))?;
        store::save_json(self.store.as_ref(), StateKey::SelectedNetwork, &id)?;
        let previous = std::mem::replace(&mut self.selected, idx);
        let network = self.selected();
        tracing::info!(
            from = %self.table.get(previous).map_or("", |n| n.id.as_str()),
            to = %network.id,
            "network switched"
        );
        if let Some(obs) = &self.observer {
            obs.network_selected(network);
        }
        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl NetworkObserver for Recorder {
        fn network_selected(&self, network: &Network) {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(network.id.clone());
            }
        }
    }

    fn registry(store: &Arc<MemoryKvStore>) -> eyre::Result<NetworkRegistry> {
        let dyn_store: Arc<dyn KvStore> = Arc::<MemoryKvStore>::clone(store);
        NetworkRegistry::load(&KeysteadConfig::default(), dyn_store)
    }

    #[test]
    fn families_are_inferred_from_ids_and_chain_ids() -> eyre::Result<()> {
        assert_eq!(infer_family("solana-devnet", None)?, ChainFamily::Solana);
        assert_eq!(infer_family("polygon", Some(137))?, ChainFamily::Ethereum);
        assert!(infer_family("mystery", None).is_err(), "no chain id, unknown cluster");
        Ok(())
    }

    #[test]
    fn lookup_and_unsupported() -> eyre::Result<()> {
        let reg = registry(&Arc::new(MemoryKvStore::default()))?;
        assert_eq!(reg.selected().id, "ethereum");
        assert_eq!(reg.by_id("ganache")?.chain_id, Some(1337));
        assert_eq!(
            reg.by_id("dogechain").err(),
            Some(WalletError::UnsupportedNetwork("dogechain".to_owned()))
        );
        Ok(())
    }

    #[test]
    fn switch_persists_and_notifies() -> eyre::Result<()> {
        let store = Arc::new(MemoryKvStore::default());
        let rec = Arc::new(Recorder::default());
        let mut reg = registry(&store)?.with_observer(Arc::<Recorder>::clone(&rec));
        assert_eq!(reg.switch_to("solana")?.family, ChainFamily::Solana);
        assert!(reg.switch_to("nowhere").is_err(), "unknown id");
        assert_eq!(reg.selected().id, "solana", "failed switch keeps selection");

        let reloaded = registry(&store)?;
        assert_eq!(reloaded.selected().id, "solana", "selection persisted");
        let seen = rec.0.lock().map_err(|e| eyre::eyre!("{e}"))?.clone();
        assert_eq!(seen, vec!["solana".to_owned()]);
        Ok(())
    }

    #[test]
    fn stale_persisted_selection_falls_back_to_default() -> eyre::Result<()> {
        let store = Arc::new(MemoryKvStore::default());
        store::save_json(store.as_ref(), StateKey::SelectedNetwork, &"removed-chain")?;
        assert_eq!(registry(&store)?.selected().id, "ethereum");
        Ok(())
    }

    #[test]
    fn selection_is_a_pointer_into_the_table() -> eyre::Result<()> {
        let mut reg = registry(&Arc::new(MemoryKvStore::default()))?;
        reg.switch_to("sepolia")?;
        let sel: *const Network = reg.selected();
        let row: *const Network = reg.by_id("sepolia")?;
        assert_eq!(sel, row, "no copy is made");
        Ok(())
    }
}
