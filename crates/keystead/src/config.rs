use crate::paths::KeysteadPaths;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_NETWORK_ID: &str = "ethereum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Argon2id memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Interrupted onboarding older than this is presented for resume-or-discard.
    pub progress_ttl_seconds: u64,
    pub min_password_len: usize,
    /// 12 or 24.
    pub phrase_words: usize,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            progress_ttl_seconds: 60 * 60,
            min_password_len: 8,
            phrase_words: 12,
        }
    }
}

/// How Solana keys are derived from the mnemonic seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolanaDerivation {
    /// ed25519 secret = first 32 bytes of the BIP-39 seed. Single account only.
    #[default]
    SeedPrefix,
    /// SLIP-0010 along m/44'/501'/index'/0'.
    Bip44,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub rounds: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub id: String,
    pub name: String,
    /// Numeric EIP-155 chain id; absent for Solana clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub rpc_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_rpc_urls: Vec<String>,
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub explorer_url: String,
}

impl NetworkEntry {
    fn evm(id: &str, name: &str, chain_id: u64, rpc_url: &str, explorer_url: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            chain_id: Some(chain_id),
            rpc_url: rpc_url.to_owned(),
            fallback_rpc_urls: vec![],
            symbol: "ETH".to_owned(),
            decimals: 18,
            explorer_url: explorer_url.to_owned(),
        }
    }

    fn solana(id: &str, name: &str, rpc_url: &str, explorer_url: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            chain_id: None,
            rpc_url: rpc_url.to_owned(),
            fallback_rpc_urls: vec![],
            symbol: "SOL".to_owned(),
            decimals: 9,
            explorer_url: explorer_url.to_owned(),
        }
    }
}

pub fn default_networks() -> Vec<NetworkEntry> {
    vec![
        NetworkEntry::evm(
            "ethereum",
            "Ethereum Mainnet",
            1,
            "https://eth.llamarpc.com",
            "https://etherscan.io",
        ),
        NetworkEntry::evm(
            "sepolia",
            "Sepolia Testnet",
            11_155_111,
            "https://rpc.sepolia.org",
            "https://sepolia.etherscan.io",
        ),
        NetworkEntry::evm("ganache", "Ganache Local", 1337, "http://127.0.0.1:7545", ""),
        NetworkEntry::solana(
            "solana",
            "Solana Mainnet",
            "https://api.mainnet-beta.solana.com",
            "https://explorer.solana.com",
        ),
        NetworkEntry::solana(
            "solana-devnet",
            "Solana Devnet",
            "https://api.devnet.solana.com",
            "https://explorer.solana.com/?cluster=devnet",
        ),
    ]
}

fn default_network_id() -> String {
    DEFAULT_NETWORK_ID.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysteadConfig {
    #[serde(default = "default_network_id")]
    pub default_network: String,
    #[serde(default)]
    pub solana_derivation: SolanaDerivation,
    #[serde(default)]
    pub kdf: KdfConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkEntry>,
}

impl Default for KeysteadConfig {
    fn default() -> Self {
        Self {
            default_network: default_network_id(),
            solana_derivation: SolanaDerivation::default(),
            kdf: KdfConfig::default(),
            setup: SetupConfig::default(),
            retry: RetryConfig::default(),
            networks: default_networks(),
        }
    }
}

impl KeysteadConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if !matches!(self.setup.phrase_words, 12 | 24) {
            eyre::bail!(
                "setup.phrase_words must be 12 or 24 (got {})",
                self.setup.phrase_words
            );
        }
        if self.setup.min_password_len == 0 {
            eyre::bail!("setup.min_password_len must be positive");
        }
        if !self.networks.iter().any(|n| n.id == self.default_network) {
            eyre::bail!("default_network {} is not in the network table", self.default_network);
        }
        Ok(())
    }
}

/// Env var that overrides the primary RPC URL of network `id`.
pub fn rpc_url_env_var(id: &str) -> String {
    format!(
        "KEYSTEAD_RPC_URL_{}",
        id.to_ascii_uppercase().replace('-', "_")
    )
}

/// If an env var is set and non-empty, apply `setter` with the trimmed value.
fn apply_env(var: &str, setter: impl FnOnce(&str)) {
    if let Ok(u) = std::env::var(var) {
        let t = u.trim();
        if !t.is_empty() {
            setter(t);
        }
    }
}

fn apply_env_number<T: std::str::FromStr>(var: &str, setter: impl FnOnce(T)) {
    apply_env(var, |v| {
        if let Ok(n) = v.parse::<T>() {
            setter(n);
        }
    });
}

fn apply_env_overrides(cfg: &mut KeysteadConfig) {
    apply_env_number("KEYSTEAD_KDF_MEMORY_KIB", |n| cfg.kdf.memory_kib = n);
    apply_env_number("KEYSTEAD_KDF_ITERATIONS", |n| cfg.kdf.iterations = n);
    apply_env_number("KEYSTEAD_SETUP_TTL_SECONDS", |n| {
        cfg.setup.progress_ttl_seconds = n;
    });
    apply_env("KEYSTEAD_DEFAULT_NETWORK", |v| {
        v.clone_into(&mut cfg.default_network);
    });
    for n in &mut cfg.networks {
        apply_env(&rpc_url_env_var(&n.id), |v| v.clone_into(&mut n.rpc_url));
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &KeysteadPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<KeysteadConfig> {
        let mut cfg = match crate::fsutil::read_if_exists(&self.path)? {
            Some(bytes) => {
                let s = String::from_utf8(bytes).context("config.toml is not utf-8")?;
                toml::from_str(&s).context("parse config.toml")?
            }
            None => {
                let cfg = KeysteadConfig::default();
                self.save(&cfg)?;
                cfg
            }
        };
        apply_env_overrides(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &KeysteadConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::replace_atomic(&self.path, s.as_bytes()).context("write config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_both_families_and_validate() -> eyre::Result<()> {
        let cfg = KeysteadConfig::default();
        cfg.validate()?;
        assert!(
            cfg.networks.iter().any(|n| n.chain_id.is_none()),
            "a solana cluster is configured"
        );
        assert!(
            cfg.networks.iter().any(|n| n.chain_id == Some(1)),
            "ethereum mainnet is configured"
        );
        Ok(())
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() -> eyre::Result<()> {
        let cfg: KeysteadConfig = toml::from_str(
            r#"
default_network = "ganache"
solana_derivation = "bip44"

[kdf]
memory_kib = 64
"#,
        )?;
        assert_eq!(cfg.kdf.memory_kib, 64);
        assert_eq!(cfg.kdf.iterations, 2, "unset fields keep defaults");
        assert_eq!(cfg.solana_derivation, SolanaDerivation::Bip44);
        assert_eq!(cfg.networks.len(), default_networks().len());
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn rejects_bad_word_count_and_unknown_default() {
        let mut cfg = KeysteadConfig::default();
        cfg.setup.phrase_words = 15;
        assert!(cfg.validate().is_err(), "15 words");

        let mut cfg = KeysteadConfig::default();
        "nowhere".clone_into(&mut cfg.default_network);
        assert!(cfg.validate().is_err(), "unknown default network");
    }

    #[test]
    fn rpc_env_var_names() {
        assert_eq!(rpc_url_env_var("solana-devnet"), "KEYSTEAD_RPC_URL_SOLANA_DEVNET");
        assert_eq!(rpc_url_env_var("ethereum"), "KEYSTEAD_RPC_URL_ETHEREUM");
    }

    #[test]
    fn first_load_writes_config_file() -> eyre::Result<()> {
        let td = tempfile::tempdir()?;
        let paths = KeysteadPaths {
            config_dir: td.path().join("cfg"),
            data_dir: td.path().join("data"),
            log_file: td.path().join("data").join("log.jsonl"),
        };
        let store = ConfigStore::new(&paths);
        let cfg = store.load_or_init_default()?;
        assert!(paths.config_file().exists(), "config.toml written");
        let again = store.load_or_init_default()?;
        assert_eq!(cfg.networks, again.networks, "reload is stable");
        Ok(())
    }
}
