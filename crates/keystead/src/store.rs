use eyre::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, path::PathBuf, sync::Mutex};

/// Persisted wallet state keys. Each key is written atomically on its own;
/// there is no cross-key transaction, so callers order their writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKey {
    IsInitialized,
    IsLocked,
    EncryptedMnemonic,
    EncryptedPrivateKeys,
    Accounts,
    SelectedNetwork,
    SetupProgress,
    SetupComplete,
}

impl StateKey {
    pub const ALL: [Self; 8] = [
        Self::IsInitialized,
        Self::IsLocked,
        Self::EncryptedMnemonic,
        Self::EncryptedPrivateKeys,
        Self::Accounts,
        Self::SelectedNetwork,
        Self::SetupProgress,
        Self::SetupComplete,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IsInitialized => "isInitialized",
            Self::IsLocked => "isLocked",
            Self::EncryptedMnemonic => "encryptedMnemonic",
            Self::EncryptedPrivateKeys => "encryptedPrivateKeys",
            Self::Accounts => "accounts",
            Self::SelectedNetwork => "selectedNetwork",
            Self::SetupProgress => "setupProgress",
            Self::SetupComplete => "setupComplete",
        }
    }
}

/// Opaque key to blob storage.
pub trait KvStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: StateKey) -> eyre::Result<Option<Vec<u8>>>;
    fn set(&self, key: StateKey, value: &[u8]) -> eyre::Result<()>;
    fn delete(&self, key: StateKey) -> eyre::Result<()>;
}

pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: StateKey) -> eyre::Result<Option<T>> {
    store
        .get(key)?
        .map(|b| serde_json::from_slice(&b))
        .transpose()
        .with_context(|| format!("decode {}", key.as_str()))
}

pub fn save_json<T: Serialize>(store: &dyn KvStore, key: StateKey, value: &T) -> eyre::Result<()> {
    let b = serde_json::to_vec(value).with_context(|| format!("encode {}", key.as_str()))?;
    store.set(key, &b)
}

/// Missing flags read as `false`.
pub fn load_flag(store: &dyn KvStore, key: StateKey) -> eyre::Result<bool> {
    Ok(load_json::<bool>(store, key)?.unwrap_or(false))
}

pub fn save_flag(store: &dyn KvStore, key: StateKey, value: bool) -> eyre::Result<()> {
    save_json(store, key, &value)
}

/// One private file per key under the state directory.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn open(dir: PathBuf) -> eyre::Result<Self> {
        crate::fsutil::ensure_private_dir(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: StateKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: StateKey) -> eyre::Result<Option<Vec<u8>>> {
        crate::fsutil::read_if_exists(&self.path(key))
    }

    fn set(&self, key: StateKey, value: &[u8]) -> eyre::Result<()> {
        crate::fsutil::replace_atomic(&self.path(key), value)
    }

    fn delete(&self, key: StateKey) -> eyre::Result<()> {
        crate::fsutil::remove_if_exists(&self.path(key))
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<BTreeMap<StateKey, Vec<u8>>>,
}

impl MemoryKvStore {
    fn map(&self) -> eyre::Result<std::sync::MutexGuard<'_, BTreeMap<StateKey, Vec<u8>>>> {
        self.inner
            .lock()
            .map_err(|e| eyre::eyre!("memory store poisoned: {e}"))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: StateKey) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.map()?.get(&key).cloned())
    }

    fn set(&self, key: StateKey, value: &[u8]) -> eyre::Result<()> {
        self.map()?.insert(key, value.to_vec());
        Ok(())
    }

    fn delete(&self, key: StateKey) -> eyre::Result<()> {
        self.map()?.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) -> eyre::Result<()> {
        assert!(!load_flag(store, StateKey::IsInitialized)?, "missing flag is false");
        save_flag(store, StateKey::IsInitialized, true)?;
        assert!(load_flag(store, StateKey::IsInitialized)?, "flag set");

        save_json(store, StateKey::SelectedNetwork, &"solana")?;
        let sel: Option<String> = load_json(store, StateKey::SelectedNetwork)?;
        assert_eq!(sel.as_deref(), Some("solana"));

        store.delete(StateKey::SelectedNetwork)?;
        store.delete(StateKey::SelectedNetwork)?;
        assert!(store.get(StateKey::SelectedNetwork)?.is_none(), "deleted");
        Ok(())
    }

    #[test]
    fn memory_store_semantics() -> eyre::Result<()> {
        exercise(&MemoryKvStore::default())
    }

    #[test]
    fn file_store_semantics() -> eyre::Result<()> {
        let td = tempfile::tempdir()?;
        let store = FileKvStore::open(td.path().join("state"))?;
        exercise(&store)?;
        assert!(
            td.path().join("state").join("isInitialized.json").exists(),
            "one file per key"
        );
        Ok(())
    }

    #[test]
    fn undecodable_values_are_errors() -> eyre::Result<()> {
        let store = MemoryKvStore::default();
        store.set(StateKey::IsLocked, b"not json")?;
        assert!(load_flag(&store, StateKey::IsLocked).is_err(), "garbage flag");
        Ok(())
    }
}
