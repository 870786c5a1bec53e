pub mod crypto;

use crate::{
    config::SolanaDerivation,
    errors::WalletError,
    network::Network,
    signing::{self, SignPayload, SignatureOutput},
    store::{self, KvStore, StateKey},
    wallet::{self, Account, AccountBook, ChainFamily, KeyRef, RecoveryPhrase},
};
use crypto::{EncryptedBlob, SecretCipher};
use secrecy::SecretString;
use std::{collections::BTreeMap, sync::Arc};
use zeroize::{Zeroize as _, Zeroizing};

const MNEMONIC_PURPOSE: &str = "mnemonic";

fn key_purpose(key_ref: &KeyRef) -> String {
    format!("key:{key_ref}")
}

/// Decrypted material, held only while unlocked.
struct UnlockedSecrets {
    phrase: RecoveryPhrase,
    keys: BTreeMap<KeyRef, Zeroizing<Vec<u8>>>,
}

impl UnlockedSecrets {
    fn wipe(mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
        self.keys.clear();
    }
}

/// Encrypted storage of the recovery phrase and one blob per private key.
///
/// Plaintext keys live in memory between `unlock` and `lock` only and never
/// leave a `sign_with` call.
pub struct SecretVault {
    store: Arc<dyn KvStore>,
    cipher: Arc<dyn SecretCipher>,
    solana: SolanaDerivation,
    unlocked: Option<UnlockedSecrets>,
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("solana", &self.solana)
            .field("unlocked", &self.unlocked.is_some())
            .finish_non_exhaustive()
    }
}

impl SecretVault {
    pub fn new(
        store: Arc<dyn KvStore>,
        cipher: Arc<dyn SecretCipher>,
        solana: SolanaDerivation,
    ) -> Self {
        Self {
            store,
            cipher,
            solana,
            unlocked: None,
        }
    }

    pub fn is_initialized(&self) -> eyre::Result<bool> {
        store::load_flag(self.store.as_ref(), StateKey::IsInitialized)
    }

    /// `isInitialized` set but the phrase blob gone is not a recoverable state.
    pub fn is_intact(&self) -> eyre::Result<bool> {
        Ok(!self.is_initialized()? || self.store.get(StateKey::EncryptedMnemonic)?.is_some())
    }

    pub fn accounts(&self) -> eyre::Result<AccountBook> {
        Ok(store::load_json(self.store.as_ref(), StateKey::Accounts)?.unwrap_or_default())
    }

    /// Derive, encrypt and persist a fresh vault. The wallet is left unlocked.
    pub fn initialize(
        &mut self,
        phrase: RecoveryPhrase,
        password: &SecretString,
    ) -> eyre::Result<AccountBook> {
        if self.is_initialized()? {
            return Err(WalletError::AlreadyInitialized.into());
        }
        self.write_vault(phrase, password)
    }

    /// Hard reset onto `phrase`: nothing of the previous record survives.
    pub fn recover(
        &mut self,
        phrase: RecoveryPhrase,
        new_password: &SecretString,
    ) -> eyre::Result<AccountBook> {
        self.wipe()?;
        self.write_vault(phrase, new_password)
    }

    /// Drop every vault key. `isInitialized` goes first so a crash part way
    /// leaves an uninitialized store, never a half-deleted initialized one.
    pub fn wipe(&mut self) -> eyre::Result<()> {
        self.lock();
        store::save_flag(self.store.as_ref(), StateKey::IsInitialized, false)?;
        for key in [
            StateKey::EncryptedMnemonic,
            StateKey::EncryptedPrivateKeys,
            StateKey::Accounts,
        ] {
            self.store.delete(key)?;
        }
        Ok(())
    }

    fn write_vault(
        &mut self,
        phrase: RecoveryPhrase,
        password: &SecretString,
    ) -> eyre::Result<AccountBook> {
        let mut book = AccountBook::default();
        let mut blobs = BTreeMap::new();
        let mut keys = BTreeMap::new();
        for chain in ChainFamily::ALL {
            let derived = wallet::derive(&phrase, chain, 0, self.solana)?;
            let key_ref = KeyRef::new(chain, 0);
            blobs.insert(
                key_ref.clone(),
                self.cipher
                    .encrypt(&derived.secret, password, &key_purpose(&key_ref))?,
            );
            book.push(Account {
                chain,
                index: 0,
                address: derived.address.clone(),
                key_ref: key_ref.clone(),
            });
            keys.insert(key_ref, derived.secret);
        }
        let phrase_blob =
            self.cipher
                .encrypt(phrase.expose().as_bytes(), password, MNEMONIC_PURPOSE)?;

        // Ordered so that `isInitialized=true` is only ever observed with every
        // blob it depends on already in place.
        store::save_json(self.store.as_ref(), StateKey::EncryptedPrivateKeys, &blobs)?;
        store::save_json(self.store.as_ref(), StateKey::Accounts, &book)?;
        store::save_json(self.store.as_ref(), StateKey::EncryptedMnemonic, &phrase_blob)?;
        store::save_flag(self.store.as_ref(), StateKey::IsInitialized, true)?;

        self.lock();
        self.unlocked = Some(UnlockedSecrets { phrase, keys });
        tracing::info!(
            accounts = book.iter().count(),
            words = self.unlocked.as_ref().map_or(0, |u| u.phrase.word_count()),
            "vault written"
        );
        Ok(book)
    }

    fn decrypt_phrase(&self, password: &SecretString) -> eyre::Result<RecoveryPhrase> {
        let blob: EncryptedBlob = store::load_json(self.store.as_ref(), StateKey::EncryptedMnemonic)?
            .ok_or(WalletError::VaultCorrupted)?;
        let plain = self.cipher.decrypt(&blob, password, MNEMONIC_PURPOSE)?;
        let text = std::str::from_utf8(&plain).map_err(|_utf8| WalletError::VaultCorrupted)?;
        RecoveryPhrase::parse(text).map_err(|_invalid| WalletError::VaultCorrupted.into())
    }

    /// Confirms `password` against the stored phrase blob without unlocking.
    pub fn verify_password(&self, password: &SecretString) -> eyre::Result<()> {
        if !self.is_initialized()? {
            return Err(WalletError::NotInitialized.into());
        }
        self.decrypt_phrase(password).map(drop)
    }

    /// The phrase blob is the password check. Once it opens, any key blob that
    /// fails to open, or opens to a key for another address, is corruption.
    pub fn unlock(&mut self, password: &SecretString) -> eyre::Result<()> {
        if !self.is_initialized()? {
            return Err(WalletError::NotInitialized.into());
        }
        let phrase = self.decrypt_phrase(password)?;
        let book = self.accounts()?;
        let blobs: BTreeMap<KeyRef, EncryptedBlob> =
            store::load_json(self.store.as_ref(), StateKey::EncryptedPrivateKeys)?
                .ok_or(WalletError::VaultCorrupted)?;

        let mut keys = BTreeMap::new();
        for account in book.iter() {
            let blob = blobs
                .get(&account.key_ref)
                .ok_or(WalletError::VaultCorrupted)?;
            let secret = self
                .cipher
                .decrypt(blob, password, &key_purpose(&account.key_ref))
                .map_err(|_undecryptable| WalletError::VaultCorrupted)?;
            let address = match account.chain {
                ChainFamily::Ethereum => signing::evm::address_of(&secret),
                ChainFamily::Solana => signing::solana::address_of(&secret),
            }
            .map_err(|_bad_key| WalletError::VaultCorrupted)?;
            if !account.has_address(&address) {
                tracing::error!(key = %account.key_ref, "stored key does not match its account");
                return Err(WalletError::VaultCorrupted.into());
            }
            keys.insert(account.key_ref.clone(), secret);
        }

        self.lock();
        self.unlocked = Some(UnlockedSecrets { phrase, keys });
        Ok(())
    }

    /// Returns whether there was anything to discard.
    pub fn lock(&mut self) -> bool {
        self.unlocked.take().map(UnlockedSecrets::wipe).is_some()
    }

    pub fn phrase_matches(&self, words: &str) -> Result<bool, WalletError> {
        let secrets = self.unlocked.as_ref().ok_or(WalletError::WalletLocked)?;
        Ok(secrets.phrase.matches(words))
    }

    /// Plaintext phrase for the trusted setup flow only.
    pub(crate) fn reveal_phrase(&self) -> Result<Zeroizing<String>, WalletError> {
        let secrets = self.unlocked.as_ref().ok_or(WalletError::WalletLocked)?;
        Ok(Zeroizing::new(secrets.phrase.expose().to_owned()))
    }

    /// Derive and persist the next account of `chain`. Requires an unlocked
    /// vault and the vault password.
    pub fn add_account(
        &mut self,
        chain: ChainFamily,
        password: &SecretString,
    ) -> eyre::Result<Account> {
        if self.unlocked.is_none() {
            return Err(WalletError::WalletLocked.into());
        }
        let phrase = self.decrypt_phrase(password)?;
        let mut book = self.accounts()?;
        let index = book.next_index(chain);
        let derived = wallet::derive(&phrase, chain, index, self.solana)?;
        let key_ref = KeyRef::new(chain, index);

        let mut blobs: BTreeMap<KeyRef, EncryptedBlob> =
            store::load_json(self.store.as_ref(), StateKey::EncryptedPrivateKeys)?
                .unwrap_or_default();
        blobs.insert(
            key_ref.clone(),
            self.cipher
                .encrypt(&derived.secret, password, &key_purpose(&key_ref))?,
        );
        let account = Account {
            chain,
            index,
            address: derived.address.clone(),
            key_ref: key_ref.clone(),
        };
        book.push(account.clone());

        // Blob before the account row that points at it.
        store::save_json(self.store.as_ref(), StateKey::EncryptedPrivateKeys, &blobs)?;
        store::save_json(self.store.as_ref(), StateKey::Accounts, &book)?;
        if let Some(secrets) = self.unlocked.as_mut() {
            secrets.keys.insert(key_ref, derived.secret);
        }
        tracing::info!(%chain, index, address = %account.address, "account added");
        Ok(account)
    }

    /// Sign with the cached keys of `signers` (first one is the primary).
    /// Only the signature or signed payload comes back.
    pub fn sign_with(
        &self,
        network: &Network,
        signers: &[&Account],
        payload: &SignPayload,
    ) -> eyre::Result<SignatureOutput> {
        let secrets = self.unlocked.as_ref().ok_or(WalletError::WalletLocked)?;
        let keys = signers
            .iter()
            .map(|a| {
                secrets
                    .keys
                    .get(&a.key_ref)
                    .map(|k| k.as_slice())
                    .ok_or_else(|| WalletError::AccountNotFound(a.address.clone()))
            })
            .collect::<Result<Vec<&[u8]>, _>>()?;
        let primary = *keys
            .first()
            .ok_or_else(|| WalletError::invalid_params("no signing account"))?;

        match payload {
            SignPayload::EvmTransaction(tx) => {
                let chain_id = network
                    .chain_id
                    .ok_or_else(|| WalletError::UnsupportedNetwork(network.id.clone()))?;
                signing::evm::sign_transaction(primary, chain_id, tx)
            }
            SignPayload::EvmMessage(msg) => signing::evm::sign_message(primary, msg),
            SignPayload::SolanaTransaction { transaction, .. } => {
                signing::solana::sign_transaction(&keys, transaction)
            }
            SignPayload::SolanaMessage(msg) => signing::solana::sign_message(primary, msg),
        }
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
    use std::sync::Mutex;

    /// Records the order of writes.
    #[derive(Debug, Default)]
    struct Journal {
        inner: MemoryKvStore,
        writes: Mutex<Vec<(StateKey, bool)>>,
    }

    impl KvStore for Journal {
        fn get(&self, key: StateKey) -> eyre::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: StateKey, value: &[u8]) -> eyre::Result<()> {
            self.writes
                .lock()
                .map_err(|e| eyre::eyre!("{e}"))?
                .push((key, value == b"true"));
            self.inner.set(key, value)
        }

        fn delete(&self, key: StateKey) -> eyre::Result<()> {
            self.inner.delete(key)
        }
    }

    fn vault_on(store: Arc<dyn KvStore>) -> eyre::Result<SecretVault> {
        Ok(SecretVault::new(
            store,
            Arc::new(testkit::cheap_cipher()?),
            SolanaDerivation::SeedPrefix,
        ))
    }

    fn code(e: &eyre::Report) -> Option<&'static str> {
        e.downcast_ref::<WalletError>().map(WalletError::code)
    }

    #[test]
    fn initialize_writes_initialized_flag_last() -> eyre::Result<()> {
        let journal = Arc::new(Journal::default());
        let mut vault = vault_on(Arc::<Journal>::clone(&journal))?;
        vault.initialize(RecoveryPhrase::parse(ABANDON)?, &testkit::pw("correct-horse-battery"))?;

        let writes = journal.writes.lock().map_err(|e| eyre::eyre!("{e}"))?.clone();
        let flag_at = writes
            .iter()
            .position(|(k, v)| *k == StateKey::IsInitialized && *v)
            .context("flag written")?;
        let mnemonic_at = writes
            .iter()
            .position(|(k, _)| *k == StateKey::EncryptedMnemonic)
            .context("mnemonic written")?;
        assert!(mnemonic_at < flag_at, "mnemonic precedes isInitialized: {writes:?}");
        assert_eq!(writes.last().map(|w| w.0), Some(StateKey::IsInitialized));
        Ok(())
    }

    #[test]
    fn second_initialize_is_refused() -> eyre::Result<()> {
        let mut vault = vault_on(Arc::new(MemoryKvStore::default()))?;
        let pw = testkit::pw("correct-horse-battery");
        let first = vault.initialize(RecoveryPhrase::generate(12)?, &pw)?;
        let e = vault
            .initialize(RecoveryPhrase::generate(12)?, &pw)
            .err()
            .context("must refuse")?;
        assert_eq!(code(&e), Some("AlreadyInitializedError"));
        assert_eq!(vault.accounts()?, first, "keys not replaced");
        Ok(())
    }

    #[test]
    fn unlock_checks_password_and_restores_same_accounts() -> eyre::Result<()> {
        let mut vault = vault_on(Arc::new(MemoryKvStore::default()))?;
        let book = vault.initialize(RecoveryPhrase::parse(ABANDON)?, &testkit::pw("correct-horse-battery"))?;
        assert!(vault.lock(), "was unlocked");
        assert!(!vault.lock(), "nothing left to discard");

        let e = vault
            .unlock(&testkit::pw("wrong-password"))
            .err()
            .context("wrong password")?;
        assert_eq!(code(&e), Some("WrongPasswordError"));
        assert!(!vault.lock(), "a wrong password caches nothing");

        vault.unlock(&testkit::pw("correct-horse-battery"))?;
        assert_eq!(vault.accounts()?, book);
        assert_eq!(
            book.primary(ChainFamily::Ethereum).map(|a| a.address.as_str()),
            Some("0x9858EfFD232B4033E47d90003D41EC34EcaEda94")
        );
        Ok(())
    }

    #[test]
    fn signing_needs_cached_keys() -> eyre::Result<()> {
        let mut vault = vault_on(Arc::new(MemoryKvStore::default()))?;
        let book = vault.initialize(RecoveryPhrase::generate(12)?, &testkit::pw("correct-horse-battery"))?;
        let eth = book.primary(ChainFamily::Ethereum).context("eth account")?;
        let net = testkit::network("ethereum")?;
        let payload = SignPayload::EvmMessage(b"hi".to_vec());

        vault.sign_with(&net, &[eth], &payload)?;
        vault.lock();
        let e = vault
            .sign_with(&net, &[eth], &payload)
            .err()
            .context("locked")?;
        assert_eq!(code(&e), Some("WalletLockedError"));
        Ok(())
    }

    #[test]
    fn recover_is_a_hard_reset() -> eyre::Result<()> {
        let mut vault = vault_on(Arc::new(MemoryKvStore::default()))?;
        let old = vault.initialize(RecoveryPhrase::generate(12)?, &testkit::pw("first-password"))?;
        let new = vault.recover(RecoveryPhrase::parse(ABANDON)?, &testkit::pw("second-password"))?;
        assert_ne!(old, new);
        vault.lock();
        assert!(vault.unlock(&testkit::pw("first-password")).is_err(), "old password gone");
        vault.unlock(&testkit::pw("second-password"))?;
        assert_eq!(vault.accounts()?, new);
        Ok(())
    }

    #[test]
    fn swapped_key_blob_is_corruption_not_wrong_password() -> eyre::Result<()> {
        let store = Arc::new(MemoryKvStore::default());
        let mut vault = vault_on(Arc::<MemoryKvStore>::clone(&store))?;
        let pw = testkit::pw("correct-horse-battery");
        vault.initialize(RecoveryPhrase::generate(12)?, &pw)?;
        vault.lock();

        let mut blobs: BTreeMap<KeyRef, EncryptedBlob> =
            store::load_json(store.as_ref(), StateKey::EncryptedPrivateKeys)?.context("blobs")?;
        let eth = KeyRef::new(ChainFamily::Ethereum, 0);
        let sol = KeyRef::new(ChainFamily::Solana, 0);
        let sol_blob = blobs.get(&sol).cloned().context("sol blob")?;
        blobs.insert(eth, sol_blob);
        store::save_json(store.as_ref(), StateKey::EncryptedPrivateKeys, &blobs)?;

        let e = vault.unlock(&pw).err().context("must fail")?;
        assert_eq!(code(&e), Some("VaultCorruptedError"));
        Ok(())
    }

    #[test]
    fn nothing_plaintext_reaches_the_store() -> eyre::Result<()> {
        let store = Arc::new(MemoryKvStore::default());
        let mut vault = vault_on(Arc::<MemoryKvStore>::clone(&store))?;
        vault.initialize(RecoveryPhrase::parse(ABANDON)?, &testkit::pw("correct-horse-battery"))?;
        for key in StateKey::ALL {
            let Some(bytes) = store.get(key)? else {
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            assert!(!text.contains("abandon abandon"), "{} leaks phrase", key.as_str());
            assert!(!text.contains("correct-horse"), "{} leaks password", key.as_str());
        }
        Ok(())
    }

    #[test]
    fn add_account_extends_the_chain() -> eyre::Result<()> {
        let mut vault = SecretVault::new(
            Arc::new(MemoryKvStore::default()),
            Arc::new(testkit::cheap_cipher()?),
            SolanaDerivation::Bip44,
        );
        let pw = testkit::pw("correct-horse-battery");
        vault.initialize(RecoveryPhrase::parse(ABANDON)?, &pw)?;
        assert!(vault.add_account(ChainFamily::Ethereum, &testkit::pw("nope-nope")).is_err(), "password checked");
        let second = vault.add_account(ChainFamily::Ethereum, &pw)?;
        assert_eq!(second.index, 1);
        vault.lock();
        vault.unlock(&pw)?;
        assert_eq!(vault.accounts()?.for_chain(ChainFamily::Ethereum).len(), 2);
        Ok(())
    }
}
