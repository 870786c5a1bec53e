use crate::{
    config::{KeysteadConfig, SetupConfig},
    errors::WalletError,
    keystore::{
        crypto::{self, KdfParams, SecretCipher},
        SecretVault,
    },
    network::{Network, NetworkRegistry},
    signing::{SignPayload, SignatureOutput, SigningMediator},
    store::{self, KvStore, StateKey},
    wallet::{Account, AccountBook, ChainFamily, RecoveryPhrase},
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use zeroize::Zeroizing;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupPhase {
    Choosing,
    CreatingPassword,
    ViewingSeed,
    ConfirmingSeed,
    RecoveringFromPhrase,
    Complete,
}

impl SetupPhase {
    /// Phases that are only reachable once the vault has been written.
    pub const fn has_vault(self) -> bool {
        matches!(self, Self::ViewingSeed | Self::ConfirmingSeed | Self::Complete)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Choosing => "choosing",
            Self::CreatingPassword => "creatingPassword",
            Self::ViewingSeed => "viewingSeed",
            Self::ConfirmingSeed => "confirmingSeed",
            Self::RecoveringFromPhrase => "recoveringFromPhrase",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupKind {
    Create,
    Recover,
}

/// Onboarding breadcrumb, persisted so a reload can offer resume-or-discard.
/// Carries at most a salted password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupProgress {
    pub phase: SetupPhase,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SetupKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic_ref: Option<String>,
    /// Unix millis of the last advance.
    pub timestamp: i64,
}

impl SetupProgress {
    fn is_expired(&self, now_ms: i64, ttl_seconds: u64) -> bool {
        let ttl_ms = i64::try_from(ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.timestamp) > ttl_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletPhase {
    Uninitialized,
    /// `parked` setups need `resume_setup` (or a discard) before anything
    /// else; they come from a reload, a lock, or an expired record.
    SettingUp {
        progress: SetupProgress,
        parked: bool,
        expired: bool,
    },
    Locked,
    Unlocked,
    /// Unrecoverable without the backup phrase.
    Corrupted,
}

impl WalletPhase {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::SettingUp { .. } => "settingUp",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Corrupted => "corrupted",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::SettingUp { progress, .. } => format!("settingUp({})", progress.phase.as_str()),
            other => other.label().to_owned(),
        }
    }
}

/// A freshly created wallet. The phrase is handed to the trusted UI once.
pub struct CreatedWallet {
    pub mnemonic: Zeroizing<String>,
    pub accounts: AccountBook,
}

impl fmt::Debug for CreatedWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedWallet")
            .field("accounts", &self.accounts)
            .finish_non_exhaustive()
    }
}

/// Result of resuming a parked setup. The phrase is re-surfaced only when the
/// backup was never acknowledged.
pub struct ResumedSetup {
    pub phase: SetupPhase,
    pub mnemonic: Option<Zeroizing<String>>,
}

impl fmt::Debug for ResumedSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumedSetup")
            .field("phase", &self.phase)
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatus {
    pub phase: SetupPhase,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<SetupKind>,
    pub awaiting_resume: bool,
    pub expired: bool,
}

/// Trusted-UI view of the wallet. Public data only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletStatus {
    pub is_initialized: bool,
    pub is_locked: bool,
    pub phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupStatus>,
    pub selected_network: String,
    pub network: Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub accounts: BTreeMap<ChainFamily, Vec<String>>,
}

/// Owner of the wallet record, the vault and the network pointer.
///
/// Every transition runs on `&mut self`; the service actor is the only
/// holder, which serializes lock, unlock, recovery and signing.
#[derive(Debug)]
pub struct WalletMachine {
    store: Arc<dyn KvStore>,
    vault: SecretVault,
    networks: NetworkRegistry,
    setup: SetupConfig,
    kdf: KdfParams,
    phase: WalletPhase,
    accounts: AccountBook,
}

impl WalletMachine {
    pub fn load(
        cfg: &KeysteadConfig,
        store: Arc<dyn KvStore>,
        cipher: Arc<dyn SecretCipher>,
        networks: NetworkRegistry,
    ) -> eyre::Result<Self> {
        Self::load_at(cfg, store, cipher, networks, now_ms())
    }

    /// Rebuild the phase from persisted keys as of `now_ms`. A wallet that
    /// exists always comes back locked.
    pub fn load_at(
        cfg: &KeysteadConfig,
        store: Arc<dyn KvStore>,
        cipher: Arc<dyn SecretCipher>,
        networks: NetworkRegistry,
        now_ms: i64,
    ) -> eyre::Result<Self> {
        let vault = SecretVault::new(Arc::clone(&store), cipher, cfg.solana_derivation);
        let mut m = Self {
            store,
            vault,
            networks,
            setup: cfg.setup,
            kdf: KdfParams::from(&cfg.kdf),
            phase: WalletPhase::Uninitialized,
            accounts: AccountBook::default(),
        };
        m.phase = m.restore(now_ms)?;
        if m.vault.is_initialized()? {
            m.accounts = m.vault.accounts()?;
            store::save_flag(m.store.as_ref(), StateKey::IsLocked, true)?;
        }
        tracing::info!(
            phase = %m.phase.describe(),
            network = %m.networks.selected().id,
            "wallet loaded"
        );
        Ok(m)
    }

    fn restore(&self, now_ms: i64) -> eyre::Result<WalletPhase> {
        let ttl = self.setup.progress_ttl_seconds;
        let progress: Option<SetupProgress> =
            store::load_json(self.store.as_ref(), StateKey::SetupProgress)?;

        if self.vault.is_initialized()? {
            if !self.vault.is_intact()? {
                tracing::error!("wallet is initialized but its phrase blob is missing");
                return Ok(WalletPhase::Corrupted);
            }
            if store::load_flag(self.store.as_ref(), StateKey::SetupComplete)? {
                return Ok(WalletPhase::Locked);
            }
            return Ok(match progress {
                Some(progress) => {
                    let expired = progress.is_expired(now_ms, ttl);
                    WalletPhase::SettingUp {
                        progress,
                        parked: true,
                        expired,
                    }
                }
                None => WalletPhase::Locked,
            });
        }

        let Some(progress) = progress else {
            return Ok(WalletPhase::Uninitialized);
        };
        if progress.phase.has_vault() {
            // The vault write never landed.
            tracing::warn!(
                phase = progress.phase.as_str(),
                "discarding setup progress without a vault"
            );
            self.store.delete(StateKey::SetupProgress)?;
            return Ok(WalletPhase::Uninitialized);
        }
        let expired = progress.is_expired(now_ms, ttl);
        if expired {
            tracing::info!(phase = progress.phase.as_str(), "setup progress expired");
        }
        Ok(WalletPhase::SettingUp {
            progress,
            parked: expired,
            expired,
        })
    }

    pub const fn phase(&self) -> &WalletPhase {
        &self.phase
    }

    fn invalid(&self, action: &'static str) -> WalletError {
        WalletError::InvalidTransition {
            action,
            state: self.phase.describe(),
        }
    }

    /// The live setup's phase; parked setups must be resumed first.
    fn active_setup(&self, action: &'static str) -> Result<SetupPhase, WalletError> {
        match &self.phase {
            WalletPhase::SettingUp { parked: true, .. } => Err(WalletError::SetupResumeRequired),
            WalletPhase::SettingUp { progress, .. } => Ok(progress.phase),
            _ => Err(self.invalid(action)),
        }
    }

    fn check_password(&self, password: &SecretString) -> Result<(), WalletError> {
        let min = self.setup.min_password_len;
        if password.expose_secret().chars().count() < min {
            return Err(WalletError::WeakPassword(min));
        }
        Ok(())
    }

    fn enter_setup(
        &mut self,
        phase: SetupPhase,
        kind: Option<SetupKind>,
        password_hash: Option<String>,
    ) -> eyre::Result<()> {
        let progress = SetupProgress {
            phase,
            kind,
            password_hash,
            mnemonic_ref: phase
                .has_vault()
                .then(|| StateKey::EncryptedMnemonic.as_str().to_owned()),
            timestamp: now_ms(),
        };
        store::save_json(self.store.as_ref(), StateKey::SetupProgress, &progress)?;
        tracing::info!(phase = phase.as_str(), kind = ?kind, "setup advanced");
        self.phase = WalletPhase::SettingUp {
            progress,
            parked: false,
            expired: false,
        };
        Ok(())
    }

    fn advance(&mut self, next: SetupPhase) -> eyre::Result<()> {
        let (kind, hash) = match &self.phase {
            WalletPhase::SettingUp { progress, .. } => {
                (progress.kind, progress.password_hash.clone())
            }
            _ => (None, None),
        };
        self.enter_setup(next, kind, hash)
    }

    /// Drop the breadcrumb after a failed vault write.
    fn abandon_setup(&mut self) -> eyre::Result<()> {
        self.store.delete(StateKey::SetupProgress)?;
        self.phase = if self.vault.is_initialized()? {
            WalletPhase::Locked
        } else {
            WalletPhase::Uninitialized
        };
        Ok(())
    }

    pub fn begin_setup(&mut self) -> eyre::Result<()> {
        match &self.phase {
            WalletPhase::Uninitialized => {}
            WalletPhase::SettingUp { parked: true, .. } => {
                return Err(WalletError::SetupResumeRequired.into())
            }
            WalletPhase::SettingUp { progress, .. } if !progress.phase.has_vault() => {}
            WalletPhase::Locked | WalletPhase::Unlocked => {
                return Err(WalletError::AlreadyInitialized.into())
            }
            WalletPhase::SettingUp { .. } | WalletPhase::Corrupted => {
                return Err(self.invalid("begin setup").into())
            }
        }
        self.enter_setup(SetupPhase::Choosing, None, None)
    }

    pub fn choose(&mut self, kind: SetupKind) -> eyre::Result<SetupPhase> {
        if self.active_setup("choose a setup path")?.has_vault() {
            return Err(self.invalid("choose a setup path").into());
        }
        let next = match kind {
            SetupKind::Create => SetupPhase::CreatingPassword,
            SetupKind::Recover => SetupPhase::RecoveringFromPhrase,
        };
        self.enter_setup(next, Some(kind), None)?;
        Ok(next)
    }

    /// Generate, encrypt and persist a new wallet, landing in `viewingSeed`.
    pub fn create_wallet(&mut self, password: &SecretString) -> eyre::Result<CreatedWallet> {
        match &self.phase {
            WalletPhase::Uninitialized => {}
            WalletPhase::SettingUp { parked: true, .. } => {
                return Err(WalletError::SetupResumeRequired.into())
            }
            WalletPhase::SettingUp { progress, .. }
                if matches!(
                    progress.phase,
                    SetupPhase::Choosing | SetupPhase::CreatingPassword
                ) => {}
            WalletPhase::Locked | WalletPhase::Unlocked => {
                return Err(WalletError::AlreadyInitialized.into())
            }
            WalletPhase::SettingUp { .. } | WalletPhase::Corrupted => {
                return Err(self.invalid("create a wallet").into())
            }
        }
        if self.vault.is_initialized()? {
            return Err(WalletError::AlreadyInitialized.into());
        }
        self.check_password(password)?;

        let phrase = RecoveryPhrase::generate(self.setup.phrase_words)?;
        let hash = crypto::hash_password(password, self.kdf)?;
        self.store.delete(StateKey::SetupComplete)?;
        // Breadcrumb before the vault: a crash in between is discarded on load.
        self.enter_setup(SetupPhase::ViewingSeed, Some(SetupKind::Create), Some(hash))?;
        let accounts = match self.vault.initialize(phrase, password) {
            Ok(a) => a,
            Err(e) => {
                self.abandon_setup()?;
                return Err(e);
            }
        };
        self.accounts = accounts.clone();
        let mnemonic = self.vault.reveal_phrase()?;
        tracing::info!(
            address = ?accounts.primary(ChainFamily::Ethereum).map(|a| a.address.as_str()),
            "wallet created"
        );
        Ok(CreatedWallet { mnemonic, accounts })
    }

    pub fn acknowledge_backup(&mut self) -> eyre::Result<()> {
        if self.active_setup("acknowledge the backup")? != SetupPhase::ViewingSeed {
            return Err(self.invalid("acknowledge the backup").into());
        }
        self.advance(SetupPhase::ConfirmingSeed)
    }

    /// A mismatch leaves the machine in `confirmingSeed` for another try.
    pub fn confirm_seed(&mut self, words: &str) -> eyre::Result<()> {
        if self.active_setup("confirm the phrase")? != SetupPhase::ConfirmingSeed {
            return Err(self.invalid("confirm the phrase").into());
        }
        if !self.vault.phrase_matches(words)? {
            tracing::info!("phrase confirmation mismatch");
            return Err(WalletError::SeedMismatch.into());
        }
        self.advance(SetupPhase::Complete)
    }

    /// Hard reset onto `phrase` from any state; lands in `complete`.
    pub fn recover(&mut self, phrase: &str, password: &SecretString) -> eyre::Result<AccountBook> {
        let phrase = RecoveryPhrase::parse(phrase)?;
        self.check_password(password)?;
        let hash = crypto::hash_password(password, self.kdf)?;
        self.store.delete(StateKey::SetupComplete)?;
        self.enter_setup(SetupPhase::Complete, Some(SetupKind::Recover), Some(hash))?;
        let accounts = match self.vault.recover(phrase, password) {
            Ok(a) => a,
            Err(e) => {
                self.abandon_setup()?;
                return Err(e);
            }
        };
        self.accounts = accounts.clone();
        tracing::info!(
            address = ?accounts.primary(ChainFamily::Ethereum).map(|a| a.address.as_str()),
            "wallet recovered"
        );
        Ok(accounts)
    }

    pub fn finish_setup(&mut self) -> eyre::Result<()> {
        if self.active_setup("finish setup")? != SetupPhase::Complete {
            return Err(self.invalid("finish setup").into());
        }
        store::save_flag(self.store.as_ref(), StateKey::SetupComplete, true)?;
        self.store.delete(StateKey::SetupProgress)?;
        store::save_flag(self.store.as_ref(), StateKey::IsLocked, false)?;
        self.phase = WalletPhase::Unlocked;
        tracing::info!("setup complete");
        Ok(())
    }

    /// Re-authenticate a parked setup. Phases past the vault write need the
    /// password; earlier ones hold nothing worth protecting.
    pub fn resume_setup(&mut self, password: Option<&SecretString>) -> eyre::Result<ResumedSetup> {
        let WalletPhase::SettingUp {
            progress,
            parked: true,
            ..
        } = &self.phase
        else {
            return Err(self.invalid("resume setup").into());
        };
        let progress = progress.clone();

        if progress.phase.has_vault() {
            let password = password
                .ok_or_else(|| WalletError::invalid_params("password is required to resume"))?;
            if let Some(hash) = &progress.password_hash {
                if !crypto::verify_password_hash(password, hash) {
                    return Err(WalletError::WrongPassword.into());
                }
            }
            self.unlock_vault(password)?;
        }

        let phase = progress.phase;
        self.enter_setup(phase, progress.kind, progress.password_hash)?;
        let mnemonic = if phase == SetupPhase::ViewingSeed {
            Some(self.vault.reveal_phrase()?)
        } else {
            None
        };
        Ok(ResumedSetup { phase, mnemonic })
    }

    /// Abandon onboarding. A vault written during this setup goes with it.
    pub fn discard_setup(&mut self) -> eyre::Result<()> {
        let WalletPhase::SettingUp { progress, .. } = &self.phase else {
            return Err(self.invalid("discard setup").into());
        };
        if progress.phase.has_vault() && self.vault.is_initialized()? {
            self.vault.wipe()?;
        }
        self.store.delete(StateKey::SetupProgress)?;
        self.store.delete(StateKey::SetupComplete)?;
        self.accounts = AccountBook::default();
        self.phase = WalletPhase::Uninitialized;
        tracing::info!("setup discarded");
        Ok(())
    }

    /// Idempotent. A setup past the vault write is parked.
    pub fn lock(&mut self) -> eyre::Result<()> {
        let discarded = self.vault.lock();
        if self.phase == WalletPhase::Unlocked {
            self.phase = WalletPhase::Locked;
        } else if let WalletPhase::SettingUp {
            progress, parked, ..
        } = &mut self.phase
        {
            if progress.phase.has_vault() {
                *parked = true;
            }
        }
        if self.vault.is_initialized()? {
            store::save_flag(self.store.as_ref(), StateKey::IsLocked, true)?;
        }
        tracing::info!(discarded, phase = %self.phase.describe(), "locked");
        Ok(())
    }

    pub fn unlock(&mut self, password: &SecretString) -> eyre::Result<()> {
        let setup = match &self.phase {
            WalletPhase::Uninitialized => return Err(WalletError::NotInitialized.into()),
            WalletPhase::Corrupted => return Err(WalletError::VaultCorrupted.into()),
            WalletPhase::SettingUp {
                progress, parked, ..
            } => Some((progress.phase.has_vault(), *parked)),
            WalletPhase::Locked | WalletPhase::Unlocked => None,
        };
        match setup {
            Some((false, _)) => return Err(WalletError::NotInitialized.into()),
            Some((true, true)) => return self.resume_setup(Some(password)).map(drop),
            // Live setup: the keys are already cached.
            Some((true, false)) => return self.vault.verify_password(password),
            None => {}
        }

        self.unlock_vault(password)?;
        store::save_flag(self.store.as_ref(), StateKey::IsLocked, false)?;
        self.phase = WalletPhase::Unlocked;
        tracing::info!(accounts = self.accounts.iter().count(), "unlocked");
        Ok(())
    }

    fn unlock_vault(&mut self, password: &SecretString) -> eyre::Result<()> {
        if let Err(e) = self.vault.unlock(password) {
            if matches!(
                e.downcast_ref::<WalletError>(),
                Some(WalletError::VaultCorrupted)
            ) {
                tracing::error!("vault failed its integrity check");
                self.phase = WalletPhase::Corrupted;
            }
            return Err(e);
        }
        self.accounts = self.vault.accounts()?;
        Ok(())
    }

    /// Destroy the wallet record. The password is checked unless the vault
    /// is already known to be corrupted.
    pub fn wipe(&mut self, password: Option<&SecretString>) -> eyre::Result<()> {
        if self.phase != WalletPhase::Corrupted && self.vault.is_initialized()? {
            let password =
                password.ok_or_else(|| WalletError::invalid_params("password is required"))?;
            self.vault.verify_password(password)?;
        }
        self.vault.wipe()?;
        for key in [
            StateKey::SetupProgress,
            StateKey::SetupComplete,
            StateKey::IsLocked,
        ] {
            self.store.delete(key)?;
        }
        self.accounts = AccountBook::default();
        self.phase = WalletPhase::Uninitialized;
        tracing::warn!("wallet wiped");
        Ok(())
    }

    pub fn switch_network(&mut self, id: &str) -> eyre::Result<Network> {
        self.networks.switch_to(id).cloned()
    }

    pub fn selected_network(&self) -> Network {
        self.networks.selected().clone()
    }

    pub fn networks(&self) -> Vec<Network> {
        self.networks.all().to_vec()
    }

    pub fn status(&self) -> eyre::Result<WalletStatus> {
        let network = self.networks.selected().clone();
        let setup = match &self.phase {
            WalletPhase::SettingUp {
                progress,
                parked,
                expired,
            } => Some(SetupStatus {
                phase: progress.phase,
                kind: progress.kind,
                awaiting_resume: *parked,
                expired: *expired,
            }),
            _ => None,
        };
        Ok(WalletStatus {
            is_initialized: self.vault.is_initialized()?,
            is_locked: self.phase != WalletPhase::Unlocked,
            phase: self.phase.label(),
            setup,
            selected_network: network.id.clone(),
            address: self
                .accounts
                .primary(network.family)
                .map(|a| a.address.clone()),
            accounts: self.accounts.addresses(),
            network,
        })
    }

    /// Addresses a page connected through `family` may see.
    pub fn page_accounts(&self, family: ChainFamily) -> Result<Vec<String>, WalletError> {
        if self.phase != WalletPhase::Unlocked {
            return Err(WalletError::WalletLocked);
        }
        Ok(self
            .accounts
            .for_chain(family)
            .iter()
            .map(|a| a.address.clone())
            .collect())
    }

    /// The active network, provided it belongs to `family`.
    pub fn provider_network(&self, family: ChainFamily) -> Result<Network, WalletError> {
        let selected = self.networks.selected();
        if selected.family != family {
            return Err(WalletError::AccountNotFound(format!(
                "active network {} is not a {family} network",
                selected.id
            )));
        }
        Ok(selected.clone())
    }

    pub fn add_account(&mut self, chain: ChainFamily, password: &SecretString) -> eyre::Result<Account> {
        if self.phase != WalletPhase::Unlocked {
            return Err(WalletError::WalletLocked.into());
        }
        let account = self.vault.add_account(chain, password)?;
        self.accounts = self.vault.accounts()?;
        Ok(account)
    }

    pub fn request_signature(
        &self,
        network_id: &str,
        address: &str,
        payload: &SignPayload,
    ) -> eyre::Result<SignatureOutput> {
        SigningMediator {
            unlocked: self.phase == WalletPhase::Unlocked,
            networks: &self.networks,
            accounts: &self.accounts,
            vault: &self.vault,
        }
        .request_signature(network_id, address, payload)
    }
}
