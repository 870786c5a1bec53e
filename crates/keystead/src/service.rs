//! The wallet actor.
//!
//! One OS thread owns the [`WalletMachine`] and works through a bounded queue
//! of [`Command`]s, one at a time. Key derivation and Argon2 run there, off the
//! async runtime. Lock, unlock, recovery and signing are serialized by the
//! queue: a `Lock` sent while a signature is queued runs after it, so the
//! signature completes with the key it found and the key is cleared next.

use crate::{
    errors::WalletError,
    lifecycle::{CreatedWallet, ResumedSetup, SetupKind, SetupPhase, WalletMachine, WalletStatus},
    network::Network,
    signing::{SignPayload, SignatureOutput},
    wallet::{Account, AccountBook, ChainFamily},
};
use eyre::Context as _;
use secrecy::SecretString;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

const QUEUE_DEPTH: usize = 64;

type Reply<T> = oneshot::Sender<eyre::Result<T>>;

pub enum Command {
    Status {
        reply: Reply<WalletStatus>,
    },
    Networks {
        reply: Reply<(Vec<Network>, Network)>,
    },
    BeginSetup {
        reply: Reply<()>,
    },
    Choose {
        kind: SetupKind,
        reply: Reply<SetupPhase>,
    },
    Create {
        password: SecretString,
        reply: Reply<CreatedWallet>,
    },
    AcknowledgeBackup {
        reply: Reply<()>,
    },
    ConfirmSeed {
        words: Zeroizing<String>,
        reply: Reply<()>,
    },
    Recover {
        phrase: Zeroizing<String>,
        password: SecretString,
        reply: Reply<AccountBook>,
    },
    FinishSetup {
        reply: Reply<()>,
    },
    ResumeSetup {
        password: Option<SecretString>,
        reply: Reply<ResumedSetup>,
    },
    DiscardSetup {
        reply: Reply<()>,
    },
    Lock {
        reply: Reply<()>,
    },
    Unlock {
        password: SecretString,
        reply: Reply<()>,
    },
    Wipe {
        password: Option<SecretString>,
        reply: Reply<()>,
    },
    SwitchNetwork {
        id: String,
        reply: Reply<Network>,
    },
    AddAccount {
        chain: ChainFamily,
        password: SecretString,
        reply: Reply<Account>,
    },
    PageAccounts {
        family: ChainFamily,
        reply: Reply<Vec<String>>,
    },
    ProviderNetwork {
        family: ChainFamily,
        reply: Reply<Network>,
    },
    Sign {
        network: String,
        address: String,
        payload: SignPayload,
        reply: Reply<SignatureOutput>,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Networks { .. } => "networks",
            Self::BeginSetup { .. } => "begin_setup",
            Self::Choose { .. } => "choose",
            Self::Create { .. } => "create",
            Self::AcknowledgeBackup { .. } => "acknowledge_backup",
            Self::ConfirmSeed { .. } => "confirm_seed",
            Self::Recover { .. } => "recover",
            Self::FinishSetup { .. } => "finish_setup",
            Self::ResumeSetup { .. } => "resume_setup",
            Self::DiscardSetup { .. } => "discard_setup",
            Self::Lock { .. } => "lock",
            Self::Unlock { .. } => "unlock",
            Self::Wipe { .. } => "wipe",
            Self::SwitchNetwork { .. } => "switch_network",
            Self::AddAccount { .. } => "add_account",
            Self::PageAccounts { .. } => "page_accounts",
            Self::ProviderNetwork { .. } => "provider_network",
            Self::Sign { .. } => "sign",
        }
    }
}

// Secrets ride in several variants; only the name is printed.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command::{}", self.name())
    }
}

fn answer<T>(reply: Reply<T>, result: eyre::Result<T>) {
    if reply.send(result).is_err() {
        tracing::debug!("caller went away before the reply");
    }
}

fn handle(m: &mut WalletMachine, cmd: Command) {
    match cmd {
        Command::Status { reply } => answer(reply, m.status()),
        Command::Networks { reply } => answer(reply, Ok((m.networks(), m.selected_network()))),
        Command::BeginSetup { reply } => answer(reply, m.begin_setup()),
        Command::Choose { kind, reply } => answer(reply, m.choose(kind)),
        Command::Create { password, reply } => answer(reply, m.create_wallet(&password)),
        Command::AcknowledgeBackup { reply } => answer(reply, m.acknowledge_backup()),
        Command::ConfirmSeed { words, reply } => answer(reply, m.confirm_seed(&words)),
        Command::Recover {
            phrase,
            password,
            reply,
        } => answer(reply, m.recover(&phrase, &password)),
        Command::FinishSetup { reply } => answer(reply, m.finish_setup()),
        Command::ResumeSetup { password, reply } => {
            answer(reply, m.resume_setup(password.as_ref()));
        }
        Command::DiscardSetup { reply } => answer(reply, m.discard_setup()),
        Command::Lock { reply } => answer(reply, m.lock()),
        Command::Unlock { password, reply } => answer(reply, m.unlock(&password)),
        Command::Wipe { password, reply } => answer(reply, m.wipe(password.as_ref())),
        Command::SwitchNetwork { id, reply } => answer(reply, m.switch_network(&id)),
        Command::AddAccount {
            chain,
            password,
            reply,
        } => answer(reply, m.add_account(chain, &password)),
        Command::PageAccounts { family, reply } => {
            answer(reply, m.page_accounts(family).map_err(eyre::Report::from));
        }
        Command::ProviderNetwork { family, reply } => {
            answer(reply, m.provider_network(family).map_err(eyre::Report::from));
        }
        Command::Sign {
            network,
            address,
            payload,
            reply,
        } => answer(reply, m.request_signature(&network, &address, &payload)),
    }
}

/// Start the actor thread. It exits once every handle is dropped.
pub fn spawn(machine: WalletMachine) -> eyre::Result<WalletHandle> {
    let (tx, mut rx) = mpsc::channel::<Command>(QUEUE_DEPTH);
    std::thread::Builder::new()
        .name("keystead-wallet".to_owned())
        .spawn(move || {
            let mut machine = machine;
            while let Some(cmd) = rx.blocking_recv() {
                tracing::trace!(command = cmd.name(), "wallet command");
                handle(&mut machine, cmd);
            }
            tracing::debug!("wallet actor stopped");
        })
        .context("spawn wallet actor")?;
    Ok(WalletHandle { tx })
}

/// Cheap, cloneable address of the wallet actor.
#[derive(Debug, Clone)]
pub struct WalletHandle {
    tx: mpsc::Sender<Command>,
}

impl WalletHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> eyre::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_closed| eyre::eyre!("wallet service stopped"))?;
        rx.await
            .map_err(|_dropped| eyre::eyre!("wallet service dropped the request"))?
    }

    pub async fn status(&self) -> eyre::Result<WalletStatus> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// The network table and the selected entry.
    pub async fn networks(&self) -> eyre::Result<(Vec<Network>, Network)> {
        self.call(|reply| Command::Networks { reply }).await
    }

    pub async fn begin_setup(&self) -> eyre::Result<()> {
        self.call(|reply| Command::BeginSetup { reply }).await
    }

    pub async fn choose(&self, kind: SetupKind) -> eyre::Result<SetupPhase> {
        self.call(|reply| Command::Choose { kind, reply }).await
    }

    pub async fn create_wallet(&self, password: SecretString) -> eyre::Result<CreatedWallet> {
        self.call(|reply| Command::Create { password, reply }).await
    }

    pub async fn acknowledge_backup(&self) -> eyre::Result<()> {
        self.call(|reply| Command::AcknowledgeBackup { reply }).await
    }

    pub async fn confirm_seed(&self, words: Zeroizing<String>) -> eyre::Result<()> {
        self.call(|reply| Command::ConfirmSeed { words, reply }).await
    }

    pub async fn recover(
        &self,
        phrase: Zeroizing<String>,
        password: SecretString,
    ) -> eyre::Result<AccountBook> {
        self.call(|reply| Command::Recover {
            phrase,
            password,
            reply,
        })
        .await
    }

    pub async fn finish_setup(&self) -> eyre::Result<()> {
        self.call(|reply| Command::FinishSetup { reply }).await
    }

    pub async fn resume_setup(&self, password: Option<SecretString>) -> eyre::Result<ResumedSetup> {
        self.call(|reply| Command::ResumeSetup { password, reply })
            .await
    }

    pub async fn discard_setup(&self) -> eyre::Result<()> {
        self.call(|reply| Command::DiscardSetup { reply }).await
    }

    pub async fn lock(&self) -> eyre::Result<()> {
        self.call(|reply| Command::Lock { reply }).await
    }

    pub async fn unlock(&self, password: SecretString) -> eyre::Result<()> {
        self.call(|reply| Command::Unlock { password, reply }).await
    }

    pub async fn wipe(&self, password: Option<SecretString>) -> eyre::Result<()> {
        self.call(|reply| Command::Wipe { password, reply }).await
    }

    pub async fn switch_network(&self, id: String) -> eyre::Result<Network> {
        self.call(|reply| Command::SwitchNetwork { id, reply }).await
    }

    pub async fn add_account(&self, chain: ChainFamily, password: SecretString) -> eyre::Result<Account> {
        self.call(|reply| Command::AddAccount {
            chain,
            password,
            reply,
        })
        .await
    }

    /// Addresses a page on `family` may see. Fails `WalletLocked` unless unlocked.
    pub async fn page_accounts(&self, family: ChainFamily) -> eyre::Result<Vec<String>> {
        self.call(|reply| Command::PageAccounts { family, reply })
            .await
    }

    pub async fn provider_network(&self, family: ChainFamily) -> eyre::Result<Network> {
        self.call(|reply| Command::ProviderNetwork { family, reply })
            .await
    }

    pub async fn sign(
        &self,
        network: String,
        address: String,
        payload: SignPayload,
    ) -> eyre::Result<SignatureOutput> {
        self.call(|reply| Command::Sign {
            network,
            address,
            payload,
            reply,
        })
        .await
    }
}

/// True when `e` carries this wallet error kind.
pub fn is_wallet_error(e: &eyre::Report, kind: &WalletError) -> bool {
    e.downcast_ref::<WalletError>()
        .is_some_and(|we| std::mem::discriminant(we) == std::mem::discriminant(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryKvStore, testkit};
    use eyre::ContextCompat as _;
    use std::sync::Arc;

    async fn unlocked_wallet() -> eyre::Result<(WalletHandle, String)> {
        let h = spawn(testkit::machine(&Arc::new(MemoryKvStore::default()))?)?;
        h.recover(
            Zeroizing::new(testkit::ABANDON.to_owned()),
            testkit::pw("correct-horse-battery"),
        )
        .await?;
        h.finish_setup().await?;
        let addr = h.status().await?.address.context("eth address")?;
        Ok((h, addr))
    }

    #[tokio::test]
    async fn lock_queued_behind_a_signature_lets_it_finish() -> eyre::Result<()> {
        let (h, addr) = unlocked_wallet().await?;
        assert_eq!(addr, testkit::ABANDON_ETH);

        let payload = SignPayload::EvmMessage(b"gm".to_vec());
        let (signed, locked) = tokio::join!(
            h.sign("ethereum".to_owned(), addr.clone(), payload.clone()),
            h.lock()
        );
        signed?;
        locked?;

        let e = h
            .sign("ethereum".to_owned(), addr, payload)
            .await
            .err()
            .context("locked now")?;
        assert!(is_wallet_error(&e, &WalletError::WalletLocked), "{e:#}");
        Ok(())
    }

    #[tokio::test]
    async fn page_accounts_follow_the_lock_state() -> eyre::Result<()> {
        let (h, addr) = unlocked_wallet().await?;
        assert_eq!(h.page_accounts(ChainFamily::Ethereum).await?, vec![addr]);
        h.lock().await?;
        let e = h
            .page_accounts(ChainFamily::Ethereum)
            .await
            .err()
            .context("locked")?;
        assert!(is_wallet_error(&e, &WalletError::WalletLocked), "{e:#}");
        Ok(())
    }

    #[test]
    fn command_debug_names_only() {
        let (reply, _rx) = oneshot::channel();
        let cmd = Command::Unlock {
            password: testkit::pw("correct-horse-battery"),
            reply,
        };
        assert_eq!(format!("{cmd:?}"), "Command::unlock");
    }
}
