use serde::Serialize;
use thiserror::Error;

/// Failure surfaced to a caller of the wallet core. Every variant maps to a
/// stable code string that crosses the UI and page boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet is locked")]
    WalletLocked,

    /// Wrong password and undecryptable blob are deliberately the same error.
    #[error("wrong password")]
    WrongPassword,

    #[error("wallet is already initialized")]
    AlreadyInitialized,

    #[error("wallet is not initialized")]
    NotInitialized,

    #[error("invalid recovery phrase")]
    InvalidPhrase,

    #[error("recovery phrase confirmation does not match")]
    SeedMismatch,

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("an interrupted setup must be resumed or discarded first")]
    SetupResumeRequired,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),

    #[error("vault is corrupted; recover the wallet from its backup phrase")]
    VaultCorrupted,

    #[error("connection is not authenticated")]
    Unauthorized,

    #[error("{0}")]
    Rpc(String),
}

impl WalletError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::WalletLocked => "WalletLockedError",
            Self::WrongPassword => "WrongPasswordError",
            Self::AlreadyInitialized => "AlreadyInitializedError",
            Self::NotInitialized => "NotInitializedError",
            Self::InvalidPhrase => "InvalidPhraseError",
            Self::SeedMismatch => "SeedMismatchError",
            Self::UnsupportedNetwork(_) => "UnsupportedNetworkError",
            Self::AccountNotFound(_) => "AccountNotFoundError",
            Self::UnknownMethod(_) => "UnknownMethodError",
            Self::UnknownProvider(_) => "UnknownProviderError",
            Self::WeakPassword(_) => "WeakPasswordError",
            Self::InvalidTransition { .. } => "InvalidTransitionError",
            Self::SetupResumeRequired => "SetupResumeRequiredError",
            Self::InvalidParams(_) => "InvalidParamsError",
            Self::DuplicateRequest(_) => "DuplicateRequestError",
            Self::VaultCorrupted => "VaultCorruptedError",
            Self::Unauthorized => "UnauthorizedError",
            Self::Rpc(_) => "RpcError",
        }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Wrap a chain collaborator failure so its message passes through unchanged.
    pub fn rpc(e: &eyre::Report) -> Self {
        Self::Rpc(format!("{e:#}"))
    }
}

/// Structured errors from a chain call stay as they are; transport and node
/// failures become `Rpc`.
pub fn from_collaborator(e: eyre::Report) -> eyre::Report {
    if e.downcast_ref::<WalletError>().is_some() {
        return e;
    }
    WalletError::rpc(&e).into()
}

const INTERNAL: &str = "InternalError";

/// The error half of a response envelope.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Structured errors keep their code; anything else becomes `InternalError`
    /// with the report chain as message.
    pub fn from_report(e: &eyre::Report) -> Self {
        if let Some(we) = e.downcast_ref::<WalletError>() {
            return Self::from(we.clone());
        }
        Self::new(INTERNAL, format!("{e:#}"))
    }

    /// For untrusted peers: internal failures lose their report chain,
    /// which can name local paths. Structured errors pass unchanged.
    pub fn redacted(self) -> Self {
        if self.code == INTERNAL {
            Self::new(INTERNAL, "internal error")
        } else {
            self
        }
    }
}

impl From<WalletError> for ErrorEnvelope {
    fn from(e: WalletError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr as _;

    #[test]
    fn structured_errors_survive_context_wrapping() {
        let r: eyre::Result<()> = Err(WalletError::WalletLocked.into());
        let e = r.wrap_err("sign message").err();
        let env = e.as_ref().map(ErrorEnvelope::from_report);
        assert_eq!(
            env.map(|x| x.code),
            Some("WalletLockedError"),
            "downcast must see through context"
        );
    }

    #[test]
    fn foreign_errors_become_internal() {
        let e = eyre::eyre!("disk on fire");
        let env = ErrorEnvelope::from_report(&e);
        assert_eq!(env.code, "InternalError");
        assert!(env.message.contains("disk on fire"), "message passes through");
    }

    #[test]
    fn redaction_drops_internal_detail_only() {
        let e = eyre::eyre!("No such file")
            .wrap_err("stat /home/alice/.local/share/keystead/state/accounts");
        let env = ErrorEnvelope::from_report(&e).redacted();
        assert_eq!(env, ErrorEnvelope::new("InternalError", "internal error"));

        let locked = ErrorEnvelope::from(WalletError::WalletLocked);
        assert_eq!(locked.clone().redacted(), locked, "structured errors keep their message");
    }

    #[test]
    fn rpc_errors_pass_message_through() {
        let e = eyre::eyre!("nonce too low");
        let env = ErrorEnvelope::from(WalletError::rpc(&e));
        assert_eq!(env.code, "RpcError");
        assert_eq!(env.message, "nonce too low");
    }

    #[test]
    fn collaborator_failures_keep_structured_codes() {
        let structured = from_collaborator(WalletError::invalid_params("bad to").into());
        assert_eq!(ErrorEnvelope::from_report(&structured).code, "InvalidParamsError");
        let node = from_collaborator(eyre::eyre!("connection refused"));
        assert_eq!(ErrorEnvelope::from_report(&node).code, "RpcError");
    }
}
