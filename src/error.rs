//! Session error taxonomy.

use std::fmt;
use thiserror::Error;

use crate::persist::StoreError;

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// DNS, connect, bind or connect timeout.
    Connect(String),
    /// The server never identified itself as a known cluster.
    UnknownDialect,
    /// Closed during login with no sign of a second login.
    LoginRejected,
    /// Closed during login after a duplicate-login notice.
    MultipleLogins,
    /// Closed or errored after login.
    LostConnection,
    /// A read or write failed mid-session.
    Io(String),
}

/// The error families a caller reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    Protocol,
    RateLimit,
}

impl FailureReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            FailureReason::Connect(_) | FailureReason::LostConnection | FailureReason::Io(_) => {
                ErrorClass::Transport
            }
            FailureReason::UnknownDialect
            | FailureReason::LoginRejected
            | FailureReason::MultipleLogins => ErrorClass::Protocol,
        }
    }
}

impl fmt::Display for FailureReason {
    /// The message shown to the operator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Connect(detail) => write!(f, "Cluster connection failed: {detail}"),
            FailureReason::UnknownDialect => f.write_str("Unknown cluster type"),
            FailureReason::LoginRejected => f.write_str("Cluster login failed"),
            FailureReason::MultipleLogins => {
                f.write_str("Cluster login failed: multiple logins with this call")
            }
            FailureReason::LostConnection => f.write_str("Lost cluster connection"),
            FailureReason::Io(detail) => write!(f, "Cluster I/O error: {detail}"),
        }
    }
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("too many lost connections, retry in {retry_after_secs} s")]
    TooManyLostConnections { retry_after_secs: u32 },

    #[error("{0}")]
    Failed(FailureReason),

    #[error("session is not connected")]
    NotConnected,

    #[error("could not save connection counters: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::TooManyLostConnections { .. } => ErrorClass::RateLimit,
            SessionError::Failed(reason) => reason.class(),
            SessionError::NotConnected | SessionError::Store(_) => ErrorClass::Transport,
        }
    }

    /// Only rate limiting ends automatic retries.
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::RateLimit
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            SessionError::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<FailureReason> for SessionError {
    fn from(reason: FailureReason) -> Self {
        SessionError::Failed(reason)
    }
}
