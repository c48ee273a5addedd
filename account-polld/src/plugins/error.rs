//! Poll failure taxonomy.

use thiserror::Error;

use crate::accounts::AuthFault;

/// How a supervisor reacts to a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Linear backoff, capped.
    Transient,
    /// Counts toward the consecutive authentication failure threshold.
    Auth,
    /// Like `Auth`, and the access token must be refreshed.
    TokenExpired,
}

impl ErrorClass {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth | Self::TokenExpired)
    }
}

/// Errors returned by a service poller.
#[derive(Debug, Clone, Error)]
pub enum PollError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Token expired")]
    TokenExpired,

    /// The credentials already carried a fault; nothing was sent.
    #[error("Account failed to authenticate: {0}")]
    AlreadyReported(AuthFault),

    #[error("Plugin protocol error: {0}")]
    Protocol(String),

    /// The poller task panicked.
    #[error("Poller crashed: {0}")]
    Crashed(String),

    #[error("{0}")]
    Other(String),
}

impl PollError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TokenExpired => ErrorClass::TokenExpired,
            Self::AlreadyReported(fault) if fault.is_token_expired() => ErrorClass::TokenExpired,
            Self::AuthFailed(_) | Self::AlreadyReported(_) => ErrorClass::Auth,
            Self::Network(_) | Self::Protocol(_) | Self::Crashed(_) | Self::Other(_) => {
                ErrorClass::Transient
            }
        }
    }

    /// Whether this error was logged before it reached the supervisor.
    pub fn is_already_reported(&self) -> bool {
        matches!(self, Self::AlreadyReported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(PollError::Network("reset".into()).class(), ErrorClass::Transient);
        assert_eq!(PollError::Crashed("boom".into()).class(), ErrorClass::Transient);
        assert_eq!(PollError::AuthFailed("no".into()).class(), ErrorClass::Auth);
        assert_eq!(PollError::TokenExpired.class(), ErrorClass::TokenExpired);
        assert!(PollError::TokenExpired.class().is_auth());
    }

    #[test]
    fn test_stored_fault_keeps_its_class() {
        let err = PollError::AlreadyReported(AuthFault::TokenExpired);
        assert_eq!(err.class(), ErrorClass::TokenExpired);
        assert!(err.is_already_reported());

        let err = PollError::AlreadyReported(AuthFault::AuthFailed("locked".into()));
        assert_eq!(err.class(), ErrorClass::Auth);
    }
}
