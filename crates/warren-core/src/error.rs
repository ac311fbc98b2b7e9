//! Error taxonomy for the Warren control plane

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("permission validation failed: {0}")]
    PermissionValidation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("peer is not registered")]
    PeerNotRegistered,

    #[error("peer login has expired, please log in once more")]
    PeerLoginExpired,

    #[error("peer login mismatch: peer belongs to a different user")]
    PeerLoginMismatch,

    #[error("peer is not part of this account")]
    PeerNotPartOfAccount,

    /// Retryable uniqueness collision (IP or DNS-label allocation race).
    /// Never surfaced to API callers directly.
    #[error("unique constraint violation: {0}")]
    UniqueConstraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// True for errors that allocation paths may retry on.
    pub fn is_unique_constraint(&self) -> bool {
        matches!(self, Error::UniqueConstraint(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_constraint_is_retryable() {
        assert!(Error::UniqueConstraint("peers.ip".into()).is_unique_constraint());
        assert!(!Error::PeerLoginExpired.is_unique_constraint());
    }

    #[test]
    fn duplicate_registration_message() {
        let err = Error::PreconditionFailed("peer has been already registered".into());
        assert_eq!(
            err.to_string(),
            "precondition failed: peer has been already registered"
        );
    }
}
