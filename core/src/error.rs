use thiserror::Error;

/// Error kinds surfaced by the store and its blob backends.
///
/// Callers match on the kind rather than the message: the HTTP layer maps
/// kinds to status codes, and the fallback store recovers `NotFound` from
/// secondary backends. Driver and I/O failures are wrapped in `Internal`
/// with their cause preserved.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("duplicate upload")]
    DuplicateUpload,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("content challenge failed")]
    ChallengeFailed,

    #[error("invalid entity reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
