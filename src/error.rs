use thiserror::Error;

/// Flat error taxonomy for the processing core.
///
/// Every variant maps to one of the seven kinds the core distinguishes
/// (see [`CoreError::kind`]); callers that only need to branch on kind
/// should match on that instead of the variant itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("authentication failed")]
    Auth(String),

    #[error("fatal configuration error: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The seven error kinds from the taxonomy. `CoreError` is a single flat
/// enum rather than one type per kind; this accessor recovers the kind
/// for code that needs to branch (e.g. whether a dispatch failure is
/// eligible for retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Transient,
    Auth,
    Fatal,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::Transient(_) | CoreError::Database(_) | CoreError::Io(_) => {
                ErrorKind::Transient
            }
            CoreError::Serialization(_) => ErrorKind::Internal,
            CoreError::Auth(_) => ErrorKind::Auth,
            CoreError::Fatal(_) => ErrorKind::Fatal,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a failure of this kind is worth handing to the retry
    /// scheduler rather than treated as terminal. Validation, conflict,
    /// forbidden, and not-found errors mean the input itself is bad and
    /// retrying changes nothing.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Transient => true,
            ErrorKind::Internal => {
                let msg = self.to_string().to_lowercase();
                ["timeout", "timed out", "temporar", "connection", "connect",
                 "rate limit", "503", "unavailable", "too many requests"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }
}
