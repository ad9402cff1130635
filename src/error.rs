use std::fmt::Display;

/// Failure kinds surfaced to the transport layer.
///
/// Every kind carries its detail as an owned string so errors stay `Clone`:
/// a failed shared producer hands the same failure to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Bad or absent authorization material, or an unknown download token.
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    /// Unparseable input: bad JSON, an unresolved preprocessor token, a
    /// secret name violating its convention.
    #[error("malformed: {0}")]
    Malformed(String),

    /// A vault, storage or IO failure that a retry could overcome. The
    /// offending cache entry is invalidated so a polling caller gets a
    /// fresh attempt.
    #[error("transient: {0}")]
    Transient(String),

    /// A broken invariant. Surfaced with diagnostics; the request aborts.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    pub fn not_found(detail: impl Display) -> Self {
        Self::NotFound(detail.to_string())
    }

    pub fn malformed(detail: impl Display) -> Self {
        Self::Malformed(detail.to_string())
    }

    pub fn transient(detail: impl Display) -> Self {
        Self::Transient(detail.to_string())
    }

    pub fn fatal(detail: impl Display) -> Self {
        Self::Fatal(detail.to_string())
    }

    /// Whether a polling caller may expect a later attempt to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
