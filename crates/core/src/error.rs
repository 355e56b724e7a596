#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MirraError {
    /// Network, timeout or conflict; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The object is already gone; callers treat this as satisfied.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Misconfiguration detected at setup; never retried.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Watch cursor rejected by the remote side; forces a full relist.
    #[error("stale_version: {0}")]
    StaleVersion(String),
}

impl MirraError {
    pub fn transient(msg: impl Into<String>) -> Self { Self::Transient(msg.into()) }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn fatal(msg: impl Into<String>) -> Self { Self::Fatal(msg.into()) }
    pub fn stale(msg: impl Into<String>) -> Self { Self::StaleVersion(msg.into()) }

    pub fn is_retryable(&self) -> bool {
        matches!(self, MirraError::Transient(_) | MirraError::StaleVersion(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            MirraError::Transient(_) => "transient",
            MirraError::NotFound(_) => "not_found",
            MirraError::Fatal(_) => "fatal",
            MirraError::StaleVersion(_) => "stale_version",
        }
    }
}

pub type MirraResult<T> = Result<T, MirraError>;
