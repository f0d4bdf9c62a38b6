use thiserror::Error;

use crate::ota::UpdateTarget;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    #[error("stored configuration is corrupt: {0}")]
    ConfigCorrupt(String),
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("{target} update incomplete: {written} of {expected} bytes")]
    UpdateIncomplete {
        target: UpdateTarget,
        written: u64,
        expected: u64,
    },
    #[error("{target} update write failed: {message}")]
    UpdateWriteFailure {
        target: UpdateTarget,
        message: String,
    },
    #[error("{target} update finalize failed: {message}")]
    UpdateFinalizeFailure {
        target: UpdateTarget,
        message: String,
    },
    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("configuration restore after filesystem update failed: {0}")]
    ConfigRestore(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("display error: {0}")]
    Display(String),
}

impl PanelError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

pub type Result<T, E = PanelError> = core::result::Result<T, E>;
