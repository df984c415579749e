//! Error types for provider operations.

use forge_mail_core::filter::FilterError;
use forge_mail_core::proto::ErrorCode;
use forge_mail_core::store::StoreError;
use forge_mail_core::validate::ValidationError;
use thiserror::Error;

/// Errors surfaced by providers.
///
/// `Unavailable` and `Disconnected` are recovered locally by the hybrid
/// provider (demotion to file polling); everything else reaches the caller.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Store-level failure (validation, I/O, JSON)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid filter options
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Invalid name or target
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The broker could not be reached (dial failure)
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker rejected the handshake: wrong project
    #[error("broker rejected connection: project mismatch")]
    InvalidProject,

    /// The broker rejected a request with a non-recoverable error envelope
    #[error("broker rejected request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// Malformed wire traffic
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The broker connection dropped mid-stream
    #[error("broker connection lost: {0}")]
    Disconnected(String),

    /// An internal task failed to complete
    #[error("provider task failed: {0}")]
    Task(String),
}

impl ProviderError {
    /// True for conditions the hybrid provider absorbs by demoting to the
    /// file transport.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::Disconnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_split() {
        assert!(ProviderError::Unavailable("dial".into()).is_recoverable());
        assert!(ProviderError::Disconnected("eof".into()).is_recoverable());
        assert!(!ProviderError::InvalidProject.is_recoverable());
        assert!(!ProviderError::Protocol("bad line".into()).is_recoverable());
    }
}
