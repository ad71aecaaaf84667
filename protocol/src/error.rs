use thiserror::Error;

/// Errors surfaced by the coordination core.
///
/// Writing a job or result whose uuid is already known is a no-op, not
/// an error.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Store miss or missing collection.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Missing or malformed uuid, non-object or empty dataset.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// No connected relay node can carry the handshake.
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    /// A network call expired before a reply arrived.
    #[error("timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// An execution unit reported an error while running a job.
    #[error("execution fault in unit {unit}: {reason}")]
    ExecutionFault { unit: usize, reason: String },

    /// The store collaborator failed (I/O, serialization).
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// A network send failed for a reason other than a timeout.
    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl MeshError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage {
            reason: format!("serialization failed: {e}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
