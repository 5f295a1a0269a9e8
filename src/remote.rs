use thiserror::Error;

/// Identifier assigned by the remote store on insert.
pub type RemoteId = String;

/// Failure reported by the remote store, classified for the retry policy.
///
/// Network errors, timeouts and 5xx responses are retryable; semantic
/// rejections (validation, 4xx) are terminal and drop the operation
/// immediately regardless of its retry count.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("retryable remote failure: {0}")]
    Retryable(String),
    #[error("terminal remote failure: {0}")]
    Terminal(String),
}

impl RemoteError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        RemoteError::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        RemoteError::Terminal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Retryable(_))
    }
}

/// Trait implemented by the host to apply queued mutations against the
/// backend. This keeps the engine transport-agnostic.
///
/// Implementations own their call deadline: a call that exceeds it must
/// return [`RemoteError::Retryable`] rather than block the drain loop.
pub trait RemoteStore {
    fn insert(&self, table: &str, record: &serde_json::Value) -> Result<RemoteId, RemoteError>;
    fn update(&self, table: &str, id: &str, patch: &serde_json::Value) -> Result<(), RemoteError>;
    fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
}
