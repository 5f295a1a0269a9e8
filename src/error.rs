use thiserror::Error;

/// Local failure of the engine itself (storage or serialization).
///
/// Remote failures are deliberately not part of this enum; they are classified
/// separately as [`crate::remote::RemoteError`] and consumed by the retry
/// policy instead of being propagated.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid state: {0}")]
    State(&'static str),
}
