use thiserror::Error;

/// Surfaced to the caller of the affected Store operation (§7: "Store
/// I/O failure"). The Store itself never retries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("failed to serialize custody chunk ranges: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown bundle state {0:?}")]
    UnknownState(String),
}
