use tally_adapters::RemoteFetchError;
use tally_storage::StoreError;
use thiserror::Error;

/// A single remote record could not be classified. The record is counted
/// `ignored` and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("remote record has an empty natural key")]
    MissingKey,
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

/// A run-level failure. The run is aborted without advancing its checkpoint.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote fetch failed: {0}")]
    Remote(#[from] RemoteFetchError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;
