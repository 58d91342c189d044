use crate::store::StoreError;
use crate::system::process::UnknownSortField;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    InvalidSortField(#[from] UnknownSortField),
    #[error("min_mem_percent must be a non-negative number, got {0}")]
    InvalidThreshold(f64),
    #[error("process history is unavailable: logging is disabled")]
    LoggingDisabled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
