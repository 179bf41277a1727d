//! Error types for the virtual SCSI adapter core

use thiserror::Error;

/// Adapter-wide error kind.
///
/// Every control-plane command and every internal operation returns one of
/// these. Validation errors never mutate device state; transport-class
/// errors latch `hard_terminate` on the affected device (see `engine`).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("buffer overflow, {required} bytes required")]
    BufferOverflow { required: usize },

    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("invalid request handle: {0:#x}")]
    InvalidHandle(u64),

    #[error("instance name already in use: {0}")]
    NameCollision(String),

    #[error("NBD connection refused: {0}")]
    ConnectionRefused(String),

    #[error("NBD connection lost: {0}")]
    ConnectionLost(String),

    #[error("NBD negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("request aborted")]
    Aborted,

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type used throughout the core.
pub type AdapterResult<T> = Result<T, AdapterError>;

impl AdapterError {
    /// Maps an error kind to the SCSI-visible completion status named in
    /// the external interface contract (`Success`/`Aborted`/`Timeout`/
    /// `InternalError`/`InvalidRequest`/`NoDevice`).
    pub fn scsi_completion_status(&self) -> ScsiCompletionStatus {
        match self {
            AdapterError::Aborted => ScsiCompletionStatus::Aborted,
            AdapterError::Timeout | AdapterError::ConnectionLost(_) => {
                ScsiCompletionStatus::Timeout
            }
            AdapterError::NotFound(_) => ScsiCompletionStatus::NoDevice,
            AdapterError::InvalidParameter(_) => ScsiCompletionStatus::InvalidRequest,
            _ => ScsiCompletionStatus::InternalError,
        }
    }
}

/// The small, closed set of completion outcomes the SCSI front understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiCompletionStatus {
    Success,
    Aborted,
    Timeout,
    InternalError,
    InvalidRequest,
    NoDevice,
}
