//! Error types for the sync engine.

use kvsync_protocol::{AckErrorCode, OperationStatus, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures reported by the communicator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// Target device is not reachable.
    #[error("device offline")]
    DeviceOffline,

    /// Transport send queue is saturated.
    #[error("communicator busy")]
    Busy,

    /// Communicator has been released.
    #[error("communicator closed")]
    Closed,

    /// Any other send failure.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Operation attempted before `initialize`.
    #[error("syncer not initialized")]
    NotInit,

    /// Bad mode, empty device list or similar caller mistake.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A component could not be constructed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Syncer is closing or manual sync is disabled.
    #[error("busy: {0}")]
    Busy(String),

    /// Too many manual syncs are already queued.
    #[error("manual sync queue full (limit {limit})")]
    QueueFull {
        /// Configured queue limit.
        limit: usize,
    },

    /// Operation not supported by this syncer.
    #[error("not supported: {0}")]
    NotSupport(String),

    /// Storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error("communication error: {0}")]
    Communication(#[from] CommError),

    /// Message does not belong to the current exchange.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No answer in time.
    #[error("operation timed out")]
    Timeout,

    /// Peer schema is incompatible.
    #[error("schema mismatch")]
    SchemaMismatch,

    /// Peer rejected our security option.
    #[error("security option check failed")]
    SecurityOptionCheck,

    /// Storage key was revoked.
    #[error("key revoked")]
    KeyRevoked,

    /// Permission check refused the device.
    #[error("permission denied")]
    PermissionDenied,

    /// Object was killed while the call was in flight.
    #[error("object is killed")]
    Killed,
}

impl SyncError {
    /// Returns true for both busy flavours.
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncError::Busy(_) | SyncError::QueueFull { .. })
    }

    /// Per-device status this error finalizes to.
    pub fn to_status(&self) -> OperationStatus {
        match self {
            SyncError::Timeout => OperationStatus::Timeout,
            SyncError::Communication(CommError::Busy) => OperationStatus::BusyFailure,
            SyncError::Communication(_) => OperationStatus::CommAbnormal,
            SyncError::Busy(_) | SyncError::QueueFull { .. } => OperationStatus::BusyFailure,
            SyncError::SchemaMismatch => OperationStatus::SchemaIncompatible,
            SyncError::SecurityOptionCheck => OperationStatus::SecurityOptionCheckFailure,
            SyncError::KeyRevoked => OperationStatus::EKeyRevokedFailure,
            SyncError::PermissionDenied => OperationStatus::PermissionCheckFailed,
            _ => OperationStatus::Failed,
        }
    }

    /// Returns true if the failed step can be re-issued.
    pub fn is_retryable(&self) -> bool {
        self.to_status().is_transient()
    }
}

impl From<AckErrorCode> for SyncError {
    fn from(code: AckErrorCode) -> Self {
        match code {
            AckErrorCode::SchemaMismatch => SyncError::SchemaMismatch,
            AckErrorCode::SecurityOptionCheck => SyncError::SecurityOptionCheck,
            AckErrorCode::KeyRevoked => SyncError::KeyRevoked,
            AckErrorCode::Busy => SyncError::Busy("peer busy".into()),
            AckErrorCode::PermissionDenied => SyncError::PermissionDenied,
            AckErrorCode::Internal => SyncError::Storage("peer storage failure".into()),
        }
    }
}
