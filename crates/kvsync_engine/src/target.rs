//! Units of work queued on a task context.

use crate::operation::SyncOperation;
use kvsync_protocol::{SyncMode, WaterMark};
use std::sync::Arc;

/// One request or response a context has to drive.
#[derive(Clone)]
pub enum SyncTarget {
    /// A locally requested sync for one device of an operation.
    Request {
        /// Operation the device belongs to.
        operation: Arc<SyncOperation>,
    },
    /// Data owed to a peer that asked us to push.
    Response {
        /// Session of the peer's request.
        session_id: u32,
        /// Sequence id of the peer's request, echoed back.
        sequence_id: u32,
        /// Our data is complete up to this mark.
        end_mark: WaterMark,
    },
}

impl SyncTarget {
    /// Creates a request target.
    pub fn request(operation: Arc<SyncOperation>) -> Self {
        SyncTarget::Request { operation }
    }

    /// Creates a `ResponsePull` target.
    pub fn response(session_id: u32, sequence_id: u32, end_mark: WaterMark) -> Self {
        SyncTarget::Response {
            session_id,
            sequence_id,
            end_mark,
        }
    }

    /// Direction of the target.
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncTarget::Request { operation } => operation.mode(),
            SyncTarget::Response { .. } => SyncMode::ResponsePull,
        }
    }

    /// Sync id of the owning operation, for request targets.
    pub fn sync_id(&self) -> Option<u32> {
        match self {
            SyncTarget::Request { operation } => Some(operation.sync_id()),
            SyncTarget::Response { .. } => None,
        }
    }

    /// Owning operation, for request targets.
    pub fn operation(&self) -> Option<&Arc<SyncOperation>> {
        match self {
            SyncTarget::Request { operation } => Some(operation),
            SyncTarget::Response { .. } => None,
        }
    }

    /// Returns true for response targets.
    pub fn is_response(&self) -> bool {
        matches!(self, SyncTarget::Response { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_kinds() {
        let op = Arc::new(SyncOperation::new(
            8,
            vec!["a".to_string()],
            SyncMode::PushAndPull,
            None,
            false,
        ));
        let request = SyncTarget::request(op);
        assert_eq!(request.sync_id(), Some(8));
        assert_eq!(request.mode(), SyncMode::PushAndPull);
        assert!(!request.is_response());

        let response = SyncTarget::response(1, 2, 30);
        assert_eq!(response.sync_id(), None);
        assert_eq!(response.mode(), SyncMode::ResponsePull);
        assert!(response.is_response());
        assert!(response.operation().is_none());
    }
}
