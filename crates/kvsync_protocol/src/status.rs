//! Per-device operation statuses and context lifecycle enums.

use serde::{Deserialize, Serialize};

/// Progress of one device within a sync operation.
///
/// Variants are declared in lattice order. Everything from
/// [`OperationStatus::FinishedAll`] onwards is final: success first, then
/// the failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Queued, not yet started.
    Waiting,
    /// Exchange in progress.
    Syncing,
    /// Local data fully sent.
    SendFinished,
    /// Remote data fully received.
    RecvFinished,
    /// Both directions done.
    FinishedAll,
    /// No answer within the retry budget.
    Timeout,
    /// Local permission check refused the device.
    PermissionCheckFailed,
    /// Channel to the device is down.
    CommAbnormal,
    /// Peer rejected our security label.
    SecurityOptionCheckFailure,
    /// Storage key was revoked while syncing.
    EKeyRevokedFailure,
    /// Peer or transport was too busy.
    BusyFailure,
    /// Peer schema cannot be reconciled with ours.
    SchemaIncompatible,
    /// Any other failure.
    Failed,
}

impl OperationStatus {
    /// Returns true for terminal statuses (success or failure).
    pub fn is_final(self) -> bool {
        self >= OperationStatus::FinishedAll
    }

    /// Returns true for terminal failure statuses.
    pub fn is_failure(self) -> bool {
        self > OperationStatus::FinishedAll
    }

    /// Returns true for one-directional completion.
    pub fn is_half_finished(self) -> bool {
        matches!(
            self,
            OperationStatus::SendFinished | OperationStatus::RecvFinished
        )
    }

    /// Position in the progress lattice; both half-finished states share a rank.
    pub fn rank(self) -> u8 {
        match self {
            OperationStatus::Waiting => 0,
            OperationStatus::Syncing => 1,
            OperationStatus::SendFinished | OperationStatus::RecvFinished => 2,
            _ => 3,
        }
    }

    /// Returns true for failures worth another attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            OperationStatus::Timeout | OperationStatus::CommAbnormal | OperationStatus::BusyFailure
        )
    }
}

/// Execution lifecycle of a task context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskExecStatus {
    /// Created, nothing run yet.
    Init,
    /// A target is being driven.
    Running,
    /// The last target failed to start.
    Failed,
    /// Queue drained.
    Finished,
}

/// Whether the step in flight may be re-issued on timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStatus {
    /// Timeout is terminal.
    NoNeedRetry,
    /// Timeout re-issues the current step.
    NeedRetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_threshold() {
        assert!(!OperationStatus::Waiting.is_final());
        assert!(!OperationStatus::RecvFinished.is_final());
        assert!(OperationStatus::FinishedAll.is_final());
        assert!(!OperationStatus::FinishedAll.is_failure());
        assert!(OperationStatus::Timeout.is_failure());
        assert!(OperationStatus::Failed.is_failure());
    }

    #[test]
    fn ranks_follow_lattice() {
        assert!(OperationStatus::Waiting.rank() < OperationStatus::Syncing.rank());
        assert_eq!(
            OperationStatus::SendFinished.rank(),
            OperationStatus::RecvFinished.rank()
        );
        assert_eq!(OperationStatus::SchemaIncompatible.rank(), 3);
    }

    #[test]
    fn transient_failures() {
        assert!(OperationStatus::Timeout.is_transient());
        assert!(OperationStatus::BusyFailure.is_transient());
        assert!(!OperationStatus::SchemaIncompatible.is_transient());
        assert!(!OperationStatus::PermissionCheckFailed.is_transient());
    }
}
