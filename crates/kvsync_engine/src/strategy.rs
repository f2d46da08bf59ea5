//! What distinguishes the single-version and multi-version syncers.

use crate::state_machine::{MultiVerStateMachine, SingleVerStateMachine, SyncStateMachine};
use kvsync_protocol::{InterfaceType, SyncMode};
use std::sync::Arc;

/// Storage-flavour specific behaviour plugged into a
/// [`GenericSyncer`](crate::GenericSyncer).
pub trait SyncerStrategy: Send + Sync {
    /// Storage flavour this strategy serves.
    fn interface_type(&self) -> InterfaceType;

    /// Mode used for automatic syncs.
    fn auto_sync_mode(&self) -> SyncMode;

    /// Protocol driver for every task context of the engine.
    fn create_state_machine(&self) -> Arc<dyn SyncStateMachine>;

    /// Returns true if local changes are announced to peers instead of
    /// pushed.
    fn broadcasts_local_changes(&self) -> bool;

    /// Returns true if device watermarks may be erased.
    fn supports_water_mark_erase(&self) -> bool;

    /// Returns true if a stale data wipe policy can be set.
    fn supports_wipe_policy(&self) -> bool;
}

/// Strategy for single-version stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleVerStrategy;

impl SyncerStrategy for SingleVerStrategy {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::SingleVersion
    }

    fn auto_sync_mode(&self) -> SyncMode {
        SyncMode::AutoPush
    }

    fn create_state_machine(&self) -> Arc<dyn SyncStateMachine> {
        Arc::new(SingleVerStateMachine)
    }

    fn broadcasts_local_changes(&self) -> bool {
        false
    }

    fn supports_water_mark_erase(&self) -> bool {
        true
    }

    fn supports_wipe_policy(&self) -> bool {
        true
    }
}

/// Strategy for multi-version stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiVerStrategy;

impl SyncerStrategy for MultiVerStrategy {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::MultiVersion
    }

    fn auto_sync_mode(&self) -> SyncMode {
        SyncMode::AutoPull
    }

    fn create_state_machine(&self) -> Arc<dyn SyncStateMachine> {
        Arc::new(MultiVerStateMachine)
    }

    fn broadcasts_local_changes(&self) -> bool {
        true
    }

    fn supports_water_mark_erase(&self) -> bool {
        false
    }

    fn supports_wipe_policy(&self) -> bool {
        false
    }
}

/// Strategy for `interface_type`.
pub fn strategy_for(interface_type: InterfaceType) -> Arc<dyn SyncerStrategy> {
    match interface_type {
        InterfaceType::SingleVersion => Arc::new(SingleVerStrategy),
        InterfaceType::MultiVersion => Arc::new(MultiVerStrategy),
    }
}
