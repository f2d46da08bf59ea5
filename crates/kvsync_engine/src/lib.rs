//! # KvSync Engine
//!
//! Device-to-device synchronization for key-value stores.
//!
//! This crate provides:
//! - `SyncOperation`, one caller request fanned out to many devices
//! - `SyncTaskContext`, the per-device queue of targets with timers and retries
//! - Single-version and multi-version state machines
//! - `SyncEngine`, owning the contexts of one syncer and its inbound queue
//! - `GenericSyncer`, `SyncerProxy` and `SyncerFactory`, the public facade
//! - `Metadata` and `TimeHelper`, persisted watermarks and a monotonic clock
//! - `LoopbackNetwork` and `MemorySyncInterface` for tests and simulations
//!
//! ## Architecture
//!
//! ```text
//! SyncerProxy -> GenericSyncer -> SyncEngine -> SyncTaskContext (per device)
//!                      |                              |
//!                  Metadata                    SyncStateMachine
//!                      |                              |
//!               SyncInterface                   Communicator
//! ```
//!
//! Work runs on a shared [`TaskScheduler`]. Operation completion is
//! reported over a channel and handled off the engine's locks.
//!
//! ## Key Invariants
//!
//! - A device's status within an operation only moves forward
//! - An operation reports completion exactly once
//! - Watermarks are persisted before they become visible in memory
//! - Timestamps handed out by `TimeHelper` strictly increase

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod communicator;
mod config;
mod context;
mod engine;
mod error;
mod interface;
mod memory;
mod metadata;
mod operation;
mod proxy;
mod scheduler;
mod semaphore;
mod state_machine;
mod strategy;
mod sync_id;
mod syncer;
mod target;
mod time_helper;

pub use communicator::{
    Communicator, ConnectCallback, LoopbackCommunicator, LoopbackNetwork, MessageCallback,
    SendErrorHandler,
};
pub use config::{
    RetryConfig, SyncConfig, DEFAULT_CACHE_SIZE, DEFAULT_TIMEOUT, KILL_WAIT_SECONDS,
    MAX_EXEC_NUM, QUEUED_SYNC_LIMIT_DEFAULT, RETRY_TIME,
};
pub use context::{ContextDeps, SyncPhase, SyncTaskContext, UsedGuard};
pub use engine::{DeviceHook, PermissionCheck, SyncEngine};
pub use error::{CommError, SyncError, SyncResult};
pub use interface::SyncInterface;
pub use memory::MemorySyncInterface;
pub use metadata::{hash_device_id, Metadata, DEVICE_META_KEY_PREFIX, LOCAL_TIME_OFFSET_KEY};
pub use operation::{OnComplete, OnFinalize, OnFinished, StatusMap, SyncEvent, SyncOperation};
pub use proxy::{SyncerFactory, SyncerProxy};
pub use scheduler::{TaskScheduler, TimerHandle};
pub use semaphore::Semaphore;
pub use state_machine::{MultiVerStateMachine, SingleVerStateMachine, SyncStateMachine};
pub use strategy::{strategy_for, MultiVerStrategy, SingleVerStrategy, SyncerStrategy};
pub use sync_id::{SyncIdAllocator, MAX_SYNC_ID};
pub use syncer::{GenericSyncer, LocalChangeEvent, Syncer, SyncerServices, WipePolicy};
pub use target::SyncTarget;
pub use time_helper::{sys_current_time, TimeHelper, MS_TO_100_NS};

/// Leading characters of a device id, for logs.
pub(crate) fn short_id(device: &str) -> &str {
    match device.char_indices().nth(6) {
        Some((end, _)) => &device[..end],
        None => device,
    }
}

#[cfg(test)]
mod tests {
    use super::short_id;

    #[test]
    fn short_id_truncates_on_char_boundary() {
        assert_eq!(short_id("abcdefgh"), "abcdef");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("ééééééé"), "éééééé");
    }
}
