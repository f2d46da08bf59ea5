//! A single sync request and its per-device progress.
//!
//! A [`SyncOperation`] is shared between the syncer's live table and every
//! task context that drives one of its devices. Per-device statuses only
//! move forward:
//!
//! ```text
//! Waiting -> Syncing -> SendFinished | RecvFinished -> FinishedAll
//!                    \-> any final failure
//! ```
//!
//! `SendFinished` and `RecvFinished` merge into `FinishedAll`. Once every
//! device is final the operation reports itself to the completion loop,
//! which runs [`SyncOperation::finished`] exactly once.

use crate::semaphore::Semaphore;
use kvsync_protocol::{DeviceId, OperationStatus, SyncMode};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Final per-device statuses handed to completion callbacks.
pub type StatusMap = BTreeMap<DeviceId, OperationStatus>;

/// User completion callback.
pub type OnComplete = Box<dyn FnOnce(&StatusMap) + Send>;

/// Runs when the operation is dropped.
pub type OnFinalize = Box<dyn FnOnce() + Send>;

/// Internal hook run after the user callback, with the sync id.
pub type OnFinished = Box<dyn FnOnce(u32) + Send>;

/// Events consumed by a syncer's completion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// Every device of the operation reached a final status.
    OperationFinished(u32),
}

#[derive(Default)]
struct Callbacks {
    on_complete: Option<OnComplete>,
    on_finished: Option<OnFinished>,
    on_finalize: Option<OnFinalize>,
}

/// A sync request over a set of devices.
pub struct SyncOperation {
    sync_id: u32,
    devices: Vec<DeviceId>,
    mode: SyncMode,
    is_block_sync: bool,
    statuses: Mutex<StatusMap>,
    finished: AtomicBool,
    killed: AtomicBool,
    all_finished_reported: AtomicBool,
    semaphore: Option<Semaphore>,
    notified: AtomicBool,
    callbacks: Mutex<Callbacks>,
    events: Mutex<Option<UnboundedSender<SyncEvent>>>,
}

impl SyncOperation {
    /// Creates an operation. Devices start out `Waiting`.
    pub fn new(
        sync_id: u32,
        devices: Vec<DeviceId>,
        mode: SyncMode,
        on_complete: Option<OnComplete>,
        wait: bool,
    ) -> Self {
        let operation = Self {
            sync_id,
            devices,
            mode,
            is_block_sync: wait,
            statuses: Mutex::new(StatusMap::new()),
            finished: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            all_finished_reported: AtomicBool::new(false),
            semaphore: wait.then(|| Semaphore::new(0)),
            notified: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks {
                on_complete,
                ..Callbacks::default()
            }),
            events: Mutex::new(None),
        };
        operation.initialize();
        operation
    }

    /// Seeds every device to `Waiting`.
    pub fn initialize(&self) {
        let mut statuses = self.statuses.lock();
        for device in &self.devices {
            statuses.insert(device.clone(), OperationStatus::Waiting);
        }
    }

    /// Sync id assigned by the syncer.
    pub fn sync_id(&self) -> u32 {
        self.sync_id
    }

    /// Devices covered by this operation.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Requested direction.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Returns true if the caller blocks until completion.
    pub fn is_block_sync(&self) -> bool {
        self.is_block_sync
    }

    /// Returns true for automatic syncs.
    pub fn is_auto_sync(&self) -> bool {
        self.mode.is_auto()
    }

    /// Returns true once `finished` has run.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Returns true once `kill` has run.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Routes the all-finished event to a completion loop.
    pub fn set_event_sender(&self, sender: UnboundedSender<SyncEvent>) {
        *self.events.lock() = Some(sender);
    }

    /// Installs the internal post-completion hook.
    pub fn set_on_sync_finished(&self, hook: OnFinished) {
        self.callbacks.lock().on_finished = Some(hook);
    }

    /// Installs the callback run on drop.
    pub fn set_on_sync_finalize(&self, hook: OnFinalize) {
        self.callbacks.lock().on_finalize = Some(hook);
    }

    /// Status of `device`, if it belongs to this operation.
    pub fn get_status(&self, device: &str) -> Option<OperationStatus> {
        self.statuses.lock().get(device).copied()
    }

    /// Snapshot of every device status.
    pub fn statuses(&self) -> StatusMap {
        self.statuses.lock().clone()
    }

    /// Moves `device` forward to `status`.
    ///
    /// Returns false if the transition was refused: unknown device, a
    /// backwards move, a final status already set, or a killed operation.
    pub fn set_status(&self, device: &str, status: OperationStatus) -> bool {
        if self.is_killed() {
            return false;
        }
        let all_finished = {
            let mut statuses = self.statuses.lock();
            let Some(current) = statuses.get_mut(device) else {
                return false;
            };
            let Some(next) = next_status(*current, status) else {
                return false;
            };
            debug!(sync_id = self.sync_id, from = ?*current, to = ?next, "device status");
            *current = next;
            statuses.values().all(|s| s.is_final())
        };
        if all_finished {
            self.report_all_finished();
        }
        true
    }

    /// Returns true once every device is final.
    pub fn check_is_all_finished(&self) -> bool {
        self.statuses.lock().values().all(|s| s.is_final())
    }

    /// Runs the user callback, then the internal hook. Only the first call
    /// has any effect.
    pub fn finished(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let (on_complete, on_finished) = {
            let mut callbacks = self.callbacks.lock();
            (callbacks.on_complete.take(), callbacks.on_finished.take())
        };
        let statuses = self.statuses();
        info!(sync_id = self.sync_id, ?statuses, "sync operation finished");
        if let Some(on_complete) = on_complete {
            on_complete(&statuses);
        }
        if let Some(on_finished) = on_finished {
            on_finished(self.sync_id);
        }
    }

    /// Force-terminates: non-final devices become `Failed`, then
    /// `finished` runs.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut statuses = self.statuses.lock();
            for status in statuses.values_mut() {
                if !status.is_final() {
                    *status = OperationStatus::Failed;
                }
            }
        }
        self.finished();
    }

    /// Parks a blocking caller until `notify_if_need`.
    pub fn wait_if_need(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.wait();
        }
    }

    /// Releases a blocking caller. Subsequent calls do nothing.
    pub fn notify_if_need(&self) {
        if let Some(semaphore) = &self.semaphore {
            if !self.notified.swap(true, Ordering::SeqCst) {
                semaphore.send();
            }
        }
    }

    fn report_all_finished(&self) {
        if self.all_finished_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self.events.lock().clone();
        match sender {
            Some(sender) => {
                if sender.send(SyncEvent::OperationFinished(self.sync_id)).is_err() {
                    // Completion loop is gone; finish inline.
                    self.finished();
                }
            }
            None => self.finished(),
        }
    }
}

impl Drop for SyncOperation {
    fn drop(&mut self) {
        if let Some(on_finalize) = self.callbacks.get_mut().on_finalize.take() {
            on_finalize();
        }
    }
}

fn next_status(current: OperationStatus, requested: OperationStatus) -> Option<OperationStatus> {
    if current.is_final() || current == requested {
        return None;
    }
    if current.is_half_finished() && requested.is_half_finished() {
        return Some(OperationStatus::FinishedAll);
    }
    if requested.rank() <= current.rank() {
        return None;
    }
    Some(requested)
}
