//! The syncer facade exposed to storage layers.
//!
//! A [`GenericSyncer`] validates sync requests, allocates sync ids, keeps
//! the table of live operations, throttles queued manual syncs, and hands
//! operations to its [`SyncEngine`]. Completed operations are reported
//! over a channel and finished on the scheduler, so user callbacks never
//! run under an engine or context lock.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kvsync_engine::{
//!     GenericSyncer, LoopbackNetwork, MemorySyncInterface, Syncer, SyncerServices,
//! };
//! use kvsync_protocol::SyncMode;
//!
//! let network = LoopbackNetwork::new();
//! let services = SyncerServices::new(network.communicator("phone")).unwrap();
//! let syncer = GenericSyncer::single_version(services);
//! syncer
//!     .initialize(Arc::new(MemorySyncInterface::single_version("db")))
//!     .unwrap();
//!
//! // No peers: the request is still valid, every device just fails.
//! let id = syncer
//!     .sync(&["tablet".to_string()], SyncMode::Push, None, None, true)
//!     .unwrap();
//! assert!(id >= 1);
//! syncer.close().unwrap();
//! ```

use crate::communicator::Communicator;
use crate::config::SyncConfig;
use crate::context::ContextDeps;
use crate::engine::{PermissionCheck, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::interface::SyncInterface;
use crate::metadata::Metadata;
use crate::operation::{OnComplete, OnFinalize, SyncEvent, SyncOperation};
use crate::scheduler::TaskScheduler;
use crate::short_id;
use crate::strategy::{MultiVerStrategy, SingleVerStrategy, SyncerStrategy};
use crate::sync_id::SyncIdAllocator;
use crate::time_helper::{sys_current_time, TimeHelper};
use kvsync_protocol::{DeviceId, InterfaceType, SyncMode, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// What to do with data of a device that was away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WipePolicy {
    /// Keep watermarks; sync resumes incrementally.
    #[default]
    RetainStaleData,
    /// Reset the peer watermark when the device comes back online.
    WipeStaleData,
}

/// Kind of local change reported by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChangeEvent {
    /// Records were written.
    Put,
    /// Records were deleted.
    Delete,
    /// The store was cleared.
    Clear,
    /// Records arrived through sync.
    SyncMerged,
}

impl LocalChangeEvent {
    /// Returns true if the change should be propagated by auto sync.
    pub fn triggers_sync(self) -> bool {
        !matches!(self, LocalChangeEvent::SyncMerged)
    }
}

/// Operations exposed to storage layers.
pub trait Syncer: Send + Sync {
    /// Wires the syncer to its storage. Idempotent.
    fn initialize(&self, sync_interface: Arc<dyn SyncInterface>) -> SyncResult<()>;

    /// Kills every live operation and tears the engine down.
    fn close(&self) -> SyncResult<()>;

    /// Starts a sync and returns its id.
    ///
    /// With `wait` the call blocks until every device is final.
    fn sync(
        &self,
        devices: &[DeviceId],
        mode: SyncMode,
        on_complete: Option<OnComplete>,
        on_finalize: Option<OnFinalize>,
        wait: bool,
    ) -> SyncResult<u32>;

    /// Cancels a live operation. Unknown ids are ignored.
    fn remove_sync_operation(&self, sync_id: u32) -> SyncResult<()>;

    /// Allocates a virtual timestamp.
    fn get_time_stamp(&self) -> Timestamp;

    /// Turns automatic syncing on or off.
    fn enable_auto_sync(&self, enable: bool);

    /// Reports a local change.
    fn local_data_changed(&self, event: LocalChangeEvent);

    /// Reports that `device` has new data.
    fn remote_data_changed(&self, device: &str);

    /// Resets both watermarks of `device`.
    fn erase_device_water_mark(&self, device: &str, is_need_hash: bool) -> SyncResult<()>;

    /// Non-blocking manual syncs currently queued.
    fn get_queued_sync_size(&self) -> SyncResult<usize>;

    /// Sets the limit of queued manual syncs.
    fn set_queued_sync_limit(&self, limit: usize) -> SyncResult<()>;

    /// Limit of queued manual syncs.
    fn get_queued_sync_limit(&self) -> SyncResult<usize>;

    /// Refuses further manual syncs. Fails while any are queued.
    fn disable_manual_sync(&self) -> SyncResult<()>;

    /// Accepts manual syncs again.
    fn enable_manual_sync(&self) -> SyncResult<()>;

    /// Hashed identity of this device.
    fn get_local_identity(&self) -> SyncResult<String>;

    /// Sets the stale data wipe policy.
    fn set_stale_data_wipe_policy(&self, policy: WipePolicy) -> SyncResult<()>;

    /// Installs the per-device permission check.
    fn set_permission_check(&self, check: Option<PermissionCheck>) -> SyncResult<()>;
}

/// Process-wide collaborators handed to every syncer.
#[derive(Clone)]
pub struct SyncerServices {
    /// Task and timer runtime.
    pub scheduler: Arc<TaskScheduler>,
    /// Sync id source.
    pub id_allocator: Arc<SyncIdAllocator>,
    /// Transport of this device.
    pub communicator: Arc<dyn Communicator>,
    /// Timeouts, retries and limits.
    pub config: SyncConfig,
}

impl SyncerServices {
    /// Creates services with the default configuration.
    pub fn new(communicator: Arc<dyn Communicator>) -> SyncResult<Self> {
        Self::with_config(communicator, SyncConfig::default())
    }

    /// Creates services with `config`, starting a fresh scheduler.
    pub fn with_config(communicator: Arc<dyn Communicator>, config: SyncConfig) -> SyncResult<Self> {
        Ok(Self {
            scheduler: Arc::new(TaskScheduler::new(config.worker_threads)?),
            id_allocator: Arc::new(SyncIdAllocator::new()),
            communicator,
            config,
        })
    }

    /// Shares an existing scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<TaskScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Shares an existing id allocator.
    pub fn with_id_allocator(mut self, id_allocator: Arc<SyncIdAllocator>) -> Self {
        self.id_allocator = id_allocator;
        self
    }
}

#[derive(Default)]
struct SyncerState {
    initialized: bool,
    closing: bool,
    label: String,
    engine: Option<Arc<SyncEngine>>,
    metadata: Option<Arc<Metadata>>,
    time_helper: Option<Arc<TimeHelper>>,
    events: Option<UnboundedSender<SyncEvent>>,
}

struct ManualQueue {
    size: usize,
    limit: usize,
    manual_enabled: bool,
}

struct SyncerInner {
    strategy: Arc<dyn SyncerStrategy>,
    services: SyncerServices,
    weak_self: Weak<SyncerInner>,
    state: RwLock<SyncerState>,
    operations: Mutex<HashMap<u32, Arc<SyncOperation>>>,
    queue: Mutex<ManualQueue>,
    auto_sync: AtomicBool,
    wipe_policy: Mutex<WipePolicy>,
    permission_check: RwLock<Option<PermissionCheck>>,
}

/// Syncer over a pluggable [`SyncerStrategy`].
pub struct GenericSyncer {
    inner: Arc<SyncerInner>,
}

impl GenericSyncer {
    /// Creates a syncer with `strategy`.
    pub fn new(strategy: Arc<dyn SyncerStrategy>, services: SyncerServices) -> Self {
        let limit = services.config.queued_sync_limit;
        let inner = Arc::new_cyclic(|weak_self| SyncerInner {
            strategy,
            services,
            weak_self: weak_self.clone(),
            state: RwLock::new(SyncerState::default()),
            operations: Mutex::new(HashMap::new()),
            queue: Mutex::new(ManualQueue {
                size: 0,
                limit,
                manual_enabled: true,
            }),
            auto_sync: AtomicBool::new(false),
            wipe_policy: Mutex::new(WipePolicy::default()),
            permission_check: RwLock::new(None),
        });
        Self { inner }
    }

    /// Creates a single-version syncer.
    pub fn single_version(services: SyncerServices) -> Self {
        Self::new(Arc::new(SingleVerStrategy), services)
    }

    /// Creates a multi-version syncer.
    pub fn multi_version(services: SyncerServices) -> Self {
        Self::new(Arc::new(MultiVerStrategy), services)
    }

    /// Storage flavour this syncer serves.
    pub fn interface_type(&self) -> InterfaceType {
        self.inner.strategy.interface_type()
    }

    /// Returns true between `initialize` and `close`.
    pub fn is_initialized(&self) -> bool {
        self.inner.state.read().initialized
    }

    /// Operations that have not finished yet.
    pub fn live_operation_count(&self) -> usize {
        self.inner.operations.lock().len()
    }

    /// The engine, while initialized.
    pub fn engine(&self) -> Option<Arc<SyncEngine>> {
        self.inner.state.read().engine.clone()
    }

    /// Consistency metadata, while initialized.
    pub fn metadata(&self) -> Option<Arc<Metadata>> {
        self.inner.state.read().metadata.clone()
    }

    /// Current stale data wipe policy.
    pub fn stale_data_wipe_policy(&self) -> WipePolicy {
        *self.inner.wipe_policy.lock()
    }
}

impl Syncer for GenericSyncer {
    fn initialize(&self, sync_interface: Arc<dyn SyncInterface>) -> SyncResult<()> {
        self.inner.initialize(sync_interface)
    }

    fn close(&self) -> SyncResult<()> {
        self.inner.close()
    }

    fn sync(
        &self,
        devices: &[DeviceId],
        mode: SyncMode,
        on_complete: Option<OnComplete>,
        on_finalize: Option<OnFinalize>,
        wait: bool,
    ) -> SyncResult<u32> {
        self.inner.sync(devices, mode, on_complete, on_finalize, wait)
    }

    fn remove_sync_operation(&self, sync_id: u32) -> SyncResult<()> {
        self.inner.remove_sync_operation(sync_id);
        Ok(())
    }

    fn get_time_stamp(&self) -> Timestamp {
        let time_helper = self.inner.state.read().time_helper.clone();
        match time_helper {
            Some(time_helper) => time_helper.get_time(),
            None => sys_current_time(),
        }
    }

    fn enable_auto_sync(&self, enable: bool) {
        self.inner.enable_auto_sync(enable);
    }

    fn local_data_changed(&self, event: LocalChangeEvent) {
        self.inner.local_data_changed(event);
    }

    fn remote_data_changed(&self, device: &str) {
        self.inner.remote_data_changed(device);
    }

    fn erase_device_water_mark(&self, device: &str, is_need_hash: bool) -> SyncResult<()> {
        if !self.inner.strategy.supports_water_mark_erase() {
            return Err(SyncError::NotSupport("erase device watermark".into()));
        }
        let metadata = self
            .inner
            .state
            .read()
            .metadata
            .clone()
            .ok_or(SyncError::NotInit)?;
        metadata.erase_device_water_mark(device, is_need_hash)
    }

    fn get_queued_sync_size(&self) -> SyncResult<usize> {
        Ok(self.inner.queue.lock().size)
    }

    fn set_queued_sync_limit(&self, limit: usize) -> SyncResult<()> {
        self.inner.queue.lock().limit = limit;
        info!(limit, "queued sync limit set");
        Ok(())
    }

    fn get_queued_sync_limit(&self) -> SyncResult<usize> {
        Ok(self.inner.queue.lock().limit)
    }

    fn disable_manual_sync(&self) -> SyncResult<()> {
        let mut queue = self.inner.queue.lock();
        if queue.size > 0 {
            return Err(SyncError::Busy(format!(
                "{} manual syncs still queued",
                queue.size
            )));
        }
        queue.manual_enabled = false;
        info!("manual sync disabled");
        Ok(())
    }

    fn enable_manual_sync(&self) -> SyncResult<()> {
        self.inner.queue.lock().manual_enabled = true;
        info!("manual sync enabled");
        Ok(())
    }

    fn get_local_identity(&self) -> SyncResult<String> {
        let engine = {
            let state = self.inner.state.read();
            if state.closing {
                return Err(SyncError::Busy("syncer is closing".into()));
            }
            state.engine.clone().ok_or(SyncError::NotInit)?
        };
        engine.get_local_identity()
    }

    fn set_stale_data_wipe_policy(&self, policy: WipePolicy) -> SyncResult<()> {
        if !self.inner.strategy.supports_wipe_policy() {
            return Err(SyncError::NotSupport("stale data wipe policy".into()));
        }
        *self.inner.wipe_policy.lock() = policy;
        Ok(())
    }

    fn set_permission_check(&self, check: Option<PermissionCheck>) -> SyncResult<()> {
        *self.inner.permission_check.write() = check.clone();
        if let Some(engine) = self.engine() {
            engine.set_permission_check(check);
        }
        Ok(())
    }
}

impl Drop for GenericSyncer {
    fn drop(&mut self) {
        if self.is_initialized() {
            if let Err(e) = self.inner.close() {
                debug!(error = %e, "close on drop failed");
            }
        }
    }
}

impl SyncerInner {
    fn initialize(&self, sync_interface: Arc<dyn SyncInterface>) -> SyncResult<()> {
        let engine = {
            let mut state = self.state.write();
            if state.initialized {
                return Ok(());
            }
            if state.closing {
                return Err(SyncError::Busy("syncer is closing".into()));
            }
            if sync_interface.interface_type() != self.strategy.interface_type() {
                return Err(SyncError::InvalidArgs(format!(
                    "{:?} storage given to a {:?} syncer",
                    sync_interface.interface_type(),
                    self.strategy.interface_type()
                )));
            }

            let metadata = Arc::new(Metadata::new());
            if let Err(e) = metadata.initialize(Arc::clone(&sync_interface)) {
                error!(error = %e, "metadata init failed");
                return Err(e);
            }
            let time_helper = Arc::new(TimeHelper::new(
                Arc::clone(&sync_interface),
                Arc::clone(&metadata),
            ));
            let label = short_id(&String::from_utf8_lossy(&sync_interface.identifier())).to_string();
            let engine = self.init_sync_engine(sync_interface, &metadata, &time_helper);

            let (tx, rx) = unbounded_channel();
            self.services
                .scheduler
                .spawn(completion_loop(self.weak_self.clone(), rx));

            *state = SyncerState {
                initialized: true,
                closing: false,
                label,
                engine: Some(Arc::clone(&engine)),
                metadata: Some(metadata),
                time_helper: Some(time_helper),
                events: Some(tx),
            };
            info!(label = %state.label, kind = ?self.strategy.interface_type(), "syncer initialized");
            engine
        };
        engine.reg_connect_callback();
        Ok(())
    }

    fn init_sync_engine(
        &self,
        sync_interface: Arc<dyn SyncInterface>,
        metadata: &Arc<Metadata>,
        time_helper: &Arc<TimeHelper>,
    ) -> Arc<SyncEngine> {
        let engine = SyncEngine::new(ContextDeps {
            sync_interface,
            metadata: Arc::clone(metadata),
            time_helper: Arc::clone(time_helper),
            communicator: Arc::clone(&self.services.communicator),
            scheduler: Arc::clone(&self.services.scheduler),
            state_machine: self.strategy.create_state_machine(),
            config: self.services.config.clone(),
            permission_check: Arc::default(),
        });

        let weak = self.weak_self.clone();
        engine.set_remote_data_changed_hook(Some(Arc::new(move |device: &str| {
            if let Some(syncer) = weak.upgrade() {
                syncer.remote_data_changed(device);
            }
        })));
        let weak = self.weak_self.clone();
        engine.set_device_online_hook(Some(Arc::new(move |device: &str| {
            if let Some(syncer) = weak.upgrade() {
                syncer.on_device_online(device);
            }
        })));
        engine.set_permission_check(self.permission_check.read().clone());
        engine
    }

    fn close(&self) -> SyncResult<()> {
        let (engine, label) = {
            let mut state = self.state.write();
            if state.closing {
                return Err(SyncError::Busy("syncer is closing".into()));
            }
            if !state.initialized {
                return Err(SyncError::NotInit);
            }
            state.closing = true;
            state.initialized = false;
            (state.engine.clone(), state.label.clone())
        };

        self.clear_sync_operations();
        if let Some(engine) = engine {
            engine.close();
        }

        let mut state = self.state.write();
        *state = SyncerState::default();
        info!(label = %label, "syncer closed");
        Ok(())
    }

    fn sync(
        &self,
        devices: &[DeviceId],
        mode: SyncMode,
        on_complete: Option<OnComplete>,
        on_finalize: Option<OnFinalize>,
        wait: bool,
    ) -> SyncResult<u32> {
        let operation = {
            let state = self.state.read();
            if state.closing {
                return Err(SyncError::Busy("syncer is closing".into()));
            }
            let (Some(engine), Some(events)) = (state.engine.clone(), state.events.clone()) else {
                return Err(SyncError::NotInit);
            };
            if devices.is_empty() {
                return Err(SyncError::InvalidArgs("no devices given".into()));
            }
            if !mode.is_valid_request() {
                return Err(SyncError::InvalidArgs(format!("{mode:?} cannot be requested")));
            }
            let mut targets: Vec<DeviceId> = Vec::with_capacity(devices.len());
            for device in devices {
                if !targets.contains(device) {
                    targets.push(device.clone());
                }
            }
            self.reserve_queue_slot(mode, wait)?;

            let sync_id = self.services.id_allocator.generate();
            let operation = Arc::new(SyncOperation::new(
                sync_id,
                targets,
                mode,
                on_complete,
                wait,
            ));
            operation.set_event_sender(events);
            let weak = self.weak_self.clone();
            operation.set_on_sync_finished(Box::new(move |sync_id| {
                if let Some(syncer) = weak.upgrade() {
                    syncer.remove_sync_operation(sync_id);
                }
            }));
            if let Some(on_finalize) = on_finalize {
                operation.set_on_sync_finalize(on_finalize);
            }

            self.operations.lock().insert(sync_id, Arc::clone(&operation));
            info!(
                label = %state.label,
                sync_id,
                ?mode,
                devices = operation.devices().len(),
                wait,
                "sync requested"
            );
            if let Err(e) = engine.add_sync_operation(&operation) {
                self.operations.lock().remove(&sync_id);
                self.release_queue_slot(&operation);
                return Err(e);
            }
            operation
        };

        if wait {
            operation.wait_if_need();
        }
        Ok(operation.sync_id())
    }

    fn remove_sync_operation(&self, sync_id: u32) {
        let Some(operation) = self.operations.lock().remove(&sync_id) else {
            return;
        };
        self.release_queue_slot(&operation);
        operation.kill();
        let engine = self.state.read().engine.clone();
        if let Some(engine) = engine {
            engine.remove_sync_operation(sync_id);
        }
        operation.notify_if_need();
        debug!(sync_id, "sync operation removed");
    }

    fn clear_sync_operations(&self) {
        let operations: Vec<Arc<SyncOperation>> =
            self.operations.lock().drain().map(|(_, op)| op).collect();
        for operation in &operations {
            operation.kill();
            operation.notify_if_need();
        }
        self.queue.lock().size = 0;
        if !operations.is_empty() {
            info!(count = operations.len(), "live sync operations killed");
        }
    }

    fn handle_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::OperationFinished(sync_id) => {
                let operation = self.operations.lock().get(&sync_id).cloned();
                if let Some(operation) = operation {
                    operation.finished();
                }
            }
        }
    }

    fn reserve_queue_slot(&self, mode: SyncMode, wait: bool) -> SyncResult<()> {
        if !mode.is_manual() {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        if !queue.manual_enabled {
            return Err(SyncError::Busy("manual sync is disabled".into()));
        }
        if wait {
            return Ok(());
        }
        if queue.size >= queue.limit {
            warn!(limit = queue.limit, "manual sync queue full");
            return Err(SyncError::QueueFull { limit: queue.limit });
        }
        queue.size += 1;
        Ok(())
    }

    fn release_queue_slot(&self, operation: &SyncOperation) {
        if operation.mode().is_manual() && !operation.is_block_sync() {
            let mut queue = self.queue.lock();
            queue.size = queue.size.saturating_sub(1);
        }
    }

    fn enable_auto_sync(&self, enable: bool) {
        if self.auto_sync.swap(enable, Ordering::SeqCst) == enable || !enable {
            return;
        }
        let Some(engine) = self.state.read().engine.clone() else {
            return;
        };
        let devices = engine.online_devices();
        if devices.is_empty() {
            return;
        }
        if let Err(e) = self.sync(&devices, self.strategy.auto_sync_mode(), None, None, false) {
            warn!(error = %e, "auto sync on enable failed");
        }
    }

    fn local_data_changed(&self, event: LocalChangeEvent) {
        if !event.triggers_sync() || !self.auto_sync.load(Ordering::SeqCst) {
            return;
        }
        let Some(engine) = self.state.read().engine.clone() else {
            return;
        };
        if self.strategy.broadcasts_local_changes() {
            engine.broadcast_data_changed();
            return;
        }
        let devices = engine.online_devices();
        if devices.is_empty() {
            return;
        }
        if let Err(e) = self.sync(&devices, SyncMode::AutoPush, None, None, false) {
            warn!(error = %e, "auto sync on local change failed");
        }
    }

    fn remote_data_changed(&self, device: &str) {
        if !self.auto_sync.load(Ordering::SeqCst) {
            return;
        }
        let devices = [device.to_string()];
        if let Err(e) = self.sync(&devices, self.strategy.auto_sync_mode(), None, None, false) {
            warn!(device = short_id(device), error = %e, "auto sync on remote change failed");
        }
    }

    fn on_device_online(&self, device: &str) {
        if *self.wipe_policy.lock() == WipePolicy::WipeStaleData {
            let metadata = self.state.read().metadata.clone();
            if let Some(metadata) = metadata {
                match metadata.save_peer_water_mark(device, 0, true) {
                    Ok(()) => info!(device = short_id(device), "stale peer watermark wiped"),
                    Err(e) => warn!(device = short_id(device), error = %e, "failed to wipe peer watermark"),
                }
            }
        }
        self.remote_data_changed(device);
    }
}

async fn completion_loop(syncer: Weak<SyncerInner>, mut events: UnboundedReceiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        let Some(syncer) = syncer.upgrade() else {
            break;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || syncer.handle_event(event)).await {
            error!(error = %e, "completion handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::LoopbackNetwork;
    use crate::memory::MemorySyncInterface;

    fn syncer(network: &LoopbackNetwork) -> GenericSyncer {
        let services = SyncerServices::new(network.communicator("local")).unwrap();
        GenericSyncer::single_version(services)
    }

    #[test]
    fn calls_before_initialize_fail() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        assert_eq!(
            syncer.sync(&["peer".into()], SyncMode::Push, None, None, false),
            Err(SyncError::NotInit)
        );
        assert_eq!(syncer.close(), Err(SyncError::NotInit));
        assert_eq!(syncer.get_local_identity(), Err(SyncError::NotInit));
        assert!(syncer.get_time_stamp() > 0);
    }

    #[test]
    fn initialize_is_idempotent() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        let storage = Arc::new(MemorySyncInterface::single_version("db"));
        syncer.initialize(storage.clone()).unwrap();
        syncer.initialize(storage).unwrap();
        assert!(syncer.is_initialized());
        syncer.close().unwrap();
        assert!(!syncer.is_initialized());
        assert!(syncer.engine().is_none());
    }

    #[test]
    fn wrong_storage_flavour_is_rejected() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        let storage = Arc::new(MemorySyncInterface::multi_version("db"));
        assert!(matches!(
            syncer.initialize(storage),
            Err(SyncError::InvalidArgs(_))
        ));
    }

    #[test]
    fn metadata_failure_fails_initialize() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        let storage = Arc::new(MemorySyncInterface::single_version("db"));
        storage.fail_reads(true);
        assert!(matches!(
            syncer.initialize(storage),
            Err(SyncError::Storage(_))
        ));
        assert!(!syncer.is_initialized());
    }

    #[test]
    fn invalid_requests() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        syncer
            .initialize(Arc::new(MemorySyncInterface::single_version("db")))
            .unwrap();
        assert!(matches!(
            syncer.sync(&[], SyncMode::Push, None, None, false),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            syncer.sync(&["peer".into()], SyncMode::ResponsePull, None, None, false),
            Err(SyncError::InvalidArgs(_))
        ));
        assert_eq!(syncer.live_operation_count(), 0);
    }

    #[test]
    fn manual_sync_toggle() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        syncer
            .initialize(Arc::new(MemorySyncInterface::single_version("db")))
            .unwrap();
        syncer.disable_manual_sync().unwrap();
        assert!(matches!(
            syncer.sync(&["peer".into()], SyncMode::Pull, None, None, true),
            Err(SyncError::Busy(_))
        ));
        syncer.enable_manual_sync().unwrap();
        syncer.set_queued_sync_limit(5).unwrap();
        assert_eq!(syncer.get_queued_sync_limit(), Ok(5));
        assert_eq!(syncer.get_queued_sync_size(), Ok(0));
    }

    #[test]
    fn multi_version_refuses_erase_and_wipe() {
        let network = LoopbackNetwork::new();
        let services = SyncerServices::new(network.communicator("local")).unwrap();
        let syncer = GenericSyncer::multi_version(services);
        syncer
            .initialize(Arc::new(MemorySyncInterface::multi_version("db")))
            .unwrap();
        assert!(matches!(
            syncer.erase_device_water_mark("peer", true),
            Err(SyncError::NotSupport(_))
        ));
        assert!(matches!(
            syncer.set_stale_data_wipe_policy(WipePolicy::WipeStaleData),
            Err(SyncError::NotSupport(_))
        ));
    }

    #[test]
    fn single_version_wipe_policy() {
        let network = LoopbackNetwork::new();
        let syncer = syncer(&network);
        syncer
            .set_stale_data_wipe_policy(WipePolicy::WipeStaleData)
            .unwrap();
        assert_eq!(syncer.stale_data_wipe_policy(), WipePolicy::WipeStaleData);
        assert_eq!(
            syncer.erase_device_water_mark("peer", true),
            Err(SyncError::NotInit)
        );
    }

    #[test]
    fn sync_merged_does_not_trigger() {
        assert!(LocalChangeEvent::Put.triggers_sync());
        assert!(LocalChangeEvent::Clear.triggers_sync());
        assert!(!LocalChangeEvent::SyncMerged.triggers_sync());
    }
}
