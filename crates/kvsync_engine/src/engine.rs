//! Sync engine: owns the per-device task contexts of one syncer.
//!
//! Inbound messages are handled on the scheduler with bounded concurrency.
//! Once `max_exec_tasks` handlers are busy, further messages wait in a
//! backlog bounded by bytes; messages that do not fit are discarded and
//! counted.

use crate::communicator::Communicator;
use crate::context::{ContextDeps, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::SyncOperation;
use crate::short_id;
use kvsync_protocol::{DeviceId, Message, MessageId, OperationStatus, SyncMode};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Decides whether `device` may be synced in `mode`.
pub type PermissionCheck = Arc<dyn Fn(&str, SyncMode) -> bool + Send + Sync>;

/// Notified with a device id (data changed remotely, device came online).
pub type DeviceHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct MessageQueue {
    backlog: VecDeque<(DeviceId, Message)>,
    cache_size: usize,
    exec_count: usize,
    discarded: u64,
}

/// Per-syncer engine.
pub struct SyncEngine {
    deps: ContextDeps,
    weak_self: Weak<SyncEngine>,
    contexts: Mutex<HashMap<DeviceId, Arc<SyncTaskContext>>>,
    remote_data_changed: RwLock<Option<DeviceHook>>,
    device_online: RwLock<Option<DeviceHook>>,
    queue: Mutex<MessageQueue>,
    killed: AtomicBool,
}

impl SyncEngine {
    /// Creates an engine and registers its inbound message callback.
    pub fn new(deps: ContextDeps) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak_self| Self {
            deps,
            weak_self: weak_self.clone(),
            contexts: Mutex::new(HashMap::new()),
            remote_data_changed: RwLock::new(None),
            device_online: RwLock::new(None),
            queue: Mutex::new(MessageQueue::default()),
            killed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&engine);
        engine
            .deps
            .communicator
            .register_message_callback(Some(Arc::new(move |from: &str, message: Message| {
                if let Some(engine) = weak.upgrade() {
                    engine.message_received(from, message);
                }
            })));
        engine
    }

    /// Registers the connectivity callback.
    ///
    /// Kept separate from construction so it can run outside the syncer's
    /// lock.
    pub fn reg_connect_callback(&self) {
        let weak = self.weak_self.clone();
        self.deps
            .communicator
            .register_connect_callback(Some(Arc::new(move |device: &str, online: bool| {
                if let Some(engine) = weak.upgrade() {
                    engine.on_device_connect(device, online);
                }
            })));
    }

    /// Installs the permission check consulted for every device, on our
    /// requests and on the requests of peers.
    pub fn set_permission_check(&self, check: Option<PermissionCheck>) {
        *self.deps.permission_check.write() = check;
    }

    /// Installs the hook run when a peer reports changed data.
    pub fn set_remote_data_changed_hook(&self, hook: Option<DeviceHook>) {
        *self.remote_data_changed.write() = hook;
    }

    /// Installs the hook run when a device comes online.
    pub fn set_device_online_hook(&self, hook: Option<DeviceHook>) {
        *self.device_online.write() = hook;
    }

    /// Queues `operation` on the context of each of its devices.
    ///
    /// Devices refused by the permission check become
    /// `PermissionCheckFailed`; devices whose context refuses the target
    /// become `Failed`.
    pub fn add_sync_operation(&self, operation: &Arc<SyncOperation>) -> SyncResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SyncError::Killed);
        }
        let check = self.deps.permission_check.read().clone();
        for device in operation.devices() {
            let permitted = check
                .as_ref()
                .map(|check| check(device, operation.mode()))
                .unwrap_or(true);
            if !permitted {
                info!(device = short_id(device), sync_id = operation.sync_id(), "permission check failed");
                operation.set_status(device, OperationStatus::PermissionCheckFailed);
                continue;
            }
            operation.set_status(device, OperationStatus::Waiting);
            let added = self
                .get_or_create_context(device)
                .and_then(|context| context.add_sync_operation(operation));
            if let Err(e) = added {
                warn!(device = short_id(device), error = %e, "failed to queue sync target");
                operation.set_status(device, OperationStatus::Failed);
            }
        }
        Ok(())
    }

    /// Drops the targets of `sync_id` from every context.
    pub fn remove_sync_operation(&self, sync_id: u32) {
        let contexts: Vec<Arc<SyncTaskContext>> = self.contexts.lock().values().cloned().collect();
        for context in contexts {
            context.remove_sync_operation(sync_id);
        }
    }

    /// Entry point for inbound messages.
    pub fn message_received(&self, from: &str, message: Message) {
        if from.is_empty() || self.killed.load(Ordering::SeqCst) {
            return;
        }
        let size = message.encoded_len();
        {
            let mut queue = self.queue.lock();
            if queue.exec_count >= self.deps.config.max_exec_tasks {
                if message.message_id == MessageId::LocalDataChanged
                    && queue.backlog.iter().any(|(device, queued)| {
                        device == from && queued.message_id == MessageId::LocalDataChanged
                    })
                {
                    debug!(device = short_id(from), "duplicate data change notification merged");
                    return;
                }
                if queue.cache_size + size > self.deps.config.max_queue_cache_size {
                    queue.discarded += 1;
                    warn!(
                        device = short_id(from),
                        discarded = queue.discarded,
                        "receive backlog full, message discarded"
                    );
                    return;
                }
                queue.cache_size += size;
                queue.backlog.push_back((from.to_string(), message));
                return;
            }
            queue.exec_count += 1;
        }

        let weak = self.weak_self.clone();
        let from = from.to_string();
        let scheduled = self.deps.scheduler.schedule_task(move || {
            if let Some(engine) = weak.upgrade() {
                engine.deal_messages(from, message);
            }
        });
        if let Err(e) = scheduled {
            warn!(error = %e, "failed to schedule inbound message");
            self.queue.lock().exec_count -= 1;
        }
    }

    /// Sends `LocalDataChanged` to every online device.
    pub fn broadcast_data_changed(&self) {
        for device in self.online_devices() {
            let sent = self.deps.communicator.send(
                &device,
                Message::local_data_changed(),
                Box::new(|_| {}),
            );
            if let Err(e) = sent {
                debug!(device = short_id(&device), error = %e, "data change broadcast failed");
            }
        }
    }

    /// Devices currently reachable.
    pub fn online_devices(&self) -> Vec<DeviceId> {
        self.deps.communicator.online_devices()
    }

    /// Hashed identity of this device.
    pub fn get_local_identity(&self) -> SyncResult<String> {
        let identity = self.deps.communicator.local_identity()?;
        Ok(self.deps.metadata.get_hash_device_id(&identity))
    }

    /// Bytes currently held in the receive backlog.
    pub fn queue_cache_size(&self) -> usize {
        self.queue.lock().cache_size
    }

    /// Messages discarded because the backlog was full.
    pub fn discard_msg_num(&self) -> u64 {
        self.queue.lock().discarded
    }

    /// Limit of concurrently handled inbound messages.
    pub fn max_exec_num(&self) -> usize {
        self.deps.config.max_exec_tasks
    }

    /// Context of `device`, if one exists.
    pub fn context(&self, device: &str) -> Option<Arc<SyncTaskContext>> {
        self.contexts.lock().get(device).cloned()
    }

    /// Shared consistency metadata.
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.deps.metadata
    }

    /// Unregisters callbacks, kills every context and waits for them to
    /// drain.
    pub fn close(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deps.communicator.register_message_callback(None);
        self.deps.communicator.register_connect_callback(None);
        {
            let mut queue = self.queue.lock();
            queue.backlog.clear();
            queue.cache_size = 0;
        }
        let contexts: Vec<Arc<SyncTaskContext>> =
            self.contexts.lock().drain().map(|(_, c)| c).collect();
        for context in &contexts {
            context.kill();
        }
        for context in &contexts {
            context.safe_exit();
        }
        info!(contexts = contexts.len(), "sync engine closed");
    }

    fn get_or_create_context(&self, device: &str) -> SyncResult<Arc<SyncTaskContext>> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SyncError::Killed);
        }
        let mut contexts = self.contexts.lock();
        let context = contexts
            .entry(device.to_string())
            .or_insert_with(|| SyncTaskContext::new(device, self.deps.clone()));
        Ok(Arc::clone(context))
    }

    fn deal_messages(&self, from: DeviceId, message: Message) {
        let mut next = Some((from, message));
        while let Some((from, message)) = next.take() {
            self.deal_message(&from, message);
            let mut queue = self.queue.lock();
            match queue.backlog.pop_front() {
                Some((device, queued)) => {
                    queue.cache_size = queue.cache_size.saturating_sub(queued.encoded_len());
                    next = Some((device, queued));
                }
                None => queue.exec_count -= 1,
            }
        }
    }

    fn deal_message(&self, from: &str, message: Message) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        if message.message_id == MessageId::LocalDataChanged {
            if !self.deps.communicator.is_device_online(from) {
                return;
            }
            let hook = self.remote_data_changed.read().clone();
            if let Some(hook) = hook {
                hook(from);
            }
            return;
        }
        let result = self
            .get_or_create_context(from)
            .and_then(|context| context.receive_message(message));
        if let Err(e) = result {
            debug!(device = short_id(from), error = %e, "inbound message rejected");
        }
    }

    fn on_device_connect(&self, device: &str, online: bool) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        if online {
            info!(device = short_id(device), "device online");
            let hook = self.device_online.read().clone();
            if let Some(hook) = hook {
                hook(device);
            }
        } else {
            info!(device = short_id(device), "device offline");
            if let Some(context) = self.context(device) {
                context.comm_err_abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::LoopbackNetwork;
    use crate::config::SyncConfig;
    use crate::memory::MemorySyncInterface;
    use crate::scheduler::TaskScheduler;
    use crate::state_machine::SingleVerStateMachine;
    use crate::time_helper::TimeHelper;
    use std::sync::mpsc;
    use std::time::Duration;

    fn engine(network: &LoopbackNetwork, device: &str, config: SyncConfig) -> Arc<SyncEngine> {
        let storage = Arc::new(MemorySyncInterface::single_version(device));
        let metadata = Arc::new(Metadata::new());
        metadata.initialize(storage.clone()).unwrap();
        SyncEngine::new(ContextDeps {
            sync_interface: storage.clone(),
            time_helper: Arc::new(TimeHelper::new(storage, metadata.clone())),
            metadata,
            communicator: network.communicator(device),
            scheduler: Arc::new(TaskScheduler::new(1).unwrap()),
            state_machine: Arc::new(SingleVerStateMachine),
            config,
            permission_check: Arc::default(),
        })
    }

    #[test]
    fn permission_denied_devices_fail() {
        let network = LoopbackNetwork::new();
        let engine = engine(&network, "local", SyncConfig::default());
        engine.set_permission_check(Some(Arc::new(|device: &str, _mode: SyncMode| {
            device != "denied"
        })));

        let op = Arc::new(SyncOperation::new(1, vec!["denied".into()], SyncMode::Push, None, false));
        engine.add_sync_operation(&op).unwrap();
        assert_eq!(
            op.get_status("denied"),
            Some(OperationStatus::PermissionCheckFailed)
        );
        assert!(op.is_finished());
        assert!(engine.context("denied").is_none());
    }

    #[test]
    fn data_change_notification_runs_hook() {
        let network = LoopbackNetwork::new();
        let engine = engine(&network, "local", SyncConfig::default());
        let peer = network.communicator("peer");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        engine.set_remote_data_changed_hook(Some(Arc::new(move |device: &str| {
            let _ = tx.lock().send(device.to_string());
        })));

        peer.send("local", Message::local_data_changed(), Box::new(|_| {}))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "peer");
    }

    #[test]
    fn offline_peer_notification_is_ignored() {
        let network = LoopbackNetwork::new();
        let engine = engine(&network, "local", SyncConfig::default());
        let _peer = network.communicator("peer");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        engine.set_remote_data_changed_hook(Some(Arc::new(move |device: &str| {
            let _ = tx.lock().send(device.to_string());
        })));
        network.set_online("peer", false);

        engine.message_received("peer", Message::local_data_changed());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn local_identity_is_hashed() {
        let network = LoopbackNetwork::new();
        let engine = engine(&network, "local", SyncConfig::default());
        let identity = engine.get_local_identity().unwrap();
        assert_eq!(identity, crate::metadata::hash_device_id("local"));
    }

    #[test]
    fn close_kills_contexts() {
        let network = LoopbackNetwork::new();
        let engine = engine(&network, "local", SyncConfig::default());
        let _peer = network.communicator("peer");
        network.drop_messages_to("peer", true);

        let op = Arc::new(SyncOperation::new(1, vec!["peer".into()], SyncMode::Pull, None, false));
        engine.add_sync_operation(&op).unwrap();
        let context = engine.context("peer").unwrap();
        engine.close();

        assert!(context.is_killed());
        assert!(engine.context("peer").is_none());
        assert_eq!(op.get_status("peer"), Some(OperationStatus::Failed));
        assert_eq!(engine.add_sync_operation(&op), Err(SyncError::Killed));
    }
}
