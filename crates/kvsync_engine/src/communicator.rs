//! Communicator abstraction for exchanging sync messages with peers.

use crate::error::{CommError, SyncError, SyncResult};
use kvsync_protocol::{DeviceId, Message};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, error, trace};

/// Invoked for every inbound message with the sending device.
pub type MessageCallback = Arc<dyn Fn(&str, Message) + Send + Sync>;

/// Invoked when a device goes online (`true`) or offline (`false`).
pub type ConnectCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Invoked at most once if a message accepted by `send` cannot be delivered.
pub type SendErrorHandler = Box<dyn FnOnce(CommError) + Send>;

/// Message transport between devices.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (a real device bus, the in-process loopback used for
/// testing, etc.).
pub trait Communicator: Send + Sync {
    /// Identity of this device as seen by peers.
    fn local_identity(&self) -> SyncResult<DeviceId>;

    /// Sends a message.
    ///
    /// An `Err` means the message was not accepted. Failures discovered
    /// after acceptance are reported through `on_error`, possibly from
    /// another thread.
    fn send(&self, target: &str, message: Message, on_error: SendErrorHandler)
        -> Result<(), CommError>;

    /// Installs (or with `None`, removes) the inbound message callback.
    fn register_message_callback(&self, callback: Option<MessageCallback>);

    /// Installs (or with `None`, removes) the connectivity callback.
    fn register_connect_callback(&self, callback: Option<ConnectCallback>);

    /// Devices currently reachable.
    fn online_devices(&self) -> Vec<DeviceId>;

    /// Returns true if `device` is currently reachable.
    fn is_device_online(&self, device: &str) -> bool;
}

struct Endpoint {
    online: AtomicBool,
    message_callback: RwLock<Option<MessageCallback>>,
    connect_callback: RwLock<Option<ConnectCallback>>,
}

struct Delivery {
    from: DeviceId,
    to: DeviceId,
    message: Message,
    on_error: SendErrorHandler,
}

struct NetworkInner {
    endpoints: RwLock<HashMap<DeviceId, Arc<Endpoint>>>,
    deliveries: Mutex<Option<mpsc::Sender<Delivery>>>,
    drop_to: RwLock<HashSet<DeviceId>>,
    send_failures: RwLock<HashMap<DeviceId, CommError>>,
    sent: Mutex<HashMap<(DeviceId, DeviceId), usize>>,
}

impl NetworkInner {
    fn endpoint(&self, device: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(device).cloned()
    }

    fn is_online(&self, device: &str) -> bool {
        self.endpoint(device)
            .map(|e| e.online.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn deliver(&self, delivery: Delivery) {
        let Delivery {
            from,
            to,
            message,
            on_error,
        } = delivery;

        if !self.is_online(&from) || !self.is_online(&to) {
            debug!(from = %from, to = %to, "loopback target unreachable");
            on_error(CommError::DeviceOffline);
            return;
        }
        if self.drop_to.read().contains(&to) {
            trace!(from = %from, to = %to, id = ?message.message_id, "loopback dropped message");
            return;
        }
        let callback = self
            .endpoint(&to)
            .and_then(|e| e.message_callback.read().clone());
        if let Some(callback) = callback {
            callback(&from, message);
        }
    }
}

/// An in-process network connecting [`LoopbackCommunicator`]s.
///
/// Messages are delivered asynchronously on a dedicated thread, in send
/// order. Devices can be taken offline, and messages to a device can be
/// dropped or refused to simulate faults.
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Creates a network and starts its delivery thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>();
        let inner = Arc::new(NetworkInner {
            endpoints: RwLock::new(HashMap::new()),
            deliveries: Mutex::new(Some(tx)),
            drop_to: RwLock::new(HashSet::new()),
            send_failures: RwLock::new(HashMap::new()),
            sent: Mutex::new(HashMap::new()),
        });

        let weak: Weak<NetworkInner> = Arc::downgrade(&inner);
        let spawned = thread::Builder::new()
            .name("kvsync-loopback".into())
            .spawn(move || {
                while let Ok(delivery) = rx.recv() {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.deliver(delivery);
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn loopback delivery thread");
        }

        Self { inner }
    }

    /// Attaches a device to the network. The device starts online.
    pub fn communicator(&self, device: impl Into<DeviceId>) -> Arc<LoopbackCommunicator> {
        let device = device.into();
        self.inner.endpoints.write().insert(
            device.clone(),
            Arc::new(Endpoint {
                online: AtomicBool::new(true),
                message_callback: RwLock::new(None),
                connect_callback: RwLock::new(None),
            }),
        );
        Arc::new(LoopbackCommunicator {
            network: Arc::clone(&self.inner),
            device,
            closed: AtomicBool::new(false),
        })
    }

    /// Brings a device up or down, notifying the affected peers.
    pub fn set_online(&self, device: &str, online: bool) {
        let Some(endpoint) = self.inner.endpoint(device) else {
            return;
        };
        if endpoint.online.swap(online, Ordering::SeqCst) == online {
            return;
        }

        let peers: Vec<(DeviceId, Arc<Endpoint>)> = self
            .inner
            .endpoints
            .read()
            .iter()
            .filter(|(id, e)| id.as_str() != device && e.online.load(Ordering::SeqCst))
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();

        let own_callback = endpoint.connect_callback.read().clone();
        for (peer, peer_endpoint) in peers {
            let callback = peer_endpoint.connect_callback.read().clone();
            if let Some(callback) = callback {
                callback(device, online);
            }
            if let Some(callback) = &own_callback {
                callback(&peer, online);
            }
        }
    }

    /// Silently drops every message addressed to `device`.
    pub fn drop_messages_to(&self, device: &str, drop: bool) {
        let mut drop_to = self.inner.drop_to.write();
        if drop {
            drop_to.insert(device.to_string());
        } else {
            drop_to.remove(device);
        }
    }

    /// Makes `send` to `device` fail synchronously with `error`.
    pub fn fail_sends_to(&self, device: &str, error: Option<CommError>) {
        let mut failures = self.inner.send_failures.write();
        match error {
            Some(error) => {
                failures.insert(device.to_string(), error);
            }
            None => {
                failures.remove(device);
            }
        }
    }

    /// Messages accepted from `from` to `to` so far.
    pub fn sent_count(&self, from: &str, to: &str) -> usize {
        self.inner
            .sent
            .lock()
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One device's view of a [`LoopbackNetwork`].
pub struct LoopbackCommunicator {
    network: Arc<NetworkInner>,
    device: DeviceId,
    closed: AtomicBool,
}

impl LoopbackCommunicator {
    /// Device id of this endpoint.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Stops accepting sends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Communicator for LoopbackCommunicator {
    fn local_identity(&self) -> SyncResult<DeviceId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Communication(CommError::Closed));
        }
        Ok(self.device.clone())
    }

    fn send(
        &self,
        target: &str,
        message: Message,
        on_error: SendErrorHandler,
    ) -> Result<(), CommError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommError::Closed);
        }
        if let Some(error) = self.network.send_failures.read().get(target) {
            return Err(error.clone());
        }

        *self
            .network
            .sent
            .lock()
            .entry((self.device.clone(), target.to_string()))
            .or_insert(0) += 1;

        let deliveries = self.network.deliveries.lock();
        let Some(tx) = deliveries.as_ref() else {
            return Err(CommError::Closed);
        };
        tx.send(Delivery {
            from: self.device.clone(),
            to: target.to_string(),
            message,
            on_error,
        })
        .map_err(|_| CommError::Closed)
    }

    fn register_message_callback(&self, callback: Option<MessageCallback>) {
        if let Some(endpoint) = self.network.endpoint(&self.device) {
            *endpoint.message_callback.write() = callback;
        }
    }

    fn register_connect_callback(&self, callback: Option<ConnectCallback>) {
        if let Some(endpoint) = self.network.endpoint(&self.device) {
            *endpoint.connect_callback.write() = callback;
        }
    }

    fn online_devices(&self) -> Vec<DeviceId> {
        if !self.network.is_online(&self.device) {
            return Vec::new();
        }
        let mut devices: Vec<DeviceId> = self
            .network
            .endpoints
            .read()
            .iter()
            .filter(|(id, e)| **id != self.device && e.online.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect();
        devices.sort();
        devices
    }

    fn is_device_online(&self, device: &str) -> bool {
        device != self.device
            && self.network.is_online(&self.device)
            && self.network.is_online(device)
    }
}
