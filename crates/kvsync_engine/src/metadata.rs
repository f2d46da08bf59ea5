//! Per-device consistency metadata.
//!
//! [`Metadata`] caches one [`MetaDataValue`] per remote device and persists
//! every change through the [`SyncInterface`] metadata area before the
//! cache is updated, so a failed write never leaves the cache ahead of
//! storage.

use crate::error::{SyncError, SyncResult};
use crate::interface::SyncInterface;
use kvsync_protocol::{DeviceId, MetaDataValue, TimeOffset, Timestamp, WaterMark};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of per-device metadata keys.
pub const DEVICE_META_KEY_PREFIX: &str = "metadata:";

/// Key of the persisted local clock offset.
pub const LOCAL_TIME_OFFSET_KEY: &str = "localTimeOffset";

/// Persistent consistency state for every known device.
pub struct Metadata {
    storage: RwLock<Option<Arc<dyn SyncInterface>>>,
    meta_map: Mutex<HashMap<String, MetaDataValue>>,
    hash_map: Mutex<HashMap<DeviceId, String>>,
    local_time_offset: AtomicI64,
    local_time_offset_lock: Mutex<()>,
    last_local_time: Mutex<Timestamp>,
}

impl Metadata {
    /// Creates an empty, uninitialized metadata store.
    pub fn new() -> Self {
        Self {
            storage: RwLock::new(None),
            meta_map: Mutex::new(HashMap::new()),
            hash_map: Mutex::new(HashMap::new()),
            local_time_offset: AtomicI64::new(0),
            local_time_offset_lock: Mutex::new(()),
            last_local_time: Mutex::new(0),
        }
    }

    /// Loads every persisted record from `storage`.
    pub fn initialize(&self, storage: Arc<dyn SyncInterface>) -> SyncResult<()> {
        let mut loaded = HashMap::new();
        for key in storage.all_meta_keys()? {
            let Some(device) = key.strip_prefix(DEVICE_META_KEY_PREFIX.as_bytes()) else {
                continue;
            };
            let Some(bytes) = storage.get_meta_data(&key)? else {
                continue;
            };
            let value = MetaDataValue::decode(&bytes)?;
            loaded.insert(String::from_utf8_lossy(device).into_owned(), value);
        }

        let offset = match storage.get_meta_data(LOCAL_TIME_OFFSET_KEY.as_bytes())? {
            Some(bytes) => decode_offset(&bytes)?,
            None => 0,
        };

        debug!(devices = loaded.len(), offset, "metadata loaded");
        *self.meta_map.lock() = loaded;
        self.local_time_offset.store(offset, Ordering::Relaxed);
        *self.last_local_time.lock() = storage.max_timestamp();
        *self.storage.write() = Some(storage);
        Ok(())
    }

    /// Clock offset recorded for `device`.
    pub fn get_time_offset(&self, device: &str) -> TimeOffset {
        self.get_value(&self.get_hash_device_id(device)).time_offset
    }

    /// Persists the clock offset of `device`.
    pub fn save_time_offset(&self, device: &str, offset: TimeOffset) -> SyncResult<()> {
        let key = self.get_hash_device_id(device);
        self.update(&key, |value| value.time_offset = offset)
    }

    /// Mark up to which local data has been sent to `device`.
    pub fn get_local_water_mark(&self, device: &str) -> WaterMark {
        self.get_value(&self.get_hash_device_id(device)).local_water_mark
    }

    /// Persists the local watermark of `device`.
    pub fn save_local_water_mark(&self, device: &str, mark: WaterMark) -> SyncResult<()> {
        let key = self.get_hash_device_id(device);
        self.update(&key, |value| value.local_water_mark = mark)
    }

    /// Mark up to which data of `device` has been received.
    pub fn get_peer_water_mark(&self, device: &str, is_need_hash: bool) -> WaterMark {
        self.get_value(&self.key_for(device, is_need_hash)).peer_water_mark
    }

    /// Persists the peer watermark of `device`.
    ///
    /// With `is_need_hash == false` the caller passes an already hashed id.
    pub fn save_peer_water_mark(
        &self,
        device: &str,
        mark: WaterMark,
        is_need_hash: bool,
    ) -> SyncResult<()> {
        let key = self.key_for(device, is_need_hash);
        self.update(&key, |value| value.peer_water_mark = mark)
    }

    /// Resets both watermarks of `device`.
    pub fn erase_device_water_mark(&self, device: &str, is_need_hash: bool) -> SyncResult<()> {
        let key = self.key_for(device, is_need_hash);
        self.update(&key, |value| {
            value.local_water_mark = 0;
            value.peer_water_mark = 0;
        })
    }

    /// Local clock offset applied to system time.
    pub fn get_local_time_offset(&self) -> TimeOffset {
        self.local_time_offset.load(Ordering::Relaxed)
    }

    /// Persists the local clock offset.
    pub fn save_local_time_offset(&self, offset: TimeOffset) -> SyncResult<()> {
        let _guard = self.local_time_offset_lock.lock();
        self.storage()?
            .put_meta_data(LOCAL_TIME_OFFSET_KEY.as_bytes(), &offset.to_be_bytes())?;
        self.local_time_offset.store(offset, Ordering::Relaxed);
        Ok(())
    }

    /// Last virtual timestamp handed out.
    pub fn get_last_local_time(&self) -> Timestamp {
        *self.last_local_time.lock()
    }

    /// Raises the last-local-time guard. Lower values are ignored.
    pub fn set_last_local_time(&self, time: Timestamp) {
        let mut last = self.last_local_time.lock();
        if time > *last {
            *last = time;
        }
    }

    /// Allocates a timestamp strictly greater than every earlier one.
    pub(crate) fn allocate_local_time(&self, candidate: Timestamp) -> Timestamp {
        let mut last = self.last_local_time.lock();
        let next = candidate.max(last.saturating_add(1));
        *last = next;
        next
    }

    /// SHA-256 of `device` as lowercase hex, memoized.
    pub fn get_hash_device_id(&self, device: &str) -> String {
        let mut hashes = self.hash_map.lock();
        if let Some(hash) = hashes.get(device) {
            return hash.clone();
        }
        let hash = hash_device_id(device);
        hashes.insert(device.to_string(), hash.clone());
        hash
    }

    /// Devices with a cached record, by hashed id.
    pub fn known_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.meta_map.lock().keys().cloned().collect();
        devices.sort();
        devices
    }

    fn key_for(&self, device: &str, is_need_hash: bool) -> String {
        if is_need_hash {
            self.get_hash_device_id(device)
        } else {
            device.to_string()
        }
    }

    fn get_value(&self, key: &str) -> MetaDataValue {
        self.meta_map.lock().get(key).copied().unwrap_or_default()
    }

    fn storage(&self) -> SyncResult<Arc<dyn SyncInterface>> {
        self.storage.read().clone().ok_or(SyncError::NotInit)
    }

    fn update(&self, key: &str, apply: impl FnOnce(&mut MetaDataValue)) -> SyncResult<()> {
        let storage = self.storage()?;
        let mut map = self.meta_map.lock();
        let mut value = map.get(key).copied().unwrap_or_default();
        apply(&mut value);
        value.last_update_time = self.get_last_local_time();

        let storage_key = format!("{DEVICE_META_KEY_PREFIX}{key}");
        if let Err(e) = storage.put_meta_data(storage_key.as_bytes(), &value.encode()?) {
            warn!(error = %e, "failed to persist device metadata");
            return Err(e);
        }
        map.insert(key.to_string(), value);
        Ok(())
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of a device id rendered as lowercase hex.
pub fn hash_device_id(device: &str) -> String {
    Sha256::digest(device.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn decode_offset(bytes: &[u8]) -> SyncResult<TimeOffset> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SyncError::Storage(format!("bad local time offset length {}", bytes.len())))?;
    Ok(i64::from_be_bytes(raw))
}
