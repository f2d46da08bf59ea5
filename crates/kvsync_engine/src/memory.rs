//! In-memory storage collaborator for testing.

use crate::error::{SyncError, SyncResult};
use crate::interface::SyncInterface;
use kvsync_protocol::{InterfaceType, SecurityOption, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory [`SyncInterface`].
///
/// Suitable for:
/// - Unit and integration tests
/// - The CLI simulation
///
/// Read and write failures, and a revoked storage key, can be injected to
/// exercise error paths.
#[derive(Debug)]
pub struct MemorySyncInterface {
    interface_type: InterfaceType,
    identifier: Vec<u8>,
    meta: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    max_timestamp: AtomicU64,
    schema: RwLock<String>,
    security: RwLock<SecurityOption>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    key_revoked: AtomicBool,
}

impl MemorySyncInterface {
    /// Creates an empty store.
    pub fn new(interface_type: InterfaceType, identifier: impl Into<Vec<u8>>) -> Self {
        Self {
            interface_type,
            identifier: identifier.into(),
            meta: RwLock::new(BTreeMap::new()),
            max_timestamp: AtomicU64::new(0),
            schema: RwLock::new(String::new()),
            security: RwLock::new(SecurityOption::default()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            key_revoked: AtomicBool::new(false),
        }
    }

    /// Creates an empty single-version store.
    pub fn single_version(identifier: impl Into<Vec<u8>>) -> Self {
        Self::new(InterfaceType::SingleVersion, identifier)
    }

    /// Creates an empty multi-version store.
    pub fn multi_version(identifier: impl Into<Vec<u8>>) -> Self {
        Self::new(InterfaceType::MultiVersion, identifier)
    }

    /// Simulates a local write at `timestamp`.
    pub fn set_max_timestamp(&self, timestamp: Timestamp) {
        self.max_timestamp.fetch_max(timestamp, Ordering::SeqCst);
    }

    /// Sets the schema advertised during ability sync.
    pub fn set_schema(&self, schema: impl Into<String>) {
        *self.schema.write() = schema.into();
    }

    /// Sets the security option advertised during ability sync.
    pub fn set_security_option(&self, option: SecurityOption) {
        *self.security.write() = option;
    }

    /// Makes metadata writes fail with [`SyncError::KeyRevoked`].
    pub fn revoke_key(&self, revoked: bool) {
        self.key_revoked.store(revoked, Ordering::SeqCst);
    }

    /// Makes metadata reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes metadata writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored metadata entries.
    pub fn meta_len(&self) -> usize {
        self.meta.read().len()
    }
}

impl SyncInterface for MemorySyncInterface {
    fn interface_type(&self) -> InterfaceType {
        self.interface_type
    }

    fn identifier(&self) -> Vec<u8> {
        self.identifier.clone()
    }

    fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp.load(Ordering::SeqCst)
    }

    fn schema(&self) -> String {
        self.schema.read().clone()
    }

    fn security_option(&self) -> SecurityOption {
        *self.security.read()
    }

    fn get_meta_data(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected read failure".into()));
        }
        Ok(self.meta.read().get(key).cloned())
    }

    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> SyncResult<()> {
        if self.key_revoked.load(Ordering::SeqCst) {
            return Err(SyncError::KeyRevoked);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected write failure".into()));
        }
        self.meta.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn all_meta_keys(&self) -> SyncResult<Vec<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected read failure".into()));
        }
        Ok(self.meta.read().keys().cloned().collect())
    }
}
