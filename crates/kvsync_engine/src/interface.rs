//! Storage collaborator abstraction.

use crate::error::SyncResult;
use kvsync_protocol::{InterfaceType, SecurityOption, Timestamp};

/// The storage a syncer replicates.
///
/// The sync engine never touches user records directly. It only needs the
/// storage flavour, a stable identifier, the newest record timestamp, the
/// capabilities checked during ability sync, and a small key/value area for
/// its own metadata.
pub trait SyncInterface: Send + Sync {
    /// Storage flavour; selects the syncer implementation.
    fn interface_type(&self) -> InterfaceType;

    /// Stable identifier of the store, used as the logging label.
    fn identifier(&self) -> Vec<u8>;

    /// Largest record timestamp currently stored.
    fn max_timestamp(&self) -> Timestamp;

    /// Schema of the store; empty when schemaless.
    fn schema(&self) -> String {
        String::new()
    }

    /// Security classification of the store.
    fn security_option(&self) -> SecurityOption {
        SecurityOption::default()
    }

    /// Reads one metadata entry. `Ok(None)` means the key is absent.
    fn get_meta_data(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>>;

    /// Writes one metadata entry.
    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> SyncResult<()>;

    /// Lists every metadata key.
    fn all_meta_keys(&self) -> SyncResult<Vec<Vec<u8>>>;
}
