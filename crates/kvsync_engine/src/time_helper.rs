//! Virtual clock used to stamp local records.

use crate::error::SyncResult;
use crate::interface::SyncInterface;
use crate::metadata::Metadata;
use kvsync_protocol::{TimeOffset, Timestamp};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// One millisecond in 100 ns units.
pub const MS_TO_100_NS: i64 = 10_000;

/// System time since the Unix epoch, in 100 ns units.
pub fn sys_current_time() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as Timestamp)
        .unwrap_or(0)
}

/// Hands out strictly increasing virtual timestamps.
///
/// Virtual time is system time plus the persisted local offset, raised to
/// one past the last value handed out.
pub struct TimeHelper {
    storage: Arc<dyn SyncInterface>,
    metadata: Arc<Metadata>,
}

impl TimeHelper {
    /// Creates a helper over an initialized [`Metadata`].
    pub fn new(storage: Arc<dyn SyncInterface>, metadata: Arc<Metadata>) -> Self {
        Self { storage, metadata }
    }

    /// Current virtual time without allocating it.
    pub fn current_time(&self) -> Timestamp {
        let now = sys_current_time() as i64 + self.metadata.get_local_time_offset();
        now.max(0) as Timestamp
    }

    /// Allocates the next virtual timestamp.
    pub fn get_time(&self) -> Timestamp {
        self.metadata.allocate_local_time(self.current_time())
    }

    /// Re-bases the local offset after the system clock moved by `changed`.
    ///
    /// Virtual time never falls behind the newest stored record.
    pub fn adjust_for_clock_change(&self, changed: TimeOffset) -> SyncResult<()> {
        let mut offset = self.metadata.get_local_time_offset() - changed;
        let max_timestamp = self.storage.max_timestamp() as i64;
        let virtual_now = sys_current_time() as i64 + offset;
        if virtual_now < max_timestamp {
            offset += max_timestamp - virtual_now + MS_TO_100_NS;
        }
        info!(changed, offset, "system clock changed, local offset adjusted");
        self.metadata.save_local_time_offset(offset)
    }
}
