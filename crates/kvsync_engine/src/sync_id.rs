//! Sync id allocation.

use kvsync_protocol::MIN_VALID_SYNC_ID;
use parking_lot::Mutex;

/// Largest sync id before wrapping.
pub const MAX_SYNC_ID: u32 = i32::MAX as u32;

/// Hands out sync ids, shared by every syncer of a process.
///
/// Ids start at [`MIN_VALID_SYNC_ID`] and wrap back to it after
/// [`MAX_SYNC_ID`].
#[derive(Debug)]
pub struct SyncIdAllocator {
    current: Mutex<u32>,
}

impl SyncIdAllocator {
    /// Creates an allocator whose first id is `MIN_VALID_SYNC_ID`.
    pub fn new() -> Self {
        Self::starting_after(MIN_VALID_SYNC_ID - 1)
    }

    /// Creates an allocator whose next id follows `last`.
    pub fn starting_after(last: u32) -> Self {
        Self {
            current: Mutex::new(last),
        }
    }

    /// Allocates the next id.
    pub fn generate(&self) -> u32 {
        let mut current = self.current.lock();
        *current = match current.checked_add(1) {
            Some(next) if next <= MAX_SYNC_ID => next,
            _ => MIN_VALID_SYNC_ID,
        };
        *current
    }
}

impl Default for SyncIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
