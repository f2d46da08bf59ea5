//! Sync modes and storage data-model types.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Direction and trigger of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Send local changes to the peer.
    Push,
    /// Fetch the peer's changes.
    Pull,
    /// Push then pull in one exchange.
    PushAndPull,
    /// Push triggered by a local data change.
    AutoPush,
    /// Pull triggered by a remote data change.
    AutoPull,
    /// Passive answer to a peer's pull. Never issued by callers.
    ResponsePull,
}

impl SyncMode {
    /// Every mode, in code order.
    pub const ALL: [SyncMode; 6] = [
        SyncMode::Push,
        SyncMode::Pull,
        SyncMode::PushAndPull,
        SyncMode::AutoPush,
        SyncMode::AutoPull,
        SyncMode::ResponsePull,
    ];

    /// Converts to a numeric code.
    pub fn to_code(self) -> u8 {
        match self {
            SyncMode::Push => 0,
            SyncMode::Pull => 1,
            SyncMode::PushAndPull => 2,
            SyncMode::AutoPush => 3,
            SyncMode::AutoPull => 4,
            SyncMode::ResponsePull => 5,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or(ProtocolError::UnknownCode {
                kind: "sync mode",
                code,
            })
    }

    /// Returns true for modes a caller may pass to `sync`.
    pub fn is_valid_request(self) -> bool {
        !matches!(self, SyncMode::ResponsePull)
    }

    /// Returns true for modes issued by the auto-sync policy.
    pub fn is_auto(self) -> bool {
        matches!(self, SyncMode::AutoPush | SyncMode::AutoPull)
    }

    /// Returns true for caller-issued modes subject to the manual queue limit.
    pub fn is_manual(self) -> bool {
        matches!(self, SyncMode::Push | SyncMode::Pull | SyncMode::PushAndPull)
    }

    /// Returns true if the exchange sends local data.
    pub fn has_push(self) -> bool {
        matches!(
            self,
            SyncMode::Push | SyncMode::PushAndPull | SyncMode::AutoPush
        )
    }

    /// Returns true if the exchange fetches remote data.
    pub fn has_pull(self) -> bool {
        matches!(
            self,
            SyncMode::Pull | SyncMode::PushAndPull | SyncMode::AutoPull
        )
    }
}

/// Data model declared by the storage behind a syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceType {
    /// Single-version store (last writer wins per key).
    SingleVersion,
    /// Multi-version store (commit history).
    MultiVersion,
}

impl InterfaceType {
    /// Converts to a numeric code.
    pub fn to_code(self) -> u8 {
        match self {
            InterfaceType::SingleVersion => 1,
            InterfaceType::MultiVersion => 2,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        match code {
            1 => Ok(InterfaceType::SingleVersion),
            2 => Ok(InterfaceType::MultiVersion),
            _ => Err(ProtocolError::UnknownCode {
                kind: "interface type",
                code,
            }),
        }
    }
}
