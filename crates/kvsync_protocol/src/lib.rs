//! # KvSync Protocol
//!
//! Value types and CBOR codecs shared by the KvSync engine and its
//! collaborators.
//!
//! This crate provides:
//! - `SyncMode` and `InterfaceType`
//! - Per-device `OperationStatus` and the context lifecycle enums
//! - `MetaDataValue`, the persisted per-device consistency record
//! - `Message` and the packets carried in its payload
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod message;
mod metadata;
mod mode;
mod status;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    schema_compatible, AbilityAckPacket, AbilitySyncPacket, AckErrorCode, DataAckPacket,
    DataRequestPacket, Message, MessageId, MessageType, SecurityOption, TimeSyncPacket,
    MESSAGE_HEADER_LEN, SOFTWARE_VERSION_CURRENT,
};
pub use metadata::MetaDataValue;
pub use mode::{InterfaceType, SyncMode};
pub use status::{OperationStatus, RetryStatus, TaskExecStatus};

/// Opaque identifier of a remote device.
pub type DeviceId = String;

/// Virtual timestamp in 100 ns units.
pub type Timestamp = u64;

/// Estimated clock skew between two devices, in 100 ns units.
pub type TimeOffset = i64;

/// Progress marker: every record up to this timestamp has been exchanged.
pub type WaterMark = u64;

/// The smallest sync id ever handed to a caller.
pub const MIN_VALID_SYNC_ID: u32 = 1;

fn to_cbor<T: serde::Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}
