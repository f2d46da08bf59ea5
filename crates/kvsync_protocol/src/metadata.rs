//! Persisted per-device consistency record.

use crate::error::ProtocolResult;
use crate::{from_cbor, to_cbor, TimeOffset, Timestamp, WaterMark};
use serde::{Deserialize, Serialize};

/// Consistency state kept for one remote device.
///
/// Watermarks only grow under normal operation; they are reset by an
/// explicit erase when a device is re-paired or its data is wiped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataValue {
    /// Estimated clock skew of the device relative to us.
    pub time_offset: TimeOffset,
    /// Local virtual time of the last update to this record.
    pub last_update_time: Timestamp,
    /// Local records up to this mark have been sent to the device.
    pub local_water_mark: WaterMark,
    /// Device records up to this mark have been received.
    pub peer_water_mark: WaterMark,
}

impl MetaDataValue {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
