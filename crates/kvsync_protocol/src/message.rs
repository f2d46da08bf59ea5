//! Messages exchanged between sync task contexts.
//!
//! A [`Message`] is the unit handed to the communicator. Its header carries
//! the routing and ordering fields; the payload is one of the CBOR-encoded
//! packets defined here.

use crate::error::{ProtocolError, ProtocolResult};
use crate::{from_cbor, to_cbor, SyncMode, TimeOffset, Timestamp, WaterMark};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Fixed size accounted for the message header when sizing queues.
pub const MESSAGE_HEADER_LEN: usize = 16;

/// Protocol revision advertised during ability sync.
pub const SOFTWARE_VERSION_CURRENT: u32 = 3;

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Schema and security option negotiation.
    AbilitySync,
    /// Clock offset negotiation.
    TimeSync,
    /// Watermark / data exchange.
    DataSync,
    /// Broadcast: the sender's local data changed.
    LocalDataChanged,
}

/// Role of a message in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Initiates a step.
    Request,
    /// Answers a request.
    Response,
    /// One-way notification.
    Notify,
}

/// A framed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message kind.
    pub message_id: MessageId,
    /// Request, response or notification.
    pub message_type: MessageType,
    /// Session of the exchange this message belongs to.
    pub session_id: u32,
    /// Position of the message within its session.
    pub sequence_id: u32,
    /// Encoded packet.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message with an empty payload.
    pub fn new(message_id: MessageId, message_type: MessageType) -> Self {
        Self {
            message_id,
            message_type,
            session_id: 0,
            sequence_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Sets the session and sequence ids.
    pub fn with_session(mut self, session_id: u32, sequence_id: u32) -> Self {
        self.session_id = session_id;
        self.sequence_id = sequence_id;
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Creates a `LocalDataChanged` notification.
    pub fn local_data_changed() -> Self {
        Self::new(MessageId::LocalDataChanged, MessageType::Notify)
    }

    /// Size accounted for this message in receive queues.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.payload.len()
    }

    /// Decodes the payload as an ability sync request.
    pub fn ability_sync_packet(&self) -> ProtocolResult<AbilitySyncPacket> {
        self.expect_id(MessageId::AbilitySync)?;
        from_cbor(&self.payload)
    }

    /// Decodes the payload as an ability sync acknowledgement.
    pub fn ability_ack_packet(&self) -> ProtocolResult<AbilityAckPacket> {
        self.expect_id(MessageId::AbilitySync)?;
        from_cbor(&self.payload)
    }

    /// Decodes the payload as a time sync packet.
    pub fn time_sync_packet(&self) -> ProtocolResult<TimeSyncPacket> {
        self.expect_id(MessageId::TimeSync)?;
        from_cbor(&self.payload)
    }

    /// Decodes the payload as a data request.
    pub fn data_request_packet(&self) -> ProtocolResult<DataRequestPacket> {
        self.expect_id(MessageId::DataSync)?;
        from_cbor(&self.payload)
    }

    /// Decodes the payload as a data acknowledgement.
    pub fn data_ack_packet(&self) -> ProtocolResult<DataAckPacket> {
        self.expect_id(MessageId::DataSync)?;
        from_cbor(&self.payload)
    }

    fn expect_id(&self, id: MessageId) -> ProtocolResult<()> {
        if self.message_id == id {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedPayload(self.message_id))
        }
    }
}

/// Four timestamps of a time sync round trip.
///
/// The source fills the `source_*` fields; the target fills `target_*`
/// when answering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncPacket {
    /// Source clock when the request was sent.
    pub source_time_begin: Timestamp,
    /// Source clock when the response arrived.
    pub source_time_end: Timestamp,
    /// Target clock when the request arrived.
    pub target_time_begin: Timestamp,
    /// Target clock when the response was sent.
    pub target_time_end: Timestamp,
}

impl TimeSyncPacket {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Offset of the target clock relative to the source, compensating for
    /// the round trip.
    ///
    /// The target half of the packet comes from the peer, so the arithmetic
    /// is widened and an unrepresentable offset is an error.
    pub fn calculate_time_offset(&self) -> ProtocolResult<TimeOffset> {
        let source_begin = i128::from(self.source_time_begin);
        let source_end = i128::from(self.source_time_end);
        let target_begin = i128::from(self.target_time_begin);
        let target_end = i128::from(self.target_time_end);
        let round_trip = (source_end - source_begin) - (target_end - target_begin);
        let offset_begin = target_begin - source_begin - round_trip / 2;
        let offset_end = target_end + round_trip / 2 - source_end;
        TimeOffset::try_from((offset_begin + offset_end) / 2)
            .map_err(|_| ProtocolError::TimeOffsetOverflow)
    }
}

/// Security classification of a store.
///
/// A label of zero means the store is unclassified; it syncs with anyone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOption {
    /// Sensitivity level.
    pub label: u8,
    /// Label-specific flag.
    pub flag: u8,
}

impl SecurityOption {
    /// Creates an option with `label` and no flag.
    pub fn with_label(label: u8) -> Self {
        Self { label, flag: 0 }
    }

    /// Returns true if stores labelled `self` and `remote` may sync.
    pub fn is_compatible(&self, remote: &SecurityOption) -> bool {
        self.label == 0 || remote.label == 0 || self.label == remote.label
    }
}

/// Returns true if two stores' schemas may sync. An empty schema matches
/// anything.
pub fn schema_compatible(local: &str, remote: &str) -> bool {
    local.is_empty() || remote.is_empty() || local == remote
}

/// Opens a connection: the requester's capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilitySyncPacket {
    /// Protocol revision of the sender.
    pub software_version: u32,
    /// Schema of the sender's store.
    pub schema: String,
    /// Security option of the sender's store.
    pub security: SecurityOption,
}

impl AbilitySyncPacket {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }
}

/// Answers an ability sync request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityAckPacket {
    /// Protocol revision of the responder.
    pub software_version: u32,
    /// Schema of the responder's store.
    pub schema: String,
    /// Security option of the responder's store.
    pub security: SecurityOption,
    /// Set when the responder refuses to sync with the requester.
    pub error: Option<AckErrorCode>,
}

impl AbilityAckPacket {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }
}

/// Opens a data exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequestPacket {
    /// Requested direction.
    pub mode: SyncMode,
    /// Sender's data is complete up to this mark (push part).
    pub send_end_mark: WaterMark,
    /// Sender already holds the receiver's data up to this mark (pull part).
    pub pull_begin_mark: WaterMark,
}

impl DataRequestPacket {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }
}

/// Failure reported by the answering device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckErrorCode {
    /// Schemas cannot be reconciled.
    SchemaMismatch,
    /// Security labels do not match.
    SecurityOptionCheck,
    /// Storage key was revoked.
    KeyRevoked,
    /// Peer is too busy to serve the request.
    Busy,
    /// Peer's permission check refused us.
    PermissionDenied,
    /// Peer storage failed.
    Internal,
}

/// Answers a data request or carries a pull response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAckPacket {
    /// Responder's data is complete up to this mark.
    pub end_mark: WaterMark,
    /// Set when the responder could not serve the request.
    pub error: Option<AckErrorCode>,
}

impl DataAckPacket {
    /// A successful acknowledgement.
    pub fn ok(end_mark: WaterMark) -> Self {
        Self {
            end_mark,
            error: None,
        }
    }

    /// A failed acknowledgement.
    pub fn failed(error: AckErrorCode) -> Self {
        Self {
            end_mark: 0,
            error: Some(error),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }
}
