//! Protocol drivers for task contexts.
//!
//! A state machine is stateless: everything it needs to remember between
//! steps lives in the [`SyncTaskContext`] it is driving. The active side
//! of a single-version sync runs
//!
//! ```text
//! [AbilitySync -> ack] -> [TimeSync request -> response] -> DataSync request -> ack
//! ```
//!
//! where the bracketed steps run once per connection. The passive side
//! checks schema and security options, answers time sync requests inline,
//! records the pushed watermark, and queues a `ResponsePull` target when the
//! requester also wants our data.
//!
//! A failed response is handed back to the context, which retries transient
//! failures within the step's retry budget and aborts on anything else.

use crate::context::{SyncPhase, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::short_id;
use crate::target::SyncTarget;
use kvsync_protocol::{
    schema_compatible, AbilityAckPacket, AbilitySyncPacket, AckErrorCode, DataAckPacket,
    DataRequestPacket, Message, MessageId, MessageType, OperationStatus, SyncMode,
    TimeSyncPacket, SOFTWARE_VERSION_CURRENT,
};
use tracing::{debug, info, warn};

/// Drives the protocol of one task context.
pub trait SyncStateMachine: Send + Sync {
    /// Starts the active target.
    fn start_sync(&self, context: &SyncTaskContext) -> SyncResult<()>;

    /// Re-issues the outstanding step after a timeout.
    fn retry_step(&self, context: &SyncTaskContext) -> SyncResult<()>;

    /// Handles an inbound message.
    fn receive_message(&self, context: &SyncTaskContext, message: Message) -> SyncResult<()>;

    /// Sends the data owed by a response target.
    fn serve_response(&self, context: &SyncTaskContext, target: &SyncTarget) -> SyncResult<()>;
}

/// State machine for single-version stores: checks capabilities and
/// negotiates the clock offset once per connection, then exchanges
/// watermarks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleVerStateMachine;

impl SyncStateMachine for SingleVerStateMachine {
    fn start_sync(&self, context: &SyncTaskContext) -> SyncResult<()> {
        let mode = context.current_mode().ok_or(SyncError::Killed)?;
        mark_one_way(context, mode);
        if !context.is_ability_synced() {
            send_ability_request(context)
        } else if !context.is_time_synced() {
            send_time_sync_request(context)
        } else {
            send_data_request(context, mode)
        }
    }

    fn retry_step(&self, context: &SyncTaskContext) -> SyncResult<()> {
        resend(context)
    }

    fn receive_message(&self, context: &SyncTaskContext, message: Message) -> SyncResult<()> {
        match message.message_type {
            MessageType::Request => answer_request(context, message),
            MessageType::Response => {
                let (phase, mode) = context.take_phase_for_response(&message)?;
                if let Err(e) = self.on_response(context, phase, mode, &message) {
                    context.handle_response_error(phase, e);
                }
                Ok(())
            }
            MessageType::Notify => Err(SyncError::InvalidMessage(format!(
                "{:?} notify reached the state machine",
                message.message_id
            ))),
        }
    }

    fn serve_response(&self, context: &SyncTaskContext, target: &SyncTarget) -> SyncResult<()> {
        send_pull_response(context, target)
    }
}

impl SingleVerStateMachine {
    fn on_response(
        &self,
        context: &SyncTaskContext,
        phase: SyncPhase,
        mode: SyncMode,
        message: &Message,
    ) -> SyncResult<()> {
        match phase {
            SyncPhase::AbilitySync => {
                let ack = message.ability_ack_packet()?;
                if let Some(code) = ack.error {
                    return Err(SyncError::from(code));
                }
                if !schema_compatible(&context.sync_interface().schema(), &ack.schema) {
                    return Err(SyncError::SchemaMismatch);
                }
                context.set_ability_synced(true);
                debug!(
                    device = short_id(context.device_id()),
                    version = ack.software_version,
                    "ability sync finished"
                );
                if context.is_time_synced() {
                    send_data_request(context, mode)
                } else {
                    send_time_sync_request(context)
                }
            }
            SyncPhase::TimeSync { source_time_begin } => {
                let mut packet = message.time_sync_packet()?;
                packet.source_time_begin = source_time_begin;
                packet.source_time_end = context.time_helper().current_time();
                let offset = packet.calculate_time_offset()?;
                context
                    .metadata()
                    .save_time_offset(context.device_id(), offset)?;
                context.set_time_offset(offset);
                context.set_time_synced(true);
                debug!(device = short_id(context.device_id()), offset, "time offset negotiated");
                send_data_request(context, mode)
            }
            SyncPhase::DataSync { request } => finish_data_exchange(context, request, message),
            SyncPhase::Idle => Err(SyncError::InvalidMessage("no step outstanding".into())),
        }
    }
}

/// State machine for multi-version stores: no clock negotiation, and every
/// request also pulls the peer's commits.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiVerStateMachine;

impl MultiVerStateMachine {
    /// Direction actually requested for a caller's mode.
    pub fn request_mode(mode: SyncMode) -> SyncMode {
        match mode {
            SyncMode::Push | SyncMode::AutoPush | SyncMode::PushAndPull => SyncMode::PushAndPull,
            SyncMode::Pull | SyncMode::AutoPull | SyncMode::ResponsePull => SyncMode::Pull,
        }
    }
}

impl SyncStateMachine for MultiVerStateMachine {
    fn start_sync(&self, context: &SyncTaskContext) -> SyncResult<()> {
        let mode = Self::request_mode(context.current_mode().ok_or(SyncError::Killed)?);
        mark_one_way(context, mode);
        send_data_request(context, mode)
    }

    fn retry_step(&self, context: &SyncTaskContext) -> SyncResult<()> {
        resend(context)
    }

    fn receive_message(&self, context: &SyncTaskContext, message: Message) -> SyncResult<()> {
        match message.message_type {
            MessageType::Request => answer_request(context, message),
            MessageType::Response => {
                let (phase, _) = context.take_phase_for_response(&message)?;
                let result = match phase {
                    SyncPhase::DataSync { request } => {
                        finish_data_exchange(context, request, &message)
                    }
                    _ => Err(SyncError::InvalidMessage(
                        "multi-version sync only exchanges data".into(),
                    )),
                };
                if let Err(e) = result {
                    context.handle_response_error(phase, e);
                }
                Ok(())
            }
            MessageType::Notify => Err(SyncError::InvalidMessage(format!(
                "{:?} notify reached the state machine",
                message.message_id
            ))),
        }
    }

    fn serve_response(&self, context: &SyncTaskContext, target: &SyncTarget) -> SyncResult<()> {
        send_pull_response(context, target)
    }
}

// A one-way sync has nothing to do in the other direction.
fn mark_one_way(context: &SyncTaskContext, mode: SyncMode) {
    if mode.has_push() && !mode.has_pull() {
        context.set_operation_status(OperationStatus::RecvFinished);
    } else if mode.has_pull() && !mode.has_push() {
        context.set_operation_status(OperationStatus::SendFinished);
    }
}

fn send_ability_request(context: &SyncTaskContext) -> SyncResult<()> {
    let storage = context.sync_interface();
    let packet = AbilitySyncPacket {
        software_version: SOFTWARE_VERSION_CURRENT,
        schema: storage.schema(),
        security: storage.security_option(),
    };
    let (session_id, sequence_id) = context.begin_step(SyncPhase::AbilitySync)?;
    context.send_message(
        Message::new(MessageId::AbilitySync, MessageType::Request)
            .with_session(session_id, sequence_id)
            .with_payload(packet.encode()?),
    )
}

fn send_time_sync_request(context: &SyncTaskContext) -> SyncResult<()> {
    let source_time_begin = context.time_helper().current_time();
    let (session_id, sequence_id) = context.begin_step(SyncPhase::TimeSync { source_time_begin })?;
    let packet = TimeSyncPacket {
        source_time_begin,
        ..TimeSyncPacket::default()
    };
    context.send_message(
        Message::new(MessageId::TimeSync, MessageType::Request)
            .with_session(session_id, sequence_id)
            .with_payload(packet.encode()?),
    )
}

fn send_data_request(context: &SyncTaskContext, mode: SyncMode) -> SyncResult<()> {
    let request = DataRequestPacket {
        mode,
        send_end_mark: context.sync_interface().max_timestamp(),
        pull_begin_mark: context
            .metadata()
            .get_peer_water_mark(context.device_id(), true),
    };
    let (session_id, sequence_id) = context.begin_step(SyncPhase::DataSync { request })?;
    context.send_message(
        Message::new(MessageId::DataSync, MessageType::Request)
            .with_session(session_id, sequence_id)
            .with_payload(request.encode()?),
    )
}

fn resend(context: &SyncTaskContext) -> SyncResult<()> {
    match context.current_phase() {
        SyncPhase::AbilitySync => send_ability_request(context),
        SyncPhase::TimeSync { .. } => send_time_sync_request(context),
        SyncPhase::DataSync { request } => send_data_request(context, request.mode),
        SyncPhase::Idle => Err(SyncError::InvalidMessage("no step to retry".into())),
    }
}

fn finish_data_exchange(
    context: &SyncTaskContext,
    request: DataRequestPacket,
    message: &Message,
) -> SyncResult<()> {
    let ack = message.data_ack_packet()?;
    if let Some(code) = ack.error {
        return Err(SyncError::from(code));
    }
    let device = context.device_id();
    let metadata = context.metadata();
    if request.mode.has_push() {
        metadata.save_local_water_mark(device, request.send_end_mark)?;
        context.set_operation_status(OperationStatus::SendFinished);
    }
    if request.mode.has_pull() {
        if ack.end_mark > metadata.get_peer_water_mark(device, true) {
            metadata.save_peer_water_mark(device, ack.end_mark, true)?;
        }
        context.set_operation_status(OperationStatus::RecvFinished);
    }
    info!(
        device = short_id(device),
        mode = ?request.mode,
        sent = request.send_end_mark,
        received = ack.end_mark,
        "data exchange finished"
    );
    context.complete_target(OperationStatus::FinishedAll);
    Ok(())
}

fn answer_request(context: &SyncTaskContext, message: Message) -> SyncResult<()> {
    match message.message_id {
        MessageId::AbilitySync => answer_ability_request(context, &message),
        MessageId::TimeSync => {
            let mut packet = message.time_sync_packet()?;
            packet.target_time_begin = context.time_helper().current_time();
            packet.target_time_end = context.time_helper().current_time();
            context.send_response(
                Message::new(MessageId::TimeSync, MessageType::Response)
                    .with_session(message.session_id, message.sequence_id)
                    .with_payload(packet.encode()?),
            )
        }
        MessageId::DataSync => answer_data_request(context, &message),
        MessageId::LocalDataChanged => Err(SyncError::InvalidMessage(
            "data change notification sent as request".into(),
        )),
    }
}

fn answer_ability_request(context: &SyncTaskContext, message: &Message) -> SyncResult<()> {
    let request = message.ability_sync_packet()?;
    let storage = context.sync_interface();
    let schema = storage.schema();
    let security = storage.security_option();
    let error = if !schema_compatible(&schema, &request.schema) {
        Some(AckErrorCode::SchemaMismatch)
    } else if !security.is_compatible(&request.security) {
        Some(AckErrorCode::SecurityOptionCheck)
    } else {
        None
    };
    if let Some(code) = error {
        warn!(device = short_id(context.device_id()), ?code, "ability check refused peer");
    }
    let ack = AbilityAckPacket {
        software_version: SOFTWARE_VERSION_CURRENT,
        schema,
        security,
        error,
    };
    context.send_response(
        Message::new(MessageId::AbilitySync, MessageType::Response)
            .with_session(message.session_id, message.sequence_id)
            .with_payload(ack.encode()?),
    )
}

fn answer_data_request(context: &SyncTaskContext, message: &Message) -> SyncResult<()> {
    let request = message.data_request_packet()?;
    let device = context.device_id();

    if !context.check_permission(request.mode) {
        send_ack(context, message, DataAckPacket::failed(AckErrorCode::PermissionDenied))?;
        return Err(SyncError::PermissionDenied);
    }

    if !request.mode.is_valid_request() {
        send_ack(context, message, DataAckPacket::failed(AckErrorCode::Internal))?;
        return Err(SyncError::InvalidArgs(format!(
            "peer requested {:?}",
            request.mode
        )));
    }

    if request.mode.has_push() {
        let metadata = context.metadata();
        if request.send_end_mark > metadata.get_peer_water_mark(device, true) {
            if let Err(e) = metadata.save_peer_water_mark(device, request.send_end_mark, true) {
                let code = match e {
                    SyncError::KeyRevoked => AckErrorCode::KeyRevoked,
                    _ => AckErrorCode::Internal,
                };
                send_ack(context, message, DataAckPacket::failed(code))?;
                return Err(e);
            }
        }
    }

    if request.mode.has_pull() {
        context.add_sync_target(SyncTarget::response(
            message.session_id,
            message.sequence_id,
            context.sync_interface().max_timestamp(),
        ))
    } else {
        let end_mark = context.sync_interface().max_timestamp();
        send_ack(context, message, DataAckPacket::ok(end_mark))
    }
}

fn send_pull_response(context: &SyncTaskContext, target: &SyncTarget) -> SyncResult<()> {
    let SyncTarget::Response {
        session_id,
        sequence_id,
        end_mark,
    } = *target
    else {
        return Err(SyncError::InvalidArgs("not a response target".into()));
    };
    debug!(device = short_id(context.device_id()), end_mark, "serving pull response");
    context.send_response(
        Message::new(MessageId::DataSync, MessageType::Response)
            .with_session(session_id, sequence_id)
            .with_payload(DataAckPacket::ok(end_mark).encode()?),
    )
}

fn send_ack(context: &SyncTaskContext, request: &Message, ack: DataAckPacket) -> SyncResult<()> {
    context.send_response(
        Message::new(MessageId::DataSync, MessageType::Response)
            .with_session(request.session_id, request.sequence_id)
            .with_payload(ack.encode()?),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_version_always_pulls() {
        for mode in SyncMode::ALL {
            assert!(MultiVerStateMachine::request_mode(mode).has_pull());
        }
        assert_eq!(
            MultiVerStateMachine::request_mode(SyncMode::AutoPush),
            SyncMode::PushAndPull
        );
        assert_eq!(
            MultiVerStateMachine::request_mode(SyncMode::AutoPull),
            SyncMode::Pull
        );
    }
}
