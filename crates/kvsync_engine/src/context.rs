//! Per-device task context.
//!
//! A [`SyncTaskContext`] owns everything the engine knows about one remote
//! device: the queues of request and response targets, the active target,
//! the step timer with its retry budget, and the session and sequence ids
//! used to match responses to requests.
//!
//! Request targets run one at a time in FIFO order. Response targets are
//! served as soon as they are queued and never wait behind the active
//! request target, so two devices syncing with each other cannot deadlock.

use crate::communicator::{Communicator, SendErrorHandler};
use crate::config::SyncConfig;
use crate::engine::PermissionCheck;
use crate::error::{CommError, SyncError, SyncResult};
use crate::interface::SyncInterface;
use crate::metadata::Metadata;
use crate::operation::SyncOperation;
use crate::scheduler::{TaskScheduler, TimerHandle};
use crate::short_id;
use crate::state_machine::SyncStateMachine;
use crate::target::SyncTarget;
use crate::time_helper::TimeHelper;
use kvsync_protocol::{
    DataRequestPacket, DeviceId, Message, MessageId, OperationStatus, RetryStatus, SyncMode,
    TaskExecStatus, TimeOffset, Timestamp,
};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Protocol step the active request target is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing outstanding.
    Idle,
    /// Waiting for an ability sync acknowledgement.
    AbilitySync,
    /// Waiting for a time sync response.
    TimeSync {
        /// Local virtual time when the request was sent.
        source_time_begin: Timestamp,
    },
    /// Waiting for a data acknowledgement.
    DataSync {
        /// The request that was sent.
        request: DataRequestPacket,
    },
}

/// Collaborators shared by every context of one engine.
#[derive(Clone)]
pub struct ContextDeps {
    /// Storage being synced.
    pub sync_interface: Arc<dyn SyncInterface>,
    /// Consistency metadata.
    pub metadata: Arc<Metadata>,
    /// Virtual clock.
    pub time_helper: Arc<TimeHelper>,
    /// Message transport.
    pub communicator: Arc<dyn Communicator>,
    /// Task and timer runtime.
    pub scheduler: Arc<TaskScheduler>,
    /// Protocol driver.
    pub state_machine: Arc<dyn SyncStateMachine>,
    /// Timeouts and retry budget.
    pub config: SyncConfig,
    /// Permission check shared with the engine; consulted for both our
    /// requests and the peer's.
    pub permission_check: Arc<RwLock<Option<PermissionCheck>>>,
}

struct ContextState {
    request_targets: VecDeque<SyncTarget>,
    response_targets: VecDeque<SyncTarget>,
    current: Option<SyncTarget>,
    exec_status: TaskExecStatus,
    timer: Option<TimerHandle>,
    timer_generation: u64,
    timeout: Duration,
    retry_time: u32,
    retry_status: RetryStatus,
    request_session_id: u32,
    task_error: Option<SyncError>,
    phase: SyncPhase,
    serving_responses: bool,
}

/// Keeps a context counted as in use until dropped.
pub struct UsedGuard<'a> {
    context: &'a SyncTaskContext,
}

impl Drop for UsedGuard<'_> {
    fn drop(&mut self) {
        self.context.dec_used_count();
    }
}

/// Sync state for one remote device.
pub struct SyncTaskContext {
    device_id: DeviceId,
    deps: ContextDeps,
    weak_self: Weak<SyncTaskContext>,
    state: Mutex<ContextState>,
    sequence_id: AtomicU32,
    time_offset: AtomicI64,
    time_synced: AtomicBool,
    ability_synced: AtomicBool,
    used: Mutex<u32>,
    used_cond: Condvar,
    killed: AtomicBool,
}

impl SyncTaskContext {
    /// Creates the context for `device_id`.
    pub fn new(device_id: impl Into<DeviceId>, deps: ContextDeps) -> Arc<Self> {
        let device_id = device_id.into();
        let time_offset = deps.metadata.get_time_offset(&device_id);
        let timeout = deps.config.timeout;
        Arc::new_cyclic(|weak_self| Self {
            device_id,
            deps,
            weak_self: weak_self.clone(),
            state: Mutex::new(ContextState {
                request_targets: VecDeque::new(),
                response_targets: VecDeque::new(),
                current: None,
                exec_status: TaskExecStatus::Init,
                timer: None,
                timer_generation: 0,
                timeout,
                retry_time: 0,
                retry_status: RetryStatus::NoNeedRetry,
                request_session_id: 0,
                task_error: None,
                phase: SyncPhase::Idle,
                serving_responses: false,
            }),
            sequence_id: AtomicU32::new(0),
            time_offset: AtomicI64::new(time_offset),
            time_synced: AtomicBool::new(false),
            ability_synced: AtomicBool::new(false),
            used: Mutex::new(0),
            used_cond: Condvar::new(),
            killed: AtomicBool::new(false),
        })
    }

    /// Remote device this context serves.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Queues one device of `operation`.
    pub fn add_sync_operation(&self, operation: &Arc<SyncOperation>) -> SyncResult<()> {
        self.add_sync_target(SyncTarget::request(Arc::clone(operation)))
    }

    /// Queues a target and schedules work if the context is idle.
    pub fn add_sync_target(&self, target: SyncTarget) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::Killed);
        }
        let is_response = target.is_response();
        let schedule = {
            let mut state = self.state.lock();
            if is_response {
                state.response_targets.push_back(target);
                !std::mem::replace(&mut state.serving_responses, true)
            } else {
                state.request_targets.push_back(target);
                state.exec_status != TaskExecStatus::Running
            }
        };
        if !schedule {
            return Ok(());
        }
        if is_response {
            let result = self.schedule(SyncTaskContext::serve_responses);
            if result.is_err() {
                self.state.lock().serving_responses = false;
            }
            result
        } else {
            self.schedule(SyncTaskContext::exec_sync_task)
        }
    }

    /// Drops queued targets of `sync_id` and stops the active one if it
    /// belongs to that operation.
    pub fn remove_sync_operation(&self, sync_id: u32) {
        let removed_active = {
            let mut state = self.state.lock();
            state
                .request_targets
                .retain(|t| t.sync_id() != Some(sync_id));
            if state.current.as_ref().and_then(SyncTarget::sync_id) == Some(sync_id) {
                Self::stop_timer_locked(&mut state);
                state.current = None;
                state.phase = SyncPhase::Idle;
                state.exec_status = TaskExecStatus::Finished;
                true
            } else {
                false
            }
        };
        if removed_active {
            debug!(device = short_id(&self.device_id), sync_id, "active target removed");
            self.schedule_next();
        }
    }

    /// Promotes the next request target and starts its state machine.
    pub fn exec_sync_task(&self) {
        if self.is_killed() {
            return;
        }
        let _guard = self.inc_used_count();
        let operation = {
            let mut state = self.state.lock();
            if state.exec_status == TaskExecStatus::Running {
                return;
            }
            if !self.move_to_next_target_locked(&mut state) {
                state.exec_status = TaskExecStatus::Finished;
                return;
            }
            state.exec_status = TaskExecStatus::Running;
            state.current.as_ref().and_then(SyncTarget::operation).cloned()
        };

        if let Some(operation) = operation {
            info!(
                device = short_id(&self.device_id),
                sync_id = operation.sync_id(),
                mode = ?operation.mode(),
                "sync target started"
            );
            operation.set_status(&self.device_id, OperationStatus::Syncing);
        }

        if let Err(e) = self.start_state_machine() {
            warn!(device = short_id(&self.device_id), error = %e, "state machine failed to start");
            self.abort(e.to_status());
        }
    }

    /// Starts the protocol for the active target.
    ///
    /// Fails fast with a communication error if the device is unreachable.
    pub fn start_state_machine(&self) -> SyncResult<()> {
        if !self.is_comm_normal() {
            return Err(SyncError::Communication(CommError::DeviceOffline));
        }
        self.deps.state_machine.start_sync(self)
    }

    /// Handles a message from the device.
    pub fn receive_message(&self, message: Message) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::Killed);
        }
        let _guard = self.inc_used_count();
        self.deps.state_machine.receive_message(self, message)
    }

    /// Arms the step timer with the current timeout.
    pub fn start_timer(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        self.start_timer_locked(&mut state)
    }

    /// Disarms the step timer.
    pub fn stop_timer(&self) {
        let mut state = self.state.lock();
        Self::stop_timer_locked(&mut state);
    }

    /// Changes the step timeout, re-arming a running timer.
    pub fn modify_timer(&self, milliseconds: u64) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.timeout = Duration::from_millis(milliseconds);
        if state.timer.is_some() {
            self.start_timer_locked(&mut state)?;
        }
        Ok(())
    }

    /// Advances the message sequence and returns the new value.
    pub fn inc_sequence_id(&self) -> u32 {
        self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sequence id of the newest request.
    pub fn get_sequence_id(&self) -> u32 {
        self.sequence_id.load(Ordering::SeqCst)
    }

    /// Restarts sequence numbering.
    pub fn reset_sequence_id(&self) {
        self.sequence_id.store(0, Ordering::SeqCst);
    }

    /// Session id of the active request target.
    pub fn request_session_id(&self) -> u32 {
        self.state.lock().request_session_id
    }

    /// Marks the context as in use until the guard drops.
    pub fn inc_used_count(&self) -> UsedGuard<'_> {
        *self.used.lock() += 1;
        UsedGuard { context: self }
    }

    fn dec_used_count(&self) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(1);
        if *used == 0 {
            self.used_cond.notify_all();
        }
    }

    /// Waits up to the configured kill wait for in-flight users.
    ///
    /// Returns false if users remained when the wait expired.
    pub fn safe_exit(&self) -> bool {
        let deadline = Instant::now() + self.deps.config.kill_wait;
        let mut used = self.used.lock();
        while *used > 0 {
            if self.used_cond.wait_until(&mut used, deadline).timed_out() {
                if *used > 0 {
                    warn!(device = short_id(&self.device_id), users = *used, "context still in use");
                }
                return *used == 0;
            }
        }
        true
    }

    /// Caches the device clock offset.
    pub fn set_time_offset(&self, offset: TimeOffset) {
        self.time_offset.store(offset, Ordering::SeqCst);
    }

    /// Cached device clock offset.
    pub fn get_time_offset(&self) -> TimeOffset {
        self.time_offset.load(Ordering::SeqCst)
    }

    /// Returns true once the clock offset was negotiated on this connection.
    pub fn is_time_synced(&self) -> bool {
        self.time_synced.load(Ordering::SeqCst)
    }

    pub(crate) fn set_time_synced(&self, synced: bool) {
        self.time_synced.store(synced, Ordering::SeqCst);
    }

    /// Returns true once schema and security options were checked on this
    /// connection.
    pub fn is_ability_synced(&self) -> bool {
        self.ability_synced.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ability_synced(&self, synced: bool) {
        self.ability_synced.store(synced, Ordering::SeqCst);
    }

    /// Returns true unless the permission check refuses this device in
    /// `mode`.
    pub fn check_permission(&self, mode: SyncMode) -> bool {
        let check = self.deps.permission_check.read().clone();
        match check {
            Some(check) => check(&self.device_id, mode),
            None => true,
        }
    }

    /// Returns true if the device is reachable.
    pub fn is_comm_normal(&self) -> bool {
        self.deps.communicator.is_device_online(&self.device_id)
    }

    /// Routes an asynchronous send failure to its context.
    ///
    /// Failures of an earlier session are ignored.
    pub fn comm_err_handler(error: CommError, context: &Weak<SyncTaskContext>, session_id: u32) {
        if let Some(context) = context.upgrade() {
            context.on_comm_error(error, session_id);
        }
    }

    /// Finalizes the active target with `status` and moves on.
    pub fn abort(&self, status: OperationStatus) {
        self.complete_target(status);
    }

    /// Aborts the active target because the device went away.
    pub fn comm_err_abort(&self) {
        self.set_time_synced(false);
        self.set_ability_synced(false);
        let active = self.state.lock().current.is_some();
        if active {
            info!(device = short_id(&self.device_id), "device offline, aborting target");
            self.abort(OperationStatus::CommAbnormal);
        }
    }

    /// Drops every queued and active target; their devices become `Failed`.
    pub fn clear(&self) {
        let targets: Vec<SyncTarget> = {
            let mut state = self.state.lock();
            Self::stop_timer_locked(&mut state);
            state.phase = SyncPhase::Idle;
            state.response_targets.clear();
            let mut targets: Vec<SyncTarget> = state.current.take().into_iter().collect();
            targets.extend(state.request_targets.drain(..));
            targets
        };
        for target in targets {
            if let Some(operation) = target.operation() {
                operation.set_status(&self.device_id, OperationStatus::Failed);
            }
        }
    }

    /// Stops accepting work and clears all targets.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear();
    }

    /// Returns true once killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Execution status of the request queue.
    pub fn exec_status(&self) -> TaskExecStatus {
        self.state.lock().exec_status
    }

    /// Retries spent on the active target.
    pub fn retry_time(&self) -> u32 {
        self.state.lock().retry_time
    }

    /// Queued (not active) request targets.
    pub fn request_target_count(&self) -> usize {
        self.state.lock().request_targets.len()
    }

    /// Sync id of the active target.
    pub fn current_sync_id(&self) -> Option<u32> {
        self.state.lock().current.as_ref().and_then(SyncTarget::sync_id)
    }

    pub(crate) fn metadata(&self) -> &Metadata {
        &self.deps.metadata
    }

    pub(crate) fn sync_interface(&self) -> &dyn SyncInterface {
        self.deps.sync_interface.as_ref()
    }

    pub(crate) fn time_helper(&self) -> &TimeHelper {
        &self.deps.time_helper
    }

    /// Mode of the active request target.
    pub(crate) fn current_mode(&self) -> Option<SyncMode> {
        self.state.lock().current.as_ref().map(SyncTarget::mode)
    }

    pub(crate) fn current_phase(&self) -> SyncPhase {
        self.state.lock().phase
    }

    /// Records `phase` as outstanding, arms the timer and allocates the
    /// ids of the request about to be sent.
    pub(crate) fn begin_step(&self, phase: SyncPhase) -> SyncResult<(u32, u32)> {
        let mut state = self.state.lock();
        if state.current.is_none() {
            return Err(SyncError::Killed);
        }
        state.phase = phase;
        state.retry_status = RetryStatus::NeedRetry;
        self.start_timer_locked(&mut state)?;
        Ok((state.request_session_id, self.inc_sequence_id()))
    }

    /// Validates a response against the outstanding step and claims it.
    ///
    /// Responses of another session, with a stale sequence id, or for a
    /// step that is not outstanding are rejected.
    pub(crate) fn take_phase_for_response(
        &self,
        message: &Message,
    ) -> SyncResult<(SyncPhase, SyncMode)> {
        let mut state = self.state.lock();
        let Some(mode) = state.current.as_ref().map(SyncTarget::mode) else {
            return Err(SyncError::InvalidMessage("no active target".into()));
        };
        if message.session_id != state.request_session_id {
            return Err(SyncError::InvalidMessage(format!(
                "session {} does not match {}",
                message.session_id, state.request_session_id
            )));
        }
        let sequence_id = self.get_sequence_id();
        if message.sequence_id != sequence_id {
            return Err(SyncError::InvalidMessage(format!(
                "sequence {} does not match {}",
                message.sequence_id, sequence_id
            )));
        }
        let expected = matches!(
            (state.phase, message.message_id),
            (SyncPhase::AbilitySync, MessageId::AbilitySync)
                | (SyncPhase::TimeSync { .. }, MessageId::TimeSync)
                | (SyncPhase::DataSync { .. }, MessageId::DataSync)
        );
        if !expected {
            return Err(SyncError::InvalidMessage(format!(
                "{:?} response not expected",
                message.message_id
            )));
        }
        Self::stop_timer_locked(&mut state);
        state.task_error = None;
        let phase = std::mem::replace(&mut state.phase, SyncPhase::Idle);
        Ok((phase, mode))
    }

    /// Moves the active device of its operation forward.
    pub(crate) fn set_operation_status(&self, status: OperationStatus) {
        let operation = self
            .state
            .lock()
            .current
            .as_ref()
            .and_then(SyncTarget::operation)
            .cloned();
        if let Some(operation) = operation {
            operation.set_status(&self.device_id, status);
        }
    }

    /// Finalizes the active target and schedules the next one.
    pub(crate) fn complete_target(&self, status: OperationStatus) {
        let target = {
            let mut state = self.state.lock();
            Self::stop_timer_locked(&mut state);
            state.phase = SyncPhase::Idle;
            state.task_error = None;
            state.exec_status = if status.is_failure() {
                TaskExecStatus::Failed
            } else {
                TaskExecStatus::Finished
            };
            state.current.take()
        };
        let Some(target) = target else {
            return;
        };
        if let Some(operation) = target.operation() {
            info!(
                device = short_id(&self.device_id),
                sync_id = operation.sync_id(),
                ?status,
                "sync target completed"
            );
            operation.set_status(&self.device_id, status);
        }
        self.schedule_next();
    }

    /// Records a retryable failure for the timer, or aborts.
    pub(crate) fn handle_step_error(&self, error: SyncError) {
        self.step_failed(error, None);
    }

    /// Handles a failure found while processing the response to `phase`.
    ///
    /// The response already disarmed the timer, so a retryable failure
    /// re-arms it for `phase` as long as retries remain.
    pub(crate) fn handle_response_error(&self, phase: SyncPhase, error: SyncError) {
        self.step_failed(error, Some(phase));
    }

    fn step_failed(&self, error: SyncError, failed_phase: Option<SyncPhase>) {
        let recorded = {
            let mut state = self.state.lock();
            if state.current.is_none() {
                return;
            }
            if !error.is_retryable() {
                false
            } else if state.timer.is_some() {
                state.task_error = Some(error.clone());
                true
            } else {
                let phase = failed_phase.unwrap_or(state.phase);
                if phase == SyncPhase::Idle
                    || state.retry_time >= self.deps.config.retry.max_retries
                {
                    false
                } else {
                    state.phase = phase;
                    state.retry_status = RetryStatus::NeedRetry;
                    state.task_error = Some(error.clone());
                    self.start_timer_locked(&mut state).is_ok()
                }
            }
        };
        if recorded {
            debug!(device = short_id(&self.device_id), error = %error, "step failed, awaiting retry");
        } else {
            warn!(device = short_id(&self.device_id), error = %error, "step failed");
            self.abort(error.to_status());
        }
    }

    /// Sends a request of the active session.
    pub(crate) fn send_message(&self, message: Message) -> SyncResult<()> {
        let weak = self.weak_self.clone();
        let session_id = message.session_id;
        let on_error: SendErrorHandler = Box::new(move |error| {
            SyncTaskContext::comm_err_handler(error, &weak, session_id);
        });
        self.deps
            .communicator
            .send(&self.device_id, message, on_error)
            .map_err(SyncError::from)
    }

    /// Sends a response; delivery failures are only logged.
    pub(crate) fn send_response(&self, message: Message) -> SyncResult<()> {
        let device = short_id(&self.device_id).to_string();
        let on_error: SendErrorHandler = Box::new(move |error| {
            debug!(device = %device, error = %error, "response not delivered");
        });
        self.deps
            .communicator
            .send(&self.device_id, message, on_error)
            .map_err(SyncError::from)
    }

    fn on_comm_error(&self, error: CommError, session_id: u32) {
        {
            let state = self.state.lock();
            if state.current.is_none() || state.request_session_id != session_id {
                debug!(device = short_id(&self.device_id), session_id, "stale send failure ignored");
                return;
            }
        }
        if !self.is_comm_normal() {
            self.comm_err_abort();
            return;
        }
        self.handle_step_error(SyncError::Communication(error));
    }

    fn timeout_callback(&self, generation: u64) {
        enum Next {
            Retry(u32),
            Finalize(OperationStatus),
        }

        let _guard = self.inc_used_count();
        let next = {
            let mut state = self.state.lock();
            if generation != state.timer_generation || state.current.is_none() {
                return;
            }
            state.timer = None;
            if state.retry_status == RetryStatus::NeedRetry
                && state.retry_time < self.deps.config.retry.max_retries
            {
                state.retry_time += 1;
                Next::Retry(state.retry_time)
            } else {
                let status = state
                    .task_error
                    .as_ref()
                    .map(SyncError::to_status)
                    .filter(|s| s.is_transient())
                    .unwrap_or(OperationStatus::Timeout);
                Next::Finalize(status)
            }
        };

        match next {
            Next::Retry(attempt) => {
                info!(device = short_id(&self.device_id), attempt, "step timed out, retrying");
                if let Err(e) = self.deps.state_machine.retry_step(self) {
                    self.handle_step_error(e);
                }
            }
            Next::Finalize(status) => {
                warn!(device = short_id(&self.device_id), ?status, "step timed out");
                self.abort(status);
            }
        }
    }

    fn serve_responses(&self) {
        let _guard = self.inc_used_count();
        loop {
            let target = {
                let mut state = self.state.lock();
                match state.response_targets.pop_front() {
                    Some(target) if !self.is_killed() => target,
                    _ => {
                        state.response_targets.clear();
                        state.serving_responses = false;
                        return;
                    }
                }
            };
            if let Err(e) = self.deps.state_machine.serve_response(self, &target) {
                warn!(device = short_id(&self.device_id), error = %e, "failed to serve response");
            }
        }
    }

    fn move_to_next_target_locked(&self, state: &mut MutexGuard<'_, ContextState>) -> bool {
        let next = loop {
            match state.request_targets.pop_front() {
                Some(target) if target.operation().is_some_and(|op| op.is_finished()) => continue,
                other => break other,
            }
        };
        let Some(next) = next else {
            return false;
        };
        state.current = Some(next);
        state.retry_time = 0;
        state.retry_status = RetryStatus::NoNeedRetry;
        state.task_error = None;
        state.phase = SyncPhase::Idle;
        state.request_session_id = loop {
            let id = rand::random::<u32>();
            if id != 0 {
                break id;
            }
        };
        self.reset_sequence_id();
        true
    }

    fn start_timer_locked(&self, state: &mut MutexGuard<'_, ContextState>) -> SyncResult<()> {
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let weak = self.weak_self.clone();
        let timer = self.deps.scheduler.set_timer(state.timeout, move || {
            if let Some(context) = weak.upgrade() {
                context.timeout_callback(generation);
            }
        })?;
        state.timer = Some(timer);
        Ok(())
    }

    fn stop_timer_locked(state: &mut MutexGuard<'_, ContextState>) {
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.timer_generation += 1;
    }

    fn schedule(&self, task: fn(&SyncTaskContext)) -> SyncResult<()> {
        let weak = self.weak_self.clone();
        self.deps.scheduler.schedule_task(move || {
            if let Some(context) = weak.upgrade() {
                task(&context);
            }
        })
    }

    fn schedule_next(&self) {
        if self.is_killed() {
            return;
        }
        if let Err(e) = self.schedule(SyncTaskContext::exec_sync_task) {
            warn!(device = short_id(&self.device_id), error = %e, "failed to schedule next target");
        }
    }
}
