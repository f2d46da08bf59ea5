//! Task scheduler shared by syncers.
//!
//! Wraps a multi-threaded tokio runtime. Protocol work is synchronous, so
//! scheduled tasks and timer actions run on the blocking pool; the async
//! side only drives timers and the completion loops.

use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// Handle of a pending timer.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancels the timer. An action that already started keeps running.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Runs tasks and timers for sync contexts.
pub struct TaskScheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    closed: AtomicBool,
}

impl TaskScheduler {
    /// Starts a scheduler with `worker_threads` async workers.
    pub fn new(worker_threads: usize) -> SyncResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("kvsync-worker")
            .enable_time()
            .build()
            .map_err(|e| SyncError::OutOfMemory(format!("task scheduler: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            closed: AtomicBool::new(false),
        })
    }

    /// Runs `task` on the blocking pool.
    pub fn schedule_task<F>(&self, task: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Killed);
        }
        self.handle.spawn_blocking(task);
        Ok(())
    }

    /// Runs `action` on the blocking pool once `delay` has elapsed.
    pub fn set_timer<F>(&self, delay: Duration, action: F) -> SyncResult<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Killed);
        }
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(action).await {
                debug!(error = %e, "timer action did not complete");
            }
        });
        Ok(TimerHandle {
            abort: task.abort_handle(),
        })
    }

    /// Spawns an async task, e.g. a completion loop.
    pub fn spawn<Fut>(&self, future: Fut) -> JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Refuses new tasks and timers.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true once `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
