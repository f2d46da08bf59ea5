//! Configuration for the sync engine.

use std::time::Duration;

/// Default per-step timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Retries of one step before the device is finalized.
pub const RETRY_TIME: u32 = 3;

/// Bounded wait for in-flight users when a context is torn down.
pub const KILL_WAIT_SECONDS: u64 = 20;

/// Default limit of queued non-blocking manual syncs.
pub const QUEUED_SYNC_LIMIT_DEFAULT: usize = 32;

/// Inbound messages handled concurrently before backlogging.
pub const MAX_EXEC_NUM: usize = 7;

/// Default byte budget for backlogged inbound messages.
pub const DEFAULT_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for syncers and their engines.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time to wait for each protocol step.
    pub timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Initial limit of queued manual syncs.
    pub queued_sync_limit: usize,
    /// Bounded wait used by `safe_exit`.
    pub kill_wait: Duration,
    /// Concurrently handled inbound messages.
    pub max_exec_tasks: usize,
    /// Byte budget of the inbound backlog.
    pub max_queue_cache_size: usize,
    /// Worker threads of the task scheduler.
    pub worker_threads: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            queued_sync_limit: QUEUED_SYNC_LIMIT_DEFAULT,
            kill_wait: Duration::from_secs(KILL_WAIT_SECONDS),
            max_exec_tasks: MAX_EXEC_NUM,
            max_queue_cache_size: DEFAULT_CACHE_SIZE,
            worker_threads: 2,
        }
    }

    /// Sets the step timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the initial manual queue limit.
    pub fn with_queued_sync_limit(mut self, limit: usize) -> Self {
        self.queued_sync_limit = limit;
        self
    }

    /// Sets the teardown wait.
    pub fn with_kill_wait(mut self, wait: Duration) -> Self {
        self.kill_wait = wait;
        self
    }

    /// Sets the inbound concurrency and backlog budget.
    pub fn with_message_limits(mut self, max_exec_tasks: usize, max_queue_cache_size: usize) -> Self {
        self.max_exec_tasks = max_exec_tasks.max(1);
        self.max_queue_cache_size = max_queue_cache_size;
        self
    }

    /// Sets the scheduler worker count.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
///
/// Retries are fixed-interval: each attempt waits one full step timeout.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Re-issues of a step before giving up.
    pub max_retries: u32,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self { max_retries: 0 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(RETRY_TIME)
    }
}
