//! Counting semaphore used to park blocking sync callers.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore.
///
/// `wait` consumes one permit, blocking until one is available; `send`
/// adds one permit and wakes a single waiter.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` permits.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`Semaphore::wait`] but gives up after `timeout`.
    ///
    /// Returns false if no permit became available in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Releases one permit.
    pub fn send(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn send_then_wait_does_not_block() {
        let sem = Semaphore::new(0);
        sem.send();
        sem.wait();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn wait_timeout_expires() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn waiter_is_woken_from_other_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        sem.send();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn permits_accumulate() {
        let sem = Semaphore::new(1);
        sem.send();
        assert_eq!(sem.available(), 2);
        assert!(sem.wait_timeout(Duration::ZERO));
        assert!(sem.wait_timeout(Duration::ZERO));
        assert!(!sem.wait_timeout(Duration::ZERO));
    }
}
