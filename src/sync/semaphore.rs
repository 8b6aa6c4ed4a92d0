//! A counting semaphore used for `tx_wait`: blocks a sender while a
//! connection's retransmit window is full, and wakes it as acknowledgments
//! free up slots.
//!
//! Modeled on the wait/signal/try_wait naming of a small kernel's
//! `sync::Semaphore`, but backed by `parking_lot::{Mutex, Condvar}` instead
//! of a spin loop, since this crate blocks real OS threads rather than
//! running under a cooperative scheduler.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub struct CountingSemaphore {
    count: Mutex<i64>,
    cv: Condvar,
}

impl CountingSemaphore {
    pub fn new(initial: i64) -> Self {
        CountingSemaphore {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Increments the count and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    /// Decrements the count if positive without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Blocks until the count is positive (consuming one unit) or `timeout`
    /// elapses. Returns `true` if a unit was acquired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            let result = self.cv.wait_for(&mut count, remaining);
            if result.timed_out() && *count <= 0 {
                return false;
            }
        }
    }

    pub fn current(&self) -> i64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_wait_respects_count() {
        let sem = CountingSemaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.signal();
        assert!(sem.try_wait());
    }

    #[test]
    fn wait_timeout_returns_false_when_starved() {
        let sem = CountingSemaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn signal_wakes_a_blocked_waiter() {
        let sem = Arc::new(CountingSemaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        sem.signal();
        assert!(waiter.join().unwrap());
    }
}
