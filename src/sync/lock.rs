//! A mutex with a bounded `acquire` call, used for `rdp_lock`: holding this
//! lock serializes a connection's entire RDP input-handling and send path,
//! and failing to acquire it within the timeout is treated as a detected
//! deadlock rather than blocked forever.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::CspError;

pub struct TimedLock<T> {
    inner: Mutex<T>,
}

impl<T> TimedLock<T> {
    pub fn new(value: T) -> Self {
        TimedLock {
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock within `timeout`, or returns `CspError::Deadlock`.
    pub fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<parking_lot::MutexGuard<'_, T>, CspError> {
        self.inner.try_lock_for(timeout).ok_or(CspError::Deadlock)
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, T> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_times_out_when_already_held() {
        let lock = Arc::new(TimedLock::new(0u32));
        let guard = lock.lock();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || lock2.acquire(Duration::from_millis(30)).is_err());
        assert!(handle.join().unwrap());
        drop(guard);
    }

    #[test]
    fn acquire_succeeds_once_free() {
        let lock = TimedLock::new(5u32);
        {
            let guard = lock.acquire(Duration::from_millis(100)).unwrap();
            assert_eq!(*guard, 5);
        }
        assert!(lock.acquire(Duration::from_millis(100)).is_ok());
    }
}
