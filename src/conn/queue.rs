//! A small bounded FIFO, used both as a connection's receive queue and as a
//! listener's accept queue. Full pushes fail rather than block, matching
//! the "socket-queue-full is a hard error, packet dropped" rule.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity,
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Attempts to enqueue `item`. Returns it back to the caller if the
    /// queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if let Some(item) = items.pop_front() {
            return Some(item);
        }
        let result = self.not_empty.wait_for(&mut items, timeout);
        if result.timed_out() {
            return None;
        }
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_fails_once_full() {
        let q = BoundedQueue::new(1);
        assert!(q.try_push(1).is_ok());
        assert_eq!(q.try_push(2), Err(2));
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        assert!(q.pop_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn fifo_order_preserved() {
        let q = BoundedQueue::new(3);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }
}
