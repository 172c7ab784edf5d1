//! Pending-write queue.
//!
//! A bounded FIFO of slot indices between the capture side and the disk
//! writer. Pushing never blocks (the capture trigger runs at frame cadence
//! and must not wait); the writer peeks at the head, coalesces as many
//! entries as it can write in one burst and consumes them only after the
//! write finished, so [`len`](PendingWriteQueue::len) always counts every
//! frame not yet on storage.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Queue of slot indices waiting to be written.
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct PendingWriteQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

#[derive(Debug)]
struct QueueState {
    slots: VecDeque<usize>,
    capacity: usize,
    total_pushed: u64,
    total_consumed: u64,
    total_rejected: u64,
    total_cleared: u64,
    flushing: bool,
}

impl PendingWriteQueue {
    /// Create a queue holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    slots: VecDeque::with_capacity(capacity),
                    capacity,
                    total_pushed: 0,
                    total_consumed: 0,
                    total_rejected: 0,
                    total_cleared: 0,
                    flushing: false,
                }),
                not_empty: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current number of queued slots.
    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    /// Get statistics about the queue.
    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            current: state.slots.len(),
            total_pushed: state.total_pushed,
            total_consumed: state.total_consumed,
            total_rejected: state.total_rejected,
            total_cleared: state.total_cleared,
        }
    }

    /// Append a slot without blocking.
    pub fn push(&self, slot: usize) -> Result<()> {
        let mut state = self.state();
        if state.slots.len() >= state.capacity {
            state.total_rejected += 1;
            return Err(Error::InvalidState(format!(
                "pending-write queue full ({} entries)",
                state.capacity
            )));
        }
        state.slots.push_back(slot);
        state.total_pushed += 1;
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Append several slots in order, all or nothing.
    pub fn push_all(&self, slots: &[usize]) -> Result<()> {
        let mut state = self.state();
        if state.slots.len() + slots.len() > state.capacity {
            state.total_rejected += slots.len() as u64;
            return Err(Error::InvalidState(format!(
                "pending-write queue cannot take {} more entries",
                slots.len()
            )));
        }
        state.slots.extend(slots.iter().copied());
        state.total_pushed += slots.len() as u64;
        self.inner.not_empty.notify_all();
        Ok(())
    }

    /// The head entry, if any.
    pub fn peek(&self) -> Option<usize> {
        self.state().slots.front().copied()
    }

    /// Wait up to `timeout` for an entry; returns the head.
    ///
    /// Returns `None` on timeout or while flushing.
    pub fn peek_timeout(&self, timeout: Duration) -> Option<usize> {
        let mut state = self.state();
        if state.slots.is_empty() && !state.flushing {
            state = self
                .inner
                .not_empty
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.slots.front().copied()
    }

    /// Copy of the first `max` entries, head first.
    pub fn snapshot(&self, max: usize) -> Vec<usize> {
        self.state().slots.iter().take(max).copied().collect()
    }

    /// Remove `count` entries from the head once they are written.
    pub fn consume(&self, count: usize) {
        let mut state = self.state();
        let count = count.min(state.slots.len());
        state.slots.drain(..count);
        state.total_consumed += count as u64;
    }

    /// Drop every entry; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let dropped = state.slots.len();
        state.slots.clear();
        state.total_cleared += dropped as u64;
        dropped
    }

    /// Set flushing mode (wakes up a waiting writer).
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.state();
        state.flushing = flushing;
        if flushing {
            self.inner.not_empty.notify_all();
        }
    }
}

/// Statistics about queue operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries currently queued.
    pub current: usize,
    /// Entries ever pushed.
    pub total_pushed: u64,
    /// Entries removed after being written.
    pub total_consumed: u64,
    /// Pushes refused because the queue was full.
    pub total_rejected: u64,
    /// Entries dropped by [`PendingWriteQueue::clear`].
    pub total_cleared: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_queue_fifo() {
        let queue = PendingWriteQueue::new(4);
        queue.push(3).unwrap();
        queue.push(4).unwrap();
        queue.push(0).unwrap();

        assert_eq!(queue.peek(), Some(3));
        assert_eq!(queue.snapshot(2), vec![3, 4]);
        queue.consume(2);
        assert_eq!(queue.peek(), Some(0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_rejects_when_full() {
        let queue = PendingWriteQueue::new(2);
        queue.push(0).unwrap();
        queue.push(1).unwrap();
        assert!(queue.push(2).is_err());
        assert!(queue.push_all(&[5]).is_err());
        assert_eq!(queue.stats().total_rejected, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_queue_clear() {
        let queue = PendingWriteQueue::new(8);
        queue.push_all(&[1, 2, 3]).unwrap();
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().total_cleared, 3);
    }

    #[test]
    fn test_peek_timeout_wakes_on_push() {
        let queue = PendingWriteQueue::new(8);
        let producer = queue.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(7).unwrap();
        });

        let start = Instant::now();
        let mut head = None;
        while head.is_none() && start.elapsed() < Duration::from_secs(2) {
            head = queue.peek_timeout(Duration::from_millis(100));
        }
        assert_eq!(head, Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn test_peek_timeout_expires() {
        let queue = PendingWriteQueue::new(8);
        assert_eq!(queue.peek_timeout(Duration::from_millis(5)), None);
        queue.set_flushing(true);
        assert_eq!(queue.peek_timeout(Duration::from_secs(10)), None);
    }
}
