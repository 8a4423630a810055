//! A generic, thread-safe FIFO with blocking dequeue, wake-up, and byte-count
//! accounting, grounded on `VMessageQueue`: a bounded-wait semaphore dequeue
//! (5 second poll interval in the original) rather than an unbounded wait,
//! and lock-free diagnostic reads of size/byte-size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// The bounded poll interval `blocking_next` falls back to when no one
/// signals it. Matches `VMessageQueue::blockUntilNextMessage`'s 5 second
/// semaphore wait.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Anything a [`MessageQueue`] can account bytes for.
pub trait QueuedBytes {
    fn byte_len(&self) -> u64;
}

impl QueuedBytes for wire::Message {
    fn byte_len(&self) -> u64 {
        self.payload().len() as u64
    }
}

impl QueuedBytes for wire::BroadcastMessage {
    fn byte_len(&self) -> u64 {
        self.payload().len() as u64
    }
}

struct Entry<T> {
    item: T,
    posted_at: Instant,
}

struct Inner<T> {
    items: VecDeque<Entry<T>>,
}

/// A thread-safe FIFO queue. Ordering is with respect to the single
/// enqueueing mutex: concurrent posters see atomic-per-post ordering, but
/// there is no global order across distinct queues.
pub struct MessageQueue<T: QueuedBytes> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    size: AtomicUsize,
    byte_size: AtomicU64,
    /// Optional diagnostic: if a dequeue observes a message that sat longer
    /// than this, emit a debug log. Advisory only (spec.md §4.4).
    lag_threshold: Option<Duration>,
}

impl<T: QueuedBytes> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueuedBytes> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            size: AtomicUsize::new(0),
            byte_size: AtomicU64::new(0),
            lag_threshold: None,
        }
    }

    pub fn with_lag_threshold(threshold: Duration) -> Self {
        Self {
            lag_threshold: Some(threshold),
            ..Self::new()
        }
    }

    /// Appends `item`, updates the byte count, and wakes one waiter.
    pub fn post(&self, item: T) {
        let bytes = item.byte_len();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.items.push_back(Entry {
                item,
                posted_at: Instant::now(),
            });
        }
        self.size.fetch_add(1, Ordering::SeqCst);
        self.byte_size.fetch_add(bytes, Ordering::SeqCst);
        self.not_empty.notify_one();
    }

    /// Returns the front item if one is available, without blocking.
    pub fn next_nonblocking(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.items.pop_front()?;
        drop(inner);
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.byte_size.fetch_sub(entry.item.byte_len(), Ordering::SeqCst);

        if let Some(threshold) = self.lag_threshold {
            let lag = entry.posted_at.elapsed();
            if lag >= threshold {
                tracing::debug!(lag_ms = lag.as_millis() as u64, "message queue saw a delay before dequeue");
            }
        }

        Some(entry.item)
    }

    /// Blocks until an entry is available, a waiter is woken by [`Self::wake`]
    /// or [`Self::post`], or the bounded poll interval elapses. Returns
    /// `None` on a spurious wake or elapsed poll with nothing queued; the
    /// caller is expected to re-loop and check its own running flag.
    pub fn blocking_next(&self) -> Option<T> {
        if let Some(item) = self.next_nonblocking() {
            return Some(item);
        }
        let guard = self.inner.lock().unwrap();
        if !guard.items.is_empty() {
            drop(guard);
            return self.next_nonblocking();
        }
        let _ = self.not_empty.wait_timeout(guard, POLL_INTERVAL).unwrap();
        self.next_nonblocking()
    }

    /// Signals one waiter so a blocked dequeue returns and can observe a
    /// changed `running` flag.
    pub fn wake(&self) {
        self.not_empty.notify_one();
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size.load(Ordering::SeqCst)
    }

    /// Removes and returns every queued item, in FIFO order.
    pub fn drain_all(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<T> = inner.items.drain(..).map(|e| e.item).collect();
        drop(inner);
        self.size.store(0, Ordering::SeqCst);
        self.byte_size.store(0, Ordering::SeqCst);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    impl QueuedBytes for i32 {
        fn byte_len(&self) -> u64 {
            4
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let q: MessageQueue<i32> = MessageQueue::new();
        q.post(1);
        q.post(2);
        q.post(3);
        assert_eq!(q.next_nonblocking(), Some(1));
        assert_eq!(q.next_nonblocking(), Some(2));
        assert_eq!(q.next_nonblocking(), Some(3));
        assert_eq!(q.next_nonblocking(), None);
    }

    #[test]
    fn byte_size_tracks_posts_and_dequeues() {
        let q: MessageQueue<i32> = MessageQueue::new();
        q.post(1);
        q.post(2);
        assert_eq!(q.size(), 2);
        assert_eq!(q.byte_size(), 8);
        q.next_nonblocking();
        assert_eq!(q.size(), 1);
        assert_eq!(q.byte_size(), 4);
    }

    #[test]
    fn blocking_next_returns_promptly_after_wake() {
        let q: Arc<MessageQueue<i32>> = Arc::new(MessageQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.blocking_next());
        thread::sleep(Duration::from_millis(50));
        q.post(42);
        let result = handle.join().unwrap();
        assert_eq!(result, Some(42));
    }

    #[test]
    fn drain_all_empties_queue_and_resets_counters() {
        let q: MessageQueue<i32> = MessageQueue::new();
        q.post(1);
        q.post(2);
        let drained = q.drain_all();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(q.size(), 0);
        assert_eq!(q.byte_size(), 0);
    }
}
