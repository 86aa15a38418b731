//! Bounded FIFO of ingested JSON records.

use super::error::{IngestionError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

struct Inner {
    queue: Mutex<VecDeque<Value>>,
    capacity: usize,
    arrived: Notify,
    stopped: AtomicBool,
}

impl Inner {
    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to use.
    fn queue(&self) -> MutexGuard<'_, VecDeque<Value>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A bounded, thread-safe queue between a record source and a processing unit.
///
/// Producers never block: a full queue rejects the record with
/// [`IngestionError::QueueFull`] instead of dropping it. Clones share the
/// same queue.
///
/// # Example
///
/// ```
/// use sluice::ingestion::IngestionChannel;
/// use serde_json::json;
///
/// let channel = IngestionChannel::new(2);
/// channel.push(json!({"id": 1})).unwrap();
/// channel.push(json!({"id": 2})).unwrap();
/// assert!(channel.push(json!({"id": 3})).is_err());
///
/// assert_eq!(channel.pop_next(), Some(json!({"id": 1})));
/// assert_eq!(channel.len(), 1);
/// ```
#[derive(Clone)]
pub struct IngestionChannel {
    inner: Arc<Inner>,
}

/// Point-in-time view of a channel, suitable for a health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// `ok` while the channel accepts records, `stopped` afterwards.
    pub status: &'static str,
    pub queue_size: usize,
    pub timestamp: DateTime<Utc>,
}

impl IngestionChannel {
    /// A channel holding at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity,
                arrived: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn push(&self, record: Value) -> Result<()> {
        self.ensure_accepting()?;
        {
            let mut queue = self.inner.queue();
            if queue.len() >= self.inner.capacity {
                return Err(IngestionError::QueueFull {
                    capacity: self.inner.capacity,
                });
            }
            queue.push_back(record);
        }
        self.inner.arrived.notify_one();
        Ok(())
    }

    /// Enqueues every record or none of them.
    pub fn push_batch(&self, records: Vec<Value>) -> Result<()> {
        self.ensure_accepting()?;
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len();
        {
            let mut queue = self.inner.queue();
            if queue.len() + count > self.inner.capacity {
                return Err(IngestionError::QueueFull {
                    capacity: self.inner.capacity,
                });
            }
            queue.extend(records);
        }
        for _ in 0..count {
            self.inner.arrived.notify_one();
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.queue().is_empty()
    }

    /// Takes the oldest record without waiting.
    pub fn pop_next(&self) -> Option<Value> {
        self.inner.queue().pop_front()
    }

    /// Takes every queued record, oldest first.
    pub fn drain(&self) -> Vec<Value> {
        self.inner.queue().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next record.
    ///
    /// Returns `None` once the channel is stopped and empty.
    pub async fn recv(&self) -> Option<Value> {
        loop {
            let arrived = self.inner.arrived.notified();
            if let Some(record) = self.pop_next() {
                return Some(record);
            }
            if self.is_stopped() {
                return None;
            }
            arrived.await;
        }
    }

    pub fn health(&self) -> Health {
        Health {
            status: if self.is_stopped() { "stopped" } else { "ok" },
            queue_size: self.len(),
            timestamp: Utc::now(),
        }
    }

    /// Stops accepting records. Queued records stay available to consumers.
    pub fn close(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.arrived.notify_waiters();
    }

    /// Accepts records again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_stopped() {
            Err(IngestionError::Stopped)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for IngestionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionChannel")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_fifo_and_capacity() {
        let channel = IngestionChannel::new(3);
        for i in 0..3 {
            channel.push(json!(i)).unwrap();
        }
        assert!(matches!(
            channel.push(json!(3)),
            Err(IngestionError::QueueFull { capacity: 3 })
        ));
        assert_eq!(channel.len(), 3);

        assert_eq!(channel.pop_next(), Some(json!(0)));
        channel.push(json!(3)).unwrap();
        assert_eq!(channel.drain(), vec![json!(1), json!(2), json!(3)]);
        assert!(!channel.has_pending());
        assert_eq!(channel.pop_next(), None);
    }

    #[test]
    fn test_push_batch_is_all_or_nothing() {
        let channel = IngestionChannel::new(4);
        channel.push(json!("a")).unwrap();

        let err = channel
            .push_batch(vec![json!("b"), json!("c"), json!("d"), json!("e")])
            .unwrap_err();
        assert!(matches!(err, IngestionError::QueueFull { .. }));
        assert_eq!(channel.len(), 1);

        channel
            .push_batch(vec![json!("b"), json!("c"), json!("d")])
            .unwrap();
        assert_eq!(channel.len(), 4);
    }

    #[test]
    fn test_health_and_close() {
        let channel = IngestionChannel::new(8);
        channel.push(json!({"id": 1})).unwrap();

        let health = channel.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.queue_size, 1);

        channel.close();
        assert_eq!(channel.health().status, "stopped");
        assert!(matches!(channel.push(json!(2)), Err(IngestionError::Stopped)));
        // Already queued records remain readable.
        assert_eq!(channel.pop_next(), Some(json!({"id": 1})));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let channel = IngestionChannel::new(0);
        assert_eq!(channel.capacity(), 1);
        channel.push(json!(1)).unwrap();
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let channel = IngestionChannel::new(8);
        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };
        tokio::task::yield_now().await;
        assert!(!consumer.is_finished());

        channel.push(json!({"id": 7})).unwrap();
        let record = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record, Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn test_recv_ends_after_close() {
        let channel = IngestionChannel::new(8);
        channel.push(json!(1)).unwrap();
        channel.close();
        assert_eq!(channel.recv().await, Some(json!(1)));
        assert_eq!(channel.recv().await, None);
    }

    #[test]
    fn test_reopen_accepts_again() {
        let channel = IngestionChannel::new(4);
        channel.close();
        assert!(matches!(channel.push(json!(1)), Err(IngestionError::Stopped)));

        channel.reopen();
        channel.push(json!(2)).unwrap();
        assert_eq!(channel.health().status, "ok");
        assert_eq!(channel.drain(), vec![json!(2)]);
    }
}
