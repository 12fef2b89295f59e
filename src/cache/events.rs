//! Change notifications.
//!
//! Commit-completion paths publish [`ChangeEvent`]s into an in-memory queue;
//! the refresh engine drains it. Publishing never waits on cache work.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::domain::types::{ChangeKind, NodeId};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_EVENT_QUEUE_LEN: &str = "nucache_event_queue_len";

/// Monotonic epoch for ordering events.
///
/// Events for the same node are applied in epoch order, which is the order
/// they were published.
pub type Epoch = u64;

/// What part of the content tree a notification covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ChangeTarget {
    /// A single node changed.
    Node { node_id: NodeId, change: ChangeKind },
    /// A node and everything below it changed (bulk operations, bin purge).
    Branch { root_id: NodeId, change: ChangeKind },
    /// The whole store changed; only a rebuild can reconcile.
    All,
}

impl ChangeTarget {
    pub fn node(node_id: NodeId, change: ChangeKind) -> Self {
        Self::Node { node_id, change }
    }

    pub fn branch(root_id: NodeId, change: ChangeKind) -> Self {
        Self::Branch { root_id, change }
    }
}

impl fmt::Display for ChangeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeTarget::Node { node_id, change } => write!(f, "node {node_id} {change}"),
            ChangeTarget::Branch { root_id, change } => write!(f, "branch {root_id} {change}"),
            ChangeTarget::All => f.write_str("all"),
        }
    }
}

/// Change event with idempotency and ordering support.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub target: ChangeTarget,
    /// When the originating write committed.
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(target: ChangeTarget, epoch: Epoch, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            target,
            timestamp,
        }
    }
}

/// In-memory FIFO of pending change events.
///
/// A mutex is enough here; publishers hold it only to push.
pub struct EventQueue {
    queue: Mutex<VecDeque<ChangeEvent>>,
    epoch_counter: AtomicU64,
    wake: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a change committed now.
    pub fn publish(&self, target: ChangeTarget) -> Epoch {
        self.publish_at(target, OffsetDateTime::now_utc())
    }

    /// Publish a change that committed at `timestamp`.
    pub fn publish_at(&self, target: ChangeTarget, timestamp: OffsetDateTime) -> Epoch {
        let (epoch, len) = {
            let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
            // Epoch is taken under the lock so queue order and epoch order agree.
            let event = ChangeEvent::new(target, self.next_epoch(), timestamp);
            info!(
                event_id = %event.id,
                event_epoch = event.epoch,
                target = %event.target,
                "Change event enqueued"
            );
            let epoch = event.epoch;
            queue.push_back(event);
            (epoch, queue.len())
        };

        gauge!(METRIC_EVENT_QUEUE_LEN).set(len as f64);
        self.wake.notify_one();
        epoch
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<ChangeEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }

    /// Resolves after the next publish (or immediately if one is already pending a wake-up).
    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn epoch_monotonicity() {
        let queue = EventQueue::new();

        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        let e3 = queue.next_epoch();

        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn publish_and_drain_fifo() {
        let queue = EventQueue::new();

        queue.publish(ChangeTarget::node(1, ChangeKind::Saved));
        queue.publish(ChangeTarget::node(1, ChangeKind::Published));
        queue.publish(ChangeTarget::All);
        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(events[0].target, ChangeTarget::node(1, ChangeKind::Saved));
        assert_eq!(events[1].target, ChangeTarget::node(1, ChangeKind::Published));
        assert!(events[0].epoch < events[1].epoch);
    }

    #[test]
    fn publish_returns_event_epoch() {
        let queue = EventQueue::new();
        let first = queue.publish(ChangeTarget::node(3, ChangeKind::Saved));
        let second = queue.publish(ChangeTarget::node(3, ChangeKind::Saved));

        let events = queue.drain(10);
        assert_eq!(events[0].epoch, first);
        assert_eq!(events[1].epoch, second);
    }

    #[test]
    fn drain_more_than_available() {
        let queue = EventQueue::new();
        queue.publish(ChangeTarget::All);

        let events = queue.drain(100);
        assert_eq!(events.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn target_payload_shape() {
        let target: ChangeTarget =
            serde_json::from_str(r#"{"scope":"branch","root_id":1050,"change":"trashed"}"#)
                .expect("valid payload");
        assert_eq!(target, ChangeTarget::branch(1050, ChangeKind::Trashed));

        let all: ChangeTarget = serde_json::from_str(r#"{"scope":"all"}"#).expect("valid payload");
        assert_eq!(all, ChangeTarget::All);
    }

    #[tokio::test]
    async fn publish_wakes_waiter() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.notified().await })
        };

        queue.publish(ChangeTarget::node(7, ChangeKind::Saved));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woken")
            .expect("waiter task");
    }

    #[test]
    fn event_queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(ChangeTarget::All);
        assert_eq!(queue.len(), 1);
    }
}
