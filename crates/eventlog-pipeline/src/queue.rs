// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO between the event source and the exporter.
//!
//! The queue is the only state shared by the producer (the subscription's
//! callback thread) and the consumer (the exporter's drain loop):
//!
//! ```text
//! OS callback thread        BoundedQueue              drain loop (tokio)
//!     │                          │                          │
//!     ├─ push (sync) ──────────> │ VecDeque<EventRecord>    │
//!     │   blocks only under      │ ──────── pop_wait ─────> │
//!     │   BlockProducer          │   Notify wakes consumer  │
//! ```
//!
//! When the queue is full the configured [`OverflowPolicy`] decides what
//! gives. Every record that does not make it to the consumer increments the
//! drop counter.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::errors::QueueOverflowError;
use crate::event::EventRecord;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What to do with a push when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued record to make room. Never blocks the producer.
    #[default]
    DropOldest,
    /// Reject the incoming record. Never blocks the producer.
    DropNewest,
    /// Park the producer until the consumer frees a slot or the queue closes.
    BlockProducer,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "dropoldest" => Ok(Self::DropOldest),
            "dropnewest" => Ok(Self::DropNewest),
            "blockproducer" | "block" => Ok(Self::BlockProducer),
            _ => Err(format!(
                "unknown overflow policy '{s}', expected one of: drop_oldest, drop_newest, block_producer"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for OverflowPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        OverflowPolicy::from_str(&value).map_err(serde::de::Error::custom)
    }
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The record is queued. If an older record was evicted to make room,
    /// the eviction is carried along.
    Accepted(Option<QueueOverflowError>),
    /// The record itself was dropped.
    Dropped(QueueOverflowError),
}

impl PushOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted(_))
    }
}

struct State {
    slots: VecDeque<EventRecord>,
    closed: bool,
}

pub struct BoundedQueue {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Notify,
    dropped: AtomicU64,
}

impl BoundedQueue {
    /// Creates a queue holding at most `capacity` records. A capacity of zero
    /// is raised to one; configuration validation rejects it earlier.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            policy,
            state: Mutex::new(State {
                slots: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the deque half-updated,
        // so a poisoned lock is still safe to use.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Total records dropped since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, reason: &QueueOverflowError) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("{reason}");
    }

    /// Pushes a record according to the overflow policy.
    ///
    /// Only [`OverflowPolicy::BlockProducer`] may block, and only until the
    /// consumer pops or the queue is closed.
    pub fn push(&self, record: EventRecord) -> PushOutcome {
        let mut state = self.lock();

        if state.closed {
            drop(state);
            let reason = QueueOverflowError::Closed;
            self.record_drop(&reason);
            return PushOutcome::Dropped(reason);
        }

        let mut evicted = None;
        if state.slots.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.slots.pop_front();
                    evicted = Some(QueueOverflowError::DroppedOldest {
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::DropNewest => {
                    drop(state);
                    let reason = QueueOverflowError::DroppedNewest {
                        capacity: self.capacity,
                    };
                    self.record_drop(&reason);
                    return PushOutcome::Dropped(reason);
                }
                OverflowPolicy::BlockProducer => {
                    debug!("Queue full ({} items), blocking producer", self.capacity);
                    while state.slots.len() >= self.capacity && !state.closed {
                        state = self
                            .not_full
                            .wait(state)
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                    }
                    if state.closed {
                        drop(state);
                        let reason = QueueOverflowError::Closed;
                        self.record_drop(&reason);
                        return PushOutcome::Dropped(reason);
                    }
                }
            }
        }

        state.slots.push_back(record);
        drop(state);

        if let Some(reason) = &evicted {
            self.record_drop(reason);
        }
        self.not_empty.notify_one();
        PushOutcome::Accepted(evicted)
    }

    /// Removes the oldest record without waiting.
    pub fn pop(&self) -> Option<EventRecord> {
        let record = self.lock().slots.pop_front();
        if record.is_some() {
            self.not_full.notify_one();
        }
        record
    }

    /// Removes the oldest record, waiting at most `max_wait` for one to
    /// arrive. Returns `None` on timeout so the caller can check for shutdown.
    pub async fn pop_wait(&self, max_wait: Duration) -> Option<EventRecord> {
        if let Some(record) = self.pop() {
            return Some(record);
        }
        // notify_one stores a permit when nobody is waiting, so a push landing
        // between the pop above and this wait still wakes us.
        let _ = tokio::time::timeout(max_wait, self.not_empty.notified()).await;
        self.pop()
    }

    /// Stops accepting records. Blocked producers are released and their
    /// records counted as dropped. Queued records stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_all();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Discards every queued record, counting each one as dropped. Returns how
    /// many were discarded.
    pub fn discard_remaining(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            let n = state.slots.len();
            state.slots.clear();
            n
        };
        if discarded > 0 {
            self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
            warn!("Discarded {discarded} queued records that were never exported");
            self.not_full.notify_all();
        }
        discarded
    }
}

impl std::fmt::Debug for BoundedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tracing_test::traced_test;

    fn record(id: u32) -> EventRecord {
        EventRecord::new(id, "provider", "Security", "HOST01", None, UNIX_EPOCH)
    }

    fn drain_ids(queue: &BoundedQueue) -> Vec<u32> {
        std::iter::from_fn(|| queue.pop())
            .map(|r| r.source_id())
            .collect()
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(record(1)), PushOutcome::Accepted(None));
        assert_eq!(queue.push(record(2)), PushOutcome::Accepted(None));
        assert_eq!(
            queue.push(record(3)),
            PushOutcome::Accepted(Some(QueueOverflowError::DroppedOldest { capacity: 2 }))
        );

        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain_ids(&queue), vec![2, 3]);
    }

    #[test]
    #[traced_test]
    fn test_drops_are_logged() {
        let queue = BoundedQueue::new(1, OverflowPolicy::DropNewest);
        queue.push(record(1));
        queue.push(record(2));

        assert!(logs_contain(
            "queue full (1 items), dropped incoming record"
        ));
    }

    #[test]
    fn test_drop_newest_keeps_earliest() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(record(1));
        queue.push(record(2));
        assert_eq!(
            queue.push(record(3)),
            PushOutcome::Dropped(QueueOverflowError::DroppedNewest { capacity: 2 })
        );

        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain_ids(&queue), vec![1, 2]);
    }

    #[test]
    fn test_push_on_closed_queue_is_counted() {
        let queue = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        queue.push(record(1));
        queue.close();

        assert_eq!(
            queue.push(record(2)),
            PushOutcome::Dropped(QueueOverflowError::Closed)
        );
        assert_eq!(queue.dropped(), 1);
        // records queued before close are still delivered
        assert_eq!(drain_ids(&queue), vec![1]);

        queue.reopen();
        assert!(queue.push(record(3)).is_accepted());
        assert_eq!(drain_ids(&queue), vec![3]);
    }

    #[test]
    fn test_block_producer_waits_for_pop() {
        let queue = Arc::new(BoundedQueue::new(1, OverflowPolicy::BlockProducer));
        queue.push(record(1));

        let producer_queue = Arc::clone(&queue);
        let producer = std::thread::spawn(move || producer_queue.push(record(2)));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop().unwrap().source_id(), 1);
        assert_eq!(producer.join().unwrap(), PushOutcome::Accepted(None));
        assert_eq!(queue.pop().unwrap().source_id(), 2);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1, OverflowPolicy::BlockProducer));
        queue.push(record(1));

        let producer_queue = Arc::clone(&queue);
        let producer = std::thread::spawn(move || producer_queue.push(record(2)));

        std::thread::sleep(Duration::from_millis(50));
        queue.close();

        assert_eq!(
            producer.join().unwrap(),
            PushOutcome::Dropped(QueueOverflowError::Closed)
        );
        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain_ids(&queue), vec![1]);
    }

    #[test]
    fn test_discard_remaining_counts_drops() {
        let queue = BoundedQueue::new(8, OverflowPolicy::DropOldest);
        for id in 0..5 {
            queue.push(record(id));
        }
        assert_eq!(queue.discard_remaining(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 5);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let queue = BoundedQueue::new(0, OverflowPolicy::DropOldest);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_overflow_policy_from_str() {
        assert_eq!(
            OverflowPolicy::from_str("drop_oldest"),
            Ok(OverflowPolicy::DropOldest)
        );
        assert_eq!(
            OverflowPolicy::from_str("DropNewest"),
            Ok(OverflowPolicy::DropNewest)
        );
        assert_eq!(
            OverflowPolicy::from_str(" block-producer "),
            Ok(OverflowPolicy::BlockProducer)
        );
        assert!(OverflowPolicy::from_str("drop_everything").is_err());
    }

    #[tokio::test]
    async fn test_pop_wait_times_out_when_empty() {
        let queue = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        let started = std::time::Instant::now();
        assert!(queue.pop_wait(Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(4, OverflowPolicy::DropOldest));

        let producer_queue = Arc::clone(&queue);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer_queue.push(EventRecord::new(
                7,
                "provider",
                "Security",
                "HOST01",
                Some(1),
                SystemTime::now(),
            ))
        });

        let popped = queue.pop_wait(Duration::from_secs(5)).await;
        assert_eq!(popped.map(|r| r.source_id()), Some(7));
        assert!(producer.join().unwrap().is_accepted());
    }

    mod property {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn drop_oldest_retains_last_capacity_records(
                capacity in 1usize..32,
                extra in 1usize..64,
            ) {
                let total = capacity + extra;
                let queue = BoundedQueue::new(capacity, OverflowPolicy::DropOldest);
                for id in 0..total {
                    queue.push(record(id as u32));
                }

                let expected: Vec<u32> = (extra..total).map(|id| id as u32).collect();
                prop_assert_eq!(drain_ids(&queue), expected);
                prop_assert_eq!(queue.dropped(), extra as u64);
            }
        }
    }
}
