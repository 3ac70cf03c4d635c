//! Bounded multi-priority FIFO with dedup and an overflow policy.
//!
//! Three lanes (high, normal, low) behind one mutex. The fingerprint index
//! shares that lock, so dedup is decided in the same critical section as
//! admission and also covers items a worker currently holds in flight.

use crate::clock::Clock;
use crate::config::OverflowPolicy;
use crate::item::{Item, Priority, RejectReason};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const LANES: usize = 3;

/// Where a fingerprint currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    InFlight,
}

#[derive(Debug)]
struct QueuedItem {
    item: Item,
    /// When the item entered its current lane; drives optional aging.
    entered_lane_at: u64,
}

#[derive(Debug)]
struct QueueState {
    lanes: [VecDeque<QueuedItem>; LANES],
    index: HashMap<String, Slot>,
    closed: bool,
}

impl QueueState {
    fn queued_len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Result of queue admission. Displacement hands the victim back so the
/// caller can surface its `Dropped` outcome.
#[derive(Debug)]
pub enum Enqueued {
    Admitted { displaced: Option<Item> },
    Rejected(RejectReason),
}

impl Enqueued {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Bounded, deduplicating, three-lane FIFO.
#[derive(Debug)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    not_empty: Notify,
    max_size: usize,
    policy: OverflowPolicy,
    age_boost: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl PriorityQueue {
    pub fn new(
        max_size: usize,
        policy: OverflowPolicy,
        age_boost: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                lanes: Default::default(),
                index: HashMap::new(),
                closed: false,
            }),
            not_empty: Notify::new(),
            max_size,
            policy,
            age_boost,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit an item, synchronously.
    pub fn enqueue(&self, mut item: Item) -> Enqueued {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        if state.closed {
            return Enqueued::Rejected(RejectReason::ShuttingDown);
        }
        if state.index.contains_key(&item.fingerprint) {
            return Enqueued::Rejected(RejectReason::Duplicate);
        }
        let mut displaced = None;
        if state.queued_len() >= self.max_size {
            match self.policy {
                OverflowPolicy::Reject => return Enqueued::Rejected(RejectReason::QueueFull),
                OverflowPolicy::Displace => match displace_below(&mut state, item.priority) {
                    Some(victim) => displaced = Some(victim),
                    None => return Enqueued::Rejected(RejectReason::QueueFull),
                },
            }
        }
        item.enqueued_at = Some(now);
        let lane = item.priority.lane();
        state.index.insert(item.fingerprint.clone(), Slot::Queued);
        state.lanes[lane].push_back(QueuedItem { item, entered_lane_at: now });
        drop(state);
        self.not_empty.notify_one();
        Enqueued::Admitted { displaced }
    }

    /// Take up to `max_n` items in strict priority order, FIFO within a lane.
    ///
    /// Blocks until at least one item is available. Returns `None` once the
    /// queue is closed and drained, or when `cancel` fires. Dequeued items
    /// stay in the dedup index as in-flight until [`Self::complete`].
    pub async fn dequeue_batch(
        &self,
        max_n: usize,
        cancel: &CancellationToken,
    ) -> Option<Vec<Item>> {
        let limit = max_n.max(1);
        loop {
            {
                let mut state = self.lock();
                if let Some(interval) = self.age_boost {
                    promote_aged(&mut state, self.clock.now_millis(), interval);
                }
                if state.queued_len() > 0 {
                    let mut batch = Vec::with_capacity(limit.min(state.queued_len()));
                    for lane in 0..LANES {
                        while batch.len() < limit {
                            let Some(entry) = state.lanes[lane].pop_front() else { break };
                            state.index.insert(entry.item.fingerprint.clone(), Slot::InFlight);
                            batch.push(entry.item);
                        }
                        if batch.len() >= limit {
                            break;
                        }
                    }
                    return Some(batch);
                }
                if state.closed {
                    drop(state);
                    // Cascade so peers blocked on the same wait observe the
                    // close as well.
                    self.not_empty.notify_one();
                    return None;
                }
            }
            // notify_one stores a permit when nobody waits yet, so an
            // enqueue racing this gap is not lost.
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.not_empty.notified() => {}
            }
        }
    }

    /// Release a fingerprint after its delivery reached a terminal outcome.
    /// The same content becomes admissible again.
    pub fn complete(&self, fingerprint: &str) {
        let mut state = self.lock();
        if state.index.get(fingerprint) == Some(&Slot::InFlight) {
            state.index.remove(fingerprint);
        }
    }

    /// Queued items across all lanes (in-flight items excluded).
    pub fn len(&self) -> usize {
        self.lock().queued_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_by_lane(&self) -> [usize; LANES] {
        let state = self.lock();
        [state.lanes[0].len(), state.lanes[1].len(), state.lanes[2].len()]
    }

    /// Items dequeued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.lock().index.values().filter(|s| **s == Slot::InFlight).count()
    }

    /// Stop admissions and wake all waiters; dequeues drain what remains.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_empty.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Pick the oldest item from the lowest non-empty lane strictly below the
/// incoming priority.
fn displace_below(state: &mut QueueState, incoming: Priority) -> Option<Item> {
    for lane in (incoming.lane() + 1..LANES).rev() {
        if let Some(victim) = state.lanes[lane].pop_front() {
            state.index.remove(&victim.item.fingerprint);
            return Some(victim.item);
        }
    }
    None
}

/// Promote items that sat in their lane longer than `interval` one lane up.
/// `entered_lane_at` is non-decreasing along each deque, so only fronts need
/// checking.
fn promote_aged(state: &mut QueueState, now: u64, interval: Duration) {
    let interval = interval.as_millis() as u64;
    for lane in (1..LANES).rev() {
        while let Some(front) = state.lanes[lane].front() {
            if now.saturating_sub(front.entered_lane_at) < interval {
                break;
            }
            let mut entry = state.lanes[lane].pop_front().expect("front just observed");
            entry.item.priority = entry.item.priority.promoted();
            entry.entered_lane_at = now;
            state.lanes[lane - 1].push_back(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::item::ContentKind;
    use serde_json::json;

    fn queue(max: usize, policy: OverflowPolicy) -> (PriorityQueue, ManualClock) {
        let clock = ManualClock::new();
        (PriorityQueue::new(max, policy, None, Arc::new(clock.clone())), clock)
    }

    fn item(id: &str, priority: Priority) -> Item {
        Item::new(
            id,
            "https://hooks.example.com/a",
            ContentKind::Article,
            priority,
            json!({ "id": id }),
        )
    }

    #[tokio::test]
    async fn drains_in_strict_priority_then_fifo_order() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        assert!(queue.enqueue(item("low-1", Priority::Low)).is_admitted());
        assert!(queue.enqueue(item("normal-1", Priority::Normal)).is_admitted());
        assert!(queue.enqueue(item("high-1", Priority::High)).is_admitted());
        assert!(queue.enqueue(item("normal-2", Priority::Normal)).is_admitted());

        let cancel = CancellationToken::new();
        let batch = queue.dequeue_batch(10, &cancel).await.expect("items available");
        let ids: Vec<&str> = batch.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["high-1", "normal-1", "normal-2", "low-1"]);
    }

    #[tokio::test]
    async fn batch_size_is_honored() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        for i in 0..5 {
            assert!(queue.enqueue(item(&format!("n-{i}"), Priority::Normal)).is_admitted());
        }
        let cancel = CancellationToken::new();
        let batch = queue.dequeue_batch(2, &cancel).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn size_never_exceeds_the_bound() {
        let (queue, _clock) = queue(3, OverflowPolicy::Displace);
        for i in 0..20 {
            let _ = queue.enqueue(item(&format!("i-{i}"), Priority::Normal));
            assert!(queue.len() <= 3);
        }
    }

    #[test]
    fn duplicate_fingerprint_is_rejected_while_queued() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        assert!(queue.enqueue(item("a", Priority::Normal)).is_admitted());
        match queue.enqueue(item("a", Priority::Normal)) {
            Enqueued::Rejected(RejectReason::Duplicate) => {}
            other => panic!("expected duplicate rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dedup_covers_in_flight_until_complete() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        let first = item("a", Priority::Normal);
        let fingerprint = first.fingerprint.clone();
        assert!(queue.enqueue(first).is_admitted());

        let cancel = CancellationToken::new();
        let batch = queue.dequeue_batch(1, &cancel).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.in_flight(), 1);

        // Still in flight: same content is a duplicate.
        match queue.enqueue(item("a", Priority::Normal)) {
            Enqueued::Rejected(RejectReason::Duplicate) => {}
            other => panic!("expected duplicate rejection, got {other:?}"),
        }

        queue.complete(&fingerprint);
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.enqueue(item("a", Priority::Normal)).is_admitted());
    }

    #[tokio::test]
    async fn displace_evicts_oldest_from_lowest_lane_below_incoming() {
        let (queue, _clock) = queue(2, OverflowPolicy::Displace);
        assert!(queue.enqueue(item("victim", Priority::Low)).is_admitted());
        assert!(queue.enqueue(item("keeper", Priority::Normal)).is_admitted());

        match queue.enqueue(item("urgent", Priority::High)) {
            Enqueued::Admitted { displaced: Some(victim) } => assert_eq!(victim.id, "victim"),
            other => panic!("expected displacement, got {other:?}"),
        }
        assert_eq!(queue.size_by_lane(), [1, 1, 0]);

        let cancel = CancellationToken::new();
        let batch = queue.dequeue_batch(10, &cancel).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["urgent", "keeper"]);
    }

    #[test]
    fn displace_rejects_when_nothing_is_strictly_below() {
        let (queue, _clock) = queue(2, OverflowPolicy::Displace);
        assert!(queue.enqueue(item("h-1", Priority::High)).is_admitted());
        assert!(queue.enqueue(item("h-2", Priority::High)).is_admitted());
        match queue.enqueue(item("h-3", Priority::High)) {
            Enqueued::Rejected(RejectReason::QueueFull) => {}
            other => panic!("expected queue_full, got {other:?}"),
        }
        // Low priority can never displace anything.
        match queue.enqueue(item("l-1", Priority::Low)) {
            Enqueued::Rejected(RejectReason::QueueFull) => {}
            other => panic!("expected queue_full, got {other:?}"),
        }
    }

    #[test]
    fn reject_policy_never_displaces() {
        let (queue, _clock) = queue(1, OverflowPolicy::Reject);
        assert!(queue.enqueue(item("l", Priority::Low)).is_admitted());
        match queue.enqueue(item("h", Priority::High)) {
            Enqueued::Rejected(RejectReason::QueueFull) => {}
            other => panic!("expected queue_full, got {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn close_rejects_new_items_and_drains_the_rest() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        assert!(queue.enqueue(item("a", Priority::Normal)).is_admitted());
        queue.close();

        match queue.enqueue(item("b", Priority::Normal)) {
            Enqueued::Rejected(RejectReason::ShuttingDown) => {}
            other => panic!("expected shutting_down, got {other:?}"),
        }

        let cancel = CancellationToken::new();
        let batch = queue.dequeue_batch(10, &cancel).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(queue.dequeue_batch(10, &cancel).await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_dequeuers() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        let queue = Arc::new(queue);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.dequeue_batch(10, &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cancellation_unblocks_dequeue() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        let queue = Arc::new(queue);
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue_batch(10, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn enqueue_wakes_a_blocked_dequeuer() {
        let (queue, _clock) = queue(10, OverflowPolicy::Displace);
        let queue = Arc::new(queue);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.dequeue_batch(10, &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.enqueue(item("a", Priority::Low)).is_admitted());
        let batch = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap()
            .expect("one item");
        assert_eq!(batch[0].id, "a");
    }

    #[tokio::test]
    async fn aging_promotes_one_lane_per_interval() {
        let clock = ManualClock::new();
        let queue = PriorityQueue::new(
            10,
            OverflowPolicy::Displace,
            Some(Duration::from_millis(100)),
            Arc::new(clock.clone()),
        );
        assert!(queue.enqueue(item("old-low", Priority::Low)).is_admitted());
        clock.advance(100);
        assert!(queue.enqueue(item("fresh-normal", Priority::Normal)).is_admitted());

        // One interval elapsed: the low item joins the back of the normal
        // lane instead of starving behind it.
        let cancel = CancellationToken::new();
        let batch = queue.dequeue_batch(10, &cancel).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh-normal", "old-low"]);
        assert_eq!(batch[1].priority, Priority::Normal);
    }
}
