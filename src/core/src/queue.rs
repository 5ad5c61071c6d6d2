//! Bounded admission queue.
//!
//! An [`AdmissionQueue`] caps the number of active holders of a resource.
//! Requests beyond the cap wait in a queue and are promoted one at a time as
//! holders release, either oldest first or by a caller supplied priority
//! function. Several queues can be acquired together as a [`Transaction`];
//! single-queue acquisitions made with the transaction in hand are no-ops for
//! queues it already holds.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{OciError, Result};

/// Picks the queued entry to promote: `(queued, active) -> index into queued`.
///
/// Out of range results are clamped to the last queued entry.
pub type PriorityFn<T> = Arc<dyn Fn(&[T], &[T]) -> usize + Send + Sync>;

/// Queue status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
    pub max: usize,
}

struct QueueState<T> {
    active: Vec<T>,
    active_ids: Vec<Uuid>,
    queued: Vec<T>,
    waiters: Vec<(Uuid, oneshot::Sender<()>)>,
}

struct Shared<T> {
    id: Uuid,
    max: usize,
    priority: Option<PriorityFn<T>>,
    state: Mutex<QueueState<T>>,
}

impl<T> Shared<T> {
    /// Remove an active entry and promote waiters into the freed capacity.
    fn release(&self, id: Uuid) {
        let mut state = self.state.lock();
        if let Some(pos) = state.active_ids.iter().position(|a| *a == id) {
            state.active_ids.remove(pos);
            state.active.remove(pos);
        }
        self.promote(&mut state);
    }

    fn promote(&self, state: &mut QueueState<T>) {
        while state.active.len() < self.max && !state.queued.is_empty() {
            let last = state.queued.len() - 1;
            let index = match &self.priority {
                Some(priority) => priority(&state.queued, &state.active).min(last),
                None => 0,
            };

            let entry = state.queued.remove(index);
            let (id, tx) = state.waiters.remove(index);
            if tx.send(()).is_err() {
                // Waiter already gone; its slot stays free for the next one.
                continue;
            }
            state.active.push(entry);
            state.active_ids.push(id);
        }
    }

    /// Withdraw a waiter. If it was promoted in the meantime the promotion is
    /// passed through to the next waiter.
    fn abandon(&self, id: Uuid) {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|(w, _)| *w == id) {
            state.waiters.remove(pos);
            state.queued.remove(pos);
            return;
        }
        if let Some(pos) = state.active_ids.iter().position(|a| *a == id) {
            state.active_ids.remove(pos);
            state.active.remove(pos);
            self.promote(&mut state);
        }
    }
}

/// Bounded-concurrency queue handing out [`Admission`]s.
pub struct AdmissionQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AdmissionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for AdmissionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("id", &self.shared.id)
            .field("max", &self.shared.max)
            .finish()
    }
}

impl<T: Send + 'static> AdmissionQueue<T> {
    /// Create a FIFO queue admitting at most `max` holders (minimum 1).
    pub fn new(max: usize) -> Self {
        Self::build(max, None)
    }

    /// Create a queue releasing waiters in the order chosen by `priority`.
    pub fn with_priority<F>(max: usize, priority: F) -> Self
    where
        F: Fn(&[T], &[T]) -> usize + Send + Sync + 'static,
    {
        Self::build(max, Some(Arc::new(priority)))
    }

    fn build(max: usize, priority: Option<PriorityFn<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                max: max.max(1),
                priority,
                state: Mutex::new(QueueState {
                    active: Vec::new(),
                    active_ids: Vec::new(),
                    queued: Vec::new(),
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Queue identity, stable across clones.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        QueueStatus {
            queued: state.queued.len(),
            active: state.active.len(),
            max: self.shared.max,
        }
    }

    /// Wait for admission, giving up when `cancel` fires.
    ///
    /// Dropping the returned future also withdraws the request.
    pub async fn acquire(&self, cancel: &CancellationToken, entry: T) -> Result<Admission<T>> {
        let id = Uuid::new_v4();
        let rx = {
            let mut state = self.shared.state.lock();
            if state.active.len() < self.shared.max {
                state.active.push(entry);
                state.active_ids.push(id);
                return Ok(self.admission(id));
            }
            let (tx, rx) = oneshot::channel();
            state.queued.push(entry);
            state.waiters.push((id, tx));
            rx
        };

        let mut pending = PendingGuard {
            shared: &self.shared,
            id,
            armed: true,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pending.armed = false;
                self.shared.abandon(id);
                Err(OciError::Cancelled)
            }
            res = rx => {
                pending.armed = false;
                match res {
                    Ok(()) => Ok(self.admission(id)),
                    Err(_) => Err(OciError::QueueError("waiter dropped before admission".to_string())),
                }
            }
        }
    }

    /// Admit without waiting, or `None` when at capacity.
    pub fn try_acquire(&self, entry: T) -> Option<Admission<T>> {
        let id = Uuid::new_v4();
        let mut state = self.shared.state.lock();
        if state.active.len() < self.shared.max {
            state.active.push(entry);
            state.active_ids.push(id);
            Some(self.admission(id))
        } else {
            None
        }
    }

    /// Acquire within an optional transaction.
    ///
    /// With a transaction this queue must already be part of, returns
    /// `Ok(None)` without touching the queue. Queues outside the transaction
    /// are rejected. Without a transaction this is [`AdmissionQueue::acquire`].
    pub async fn acquire_in(
        &self,
        txn: Option<&Transaction<T>>,
        cancel: &CancellationToken,
        entry: T,
    ) -> Result<Option<Admission<T>>> {
        match txn {
            Some(txn) if txn.contains(self) => Ok(None),
            Some(_) => Err(OciError::QueueError(format!(
                "queue {} is not part of the active transaction",
                self.shared.id
            ))),
            None => self.acquire(cancel, entry).await.map(Some),
        }
    }

    fn admission(&self, id: Uuid) -> Admission<T> {
        Admission {
            shared: Some(Arc::clone(&self.shared)),
            id,
        }
    }
}

impl<T: Clone + Send + 'static> AdmissionQueue<T> {
    /// Acquire one entry in each queue as a unit.
    ///
    /// Blocks on a designated queue, tries the rest without waiting, and on
    /// failure releases everything and blocks on the queue that was full.
    /// Duplicate queues are acquired once.
    pub async fn acquire_multi(
        cancel: &CancellationToken,
        requests: &[(&AdmissionQueue<T>, T)],
    ) -> Result<Transaction<T>> {
        let mut unique: Vec<(&AdmissionQueue<T>, &T)> = Vec::with_capacity(requests.len());
        for (queue, entry) in requests {
            if !unique.iter().any(|(q, _)| q.id() == queue.id()) {
                unique.push((*queue, entry));
            }
        }

        let queue_ids = unique.iter().map(|(q, _)| q.id()).collect::<HashSet<_>>();
        if unique.is_empty() {
            return Ok(Transaction {
                queue_ids,
                held: Vec::new(),
            });
        }

        let mut blocker = 0;
        loop {
            let (queue, entry) = unique[blocker];
            let first = queue.acquire(cancel, entry.clone()).await?;
            let mut held = Vec::with_capacity(unique.len());
            held.push(first);

            let mut failed = None;
            for (i, (queue, entry)) in unique.iter().enumerate() {
                if i == blocker {
                    continue;
                }
                match queue.try_acquire((*entry).clone()) {
                    Some(admission) => held.push(admission),
                    None => {
                        failed = Some(i);
                        break;
                    }
                }
            }

            match failed {
                None => return Ok(Transaction { queue_ids, held }),
                Some(i) => {
                    drop(held);
                    blocker = i;
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

/// Removes a queued request if the acquiring future is dropped mid-wait.
struct PendingGuard<'a, T> {
    shared: &'a Arc<Shared<T>>,
    id: Uuid,
    armed: bool,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon(self.id);
        }
    }
}

/// An active slot in a queue. Released on drop.
pub struct Admission<T> {
    shared: Option<Arc<Shared<T>>>,
    id: Uuid,
}

impl<T> Admission<T> {
    /// Release the slot now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.id);
        }
    }
}

impl<T> Drop for Admission<T> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<T> std::fmt::Debug for Admission<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").field("id", &self.id).finish()
    }
}

/// Admissions held in several queues at once.
pub struct Transaction<T> {
    queue_ids: HashSet<Uuid>,
    held: Vec<Admission<T>>,
}

impl<T> Transaction<T> {
    /// Whether `queue` is covered by this transaction.
    pub fn contains(&self, queue: &AdmissionQueue<T>) -> bool {
        self.queue_ids.contains(&queue.shared.id)
    }

    /// Number of queues held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release every admission.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> std::fmt::Debug for Transaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("queues", &self.queue_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_queued<T: Send + 'static>(queue: &AdmissionQueue<T>, n: usize) {
        for _ in 0..500 {
            if queue.status().queued == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("queue never reached {} waiters", n);
    }

    // ========================================================================
    // Single queue
    // ========================================================================

    #[tokio::test]
    async fn test_admits_up_to_max() {
        let queue = AdmissionQueue::new(2);
        let cancel = CancellationToken::new();

        let first = queue.acquire(&cancel, 1).await.unwrap();
        let _second = queue.acquire(&cancel, 2).await.unwrap();
        assert_eq!(queue.status().active, 2);

        let q = queue.clone();
        let c = cancel.clone();
        let third = tokio::spawn(async move { q.acquire(&c, 3).await.map(|_| ()) });

        wait_queued(&queue, 1).await;
        assert!(!third.is_finished());

        first.release();
        tokio::time::timeout(Duration::from_secs(5), third)
            .await
            .expect("third admitted")
            .unwrap()
            .unwrap();
        assert_eq!(queue.status().queued, 0);
    }

    #[tokio::test]
    async fn test_try_acquire_at_capacity() {
        let queue = AdmissionQueue::new(1);
        let held = queue.try_acquire("a").unwrap();
        assert!(queue.try_acquire("b").is_none());
        drop(held);
        assert!(queue.try_acquire("c").is_some());
    }

    #[tokio::test]
    async fn test_zero_max_is_one() {
        let queue = AdmissionQueue::new(0);
        assert_eq!(queue.status().max, 1);
        assert!(queue.try_acquire(()).is_some());
    }

    #[tokio::test]
    async fn test_fifo_release_order() {
        let queue = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();
        let held = queue.acquire(&cancel, 0u32).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for n in 1..=3u32 {
            let q = queue.clone();
            let c = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let admission = q.acquire(&c, n).await.unwrap();
                tx.send(n).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(admission);
            });
            wait_queued(&queue, n as usize).await;
        }

        drop(held);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_priority_function_picks_entry() {
        // Highest value first.
        let queue = AdmissionQueue::with_priority(1, |queued: &[u32], _active: &[u32]| {
            queued
                .iter()
                .enumerate()
                .max_by_key(|(_, v)| **v)
                .map(|(i, _)| i)
                .unwrap_or(0)
        });
        let cancel = CancellationToken::new();
        let held = queue.acquire(&cancel, 0).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for (i, n) in [1u32, 5, 3].into_iter().enumerate() {
            let q = queue.clone();
            let c = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let admission = q.acquire(&c, n).await.unwrap();
                tx.send(n).unwrap();
                drop(admission);
            });
            wait_queued(&queue, i + 1).await;
        }

        drop(held);
        assert_eq!(rx.recv().await.unwrap(), 5);
        assert_eq!(rx.recv().await.unwrap(), 3);
        assert_eq!(rx.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_priority_index_is_clamped() {
        let queue = AdmissionQueue::with_priority(1, |_: &[u32], _: &[u32]| 99);
        let cancel = CancellationToken::new();
        let held = queue.acquire(&cancel, 0).await.unwrap();

        let q = queue.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { q.acquire(&c, 1).await.map(|_| ()) });
        wait_queued(&queue, 1).await;

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let queue = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();
        let held = queue.acquire(&cancel, "held").await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let q = queue.clone();
        let c = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { q.acquire(&c, "waiter").await.map(|_| ()) });
        wait_queued(&queue, 1).await;

        waiter_cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(OciError::Cancelled)));
        assert_eq!(queue.status().queued, 0);

        drop(held);
        assert_eq!(queue.status().active, 0);
    }

    #[tokio::test]
    async fn test_cancel_after_promotion_passes_slot_on() {
        let queue = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();
        let held = queue.acquire(&cancel, 0).await.unwrap();

        // Already cancelled: whichever branch wins, the slot must not leak.
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let q = queue.clone();
        let c = cancelled.clone();
        let waiter = tokio::spawn(async move { q.acquire(&c, 1).await.map(|_| ()) });
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(OciError::Cancelled)));

        let q = queue.clone();
        let c = cancel.clone();
        let next = tokio::spawn(async move { q.acquire(&c, 2).await.map(|_| ()) });
        wait_queued(&queue, 1).await;
        drop(held);
        tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(queue.status().active, 0);
    }

    #[tokio::test]
    async fn test_dropped_future_withdraws() {
        let queue = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();
        let held = queue.acquire(&cancel, 0).await.unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(20), queue.acquire(&cancel, 1)).await;
        assert!(result.is_err());
        assert_eq!(queue.status().queued, 0);

        drop(held);
        assert_eq!(queue.status().active, 0);
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[tokio::test]
    async fn test_acquire_multi_holds_all() {
        let a = AdmissionQueue::new(1);
        let b = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();

        let txn = AdmissionQueue::acquire_multi(&cancel, &[(&a, 1), (&b, 1), (&a, 1)])
            .await
            .unwrap();
        assert_eq!(txn.len(), 2);
        assert!(txn.contains(&a));
        assert!(txn.contains(&b));
        assert!(a.try_acquire(2).is_none());
        assert!(b.try_acquire(2).is_none());

        txn.release();
        assert!(a.try_acquire(3).is_some());
        assert!(b.try_acquire(3).is_some());
    }

    #[tokio::test]
    async fn test_nested_acquire_is_noop() {
        let a = AdmissionQueue::new(1);
        let b = AdmissionQueue::new(1);
        let other = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();

        let txn = AdmissionQueue::acquire_multi(&cancel, &[(&a, 1), (&b, 1)])
            .await
            .unwrap();

        let nested = a.acquire_in(Some(&txn), &cancel, 2).await.unwrap();
        assert!(nested.is_none());
        assert_eq!(a.status().active, 1);

        let err = other.acquire_in(Some(&txn), &cancel, 2).await.unwrap_err();
        assert!(matches!(err, OciError::QueueError(_)));

        drop(txn);
        let outside = a.acquire_in(None, &cancel, 3).await.unwrap();
        assert!(outside.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acquire_multi_opposite_orders() {
        let a = AdmissionQueue::new(1);
        let b = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let (a, b, cancel) = (a.clone(), b.clone(), cancel.clone());
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let result = if i % 2 == 0 {
                        AdmissionQueue::acquire_multi(&cancel, &[(&a, i), (&b, i)]).await
                    } else {
                        AdmissionQueue::acquire_multi(&cancel, &[(&b, i), (&a, i)]).await
                    };
                    let txn = result.unwrap();
                    tokio::task::yield_now().await;
                    drop(txn);
                }
            }));
        }

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(30), task)
                .await
                .expect("no deadlock")
                .unwrap();
        }
        assert_eq!(a.status().active, 0);
        assert_eq!(b.status().active, 0);
    }

    #[tokio::test]
    async fn test_acquire_multi_cancelled() {
        let a = AdmissionQueue::new(1);
        let b = AdmissionQueue::new(1);
        let cancel = CancellationToken::new();
        let _held = a.acquire(&cancel, 0).await.unwrap();

        let txn_cancel = CancellationToken::new();
        txn_cancel.cancel();
        let err = AdmissionQueue::acquire_multi(&txn_cancel, &[(&a, 1), (&b, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Cancelled));
        assert_eq!(b.status().active, 0);
    }
}
