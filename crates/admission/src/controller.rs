//! Unit-pool admission controller.
//!
//! All mutable state (free units, pending queue) lives behind one mutex so
//! grant and release are atomic with respect to the free-unit count. Blocked
//! submissions park on a oneshot channel and are reconsidered in strict FIFO
//! order on every release — the head waiter is admitted or nothing is, so a
//! released exclusive slot always re-offers capacity to the earliest blocked
//! request before anything submitted later.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{AdmissionError, Result};
use crate::requirement::Concurrency;

struct Waiter {
    id: u64,
    concurrency: Concurrency,
    tx: oneshot::Sender<ExecutionSlot>,
}

struct State {
    free: u32,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct Inner {
    total: u32,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Units this requirement would be granted right now, if any.
    fn grantable(&self, state: &State, concurrency: Concurrency) -> Option<u32> {
        match concurrency {
            // Exclusive needs the whole pool idle and reserves all of it.
            Concurrency::Exclusive if state.free == self.total => Some(self.total),
            Concurrency::Exclusive => None,
            Concurrency::Exactly(n) if n <= state.free => Some(n),
            Concurrency::Exactly(_) => None,
            Concurrency::Range { min, max } if min <= state.free => Some(max.min(state.free)),
            Concurrency::Range { .. } => None,
        }
    }

    /// Return `granted` units to the pool and admit queued waiters in FIFO
    /// order, stopping at the first that still cannot be admitted.
    fn release(inner: &Arc<Self>, granted: u32) {
        let mut state = inner.lock();
        state.free += granted;
        trace!(returned = granted, free = state.free, "units released");
        Self::wake_queue(inner, &mut state);
    }

    /// Must be called with the state lock held.
    fn wake_queue(inner: &Arc<Self>, state: &mut State) {
        while let Some(head) = state.queue.front() {
            let Some(granted) = inner.grantable(state, head.concurrency) else {
                break;
            };
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.free -= granted;
            debug!(
                waiter = waiter.id,
                requirement = %waiter.concurrency,
                granted,
                free = state.free,
                "admitting queued request"
            );
            let slot = ExecutionSlot {
                inner: Arc::clone(inner),
                concurrency: waiter.concurrency,
                granted,
                released: false,
            };
            if let Err(mut unclaimed) = waiter.tx.send(slot) {
                // Receiver dropped between cancellation and grant: defuse the
                // slot so its Drop stays out of this lock, reclaim in place.
                unclaimed.released = true;
                state.free += granted;
                trace!(waiter = waiter.id, "waiter cancelled before grant");
            }
        }
    }
}

/// Removes a parked waiter from the queue when the `submit` future is
/// dropped before being granted.
struct CancelGuard {
    inner: Arc<Inner>,
    id: u64,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
            trace!(waiter = self.id, "pending submission cancelled");
        }
        // Not in the queue: the grant already raced ahead. Dropping our
        // receiver drops the slot, which returns the units.
    }
}

/// Gates concurrent process execution against a fixed pool of resource
/// units. Cheap to clone; all clones share one pool and pending queue.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    /// Create a controller owning `total_units` resource units.
    pub fn new(total_units: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                total: total_units,
                state: Mutex::new(State {
                    free: total_units,
                    queue: VecDeque::new(),
                    next_waiter_id: 0,
                }),
            }),
        }
    }

    pub fn total_units(&self) -> u32 {
        self.inner.total
    }

    /// Units not currently reserved by a live slot.
    pub fn free_units(&self) -> u32 {
        self.inner.lock().free
    }

    /// Number of submissions currently blocked on capacity.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Submit a process for admission.
    ///
    /// Returns immediately with `Unsatisfiable` when the requirement exceeds
    /// the pool outright; otherwise suspends until capacity admits it. The
    /// returned slot reserves its units until released or dropped. Dropping
    /// the future while blocked withdraws the request with no side effects.
    pub async fn submit(&self, concurrency: Concurrency) -> Result<ExecutionSlot> {
        concurrency.validate()?;
        if concurrency.min_units() > self.inner.total {
            return Err(AdmissionError::Unsatisfiable {
                required: concurrency.min_units(),
                total: self.inner.total,
            });
        }

        let (rx, id) = {
            let mut state = self.inner.lock();
            // Strict FIFO: only overtake an empty queue.
            if state.queue.is_empty()
                && let Some(granted) = self.inner.grantable(&state, concurrency)
            {
                state.free -= granted;
                debug!(requirement = %concurrency, granted, free = state.free, "admitted");
                return Ok(ExecutionSlot {
                    inner: Arc::clone(&self.inner),
                    concurrency,
                    granted,
                    released: false,
                });
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                concurrency,
                tx,
            });
            debug!(waiter = id, requirement = %concurrency, free = state.free, "blocked on capacity");
            (rx, id)
        };

        let mut guard = CancelGuard {
            inner: Arc::clone(&self.inner),
            id,
            armed: true,
        };
        match rx.await {
            Ok(slot) => {
                guard.armed = false;
                Ok(slot)
            }
            // Sender dropped without a grant: controller went away.
            Err(_) => {
                guard.armed = false;
                Err(AdmissionError::Closed)
            }
        }
    }
}

/// Runtime record of one admitted, currently-running process.
///
/// Holds the declared requirement and the concrete unit count granted.
/// Units return to the pool when the slot is released or dropped.
#[derive(Debug)]
pub struct ExecutionSlot {
    inner: Arc<Inner>,
    concurrency: Concurrency,
    granted: u32,
    released: bool,
}

impl ExecutionSlot {
    /// The unit count reserved for this process.
    pub fn granted_units(&self) -> u32 {
        self.granted
    }

    /// The requirement this slot was admitted under.
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Return the reserved units to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        Inner::release(&self.inner, self.granted);
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").field("total", &self.total).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    /// Poll a future briefly, asserting it does not complete, and hand it
    /// back still pending.
    async fn assert_blocks<F: Future>(fut: F) -> std::pin::Pin<Box<F>> {
        let mut fut = Box::pin(fut);
        if timeout(Duration::from_millis(50), &mut fut).await.is_ok() {
            panic!("expected submission to block");
        }
        fut
    }

    #[tokio::test]
    async fn exactly_grants_when_free() {
        let ctrl = AdmissionController::new(4);
        let slot = ctrl.submit(Concurrency::Exactly(3)).await.unwrap();
        assert_eq!(slot.granted_units(), 3);
        assert_eq!(ctrl.free_units(), 1);
        slot.release();
        assert_eq!(ctrl.free_units(), 4);
    }

    #[tokio::test]
    async fn exactly_over_total_is_permanent_rejection() {
        let ctrl = AdmissionController::new(4);
        // Fill the pool so a transient block would also be plausible — the
        // rejection must still be immediate.
        let _held = ctrl.submit(Concurrency::Exactly(4)).await.unwrap();
        let err = ctrl.submit(Concurrency::Exactly(5)).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Unsatisfiable {
                required: 5,
                total: 4
            }
        );
    }

    #[tokio::test]
    async fn range_min_over_total_is_permanent_rejection() {
        let ctrl = AdmissionController::new(2);
        let err = ctrl
            .submit(Concurrency::Range { min: 3, max: 8 })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Unsatisfiable {
                required: 3,
                total: 2
            }
        );
    }

    #[tokio::test]
    async fn range_grants_maximum_feasible() {
        let ctrl = AdmissionController::new(5);
        let slot = ctrl
            .submit(Concurrency::Range { min: 1, max: 4 })
            .await
            .unwrap();
        assert_eq!(slot.granted_units(), 4);
        assert_eq!(ctrl.free_units(), 1);
    }

    #[tokio::test]
    async fn range_clamped_by_free_units() {
        let ctrl = AdmissionController::new(5);
        let _busy = ctrl.submit(Concurrency::Exactly(3)).await.unwrap();
        let slot = ctrl
            .submit(Concurrency::Range { min: 1, max: 4 })
            .await
            .unwrap();
        assert_eq!(slot.granted_units(), 2);
        assert_eq!(ctrl.free_units(), 0);
    }

    #[tokio::test]
    async fn range_blocks_until_min_available() {
        let ctrl = AdmissionController::new(4);
        let busy = ctrl.submit(Concurrency::Exactly(3)).await.unwrap();

        let pending = assert_blocks(ctrl.submit(Concurrency::Range { min: 3, max: 4 })).await;
        assert_eq!(ctrl.pending(), 1);

        busy.release();
        let slot = pending.await.unwrap();
        // Free was 4 at grant time, max caps it.
        assert_eq!(slot.granted_units(), 4);
    }

    #[tokio::test]
    async fn exclusive_waits_for_idle_pool() {
        let ctrl = AdmissionController::new(4);
        let busy = ctrl.submit(Concurrency::Exactly(1)).await.unwrap();

        let pending = assert_blocks(ctrl.submit(Concurrency::Exclusive)).await;

        busy.release();
        let slot = pending.await.unwrap();
        assert_eq!(slot.granted_units(), 4);
        assert_eq!(ctrl.free_units(), 0);
    }

    #[tokio::test]
    async fn nothing_granted_while_exclusive_runs() {
        let ctrl = AdmissionController::new(4);
        let exclusive = ctrl.submit(Concurrency::Exclusive).await.unwrap();
        assert_eq!(ctrl.free_units(), 0);

        let pending = assert_blocks(ctrl.submit(Concurrency::Exactly(1))).await;

        exclusive.release();
        let slot = pending.await.unwrap();
        assert_eq!(slot.granted_units(), 1);
    }

    #[tokio::test]
    async fn exclusive_on_single_unit_pool() {
        let ctrl = AdmissionController::new(1);
        let slot = ctrl.submit(Concurrency::Exclusive).await.unwrap();
        assert_eq!(slot.granted_units(), 1);
    }

    #[tokio::test]
    async fn fifo_order_preserved_after_exclusive_release() {
        let ctrl = AdmissionController::new(4);
        let exclusive = ctrl.submit(Concurrency::Exclusive).await.unwrap();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for label in 1..=3u32 {
            let task_ctrl = ctrl.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                // Full-pool requests serialize the grants, so the observed
                // order is the controller's admission order, not the
                // scheduler's.
                let slot = task_ctrl.submit(Concurrency::Exactly(4)).await.unwrap();
                let _ = order_tx.send(label);
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(slot);
            });
            // Let each task park before submitting the next.
            while ctrl.pending() < label as usize {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        exclusive.release();
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(
                timeout(Duration::from_secs(2), order_rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn no_overtaking_of_blocked_head() {
        let ctrl = AdmissionController::new(4);
        let busy = ctrl.submit(Concurrency::Exactly(2)).await.unwrap();

        // Head needs 3, only 2 free. A later exactly(1) would fit but must
        // queue behind it.
        let head = assert_blocks(ctrl.submit(Concurrency::Exactly(3))).await;
        let tail = assert_blocks(ctrl.submit(Concurrency::Exactly(1))).await;
        assert_eq!(ctrl.pending(), 2);

        busy.release();
        let head_slot = head.await.unwrap();
        let tail_slot = tail.await.unwrap();
        assert_eq!(head_slot.granted_units(), 3);
        assert_eq!(tail_slot.granted_units(), 1);
        assert_eq!(ctrl.free_units(), 0);
    }

    #[tokio::test]
    async fn reserved_units_never_exceed_total() {
        let ctrl = AdmissionController::new(6);
        let mut slots = Vec::new();
        for n in [2u32, 3, 1] {
            slots.push(ctrl.submit(Concurrency::Exactly(n)).await.unwrap());
        }
        let reserved: u32 = slots.iter().map(ExecutionSlot::granted_units).sum();
        assert_eq!(reserved, 6);
        assert_eq!(ctrl.free_units(), 0);

        slots.pop();
        assert_eq!(ctrl.free_units(), 1);
        slots.clear();
        assert_eq!(ctrl.free_units(), 6);
    }

    #[tokio::test]
    async fn cancelling_pending_submission_leaves_no_trace() {
        let ctrl = AdmissionController::new(2);
        let busy = ctrl.submit(Concurrency::Exactly(2)).await.unwrap();

        let pending = assert_blocks(ctrl.submit(Concurrency::Exactly(1))).await;
        assert_eq!(ctrl.pending(), 1);
        drop(pending);
        assert_eq!(ctrl.pending(), 0);

        busy.release();
        assert_eq!(ctrl.free_units(), 2);
    }

    #[tokio::test]
    async fn cancelled_head_does_not_block_tail() {
        let ctrl = AdmissionController::new(2);
        let busy = ctrl.submit(Concurrency::Exactly(2)).await.unwrap();

        let head = assert_blocks(ctrl.submit(Concurrency::Exactly(2))).await;
        let tail = assert_blocks(ctrl.submit(Concurrency::Exactly(1))).await;
        drop(head);

        busy.release();
        let slot = tail.await.unwrap();
        assert_eq!(slot.granted_units(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grant_racing_cancellation_reclaims_units() {
        let ctrl = AdmissionController::new(2);

        // Race a release (which tries to admit the queued waiter) against
        // dropping that waiter's submit future. Whichever side wins, the
        // units must come back.
        for _ in 0..200 {
            let busy = ctrl.submit(Concurrency::Exactly(2)).await.unwrap();
            let waiter = tokio::spawn({
                let ctrl = ctrl.clone();
                async move {
                    let _slot = ctrl.submit(Concurrency::Exactly(2)).await;
                }
            });
            while ctrl.pending() == 0 {
                tokio::task::yield_now().await;
            }

            waiter.abort();
            busy.release();
            let _ = waiter.await;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while ctrl.free_units() != 2 {
                assert!(tokio::time::Instant::now() < deadline, "units leaked");
                tokio::task::yield_now().await;
            }
            assert_eq!(ctrl.pending(), 0);
        }
    }

    #[tokio::test]
    async fn invalid_requirement_rejected_before_queueing() {
        let ctrl = AdmissionController::new(4);
        let err = ctrl
            .submit(Concurrency::Range { min: 5, max: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRequirement(_)));
        assert_eq!(ctrl.pending(), 0);
    }

    #[tokio::test]
    async fn zero_unit_pool_rejects_everything() {
        let ctrl = AdmissionController::new(0);
        for req in [
            Concurrency::Exclusive,
            Concurrency::Exactly(1),
            Concurrency::Range { min: 1, max: 2 },
        ] {
            let err = ctrl.submit(req).await.unwrap_err();
            assert!(matches!(err, AdmissionError::Unsatisfiable { .. }));
        }
    }

    #[tokio::test]
    async fn slot_drop_wakes_queue() {
        let ctrl = AdmissionController::new(1);
        let busy = ctrl.submit(Concurrency::Exactly(1)).await.unwrap();
        let pending = assert_blocks(ctrl.submit(Concurrency::Exactly(1))).await;
        drop(busy);
        assert_eq!(pending.await.unwrap().granted_units(), 1);
    }
}
