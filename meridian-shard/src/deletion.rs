//! Orphan-range deletion: the external deleter seam, the dependency-gated
//! queue, and the completion futures handed to waiters.
//!
//! A deletion scheduled for a range must not begin while any retained
//! snapshot still covering that range has in-flight readers. Each queued task
//! carries the set of snapshot trackers it waits on; releasing the last
//! tracker submits the task to the deleter executor.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use meridian_core::{CollectionUuid, Namespace};
use tokio::sync::watch;

use crate::chunk::ChunkRange;

/// Grace-delay configuration for the range deleter.
#[derive(Debug, Clone, Copy)]
pub struct RangeDeleterConfig {
    /// Delay before a `delayed` deletion begins, in microseconds.
    pub delay_us: u64,
}

impl Default for RangeDeleterConfig {
    fn default() -> Self {
        Self {
            delay_us: meridian_core::Limits::new().range_deletion_delay_us,
        }
    }
}

/// Errors surfaced by physical range deletion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeDeletionError {
    /// The collection incarnation the deletion belonged to no longer exists.
    #[error("range deletion abandoned: collection {uuid} no longer exists")]
    Abandoned {
        /// The vanished incarnation.
        uuid: CollectionUuid,
    },

    /// The deletion failed for an environmental reason.
    #[error("range deletion failed: {reason}")]
    Failed {
        /// Why the deletion failed.
        reason: String,
    },
}

/// Executor for physical deletion of an orphaned range.
///
/// Supplied by the host. Implementations must be `Send + Sync`; the queue
/// invokes them from detached tasks, never under its own lock.
#[async_trait]
pub trait RangeDeleter: Send + Sync {
    /// Physically deletes all documents of `uuid` within `range`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeDeletionError::Abandoned`] when the collection
    /// incarnation is gone, [`RangeDeletionError::Failed`] otherwise.
    async fn delete_range(
        &self,
        nss: &Namespace,
        uuid: CollectionUuid,
        range: &ChunkRange,
    ) -> Result<(), RangeDeletionError>;
}

/// Terminal outcome of one scheduled range deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The range was physically deleted.
    Done,
    /// The collection incarnation vanished before the deletion ran; there is
    /// nothing left to delete.
    Abandoned,
    /// The deletion failed.
    Failed(String),
}

/// Observable state of a scheduled deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CleanupState {
    Pending,
    Finished(CleanupOutcome),
}

/// A shareable completion future for one scheduled range deletion.
///
/// Cloning yields an independent waiter for the same deletion.
#[derive(Debug, Clone)]
pub struct CleanupWaiter {
    rx: watch::Receiver<CleanupState>,
}

impl CleanupWaiter {
    /// Waits until the deletion reaches a terminal state.
    ///
    /// A deletion whose owning manager is torn down without resolving
    /// reports [`CleanupOutcome::Abandoned`].
    pub async fn wait(&mut self) -> CleanupOutcome {
        loop {
            {
                let state = self.rx.borrow_and_update();
                if let CleanupState::Finished(outcome) = &*state {
                    return outcome.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return CleanupOutcome::Abandoned;
            }
        }
    }

    /// Returns the terminal outcome if the deletion has already finished.
    #[must_use]
    pub fn outcome(&self) -> Option<CleanupOutcome> {
        match &*self.rx.borrow() {
            CleanupState::Pending => None,
            CleanupState::Finished(outcome) => Some(outcome.clone()),
        }
    }
}

/// A task that became runnable and must be handed to the deleter executor.
#[derive(Debug)]
pub(crate) struct ReadyDeletion {
    pub(crate) task_id: u64,
    pub(crate) range: ChunkRange,
    pub(crate) delayed: bool,
}

struct DeletionTask {
    id: u64,
    range: ChunkRange,
    delayed: bool,
    waiting_on: HashSet<u64>,
    submitted: bool,
    tx: watch::Sender<CleanupState>,
    rx: watch::Receiver<CleanupState>,
}

/// Dependency-gated queue of scheduled range deletions.
///
/// Shared between the metadata manager (which enqueues and releases
/// dependencies) and the detached deleter tasks (which report completion),
/// so completion never touches the manager lock.
pub(crate) struct DeletionQueue {
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    tasks: Vec<DeletionTask>,
    next_task_id: u64,
}

impl DeletionQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                next_task_id: 1,
            }),
        }
    }

    /// Enqueues a deletion gated on the given snapshot trackers. Returns the
    /// waiter and, when the task has no dependencies, the ready task itself.
    pub(crate) fn enqueue(
        &self,
        range: ChunkRange,
        delayed: bool,
        waiting_on: HashSet<u64>,
    ) -> (CleanupWaiter, Option<ReadyDeletion>) {
        let (tx, rx) = watch::channel(CleanupState::Pending);
        let mut inner = self.inner.lock().expect("deletion queue poisoned");
        let id = inner.next_task_id;
        inner.next_task_id += 1;

        let ready = waiting_on.is_empty().then(|| ReadyDeletion {
            task_id: id,
            range: range.clone(),
            delayed,
        });

        inner.tasks.push(DeletionTask {
            id,
            range,
            delayed,
            waiting_on,
            submitted: ready.is_some(),
            tx,
            rx: rx.clone(),
        });

        (CleanupWaiter { rx }, ready)
    }

    /// Releases one snapshot tracker from every task waiting on it and
    /// returns the tasks that became runnable.
    pub(crate) fn release_tracker(&self, tracker_id: u64) -> Vec<ReadyDeletion> {
        let mut inner = self.inner.lock().expect("deletion queue poisoned");
        let mut ready = Vec::new();
        for task in &mut inner.tasks {
            task.waiting_on.remove(&tracker_id);
            if task.waiting_on.is_empty() && !task.submitted {
                task.submitted = true;
                ready.push(ReadyDeletion {
                    task_id: task.id,
                    range: task.range.clone(),
                    delayed: task.delayed,
                });
            }
        }
        ready
    }

    /// Marks a task finished and drops it from the queue.
    pub(crate) fn complete(&self, task_id: u64, outcome: CleanupOutcome) {
        let mut inner = self.inner.lock().expect("deletion queue poisoned");
        if let Some(pos) = inner.tasks.iter().position(|t| t.id == task_id) {
            let task = inner.tasks.swap_remove(pos);
            // Receivers may all be gone; nothing to do then.
            let _ = task.tx.send(CleanupState::Finished(outcome));
        }
    }

    /// Returns a waiter for any still-scheduled deletion overlapping `range`.
    pub(crate) fn overlapping_waiter(&self, range: &ChunkRange) -> Option<CleanupWaiter> {
        let inner = self.inner.lock().expect("deletion queue poisoned");
        inner
            .tasks
            .iter()
            .find(|t| t.range.overlaps(range))
            .map(|t| CleanupWaiter { rx: t.rx.clone() })
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("deletion queue poisoned").tasks.len()
    }

    /// Resolves every task as abandoned and empties the queue.
    pub(crate) fn abandon(&self) {
        let mut inner = self.inner.lock().expect("deletion queue poisoned");
        for task in inner.tasks.drain(..) {
            let _ = task
                .tx
                .send(CleanupState::Finished(CleanupOutcome::Abandoned));
        }
    }
}

/// In-memory range deleter for tests and simulation.
///
/// Records every deletion it performs; a queued failure is consumed by the
/// next invocation.
#[derive(Default)]
pub struct SimulatedRangeDeleter {
    deleted: Mutex<Vec<(Namespace, CollectionUuid, ChunkRange)>>,
    induced_failure: Mutex<Option<RangeDeletionError>>,
}

impl SimulatedRangeDeleter {
    /// Creates an empty simulated deleter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next deletion.
    pub fn induce_failure(&self, error: RangeDeletionError) {
        *self.induced_failure.lock().expect("deleter poisoned") = Some(error);
    }

    /// Returns every range deleted so far.
    #[must_use]
    pub fn deleted_ranges(&self) -> Vec<ChunkRange> {
        self.deleted
            .lock()
            .expect("deleter poisoned")
            .iter()
            .map(|(_, _, range)| range.clone())
            .collect()
    }

    /// Number of completed deletions.
    #[must_use]
    pub fn deletion_count(&self) -> usize {
        self.deleted.lock().expect("deleter poisoned").len()
    }
}

#[async_trait]
impl RangeDeleter for SimulatedRangeDeleter {
    async fn delete_range(
        &self,
        nss: &Namespace,
        uuid: CollectionUuid,
        range: &ChunkRange,
    ) -> Result<(), RangeDeletionError> {
        if let Some(error) = self.induced_failure.lock().expect("deleter poisoned").take() {
            return Err(error);
        }
        self.deleted
            .lock()
            .expect("deleter poisoned")
            .push((nss.clone(), uuid, range.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: &'static [u8], max: &'static [u8]) -> ChunkRange {
        ChunkRange::from_static(min, max)
    }

    #[test]
    fn test_enqueue_without_dependencies_is_ready() {
        let queue = DeletionQueue::new();
        let (_waiter, ready) = queue.enqueue(range(b"a", b"m"), false, HashSet::new());
        assert!(ready.is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dependencies_gate_submission() {
        let queue = DeletionQueue::new();
        let deps: HashSet<u64> = [1, 2].into_iter().collect();
        let (_waiter, ready) = queue.enqueue(range(b"a", b"m"), false, deps);
        assert!(ready.is_none());

        assert!(queue.release_tracker(1).is_empty());
        let ready = queue.release_tracker(2);
        assert_eq!(ready.len(), 1);

        // Releasing again does not resubmit.
        assert!(queue.release_tracker(2).is_empty());
    }

    #[tokio::test]
    async fn test_complete_resolves_waiters() {
        let queue = DeletionQueue::new();
        let (mut waiter, ready) = queue.enqueue(range(b"a", b"m"), false, HashSet::new());
        let task_id = ready.unwrap().task_id;

        let mut second = waiter.clone();
        queue.complete(task_id, CleanupOutcome::Done);

        assert_eq!(waiter.wait().await, CleanupOutcome::Done);
        assert_eq!(second.wait().await, CleanupOutcome::Done);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_abandon_resolves_all() {
        let queue = DeletionQueue::new();
        let deps: HashSet<u64> = [7].into_iter().collect();
        let (mut waiter, _) = queue.enqueue(range(b"a", b"m"), false, deps);
        queue.abandon();
        assert_eq!(waiter.wait().await, CleanupOutcome::Abandoned);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_overlapping_waiter() {
        let queue = DeletionQueue::new();
        let (_waiter, _) = queue.enqueue(range(b"a", b"m"), false, HashSet::new());
        assert!(queue.overlapping_waiter(&range(b"g", b"z")).is_some());
        assert!(queue.overlapping_waiter(&range(b"m", b"z")).is_none());
    }

    #[tokio::test]
    async fn test_simulated_deleter_records_and_fails() {
        let deleter = SimulatedRangeDeleter::new();
        let nss = Namespace::parse("db.orders").unwrap();
        let uuid = CollectionUuid::new(3);

        deleter
            .delete_range(&nss, uuid, &range(b"a", b"m"))
            .await
            .unwrap();
        assert_eq!(deleter.deletion_count(), 1);

        deleter.induce_failure(RangeDeletionError::Abandoned { uuid });
        let err = deleter
            .delete_range(&nss, uuid, &range(b"m", b"z"))
            .await
            .unwrap_err();
        assert!(matches!(err, RangeDeletionError::Abandoned { .. }));
        assert_eq!(deleter.deletion_count(), 1);
    }
}
