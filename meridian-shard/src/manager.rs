//! Metadata manager - the sequence of routing snapshots referenced by
//! in-flight readers, and the scheduling of orphan-range cleanup when a
//! snapshot's chunks are replaced.
//!
//! # Snapshot retirement
//!
//! Snapshots are kept oldest-first; the newest is active. A snapshot may be
//! dropped once its reader count is zero and a newer snapshot exists.
//! Dropping a snapshot releases its hold on every queued range deletion;
//! a deletion with no remaining holds is handed to the deleter executor.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meridian_core::{CollectionUuid, Limits, MigrationId, Namespace};
use tracing::{debug, info, warn};

use crate::chunk::ChunkRange;
use crate::deletion::{
    CleanupOutcome, CleanupWaiter, DeletionQueue, RangeDeleter, RangeDeleterConfig,
    RangeDeletionError, ReadyDeletion,
};
use crate::error::{ShardError, ShardResult};
use crate::metadata::CollectionMetadata;

struct SnapshotTracker {
    id: u64,
    metadata: Arc<CollectionMetadata>,
    uses: usize,
}

struct ManagerInner {
    /// Oldest first; the back entry is the active snapshot.
    trackers: VecDeque<SnapshotTracker>,
    next_tracker_id: u64,
}

/// Holds the retained routing snapshots for one collection incarnation and
/// schedules cleanup of ranges the active snapshot no longer owns.
///
/// One manager serves exactly one collection UUID; the owning runtime
/// replaces the whole manager when the collection is dropped and recreated.
pub struct MetadataManager {
    nss: Namespace,
    uuid: CollectionUuid,
    deleter: Arc<dyn RangeDeleter>,
    config: RangeDeleterConfig,
    queue: Arc<DeletionQueue>,
    inner: Mutex<ManagerInner>,
}

impl MetadataManager {
    /// Creates a manager seeded with its first snapshot.
    #[must_use]
    pub fn new(
        nss: Namespace,
        initial: CollectionMetadata,
        deleter: Arc<dyn RangeDeleter>,
        config: RangeDeleterConfig,
    ) -> Self {
        let uuid = initial.uuid();
        let mut trackers = VecDeque::new();
        trackers.push_back(SnapshotTracker {
            id: 1,
            metadata: Arc::new(initial),
            uses: 0,
        });
        Self {
            nss,
            uuid,
            deleter,
            config,
            queue: Arc::new(DeletionQueue::new()),
            inner: Mutex::new(ManagerInner {
                trackers,
                next_tracker_id: 2,
            }),
        }
    }

    /// Identity of the collection incarnation this manager serves.
    #[must_use]
    pub const fn collection_uuid(&self) -> CollectionUuid {
        self.uuid
    }

    /// Number of retained snapshots, including the active one.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.lock_inner().trackers.len()
    }

    /// Number of range deletions scheduled but not yet finished.
    #[must_use]
    pub fn number_of_ranges_scheduled_for_deletion(&self) -> usize {
        self.queue.len()
    }

    /// Returns a reader handle on the active snapshot, or on the snapshot
    /// covering `at_cluster_time` when point-in-time reads are enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::StaleClusterTime`] when a requested point in
    /// time predates every retained snapshot.
    pub fn get_active_metadata(
        this: &Arc<Self>,
        at_cluster_time: Option<u64>,
    ) -> ShardResult<ScopedMetadata> {
        let mut inner = this.lock_inner();
        let active_supports_pit = inner
            .trackers
            .back()
            .expect("manager retains at least one snapshot")
            .metadata
            .supports_point_in_time_reads();

        let tracker = match at_cluster_time {
            Some(time) if active_supports_pit => inner
                .trackers
                .iter_mut()
                .rev()
                .find(|t| t.metadata.collection_version().timestamp.is_some_and(|ts| ts <= time))
                .ok_or_else(|| ShardError::StaleClusterTime {
                    nss: this.nss.clone(),
                    at_cluster_time: time,
                })?,
            _ => inner
                .trackers
                .back_mut()
                .expect("manager retains at least one snapshot"),
        };

        tracker.uses += 1;
        Ok(ScopedMetadata {
            manager: Arc::clone(this),
            tracker_id: tracker.id,
            metadata: Arc::clone(&tracker.metadata),
        })
    }

    /// Installs `new` as the active snapshot.
    ///
    /// Ranges this shard owned under the previous active snapshot but does
    /// not own under `new` are queued for deletion, gated on every retained
    /// snapshot that still covers them. Installing a snapshot with the same
    /// version as the active one is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `new` belongs to a different collection UUID; the owning
    /// runtime must replace the manager instead.
    pub fn set_filtering_metadata(&self, new: CollectionMetadata) {
        assert!(
            new.uuid() == self.uuid,
            "snapshot for a different collection incarnation"
        );

        let ready = {
            let mut inner = self.lock_inner();
            let active = inner
                .trackers
                .back()
                .expect("manager retains at least one snapshot");

            if active.metadata.collection_version() == new.collection_version() {
                debug!(
                    nss = %self.nss,
                    version = %new.collection_version(),
                    "Skipping metadata install: same version already active"
                );
                return;
            }

            let orphans = active.metadata.orphaned_ranges_after(&new);

            // Every retained snapshot that still covers an orphan holds its
            // deletion back until released. A migration may already have
            // scheduled the same range through clean_up_range; skip those.
            let mut ready = Vec::new();
            for range in orphans {
                if self.queue.overlapping_waiter(&range).is_some() {
                    continue;
                }
                let waiting_on: HashSet<u64> = inner
                    .trackers
                    .iter()
                    .filter(|t| t.metadata.owns_any_of(&range))
                    .map(|t| t.id)
                    .collect();
                info!(
                    nss = %self.nss,
                    range = %range,
                    blockers = waiting_on.len(),
                    "Scheduling deletion of range no longer owned"
                );
                let (_, task) = self.queue.enqueue(range, false, waiting_on);
                ready.extend(task);
            }

            let id = inner.next_tracker_id;
            inner.next_tracker_id += 1;
            info!(
                nss = %self.nss,
                version = %new.collection_version(),
                "Installing new filtering metadata"
            );
            inner.trackers.push_back(SnapshotTracker {
                id,
                metadata: Arc::new(new),
                uses: 0,
            });

            if inner.trackers.len() > Limits::new().max_retained_snapshots as usize {
                warn!(
                    nss = %self.nss,
                    retained = inner.trackers.len(),
                    "Retained snapshot count exceeds the configured limit; \
                     long-running readers are pinning old metadata"
                );
            }

            ready.extend(Self::retire_expired(&mut inner, &self.queue));
            ready
        };
        self.spawn_ready(ready);
    }

    /// Queues a deletion of `range`, gated on every retained snapshot that
    /// still covers it. With `delayed`, physical deletion waits the
    /// configured grace period after the gates clear.
    ///
    /// Returns a waiter that completes when the physical deletion finishes.
    pub fn clean_up_range(
        &self,
        range: ChunkRange,
        migration_id: Option<MigrationId>,
        delayed: bool,
    ) -> CleanupWaiter {
        // Coalesce with an already-scheduled overlapping deletion; the
        // post-migration install may have queued this range first.
        if let Some(waiter) = self.queue.overlapping_waiter(&range) {
            debug!(nss = %self.nss, range = %range, "Range cleanup already scheduled");
            return waiter;
        }

        let (waiter, ready) = {
            let inner = self.lock_inner();
            let waiting_on: HashSet<u64> = inner
                .trackers
                .iter()
                .filter(|t| t.metadata.owns_any_of(&range))
                .map(|t| t.id)
                .collect();
            debug!(
                nss = %self.nss,
                range = %range,
                ?migration_id,
                delayed,
                blockers = waiting_on.len(),
                "Scheduling range cleanup"
            );
            self.queue.enqueue(range, delayed, waiting_on)
        };
        if let Some(task) = ready {
            self.spawn_ready(vec![task]);
        }
        waiter
    }

    /// Returns a waiter for any scheduled deletion overlapping `range`, or
    /// `None` when nothing overlapping remains in flight.
    #[must_use]
    pub fn track_orphaned_data_cleanup(&self, range: &ChunkRange) -> Option<CleanupWaiter> {
        self.queue.overlapping_waiter(range)
    }

    /// Resolves every scheduled deletion as abandoned. Called by the owning
    /// runtime when this collection incarnation is replaced or cleared.
    pub fn abandon(&self) {
        info!(nss = %self.nss, uuid = %self.uuid, "Abandoning metadata manager");
        self.queue.abandon();
    }

    /// Decrements a snapshot's reader count and retires whatever became
    /// droppable.
    fn release(&self, tracker_id: u64) {
        let ready = {
            let mut inner = self.lock_inner();
            if let Some(tracker) = inner.trackers.iter_mut().find(|t| t.id == tracker_id) {
                debug_assert!(tracker.uses > 0, "release without matching acquire");
                tracker.uses = tracker.uses.saturating_sub(1);
            }
            Self::retire_expired(&mut inner, &self.queue)
        };
        self.spawn_ready(ready);
    }

    /// Increments a snapshot's reader count (handle clone).
    fn retain(&self, tracker_id: u64) {
        let mut inner = self.lock_inner();
        if let Some(tracker) = inner.trackers.iter_mut().find(|t| t.id == tracker_id) {
            tracker.uses += 1;
        }
    }

    /// Drops every snapshot with no readers that has a newer successor, and
    /// returns the deletions that became runnable.
    fn retire_expired(inner: &mut ManagerInner, queue: &DeletionQueue) -> Vec<ReadyDeletion> {
        let active_id = inner
            .trackers
            .back()
            .expect("manager retains at least one snapshot")
            .id;
        let mut retired = Vec::new();
        inner.trackers.retain(|t| {
            if t.id != active_id && t.uses == 0 {
                retired.push(t.id);
                false
            } else {
                true
            }
        });

        let mut ready = Vec::new();
        for id in retired {
            ready.extend(queue.release_tracker(id));
        }
        ready
    }

    /// Hands runnable deletions to the deleter executor on detached tasks.
    fn spawn_ready(&self, ready: Vec<ReadyDeletion>) {
        for task in ready {
            let queue = Arc::clone(&self.queue);
            let deleter = Arc::clone(&self.deleter);
            let nss = self.nss.clone();
            let uuid = self.uuid;
            let delay = Duration::from_micros(self.config.delay_us);
            tokio::spawn(async move {
                if task.delayed {
                    tokio::time::sleep(delay).await;
                }
                let outcome = match deleter.delete_range(&nss, uuid, &task.range).await {
                    Ok(()) => {
                        debug!(nss = %nss, range = %task.range, "Deleted orphaned range");
                        CleanupOutcome::Done
                    }
                    Err(RangeDeletionError::Abandoned { .. }) => {
                        debug!(nss = %nss, range = %task.range, "Range deletion abandoned");
                        CleanupOutcome::Abandoned
                    }
                    Err(RangeDeletionError::Failed { reason }) => {
                        warn!(nss = %nss, range = %task.range, reason = %reason, "Range deletion failed");
                        CleanupOutcome::Failed(reason)
                    }
                };
                queue.complete(task.task_id, outcome);
            });
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("metadata manager poisoned")
    }
}

impl Drop for MetadataManager {
    fn drop(&mut self) {
        // Unresolved waiters observe abandonment when the queue goes away.
        self.queue.abandon();
    }
}

impl std::fmt::Debug for MetadataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataManager")
            .field("nss", &self.nss)
            .field("uuid", &self.uuid)
            .field("snapshots", &self.snapshot_count())
            .finish_non_exhaustive()
    }
}

/// A refcounted reader handle on one routing snapshot.
///
/// The snapshot it dereferences to is immutable and stays retained until the
/// handle (and every clone) is dropped.
pub struct ScopedMetadata {
    manager: Arc<MetadataManager>,
    tracker_id: u64,
    metadata: Arc<CollectionMetadata>,
}

impl ScopedMetadata {
    /// The snapshot this handle retains.
    #[must_use]
    pub fn metadata(&self) -> &CollectionMetadata {
        &self.metadata
    }
}

impl std::ops::Deref for ScopedMetadata {
    type Target = CollectionMetadata;

    fn deref(&self) -> &Self::Target {
        &self.metadata
    }
}

impl Clone for ScopedMetadata {
    fn clone(&self) -> Self {
        self.manager.retain(self.tracker_id);
        Self {
            manager: Arc::clone(&self.manager),
            tracker_id: self.tracker_id,
            metadata: Arc::clone(&self.metadata),
        }
    }
}

impl Drop for ScopedMetadata {
    fn drop(&mut self) {
        self.manager.release(self.tracker_id);
    }
}

impl std::fmt::Debug for ScopedMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ScopedMetadata({}, {})",
            self.metadata.uuid(),
            self.metadata.collection_version()
        )
    }
}
