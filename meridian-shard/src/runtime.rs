//! Per-collection shard state - the façade that checks routing versions,
//! owns the metadata manager, and coordinates critical sections and
//! refreshes.
//!
//! # Locking
//!
//! Each state holds a read-write coordination lock over its filtering state,
//! critical section, and refresh slot. Readers (version checks, signal
//! fetches) take it shared; mutators (metadata installs, critical-section
//! transitions, refresh-slot updates) take it exclusive. The metadata
//! manager's own lock nests strictly inside. No lock is held across an
//! await point.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use meridian_core::{CollectionUuid, MigrationId, Namespace, ShardId};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::chunk::ChunkRange;
use crate::critical_section::{MigrationCriticalSection, OperationIntent, SectionSignal};
use crate::deletion::{CleanupOutcome, CleanupWaiter, RangeDeleter, RangeDeleterConfig};
use crate::error::{ShardError, ShardResult, StaleReason};
use crate::manager::{MetadataManager, ScopedMetadata};
use crate::metadata::CollectionMetadata;
use crate::version::ShardVersion;

/// An operation's routing context, as declared by the router that sent it.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    /// The shard version the router believed this shard holds, if any.
    /// Unversioned operations are admitted as unsharded.
    pub received_version: Option<ShardVersion>,
    /// Whether the operation reads or writes.
    pub intent: OperationIntent,
    /// Requested point-in-time, for snapshot reads.
    pub at_cluster_time: Option<u64>,
    /// Whether the operation carries database-version context. Descriptive
    /// reads without any routing context see the collection as unsharded.
    pub has_db_version: bool,
}

impl OperationDescriptor {
    /// An operation that declares no routing version.
    #[must_use]
    pub const fn unversioned(intent: OperationIntent) -> Self {
        Self {
            received_version: None,
            intent,
            at_cluster_time: None,
            has_db_version: false,
        }
    }

    /// An operation declaring the given shard version.
    #[must_use]
    pub const fn versioned(intent: OperationIntent, version: ShardVersion) -> Self {
        Self {
            received_version: Some(version),
            intent,
            at_cluster_time: None,
            has_db_version: false,
        }
    }

    /// Requests a point-in-time read at the given cluster time.
    #[must_use]
    pub const fn at_cluster_time(mut self, time: u64) -> Self {
        self.at_cluster_time = Some(time);
        self
    }

    /// Marks the operation as carrying database-version context.
    #[must_use]
    pub const fn with_db_version(mut self) -> Self {
        self.has_db_version = true;
        self
    }
}

/// A new authoritative routing state to install.
#[derive(Debug)]
pub enum MetadataUpdate {
    /// The collection is not sharded.
    Unsharded,
    /// The collection is sharded with this routing snapshot.
    Sharded(CollectionMetadata),
}

/// What a descriptive caller sees of the collection's sharding state.
#[derive(Debug, Clone)]
pub enum CollectionDescription {
    /// The collection is unsharded; every document is local.
    Unsharded,
    /// The collection is sharded; the handle retains the snapshot.
    Sharded(ScopedMetadata),
}

impl CollectionDescription {
    /// Returns true if the collection is sharded.
    #[must_use]
    pub const fn is_sharded(&self) -> bool {
        matches!(self, Self::Sharded(_))
    }

    /// The shard version carried by this description.
    #[must_use]
    pub fn shard_version(&self) -> ShardVersion {
        match self {
            Self::Unsharded => ShardVersion::UNSHARDED,
            Self::Sharded(metadata) => metadata.shard_version(),
        }
    }

    /// The retained snapshot, when sharded.
    #[must_use]
    pub const fn metadata(&self) -> Option<&ScopedMetadata> {
        match self {
            Self::Unsharded => None,
            Self::Sharded(metadata) => Some(metadata),
        }
    }
}

/// Whether an ownership-filter caller also intends to clean orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanCleanupPolicy {
    /// The caller may observe and act on orphaned ranges.
    Allow,
    /// The caller only filters documents.
    Disallow,
}

/// When a scheduled range cleanup may begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanWhen {
    /// As soon as no retained snapshot covers the range.
    Now,
    /// After the configured grace period, once no snapshot covers it.
    Delayed,
}

/// A filter over document ownership, derived from an admitted snapshot.
///
/// Operations use it to skip documents this shard holds physically but does
/// not own under the admitted routing version.
#[derive(Debug, Clone)]
pub struct OwnershipFilter {
    description: CollectionDescription,
}

impl OwnershipFilter {
    /// Returns true if this shard owns the document with the given key.
    #[must_use]
    pub fn owns_key(&self, key: &[u8]) -> bool {
        match &self.description {
            CollectionDescription::Unsharded => true,
            CollectionDescription::Sharded(metadata) => metadata.owns_key(key),
        }
    }

    /// Returns true if the filter is over a sharded snapshot.
    #[must_use]
    pub const fn is_sharded(&self) -> bool {
        self.description.is_sharded()
    }

    /// The version of the snapshot the filter was admitted under.
    #[must_use]
    pub fn shard_version(&self) -> ShardVersion {
        self.description.shard_version()
    }

    /// The underlying description.
    #[must_use]
    pub const fn description(&self) -> &CollectionDescription {
        &self.description
    }
}

/// A shareable signal completing when an in-flight refresh finishes.
#[derive(Debug, Clone)]
pub struct RefreshWaiter {
    rx: watch::Receiver<bool>,
}

impl RefreshWaiter {
    /// Creates a completion/waiter pair for one refresh attempt.
    #[must_use]
    pub fn pair() -> (RefreshCompletion, Self) {
        let (tx, rx) = watch::channel(false);
        (RefreshCompletion { tx }, Self { rx })
    }

    /// Waits until the refresh completes or its driver gives up.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Driver dropped the completion: the refresh is over either
                // way; the caller re-reads the state.
                return;
            }
        }
    }

    /// Returns true if the refresh already completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Held by the caller driving a refresh; completing it wakes every waiter.
#[derive(Debug)]
pub struct RefreshCompletion {
    tx: watch::Sender<bool>,
}

impl RefreshCompletion {
    /// Marks the refresh complete.
    pub fn complete(self) {
        let _ = self.tx.send(true);
    }
}

enum FilteringState {
    Unknown,
    Unsharded,
    Sharded(Arc<MetadataManager>),
}

struct StateInner {
    filtering: FilteringState,
    critical_section: MigrationCriticalSection,
    refresh: Option<RefreshWaiter>,
    manager_changes: u64,
}

/// Shard-side routing state for one collection.
///
/// Combines the snapshot cache, the migration critical section, and the
/// refresh-coordination slot, and performs the version check every incoming
/// operation goes through.
pub struct CollectionShardState {
    nss: Namespace,
    this_shard: ShardId,
    sharding_enabled: bool,
    deleter: Arc<dyn RangeDeleter>,
    deleter_config: RangeDeleterConfig,
    state: RwLock<StateInner>,
}

impl CollectionShardState {
    /// Creates the state for one collection.
    ///
    /// Namespaces that can never be sharded start out `Unsharded`; all
    /// others start `Unknown` until a refresh installs metadata.
    #[must_use]
    pub fn new(
        nss: Namespace,
        this_shard: ShardId,
        sharding_enabled: bool,
        deleter: Arc<dyn RangeDeleter>,
        deleter_config: RangeDeleterConfig,
    ) -> Self {
        let filtering = if nss.is_always_unsharded() {
            FilteringState::Unsharded
        } else {
            FilteringState::Unknown
        };
        Self {
            nss,
            this_shard,
            sharding_enabled,
            deleter,
            deleter_config,
            state: RwLock::new(StateInner {
                filtering,
                critical_section: MigrationCriticalSection::new(),
                refresh: None,
                manager_changes: 0,
            }),
        }
    }

    /// The collection this state serves.
    #[must_use]
    pub const fn nss(&self) -> &Namespace {
        &self.nss
    }

    /// This shard's identity.
    #[must_use]
    pub const fn this_shard(&self) -> ShardId {
        self.this_shard
    }

    // -------------------------------------------------------------------------
    // Version checks
    // -------------------------------------------------------------------------

    /// Checks the operation's declared routing version against the cached
    /// state, rejecting stale callers.
    ///
    /// # Errors
    ///
    /// See [`Self::metadata_with_version_check`] for the dispatch.
    pub fn check_shard_version(&self, op: &OperationDescriptor) -> ShardResult<()> {
        self.metadata_with_version_check(op).map(drop)
    }

    /// Runs the version check and returns the admitted snapshot as an
    /// ownership filter.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::check_shard_version`].
    ///
    /// # Panics
    ///
    /// Panics if the operation declares no shard version: filtering without
    /// a version is a caller bug.
    pub fn get_ownership_filter(
        &self,
        op: &OperationDescriptor,
        _orphan_policy: OrphanCleanupPolicy,
    ) -> ShardResult<OwnershipFilter> {
        let received = op
            .received_version
            .expect("get_ownership_filter called by an operation with no declared shard version");

        let description = self.metadata_with_version_check(op)?;
        if let CollectionDescription::Sharded(metadata) = &description {
            // An ignored version may only rely on the filter when migrations
            // are suspended for the collection.
            assert!(
                !received.is_ignored() || !metadata.allow_migrations(),
                "ownership filter for a sharded collection cannot be relied on \
                 without a valid shard version"
            );
        }
        Ok(OwnershipFilter { description })
    }

    /// Returns the collection description without any version check.
    ///
    /// Descriptive callers with no routing context (and processes where
    /// sharding is not enabled) see the collection as unsharded.
    ///
    /// # Errors
    ///
    /// Fails with a stale-config rejection when the sharding state is not
    /// currently known and must be recovered first.
    pub fn get_collection_description(
        &self,
        op: &OperationDescriptor,
    ) -> ShardResult<CollectionDescription> {
        if !self.sharding_enabled || (op.received_version.is_none() && !op.has_db_version) {
            return Ok(CollectionDescription::Unsharded);
        }

        let inner = self.read_state();
        self.description_if_known(&inner, None)?
            .ok_or_else(|| ShardError::StaleConfig {
                nss: self.nss.clone(),
                received: ShardVersion::UNSHARDED,
                wanted: None,
                shard: self.this_shard,
                reason: StaleReason::MetadataUnknown,
                critical_section: None,
            })
    }

    /// Returns the current description when the state is known, without
    /// version checking. Diagnostics only.
    #[must_use]
    pub fn current_metadata_if_known(&self) -> Option<CollectionDescription> {
        let inner = self.read_state();
        self.description_if_known(&inner, None).ok().flatten()
    }

    /// The version check behind every admitted operation.
    ///
    /// Dispatch, in order: unversioned operations are admitted as unsharded;
    /// unknown state rejects asking for recovery; an active critical section
    /// blocking the operation's intent rejects with its exit signal; a
    /// write-compatible or ignored version admits; epoch mismatch, unset
    /// wanted vs set received, and set wanted vs unset received each reject
    /// terminally; a remaining major mismatch rejects as stale. Minor-only
    /// differences admit inside write compatibility.
    ///
    /// # Errors
    ///
    /// [`ShardError::StaleConfig`], [`ShardError::StaleEpoch`], or
    /// [`ShardError::StaleClusterTime`] per the dispatch above.
    pub fn metadata_with_version_check(
        &self,
        op: &OperationDescriptor,
    ) -> ShardResult<CollectionDescription> {
        let Some(received) = op.received_version else {
            return Ok(CollectionDescription::Unsharded);
        };

        let inner = self.read_state();

        let stale = |wanted: Option<ShardVersion>,
                     reason: StaleReason,
                     critical_section: Option<SectionSignal>| {
            ShardError::StaleConfig {
                nss: self.nss.clone(),
                received,
                wanted,
                shard: self.this_shard,
                reason,
                critical_section,
            }
        };

        let Some(description) = self.description_if_known(&inner, op.at_cluster_time)? else {
            return Err(stale(None, StaleReason::MetadataUnknown, None));
        };

        let wanted = description.shard_version();

        if let Some(signal) = inner.critical_section.signal(op.intent) {
            return Err(stale(
                Some(wanted),
                StaleReason::MigrationCriticalSection,
                Some(signal),
            ));
        }

        if wanted.is_write_compatible_with(&received) || received.is_ignored() {
            return Ok(description);
        }

        if wanted.epoch != received.epoch {
            return Err(ShardError::StaleEpoch {
                nss: self.nss.clone(),
                received,
                wanted,
            });
        }

        if !wanted.is_set() && received.is_set() {
            return Err(stale(Some(wanted), StaleReason::NoLongerOwnsChunks, None));
        }

        if wanted.is_set() && !received.is_set() {
            return Err(stale(Some(wanted), StaleReason::ExpectedUnsharded, None));
        }

        // Same epoch, both set, not write-compatible: the majors differ.
        Err(stale(Some(wanted), StaleReason::VersionMismatch, None))
    }

    // -------------------------------------------------------------------------
    // Metadata installs
    // -------------------------------------------------------------------------

    /// Installs a new authoritative routing state.
    ///
    /// A sharded update for the incarnation the current manager serves is
    /// forwarded to it; anything else (first install, unsharded flip, UUID
    /// change) replaces the manager, abandoning the old one's scheduled
    /// cleanups.
    ///
    /// # Panics
    ///
    /// Panics if a sharded snapshot is installed for a namespace that can
    /// never be sharded.
    pub fn set_filtering_metadata(&self, update: MetadataUpdate) {
        let mut inner = self.write_state();
        self.apply_update(&mut inner, update);
    }

    /// Clears the cached routing state back to `Unknown`.
    ///
    /// Invoked when an authoritative state change is observed (for example a
    /// replicated catalog update). No-op for namespaces that can never be
    /// sharded. Does not cancel an in-flight refresh.
    pub fn clear_filtering_metadata(&self) {
        if self.nss.is_always_unsharded() {
            return;
        }
        let mut inner = self.write_state();
        debug!(nss = %self.nss, "Clearing collection metadata");
        if let FilteringState::Sharded(manager) = &inner.filtering {
            manager.abandon();
            inner.manager_changes += 1;
        }
        inner.filtering = FilteringState::Unknown;
    }

    /// Installs the result of a refresh, unless the state moved underneath
    /// the refresher.
    ///
    /// The install proceeds when the state is still `Unknown`, or when the
    /// active manager serves `expected_uuid`. Returns whether the result was
    /// installed; a discarded result means the refresher raced a clear or a
    /// competing install and its snapshot is no longer authoritative.
    pub fn install_refreshed_metadata(
        &self,
        expected_uuid: Option<CollectionUuid>,
        update: MetadataUpdate,
    ) -> bool {
        let mut inner = self.write_state();
        let installable = match &inner.filtering {
            FilteringState::Unknown => true,
            FilteringState::Sharded(manager) => Some(manager.collection_uuid()) == expected_uuid,
            FilteringState::Unsharded => false,
        };
        if !installable {
            debug!(
                nss = %self.nss,
                ?expected_uuid,
                "Discarding refreshed metadata: state changed during refresh"
            );
            return false;
        }
        self.apply_update(&mut inner, update);
        true
    }

    /// Diagnostic counter of manager creations, replacements, and drops.
    #[must_use]
    pub fn metadata_manager_changes(&self) -> u64 {
        self.read_state().manager_changes
    }

    // -------------------------------------------------------------------------
    // Critical section
    // -------------------------------------------------------------------------

    /// Enters the catch-up phase of the migration critical section.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if a section with a
    /// different reason is active.
    pub fn enter_critical_section_catch_up(&self, reason: &str) -> ShardResult<()> {
        info!(nss = %self.nss, reason, "Entering critical section (catch-up)");
        self.write_state().critical_section.enter_catch_up(reason)
    }

    /// Advances the critical section to the commit phase.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` on a reason mismatch or
    /// when no section is active.
    pub fn enter_critical_section_commit(&self, reason: &str) -> ShardResult<()> {
        info!(nss = %self.nss, reason, "Entering critical section (commit)");
        self.write_state().critical_section.enter_commit(reason)
    }

    /// Rolls the critical section back from commit to catch-up
    /// (migration abort).
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` on a reason mismatch or
    /// when no commit-phase section is active.
    pub fn rollback_critical_section_to_catch_up(&self, reason: &str) -> ShardResult<()> {
        info!(nss = %self.nss, reason, "Rolling critical section back to catch-up");
        self.write_state()
            .critical_section
            .rollback_to_catch_up(reason)
    }

    /// Exits the critical section, waking all signal holders.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if the active section
    /// carries a different reason.
    pub fn exit_critical_section(&self, reason: &str) -> ShardResult<()> {
        info!(nss = %self.nss, reason, "Exiting critical section");
        self.write_state().critical_section.exit(reason)
    }

    /// Exits the critical section without verifying the reason.
    /// Recovery-path only.
    pub fn exit_critical_section_no_checks(&self) {
        self.write_state().critical_section.exit_no_checks();
    }

    /// Returns a signal completing when the critical section exits, if one
    /// is active and blocks the given intent.
    #[must_use]
    pub fn critical_section_signal(&self, intent: OperationIntent) -> Option<SectionSignal> {
        self.read_state().critical_section.signal(intent)
    }

    // -------------------------------------------------------------------------
    // Orphan cleanup
    // -------------------------------------------------------------------------

    /// Schedules deletion of a range this shard no longer owns.
    ///
    /// Returns a waiter completing when the physical deletion finishes.
    ///
    /// # Panics
    ///
    /// Panics if the collection is not in the sharded state: migrations only
    /// run against sharded collections.
    pub fn clean_up_range(
        &self,
        range: ChunkRange,
        migration_id: Option<MigrationId>,
        when: CleanWhen,
    ) -> CleanupWaiter {
        let manager = {
            let inner = self.read_state();
            match &inner.filtering {
                FilteringState::Sharded(manager) => Arc::clone(manager),
                _ => panic!("clean_up_range on a collection that is not sharded"),
            }
        };
        manager.clean_up_range(range, migration_id, when == CleanWhen::Delayed)
    }

    /// Number of range deletions scheduled but not yet finished.
    #[must_use]
    pub fn number_of_ranges_scheduled_for_deletion(&self) -> usize {
        match &self.read_state().filtering {
            FilteringState::Sharded(manager) => manager.number_of_ranges_scheduled_for_deletion(),
            _ => 0,
        }
    }

    /// Waits until no scheduled deletion overlaps `range`.
    ///
    /// Abandoned deletions count as success: the range is gone either way.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if the metadata was reset
    /// or the collection was dropped and recreated while waiting; with
    /// `ExceededTimeLimit` past the deadline; with `OrphanCleanupFailed`
    /// when a deletion failed outright.
    pub async fn wait_for_clean(
        &self,
        uuid: CollectionUuid,
        range: ChunkRange,
        timeout_us: u64,
    ) -> ShardResult<()> {
        let deadline = Duration::from_micros(timeout_us);
        let wait = async {
            loop {
                let waiter = {
                    let inner = self.read_state();
                    let FilteringState::Sharded(manager) = &inner.filtering else {
                        return Err(ShardError::ConflictingOperationInProgress {
                            reason: format!(
                                "collection {} had its metadata reset while awaiting \
                                 orphan cleanup",
                                self.nss
                            ),
                        });
                    };
                    if manager.collection_uuid() != uuid {
                        return Err(ShardError::ConflictingOperationInProgress {
                            reason: format!(
                                "collection {} was dropped and recreated while awaiting \
                                 orphan cleanup",
                                self.nss
                            ),
                        });
                    }
                    manager.track_orphaned_data_cleanup(&range)
                };

                let Some(mut waiter) = waiter else {
                    info!(nss = %self.nss, range = %range, "Finished waiting for deletion of orphans");
                    return Ok(());
                };

                debug!(nss = %self.nss, range = %range, "Waiting for deletion of orphans");
                match waiter.wait().await {
                    // Abandoned means the collection incarnation is gone;
                    // the range is gone with it.
                    CleanupOutcome::Done | CleanupOutcome::Abandoned => {}
                    CleanupOutcome::Failed(reason) => {
                        return Err(ShardError::OrphanCleanupFailed {
                            nss: self.nss.clone(),
                            range: range.clone(),
                            reason,
                        });
                    }
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(ShardError::ExceededTimeLimit {
                operation: "wait_for_clean",
                waited_us: timeout_us,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Refresh coordination
    // -------------------------------------------------------------------------

    /// Publishes the in-flight refresh so concurrent stale callers can wait
    /// on it instead of racing their own.
    ///
    /// # Panics
    ///
    /// Panics if a refresh is already published: overlapping refresh drivers
    /// are a programming error.
    pub fn set_refresh_future(&self, waiter: RefreshWaiter) {
        let mut inner = self.write_state();
        assert!(
            inner.refresh.is_none(),
            "a shard version refresh is already in progress"
        );
        inner.refresh = Some(waiter);
    }

    /// Returns the in-flight refresh, if one is published.
    #[must_use]
    pub fn refresh_future(&self) -> Option<RefreshWaiter> {
        self.read_state().refresh.clone()
    }

    /// Clears the published refresh.
    ///
    /// # Panics
    ///
    /// Panics if no refresh is published.
    pub fn clear_refresh_future(&self) {
        let mut inner = self.write_state();
        assert!(
            inner.refresh.is_some(),
            "no shard version refresh is in progress"
        );
        inner.refresh = None;
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn apply_update(&self, inner: &mut StateInner, update: MetadataUpdate) {
        match update {
            MetadataUpdate::Unsharded => {
                info!(nss = %self.nss, "Marking collection as unsharded");
                if let FilteringState::Sharded(manager) = &inner.filtering {
                    manager.abandon();
                }
                inner.filtering = FilteringState::Unsharded;
                inner.manager_changes += 1;
            }
            MetadataUpdate::Sharded(new) => {
                assert!(
                    !self.nss.is_always_unsharded(),
                    "namespace {} must never be sharded",
                    self.nss
                );
                match &inner.filtering {
                    FilteringState::Sharded(manager)
                        if manager.collection_uuid() == new.uuid() =>
                    {
                        manager.set_filtering_metadata(new);
                    }
                    _ => {
                        if let FilteringState::Sharded(old) = &inner.filtering {
                            old.abandon();
                        }
                        info!(
                            nss = %self.nss,
                            uuid = %new.uuid(),
                            version = %new.collection_version(),
                            "Creating metadata manager"
                        );
                        let manager = Arc::new(MetadataManager::new(
                            self.nss.clone(),
                            new,
                            Arc::clone(&self.deleter),
                            self.deleter_config,
                        ));
                        inner.filtering = FilteringState::Sharded(manager);
                        inner.manager_changes += 1;
                    }
                }
            }
        }
    }

    /// Reads the current description under the held coordination lock.
    fn description_if_known(
        &self,
        inner: &StateInner,
        at_cluster_time: Option<u64>,
    ) -> ShardResult<Option<CollectionDescription>> {
        match &inner.filtering {
            FilteringState::Unknown => Ok(None),
            FilteringState::Unsharded => Ok(Some(CollectionDescription::Unsharded)),
            FilteringState::Sharded(manager) => Ok(Some(CollectionDescription::Sharded(
                MetadataManager::get_active_metadata(manager, at_cluster_time)?,
            ))),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StateInner> {
        self.state.read().expect("collection shard state poisoned")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StateInner> {
        self.state.write().expect("collection shard state poisoned")
    }
}

impl std::fmt::Debug for CollectionShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionShardState")
            .field("nss", &self.nss)
            .field("shard", &self.this_shard)
            .finish_non_exhaustive()
    }
}

/// RAII helper that holds the collection critical section for the duration
/// of a migration commit.
///
/// Enters the catch-up phase on construction; [`Self::enter_commit`]
/// advances it; dropping the guard exits the section.
pub struct CollectionCriticalSectionGuard {
    state: Arc<CollectionShardState>,
    reason: String,
}

impl CollectionCriticalSectionGuard {
    /// Enters the catch-up phase for `reason`.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if another section is
    /// active.
    ///
    /// # Panics
    ///
    /// Panics if the collection's metadata is not known: migrations never
    /// run against an unrecovered collection.
    pub fn enter(
        state: Arc<CollectionShardState>,
        reason: impl Into<String>,
    ) -> ShardResult<Self> {
        assert!(
            state.current_metadata_if_known().is_some(),
            "critical section entered with unknown collection metadata"
        );
        let reason = reason.into();
        state.enter_critical_section_catch_up(&reason)?;
        Ok(Self { state, reason })
    }

    /// Advances the held section to the commit phase.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` on a reason mismatch.
    pub fn enter_commit(&self) -> ShardResult<()> {
        self.state.enter_critical_section_commit(&self.reason)
    }
}

impl Drop for CollectionCriticalSectionGuard {
    fn drop(&mut self) {
        // The section may already have been exited through the state.
        let _ = self.state.exit_critical_section(&self.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::max_key;
    use crate::deletion::SimulatedRangeDeleter;
    use crate::version::Epoch;
    use bytes::Bytes;

    const SHARD_A: ShardId = ShardId::new(1);
    const SHARD_B: ShardId = ShardId::new(2);
    const EPOCH: Epoch = Epoch::new(7);

    fn state_for(nss: &str) -> CollectionShardState {
        CollectionShardState::new(
            Namespace::parse(nss).unwrap(),
            SHARD_A,
            true,
            Arc::new(SimulatedRangeDeleter::new()),
            RangeDeleterConfig { delay_us: 0 },
        )
    }

    fn metadata(uuid: u64, major: u32) -> CollectionMetadata {
        CollectionMetadata::new(
            CollectionUuid::new(uuid),
            "{ user_id: 1 }",
            SHARD_A,
            vec![
                (
                    ChunkRange::new(Bytes::new(), Bytes::from_static(b"m")).unwrap(),
                    SHARD_A,
                    ShardVersion::new(EPOCH, major, 0),
                ),
                (
                    ChunkRange::new(Bytes::from_static(b"m"), max_key()).unwrap(),
                    SHARD_B,
                    ShardVersion::new(EPOCH, major, 1),
                ),
            ],
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_always_unsharded_namespace_starts_unsharded() {
        let state = state_for("local.startup_log");
        assert!(matches!(
            state.current_metadata_if_known(),
            Some(CollectionDescription::Unsharded)
        ));
    }

    #[test]
    fn test_unknown_state_admits_unversioned() {
        let state = state_for("db.orders");
        let op = OperationDescriptor::unversioned(OperationIntent::Read);
        assert!(state.check_shard_version(&op).is_ok());
    }

    #[test]
    fn test_unknown_state_rejects_versioned() {
        let state = state_for("db.orders");
        let op = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(EPOCH, 1, 0),
        );
        let err = state.check_shard_version(&op).unwrap_err();
        assert!(matches!(
            err,
            ShardError::StaleConfig {
                wanted: None,
                reason: StaleReason::MetadataUnknown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_write_compatible_and_ignored_admit() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        // Exact match and minor-only difference both admit.
        for minor in [0, 7] {
            let op = OperationDescriptor::versioned(
                OperationIntent::Write,
                ShardVersion::new(EPOCH, 5, minor),
            );
            assert!(state.check_shard_version(&op).is_ok());
        }

        let ignored =
            OperationDescriptor::versioned(OperationIntent::Write, ShardVersion::IGNORED);
        assert!(state.check_shard_version(&ignored).is_ok());
    }

    #[tokio::test]
    async fn test_major_mismatch_rejects() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        let op = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(EPOCH, 4, 2),
        );
        let err = state.check_shard_version(&op).unwrap_err();
        match err {
            ShardError::StaleConfig {
                received,
                wanted,
                reason,
                ..
            } => {
                assert_eq!(received, ShardVersion::new(EPOCH, 4, 2));
                assert_eq!(wanted, Some(ShardVersion::new(EPOCH, 5, 0)));
                assert_eq!(reason, StaleReason::VersionMismatch);
            }
            other => panic!("expected StaleConfig, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_epoch_mismatch_rejects_distinctly() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 3)));

        let op = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(Epoch::new(99), 3, 0),
        );
        assert!(matches!(
            state.check_shard_version(&op).unwrap_err(),
            ShardError::StaleEpoch { .. }
        ));
    }

    #[tokio::test]
    async fn test_critical_section_blocks_write_admits_read() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));
        state.enter_critical_section_catch_up("migrate orders").unwrap();

        let write = OperationDescriptor::versioned(
            OperationIntent::Write,
            ShardVersion::new(EPOCH, 5, 0),
        );
        let err = state.check_shard_version(&write).unwrap_err();
        assert!(err.critical_section_signal().is_some());
        assert!(matches!(
            err,
            ShardError::StaleConfig {
                reason: StaleReason::MigrationCriticalSection,
                ..
            }
        ));

        let read = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(EPOCH, 5, 0),
        );
        assert!(state.check_shard_version(&read).is_ok());
    }

    #[tokio::test]
    async fn test_no_longer_owns_chunks() {
        let state = state_for("db.orders");
        // Shard A owns nothing in this snapshot.
        let all_on_b = CollectionMetadata::new(
            CollectionUuid::new(10),
            "{ user_id: 1 }",
            SHARD_A,
            vec![(
                ChunkRange::new(Bytes::new(), max_key()).unwrap(),
                SHARD_B,
                ShardVersion::new(EPOCH, 6, 0),
            )],
            true,
        )
        .unwrap();
        state.set_filtering_metadata(MetadataUpdate::Sharded(all_on_b));

        let op = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(EPOCH, 6, 0),
        );
        assert!(matches!(
            state.check_shard_version(&op).unwrap_err(),
            ShardError::StaleConfig {
                reason: StaleReason::NoLongerOwnsChunks,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_expected_unsharded() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        // Same epoch, caller believes it owns no chunks here.
        let op = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(EPOCH, 0, 0),
        );
        assert!(matches!(
            state.check_shard_version(&op).unwrap_err(),
            ShardError::StaleConfig {
                reason: StaleReason::ExpectedUnsharded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ownership_filter_skips_unowned_keys() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        let op = OperationDescriptor::versioned(
            OperationIntent::Read,
            ShardVersion::new(EPOCH, 5, 0),
        );
        let filter = state
            .get_ownership_filter(&op, OrphanCleanupPolicy::Disallow)
            .unwrap();
        assert!(filter.is_sharded());
        assert!(filter.owns_key(b"alice"));
        assert!(!filter.owns_key(b"zed"));
    }

    #[tokio::test]
    async fn test_description_without_context_is_unsharded() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        let bare = OperationDescriptor::unversioned(OperationIntent::Read);
        assert!(!state.get_collection_description(&bare).unwrap().is_sharded());

        let with_db = OperationDescriptor::unversioned(OperationIntent::Read).with_db_version();
        assert!(state.get_collection_description(&with_db).unwrap().is_sharded());
    }

    #[tokio::test]
    async fn test_uuid_change_replaces_manager() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));
        assert_eq!(state.metadata_manager_changes(), 1);

        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(11, 1)));
        assert_eq!(state.metadata_manager_changes(), 2);

        // Same UUID forwards to the existing manager instead.
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(11, 2)));
        assert_eq!(state.metadata_manager_changes(), 2);
    }

    #[tokio::test]
    async fn test_clear_then_refresh_install_race() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        // Refresher observed uuid 10, but a competing install replaced the
        // incarnation before it finished: the result must be discarded.
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(11, 1)));
        assert!(!state.install_refreshed_metadata(
            Some(CollectionUuid::new(10)),
            MetadataUpdate::Sharded(metadata(10, 6)),
        ));

        // After a clear the state is Unknown: any refresh result installs.
        state.clear_filtering_metadata();
        assert!(state.install_refreshed_metadata(
            Some(CollectionUuid::new(10)),
            MetadataUpdate::Sharded(metadata(10, 6)),
        ));
    }

    #[test]
    fn test_refresh_slot_single_occupancy() {
        let state = state_for("db.orders");
        let (_completion, waiter) = RefreshWaiter::pair();
        assert!(state.refresh_future().is_none());
        state.set_refresh_future(waiter);
        assert!(state.refresh_future().is_some());
        state.clear_refresh_future();
        assert!(state.refresh_future().is_none());
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn test_double_refresh_install_panics() {
        let state = state_for("db.orders");
        let (_c1, w1) = RefreshWaiter::pair();
        let (_c2, w2) = RefreshWaiter::pair();
        state.set_refresh_future(w1);
        state.set_refresh_future(w2);
    }

    #[tokio::test]
    async fn test_refresh_waiter_wakes_on_completion() {
        let (completion, mut waiter) = RefreshWaiter::pair();
        let task = tokio::spawn(async move { waiter.wait().await });
        completion.complete();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_critical_section_guard_exits_on_drop() {
        let state = Arc::new(state_for("db.orders"));
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        {
            let guard =
                CollectionCriticalSectionGuard::enter(Arc::clone(&state), "migrate orders")
                    .unwrap();
            guard.enter_commit().unwrap();
            assert!(state.critical_section_signal(OperationIntent::Read).is_some());
        }
        assert!(state.critical_section_signal(OperationIntent::Write).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_clean_conflicts_on_uuid_change() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        let err = state
            .wait_for_clean(
                CollectionUuid::new(99),
                ChunkRange::from_static(b"a", b"m"),
                1_000_000,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardError::ConflictingOperationInProgress { .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_for_clean_immediate_when_nothing_scheduled() {
        let state = state_for("db.orders");
        state.set_filtering_metadata(MetadataUpdate::Sharded(metadata(10, 5)));

        state
            .wait_for_clean(
                CollectionUuid::new(10),
                ChunkRange::from_static(b"a", b"m"),
                1_000_000,
            )
            .await
            .unwrap();
    }
}
