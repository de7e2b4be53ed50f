//! End-to-end shard routing scenarios: version-check dispatch, migration
//! critical sections, orphan cleanup, and refresh coordination.

use std::sync::Arc;

use bytes::Bytes;
use meridian_core::{CollectionUuid, Limits, MigrationId, Namespace, ShardId};
use meridian_shard::{
    drive_refresh, max_key, ChunkRange, CleanWhen, CollectionMetadata, Epoch, MetadataUpdate,
    OperationDescriptor, OperationIntent, OrphanCleanupPolicy, RegistryConfig, RoutingSnapshot,
    ShardError, ShardStateRegistry, ShardVersion, SimulatedRangeDeleter, SimulatedSnapshotSource,
    StaleReason, VersionReport,
};

const SHARD_A: ShardId = ShardId::new(1);
const SHARD_B: ShardId = ShardId::new(2);
const EPOCH: Epoch = Epoch::new(42);
const UUID: CollectionUuid = CollectionUuid::new(10);

fn nss() -> Namespace {
    Namespace::parse("testdb.orders").unwrap()
}

fn registry_with(deleter: Arc<SimulatedRangeDeleter>) -> ShardStateRegistry {
    let mut limits = Limits::new();
    // Keep the grace delay short so delayed deletions finish inside tests.
    limits.range_deletion_delay_us = 1_000;
    ShardStateRegistry::new(
        RegistryConfig {
            this_shard: SHARD_A,
            config_server: "config/cfg1:27019".to_string(),
            sharding_enabled: true,
            limits,
        },
        deleter,
    )
}

/// Shard A owns [min, "m"), shard B owns the rest.
fn split_metadata(major: u32) -> CollectionMetadata {
    CollectionMetadata::new(
        UUID,
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

/// Shard B owns everything; shard A's chunk was donated away.
fn donated_metadata(major: u32) -> CollectionMetadata {
    CollectionMetadata::new(
        UUID,
        "{ user_id: 1 }",
        SHARD_A,
        vec![(
            ChunkRange::new(Bytes::new(), max_key()).unwrap(),
            SHARD_B,
            ShardVersion::new(EPOCH, major, 0),
        )],
        true,
    )
    .unwrap()
}

#[tokio::test]
async fn test_fresh_shard_admits_unversioned_read() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());

    let op = OperationDescriptor::unversioned(OperationIntent::Read);
    state.check_shard_version(&op).unwrap();
}

#[tokio::test]
async fn test_stale_major_is_rejected_with_both_versions() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(split_metadata(5)));

    let op = OperationDescriptor::versioned(
        OperationIntent::Read,
        ShardVersion::new(EPOCH, 4, 2),
    );
    match state.check_shard_version(&op).unwrap_err() {
        ShardError::StaleConfig {
            received, wanted, ..
        } => {
            assert_eq!(received, ShardVersion::new(EPOCH, 4, 2));
            assert_eq!(wanted, Some(ShardVersion::new(EPOCH, 5, 0)));
        }
        other => panic!("expected StaleConfig, got {other:?}"),
    }
}

#[tokio::test]
async fn test_epoch_change_is_rejected_as_stale_epoch() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(split_metadata(3)));

    let op = OperationDescriptor::versioned(
        OperationIntent::Read,
        ShardVersion::new(Epoch::new(43), 3, 0),
    );
    assert!(matches!(
        state.check_shard_version(&op).unwrap_err(),
        ShardError::StaleEpoch { .. }
    ));
}

#[tokio::test]
async fn test_critical_section_blocks_writes_and_signals() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(split_metadata(5)));
    state
        .enter_critical_section_catch_up("migrate testdb.orders")
        .unwrap();

    let matching = ShardVersion::new(EPOCH, 5, 0);
    let write = OperationDescriptor::versioned(OperationIntent::Write, matching);
    let err = state.check_shard_version(&write).unwrap_err();
    let mut signal = err
        .critical_section_signal()
        .expect("rejection must carry the section signal");

    // The same operation as a read is admitted during catch-up.
    let read = OperationDescriptor::versioned(OperationIntent::Read, matching);
    state.check_shard_version(&read).unwrap();

    // A waiter on the signal wakes when the migration finishes.
    let waiter = tokio::spawn(async move { signal.wait().await });
    state
        .enter_critical_section_commit("migrate testdb.orders")
        .unwrap();
    state
        .exit_critical_section("migrate testdb.orders")
        .unwrap();
    waiter.await.unwrap();

    state.check_shard_version(&write).unwrap();
}

#[tokio::test]
async fn test_migration_end_to_end_with_orphan_cleanup() {
    let deleter = Arc::new(SimulatedRangeDeleter::new());
    let registry = registry_with(Arc::clone(&deleter));
    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(split_metadata(5)));

    // A long-running read pins the pre-migration snapshot.
    let read = OperationDescriptor::versioned(
        OperationIntent::Read,
        ShardVersion::new(EPOCH, 5, 0),
    );
    let filter = state
        .get_ownership_filter(&read, OrphanCleanupPolicy::Allow)
        .unwrap();
    assert!(filter.owns_key(b"alice"));

    // The migration donates [min, "m") to shard B and schedules cleanup.
    state
        .enter_critical_section_catch_up("migrate testdb.orders")
        .unwrap();
    state
        .enter_critical_section_commit("migrate testdb.orders")
        .unwrap();
    state.set_filtering_metadata(MetadataUpdate::Sharded(donated_metadata(6)));
    state
        .exit_critical_section("migrate testdb.orders")
        .unwrap();

    let orphan = ChunkRange::new(Bytes::new(), Bytes::from_static(b"m")).unwrap();
    let mut waiter = state.clean_up_range(orphan.clone(), Some(MigrationId::new(1)), CleanWhen::Delayed);

    // Physical deletion must not start while the old snapshot has a reader.
    tokio::task::yield_now().await;
    assert_eq!(deleter.deletion_count(), 0);
    assert!(state.number_of_ranges_scheduled_for_deletion() > 0);

    // Releasing the reader unblocks the deletion; wait_for_clean drains it.
    drop(filter);
    state
        .wait_for_clean(UUID, orphan.clone(), 5_000_000)
        .await
        .unwrap();
    assert_eq!(deleter.deletion_count(), 1);
    assert_eq!(deleter.deleted_ranges()[0], orphan);
    waiter.wait().await;
}

#[tokio::test]
async fn test_wait_for_clean_fails_across_incarnations() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(split_metadata(5)));

    // The collection is dropped and recreated under a new UUID mid-wait.
    let recreated = CollectionMetadata::new(
        CollectionUuid::new(11),
        "{ user_id: 1 }",
        SHARD_A,
        vec![(
            ChunkRange::new(Bytes::new(), max_key()).unwrap(),
            SHARD_A,
            ShardVersion::new(Epoch::new(43), 1, 0),
        )],
        true,
    )
    .unwrap();
    state.set_filtering_metadata(MetadataUpdate::Sharded(recreated));

    let err = state
        .wait_for_clean(
            UUID,
            ChunkRange::new(Bytes::new(), Bytes::from_static(b"m")).unwrap(),
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
async fn test_refresh_recovers_unknown_state() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());

    let op = OperationDescriptor::versioned(
        OperationIntent::Read,
        ShardVersion::new(EPOCH, 5, 0),
    );
    assert!(matches!(
        state.check_shard_version(&op).unwrap_err(),
        ShardError::StaleConfig {
            reason: StaleReason::MetadataUnknown,
            ..
        }
    ));

    let source = SimulatedSnapshotSource::new();
    source.set_snapshot(nss(), RoutingSnapshot::Sharded(split_metadata(5)));
    assert!(drive_refresh(&state, &source).await.unwrap());

    state.check_shard_version(&op).unwrap();
    assert!(state.refresh_future().is_none());
}

#[tokio::test]
async fn test_concurrent_callers_coalesce_behind_refresh() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());

    let source = Arc::new(SimulatedSnapshotSource::new());
    source.set_snapshot(nss(), RoutingSnapshot::Sharded(split_metadata(5)));

    // The second stale caller finds the published future and awaits it
    // instead of racing its own refresh.
    let refresher_state = Arc::clone(&state);
    let refresher_source = Arc::clone(&source);
    let refresher =
        tokio::spawn(async move { drive_refresh(&refresher_state, &*refresher_source).await });

    // The waiter side: poll for the published future, then await it.
    loop {
        if let Some(mut waiter) = state.refresh_future() {
            waiter.wait().await;
            break;
        }
        if refresher.is_finished() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(refresher.await.unwrap().unwrap());

    let op = OperationDescriptor::versioned(
        OperationIntent::Read,
        ShardVersion::new(EPOCH, 5, 0),
    );
    state.check_shard_version(&op).unwrap();
}

#[tokio::test]
async fn test_refresh_result_discarded_after_competing_install() {
    let registry = registry_with(Arc::new(SimulatedRangeDeleter::new()));
    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(split_metadata(5)));

    // A refresher observed uuid 10; before it installs, the collection is
    // recreated under uuid 12. Its stale snapshot must be discarded.
    let recreated = CollectionMetadata::new(
        CollectionUuid::new(12),
        "{ user_id: 1 }",
        SHARD_A,
        vec![(
            ChunkRange::new(Bytes::new(), max_key()).unwrap(),
            SHARD_A,
            ShardVersion::new(Epoch::new(44), 1, 0),
        )],
        true,
    )
    .unwrap();
    state.set_filtering_metadata(MetadataUpdate::Sharded(recreated));

    let installed = state.install_refreshed_metadata(
        Some(UUID),
        MetadataUpdate::Sharded(split_metadata(6)),
    );
    assert!(!installed);

    // The surviving incarnation is the recreated one.
    let description = state.current_metadata_if_known().unwrap();
    assert_eq!(
        description.metadata().unwrap().uuid(),
        CollectionUuid::new(12)
    );
}

#[tokio::test]
async fn test_registry_reports_versions_and_truncates_chunks() {
    let deleter = Arc::new(SimulatedRangeDeleter::new());
    let mut limits = Limits::new();
    limits.max_chunks_in_report = 4;
    let registry = ShardStateRegistry::new(
        RegistryConfig {
            this_shard: SHARD_A,
            config_server: "config/cfg1:27019".to_string(),
            sharding_enabled: true,
            limits,
        },
        deleter,
    );

    let report = registry.shard_version_report(&nss(), true);
    assert_eq!(report.global, VersionReport::Unknown);
    assert!(report.metadata.is_none());
    assert_eq!(report.config_server, "config/cfg1:27019");

    // Build a snapshot with more chunks than the report limit.
    let mut chunks = Vec::new();
    let mut min = Bytes::new();
    for i in 0..10_u32 {
        let max = if i == 9 {
            max_key()
        } else {
            Bytes::from(format!("{i:04}"))
        };
        chunks.push((
            ChunkRange::new(min, max.clone()).unwrap(),
            if i % 2 == 0 { SHARD_A } else { SHARD_B },
            ShardVersion::new(EPOCH, 1, i),
        ));
        min = max;
    }
    let metadata = CollectionMetadata::new(UUID, "{ user_id: 1 }", SHARD_A, chunks, true).unwrap();

    let state = registry.get_or_create(&nss());
    state.set_filtering_metadata(MetadataUpdate::Sharded(metadata));

    let report = registry.shard_version_report(&nss(), true);
    let metadata = report.metadata.expect("sharded full report carries metadata");
    assert_eq!(metadata.chunk_count_total, 10);
    assert_eq!(metadata.chunks.len(), 4);
    assert!(metadata.truncated);

    let versions = registry.report_versions();
    assert_eq!(versions.len(), 1);
    assert!(matches!(versions[0].1, VersionReport::Version(_)));
}
