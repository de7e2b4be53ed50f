//! The upstream refresh seam: where new routing snapshots come from.
//!
//! When a version check fails or the state is unknown, some caller drives a
//! refresh against the catalog and installs the result. Concurrent stale
//! callers coalesce behind the published refresh future instead of racing
//! refreshes of their own.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use meridian_core::Namespace;
use tracing::debug;

use crate::error::{ShardError, ShardResult};
use crate::metadata::CollectionMetadata;
use crate::runtime::{CollectionShardState, MetadataUpdate, RefreshWaiter};

/// A routing snapshot fetched from the catalog.
#[derive(Debug, Clone)]
pub enum RoutingSnapshot {
    /// The collection is not sharded.
    Unsharded,
    /// The collection's current routing table.
    Sharded(CollectionMetadata),
}

impl From<RoutingSnapshot> for MetadataUpdate {
    fn from(snapshot: RoutingSnapshot) -> Self {
        match snapshot {
            RoutingSnapshot::Unsharded => Self::Unsharded,
            RoutingSnapshot::Sharded(metadata) => Self::Sharded(metadata),
        }
    }
}

/// Fetches authoritative routing snapshots. Supplied by the host.
#[async_trait]
pub trait RoutingSnapshotSource: Send + Sync {
    /// Fetches the current routing snapshot for a collection.
    ///
    /// # Errors
    ///
    /// Returns whatever the catalog lookup surfaces; the caller retries per
    /// its own policy.
    async fn fetch_routing_snapshot(&self, nss: &Namespace) -> ShardResult<RoutingSnapshot>;
}

/// Drives one refresh of a collection's routing state.
///
/// Publishes the in-flight refresh on the state, fetches a snapshot, and
/// installs it unless the state moved underneath (a clear does not cancel
/// the refresh; the install verifies the state is still unknown or the same
/// incarnation). Returns whether the result was installed.
///
/// Callers must coalesce first: if [`CollectionShardState::refresh_future`]
/// is occupied, await it instead of calling this.
///
/// # Errors
///
/// Propagates fetch failures; the refresh slot is always cleared.
pub async fn drive_refresh(
    state: &CollectionShardState,
    source: &dyn RoutingSnapshotSource,
) -> ShardResult<bool> {
    let (completion, waiter) = RefreshWaiter::pair();
    state.set_refresh_future(waiter);

    let expected_uuid = state
        .current_metadata_if_known()
        .and_then(|description| description.metadata().map(|m| m.uuid()));

    let fetched = source.fetch_routing_snapshot(state.nss()).await;

    state.clear_refresh_future();
    completion.complete();

    let snapshot = fetched?;
    let installed = state.install_refreshed_metadata(expected_uuid, snapshot.into());
    debug!(nss = %state.nss(), installed, "Refresh finished");
    Ok(installed)
}

/// In-memory snapshot source for tests and simulation.
///
/// Serves the snapshot stored per namespace; unknown namespaces are
/// unsharded. A queued failure is consumed by the next fetch.
#[derive(Default)]
pub struct SimulatedSnapshotSource {
    snapshots: Mutex<HashMap<Namespace, RoutingSnapshot>>,
    induced_failure: Mutex<Option<ShardError>>,
}

impl SimulatedSnapshotSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the snapshot served for a namespace.
    pub fn set_snapshot(&self, nss: Namespace, snapshot: RoutingSnapshot) {
        self.snapshots
            .lock()
            .expect("snapshot source poisoned")
            .insert(nss, snapshot);
    }

    /// Queues a failure for the next fetch.
    pub fn induce_failure(&self, error: ShardError) {
        *self.induced_failure.lock().expect("snapshot source poisoned") = Some(error);
    }
}

#[async_trait]
impl RoutingSnapshotSource for SimulatedSnapshotSource {
    async fn fetch_routing_snapshot(&self, nss: &Namespace) -> ShardResult<RoutingSnapshot> {
        if let Some(error) = self
            .induced_failure
            .lock()
            .expect("snapshot source poisoned")
            .take()
        {
            return Err(error);
        }
        Ok(self
            .snapshots
            .lock()
            .expect("snapshot source poisoned")
            .get(nss)
            .cloned()
            .unwrap_or(RoutingSnapshot::Unsharded))
    }
}
