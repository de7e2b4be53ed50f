//! Process-wide registry of per-collection shard states.
//!
//! Owned by the host context: initialized at process startup, drained at
//! shutdown. Each collection's state is created on first access and lives
//! until the registry shuts down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use meridian_core::{Limits, Namespace, ShardId};
use tracing::info;

use crate::deletion::{RangeDeleter, RangeDeleterConfig};
use crate::report::{MetadataReport, ShardVersionReport, VersionReport};
use crate::runtime::{CollectionDescription, CollectionShardState};

/// Host-supplied configuration for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// This shard's identity.
    pub this_shard: ShardId,
    /// Connection string of the config server, for reports.
    pub config_server: String,
    /// Whether this process participates in a sharded cluster.
    pub sharding_enabled: bool,
    /// System limits.
    pub limits: Limits,
}

/// Map of every collection's shard state in this process.
pub struct ShardStateRegistry {
    config: RegistryConfig,
    deleter: Arc<dyn RangeDeleter>,
    collections: RwLock<HashMap<Namespace, Arc<CollectionShardState>>>,
}

impl ShardStateRegistry {
    /// Creates the registry.
    ///
    /// # Panics
    ///
    /// Panics if the configured limits are inconsistent.
    #[must_use]
    pub fn new(config: RegistryConfig, deleter: Arc<dyn RangeDeleter>) -> Self {
        if let Err(reason) = config.limits.validate() {
            panic!("invalid limits: {reason}");
        }
        Self {
            config,
            deleter,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the state for a collection, creating it on first access.
    #[must_use]
    pub fn get_or_create(&self, nss: &Namespace) -> Arc<CollectionShardState> {
        if let Some(state) = self.get(nss) {
            return state;
        }
        let mut collections = self.write_map();
        Arc::clone(collections.entry(nss.clone()).or_insert_with(|| {
            Arc::new(CollectionShardState::new(
                nss.clone(),
                self.config.this_shard,
                self.config.sharding_enabled,
                Arc::clone(&self.deleter),
                RangeDeleterConfig {
                    delay_us: self.config.limits.range_deletion_delay_us,
                },
            ))
        }))
    }

    /// Returns the state for a collection, if one exists.
    #[must_use]
    pub fn get(&self, nss: &Namespace) -> Option<Arc<CollectionShardState>> {
        self.read_map().get(nss).cloned()
    }

    /// Number of collections with registered state.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        self.read_map().len()
    }

    /// The cached shard version of every known collection, for diagnostics.
    #[must_use]
    pub fn report_versions(&self) -> Vec<(Namespace, VersionReport)> {
        let collections = self.read_map();
        let mut versions: Vec<_> = collections
            .iter()
            .map(|(nss, state)| {
                let report = state.current_metadata_if_known().map_or(
                    VersionReport::Unknown,
                    |description| VersionReport::Version(description.shard_version()),
                );
                (nss.clone(), report)
            })
            .collect();
        versions.sort_by(|(a, _), (b, _)| a.cmp(b));
        versions
    }

    /// Answers a shard-version introspection request for one collection.
    ///
    /// With `full_metadata`, a sharded collection's report carries its chunk
    /// listing truncated at `Limits::max_chunks_in_report`.
    #[must_use]
    pub fn shard_version_report(&self, nss: &Namespace, full_metadata: bool) -> ShardVersionReport {
        let description = self.get(nss).and_then(|state| state.current_metadata_if_known());
        let global = description.as_ref().map_or(VersionReport::Unknown, |d| {
            VersionReport::Version(d.shard_version())
        });
        let metadata = match (full_metadata, &description) {
            (true, Some(CollectionDescription::Sharded(metadata))) => Some(
                MetadataReport::from_metadata(metadata, self.config.limits.max_chunks_in_report),
            ),
            _ => None,
        };
        ShardVersionReport {
            config_server: self.config.config_server.clone(),
            global,
            metadata,
        }
    }

    /// Drains the registry: every collection's metadata is cleared (which
    /// abandons its scheduled cleanups) and the map is emptied.
    pub fn shutdown(&self) {
        let mut collections = self.write_map();
        info!(collections = collections.len(), "Shutting down shard state registry");
        for state in collections.values() {
            state.clear_filtering_metadata();
        }
        collections.clear();
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Namespace, Arc<CollectionShardState>>> {
        self.collections.read().expect("shard state registry poisoned")
    }

    fn write_map(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<Namespace, Arc<CollectionShardState>>> {
        self.collections.write().expect("shard state registry poisoned")
    }
}

impl std::fmt::Debug for ShardStateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStateRegistry")
            .field("shard", &self.config.this_shard)
            .field("collections", &self.collection_count())
            .finish_non_exhaustive()
    }
}
