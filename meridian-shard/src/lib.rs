//! Meridian Shard - Shard-side per-collection routing runtime.
//!
//! This crate caches the authoritative ownership metadata for each collection
//! on a shard, checks the routing version declared by every incoming
//! operation, coordinates the migration critical section, and schedules
//! cleanup of orphaned ranges left behind by chunk migrations.
//!
//! # Design
//!
//! - **Snapshots are immutable**: readers hold refcounted handles; a new
//!   snapshot never invalidates an in-flight reader
//! - **Version checks are explicit**: mismatches surface as structured
//!   errors, never silent coercion
//! - **Orphan cleanup is deferred**: a range is physically deleted only
//!   after every snapshot that still covers it has been released
//! - **Explicit limits**: retained snapshots and report sizes are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod chunk;
mod critical_section;
mod deletion;
mod error;
mod manager;
mod metadata;
mod registry;
mod report;
mod runtime;
mod snapshot_source;
mod version;

pub use chunk::{max_key, ChunkRange, ChunkRangeError, MAX_KEY};
pub use critical_section::{MigrationCriticalSection, OperationIntent, SectionSignal};
pub use deletion::{
    CleanupOutcome, CleanupWaiter, RangeDeleter, RangeDeleterConfig, RangeDeletionError,
    SimulatedRangeDeleter,
};
pub use error::{ShardError, ShardResult, StaleReason};
pub use manager::{MetadataManager, ScopedMetadata};
pub use metadata::{Chunk, CollectionMetadata, MetadataError};
pub use registry::{RegistryConfig, ShardStateRegistry};
pub use report::{ChunkReport, MetadataReport, ShardVersionReport, VersionReport};
pub use runtime::{
    CleanWhen, CollectionCriticalSectionGuard, CollectionDescription, CollectionShardState,
    MetadataUpdate, OperationDescriptor, OrphanCleanupPolicy, OwnershipFilter, RefreshCompletion,
    RefreshWaiter,
};
pub use snapshot_source::{
    drive_refresh, RoutingSnapshot, RoutingSnapshotSource, SimulatedSnapshotSource,
};
pub use version::{Epoch, ShardVersion, VersionError};
