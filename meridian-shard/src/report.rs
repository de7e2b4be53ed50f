//! Shard version reports - the introspection view of a collection's cached
//! routing state.
//!
//! Full-metadata reports list the chunk map, truncated at a configured
//! maximum so responses stay within the wire's document size ceiling.

use meridian_core::{CollectionUuid, ShardId};

use crate::chunk::ChunkRange;
use crate::metadata::CollectionMetadata;
use crate::version::ShardVersion;

/// The globally-visible version of a collection on this shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReport {
    /// No routing state is cached; it must be recovered first.
    Unknown,
    /// The cached shard version (the unsharded version for unsharded
    /// collections).
    Version(ShardVersion),
}

/// One chunk in a full-metadata report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    /// The chunk's key range.
    pub range: ChunkRange,
    /// The shard owning the chunk.
    pub shard: ShardId,
}

/// Detailed metadata included when a full report is requested for a sharded
/// collection.
#[derive(Debug, Clone)]
pub struct MetadataReport {
    /// Collection incarnation.
    pub uuid: CollectionUuid,
    /// Descriptive shard-key pattern.
    pub shard_key_pattern: String,
    /// Maximum chunk version across all shards.
    pub collection_version: ShardVersion,
    /// This shard's version.
    pub shard_version: ShardVersion,
    /// Whether the balancer may migrate chunks.
    pub allow_migrations: bool,
    /// Total chunks in the snapshot, including any not listed here.
    pub chunk_count_total: usize,
    /// The chunk listing, truncated at the configured maximum.
    pub chunks: Vec<ChunkReport>,
    /// True when `chunks` was truncated.
    pub truncated: bool,
}

impl MetadataReport {
    /// Builds a report from a snapshot, listing at most `max_chunks` chunks.
    #[must_use]
    pub fn from_metadata(metadata: &CollectionMetadata, max_chunks: u32) -> Self {
        let total = metadata.chunk_count();
        let chunks: Vec<ChunkReport> = metadata
            .chunks()
            .take(max_chunks as usize)
            .map(|(range, shard)| ChunkReport { range, shard })
            .collect();
        let truncated = chunks.len() < total;
        Self {
            uuid: metadata.uuid(),
            shard_key_pattern: metadata.shard_key_pattern().to_string(),
            collection_version: metadata.collection_version(),
            shard_version: metadata.shard_version(),
            allow_migrations: metadata.allow_migrations(),
            chunk_count_total: total,
            chunks,
            truncated,
        }
    }
}

/// The answer to a shard-version introspection request.
#[derive(Debug, Clone)]
pub struct ShardVersionReport {
    /// Connection string of the config server this shard follows.
    pub config_server: String,
    /// The collection's version on this shard, or `Unknown`.
    pub global: VersionReport,
    /// Full metadata, when requested and the collection is sharded.
    pub metadata: Option<MetadataReport>,
}
