//! Collection metadata - an immutable routing view for one collection at one
//! version.
//!
//! A snapshot maps the whole shard-key space onto owner shards as a set of
//! disjoint, gap-free chunks. Ranges physically present on this shard but
//! owned elsewhere in the active snapshot are orphans, candidates for
//! deferred deletion.

use std::collections::BTreeMap;

use bytes::Bytes;
use meridian_core::{CollectionUuid, ShardId};

use crate::chunk::{max_key, ChunkRange};
use crate::version::{Epoch, ShardVersion};

/// One chunk in the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Exclusive upper bound; the lower bound is the map key.
    pub max: Bytes,
    /// Shard that owns the chunk.
    pub shard: ShardId,
    /// Version at which the chunk last moved or split.
    pub version: ShardVersion,
}

/// Immutable routing snapshot for one collection.
///
/// The chunk map is keyed by inclusive lower bound and covers the key space
/// from the empty key to [`crate::MAX_KEY`] without gaps or overlaps.
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    uuid: CollectionUuid,
    shard_key_pattern: String,
    this_shard: ShardId,
    collection_version: ShardVersion,
    shard_version: ShardVersion,
    chunks: BTreeMap<Bytes, Chunk>,
    allow_migrations: bool,
    supports_point_in_time_reads: bool,
}

impl CollectionMetadata {
    /// Builds a snapshot from a chunk listing.
    ///
    /// The collection version is derived as the maximum chunk version; the
    /// shard version is the maximum version among chunks owned by
    /// `this_shard`, or `(epoch, 0, 0)` when this shard owns nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunks do not tile the key space exactly, or
    /// if their versions do not share a single epoch.
    pub fn new(
        uuid: CollectionUuid,
        shard_key_pattern: impl Into<String>,
        this_shard: ShardId,
        chunks: Vec<(ChunkRange, ShardId, ShardVersion)>,
        allow_migrations: bool,
    ) -> Result<Self, MetadataError> {
        if chunks.is_empty() {
            return Err(MetadataError::EmptyChunkMap);
        }

        let epoch = chunks[0].2.epoch;
        let mut map = BTreeMap::new();
        let mut collection_version = ShardVersion::new(epoch, 0, 0);
        let mut shard_version = ShardVersion::new(epoch, 0, 0);
        let mut expected_min = Bytes::new();

        for (range, shard, version) in chunks {
            if version.epoch != epoch {
                return Err(MetadataError::MixedEpochs {
                    expected: epoch,
                    found: version.epoch,
                });
            }
            if range.min != expected_min {
                return Err(MetadataError::Discontiguous {
                    expected: expected_min,
                    found: range.min,
                });
            }
            if version
                .try_cmp(&collection_version)
                .is_ok_and(std::cmp::Ordering::is_gt)
            {
                collection_version = version;
            }
            if shard == this_shard
                && version
                    .try_cmp(&shard_version)
                    .is_ok_and(std::cmp::Ordering::is_gt)
            {
                shard_version = version;
            }
            expected_min = range.max.clone();
            map.insert(
                range.min,
                Chunk {
                    max: range.max,
                    shard,
                    version,
                },
            );
        }

        if expected_min != max_key() {
            return Err(MetadataError::IncompleteCoverage { last: expected_min });
        }

        // An unowned shard version still carries the collection timestamp so
        // point-in-time lookups stay well-defined.
        if !shard_version.is_set() {
            shard_version.timestamp = collection_version.timestamp;
        }

        Ok(Self {
            uuid,
            shard_key_pattern: shard_key_pattern.into(),
            this_shard,
            collection_version,
            shard_version,
            chunks: map,
            allow_migrations,
            supports_point_in_time_reads: collection_version.timestamp.is_some(),
        })
    }

    /// Identity of this collection incarnation.
    #[must_use]
    pub const fn uuid(&self) -> CollectionUuid {
        self.uuid
    }

    /// Descriptive shard-key pattern, for diagnostics.
    #[must_use]
    pub fn shard_key_pattern(&self) -> &str {
        &self.shard_key_pattern
    }

    /// The shard this snapshot was built for.
    #[must_use]
    pub const fn this_shard(&self) -> ShardId {
        self.this_shard
    }

    /// The maximum chunk version across all shards.
    #[must_use]
    pub const fn collection_version(&self) -> ShardVersion {
        self.collection_version
    }

    /// The version checked against incoming operations: the maximum version
    /// among chunks this shard owns, or `(epoch, 0, 0)` if it owns none.
    #[must_use]
    pub const fn shard_version(&self) -> ShardVersion {
        self.shard_version
    }

    /// Routing table epoch.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.collection_version.epoch
    }

    /// Whether the balancer may migrate chunks of this collection.
    #[must_use]
    pub const fn allow_migrations(&self) -> bool {
        self.allow_migrations
    }

    /// Whether retained snapshots may serve point-in-time reads.
    #[must_use]
    pub const fn supports_point_in_time_reads(&self) -> bool {
        self.supports_point_in_time_reads
    }

    /// Number of chunks in the snapshot.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterates all chunks as `(range, owner)` in key order.
    pub fn chunks(&self) -> impl Iterator<Item = (ChunkRange, ShardId)> + '_ {
        self.chunks.iter().map(|(min, chunk)| {
            (
                ChunkRange {
                    min: min.clone(),
                    max: chunk.max.clone(),
                },
                chunk.shard,
            )
        })
    }

    /// Returns the shard owning the given key.
    #[must_use]
    pub fn owner_of(&self, key: &[u8]) -> Option<ShardId> {
        self.chunks
            .range(..=Bytes::copy_from_slice(key))
            .next_back()
            .filter(|(_, chunk)| *key < chunk.max)
            .map(|(_, chunk)| chunk.shard)
    }

    /// Returns true if this shard owns the given key.
    #[must_use]
    pub fn owns_key(&self, key: &[u8]) -> bool {
        self.owner_of(key) == Some(self.this_shard)
    }

    /// Ranges owned by this shard, in key order.
    #[must_use]
    pub fn owned_ranges(&self) -> Vec<ChunkRange> {
        self.chunks
            .iter()
            .filter(|(_, chunk)| chunk.shard == self.this_shard)
            .map(|(min, chunk)| ChunkRange {
                min: min.clone(),
                max: chunk.max.clone(),
            })
            .collect()
    }

    /// Returns true if any range owned by this shard overlaps `range`.
    #[must_use]
    pub fn owns_any_of(&self, range: &ChunkRange) -> bool {
        self.owned_ranges().iter().any(|r| r.overlaps(range))
    }

    /// Computes the ranges this shard owned here that it no longer owns in
    /// `newer`. These are the orphans a snapshot swap schedules for deletion.
    #[must_use]
    pub fn orphaned_ranges_after(&self, newer: &Self) -> Vec<ChunkRange> {
        let newer_owned = newer.owned_ranges();
        let mut orphans = Vec::new();
        for range in self.owned_ranges() {
            orphans.extend(subtract_ranges(&range, &newer_owned));
        }
        orphans
    }
}

/// Subtracts a sorted set of disjoint ranges from `range`, returning the
/// uncovered remainder pieces in key order.
fn subtract_ranges(range: &ChunkRange, covered: &[ChunkRange]) -> Vec<ChunkRange> {
    let mut pieces = Vec::new();
    let mut cursor = range.min.clone();
    for c in covered {
        if !c.overlaps(range) {
            continue;
        }
        if c.min > cursor {
            pieces.push(ChunkRange {
                min: cursor.clone(),
                max: c.min.clone(),
            });
        }
        if c.max > cursor {
            cursor = c.max.clone();
        }
        if cursor >= range.max {
            return pieces;
        }
    }
    if cursor < range.max {
        pieces.push(ChunkRange {
            min: cursor,
            max: range.max.clone(),
        });
    }
    pieces
}

/// Errors from snapshot construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// A snapshot must contain at least one chunk.
    #[error("snapshot has no chunks")]
    EmptyChunkMap,

    /// Adjacent chunks must tile the key space exactly.
    #[error("chunk map is discontiguous: expected lower bound {expected:?}, found {found:?}")]
    Discontiguous {
        /// The bound the next chunk was expected to start at.
        expected: Bytes,
        /// The bound it actually started at.
        found: Bytes,
    },

    /// The last chunk must end at the key-space maximum.
    #[error("chunk map does not reach the key-space maximum (last bound {last:?})")]
    IncompleteCoverage {
        /// Where coverage stopped.
        last: Bytes,
    },

    /// All chunk versions in one snapshot share a single epoch.
    #[error("chunk version epoch {found} does not match snapshot epoch {expected}")]
    MixedEpochs {
        /// The snapshot's epoch.
        expected: Epoch,
        /// The offending chunk's epoch.
        found: Epoch,
    },
}
