//! Shard-side routing errors.
//!
//! Version-check failures carry the full structured payload the router needs
//! to decide between refresh-and-retry and re-planning.

use std::fmt;

use meridian_core::{ErrorCode, Namespace, ShardId};

use crate::critical_section::SectionSignal;
use crate::version::ShardVersion;

/// The result type for shard routing operations.
pub type ShardResult<T> = Result<T, ShardError>;

/// Why a version check rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// No routing snapshot is cached; the caller must drive a refresh.
    MetadataUnknown,
    /// A migration critical section blocks the operation's intent.
    MigrationCriticalSection,
    /// The shard's version is unset while the caller's is set: this shard no
    /// longer owns any chunks.
    NoLongerOwnsChunks,
    /// The shard owns chunks but the caller declared the collection
    /// unsharded.
    ExpectedUnsharded,
    /// Major version mismatch within a shared epoch.
    VersionMismatch,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MetadataUnknown => {
                "sharding status is not currently known and needs to be recovered"
            }
            Self::MigrationCriticalSection => "migration commit in progress",
            Self::NoLongerOwnsChunks => {
                "this shard no longer contains chunks; the collection may have been dropped"
            }
            Self::ExpectedUnsharded => {
                "this shard contains chunks but the client expects an unsharded collection"
            }
            Self::VersionMismatch => "version mismatch detected",
        };
        write!(f, "{msg}")
    }
}

/// Errors from shard-side routing operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShardError {
    /// The caller's declared version does not admit the operation; refresh
    /// and retry.
    #[error("stale config for {nss}: {reason} (received {received}, wanted {wanted:?})")]
    StaleConfig {
        /// The collection being operated on.
        nss: Namespace,
        /// Version the operation declared.
        received: ShardVersion,
        /// Version this shard holds, when known.
        wanted: Option<ShardVersion>,
        /// This shard's identity.
        shard: ShardId,
        /// Which check failed.
        reason: StaleReason,
        /// When a critical section caused the rejection, a signal that
        /// completes once the section exits, so the caller can wait before
        /// retrying.
        critical_section: Option<SectionSignal>,
    },

    /// The declared and held versions belong to different collection
    /// incarnations; the router must re-plan.
    #[error("epoch mismatch detected for {nss} (received {received}, wanted {wanted})")]
    StaleEpoch {
        /// The collection being operated on.
        nss: Namespace,
        /// Version the operation declared.
        received: ShardVersion,
        /// Version this shard holds.
        wanted: ShardVersion,
    },

    /// No retained snapshot covers the requested cluster time.
    #[error("no snapshot of {nss} covers cluster time {at_cluster_time}")]
    StaleClusterTime {
        /// The collection being read.
        nss: Namespace,
        /// The requested point-in-time.
        at_cluster_time: u64,
    },

    /// A conflicting operation holds the resource.
    #[error("conflicting operation in progress: {reason}")]
    ConflictingOperationInProgress {
        /// What is holding the resource.
        reason: String,
    },

    /// A wait exceeded its deadline.
    #[error("timeout: {operation} after {waited_us}us")]
    ExceededTimeLimit {
        /// What operation timed out.
        operation: &'static str,
        /// How long we waited (in microseconds).
        waited_us: u64,
    },

    /// A scheduled orphan-range deletion failed.
    #[error("failed to delete orphaned {nss} range {range}: {reason}")]
    OrphanCleanupFailed {
        /// The collection being cleaned.
        nss: Namespace,
        /// The range whose deletion failed.
        range: crate::chunk::ChunkRange,
        /// Why the deletion failed.
        reason: String,
    },
}

impl ShardError {
    /// Maps the error to its wire code.
    #[must_use]
    pub const fn to_error_code(&self) -> ErrorCode {
        match self {
            Self::StaleConfig { .. } => ErrorCode::StaleConfig,
            Self::StaleEpoch { .. } => ErrorCode::StaleEpoch,
            Self::StaleClusterTime { .. } => ErrorCode::StaleClusterTime,
            Self::ConflictingOperationInProgress { .. } => {
                ErrorCode::ConflictingOperationInProgress
            }
            Self::ExceededTimeLimit { .. } => ErrorCode::ExceededTimeLimit,
            Self::OrphanCleanupFailed { .. } => ErrorCode::Internal,
        }
    }

    /// Extracts the critical-section signal from a stale-config rejection.
    #[must_use]
    pub fn critical_section_signal(&self) -> Option<SectionSignal> {
        match self {
            Self::StaleConfig {
                critical_section, ..
            } => critical_section.clone(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Epoch;

    #[test]
    fn test_error_codes() {
        let nss = Namespace::parse("db.orders").unwrap();
        let err = ShardError::StaleEpoch {
            nss,
            received: ShardVersion::new(Epoch::new(1), 3, 0),
            wanted: ShardVersion::new(Epoch::new(2), 3, 0),
        };
        assert_eq!(err.to_error_code(), ErrorCode::StaleEpoch);
    }

    #[test]
    fn test_stale_config_display() {
        let nss = Namespace::parse("db.orders").unwrap();
        let err = ShardError::StaleConfig {
            nss,
            received: ShardVersion::new(Epoch::new(5), 4, 2),
            wanted: Some(ShardVersion::new(Epoch::new(5), 5, 0)),
            shard: ShardId::new(1),
            reason: StaleReason::VersionMismatch,
            critical_section: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("db.orders"));
        assert!(msg.contains("version mismatch detected"));
        assert!(msg.contains("4|2"));
    }
}
