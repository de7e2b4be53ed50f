//! Strongly-typed identifiers for Meridian entities.
//!
//! Explicit ID types prevent bugs from mixing up identifiers. All IDs are
//! 64-bit to handle large-scale deployments.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `ShardId` with `SessionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster topology.
define_id!(ShardId, "shard", "Unique identifier for a shard in the cluster.");

// Collection identity.
define_id!(
    CollectionUuid,
    "uuid",
    "Identity of one incarnation of a collection. Regenerated on drop/recreate."
);

// Migration tracking.
define_id!(
    MigrationId,
    "migration",
    "Unique identifier for a chunk migration, used to tag orphan cleanup."
);

// Request attribution.
define_id!(OperationId, "op", "Unique identifier for an in-flight operation.");
define_id!(ClientId, "client", "Identity of the client that originated a request.");
define_id!(SessionId, "lsid", "Logical session identifier attached to a request.");
define_id!(
    OperationKey,
    "opkey",
    "Caller-supplied key allowing out-of-band kill of in-flight work."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let shard = ShardId::new(1);
        let session = SessionId::new(1);

        // These are different types even with same value.
        assert_eq!(shard.get(), session.get());
        // But they can't be compared directly (won't compile):
        // assert_ne!(shard, session);
    }

    #[test]
    fn test_id_display() {
        let shard = ShardId::new(42);
        assert_eq!(format!("{shard}"), "shard-42");
        assert_eq!(format!("{shard:?}"), "shard(42)");
    }

    #[test]
    fn test_id_next() {
        let id = OperationId::new(0);
        assert_eq!(id.next().get(), 1);
        assert_eq!(id.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = ShardId::new(u64::MAX);
        let _ = id.next();
    }

    #[test]
    fn test_id_ordering() {
        let a = CollectionUuid::new(1);
        let b = CollectionUuid::new(2);
        let c = CollectionUuid::new(1);

        assert!(a < b);
        assert!(b > a);
        assert_eq!(a, c);
    }
}
