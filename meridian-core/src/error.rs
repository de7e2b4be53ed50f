//! Wire-level error codes shared by the routing and cursor subsystems.
//!
//! Structured errors in the leaf crates carry their full payloads; this enum
//! is the stable code each of them maps to when crossing the wire.

use std::fmt;

/// Stable error codes reported to remote callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// The caller's routing version is out of date; refresh and retry.
    StaleConfig = 1001,
    /// The caller's routing epoch does not match; the collection was
    /// recreated or its shard key changed. Re-plan at the router.
    StaleEpoch = 1002,
    /// The requested cluster time predates the oldest retained snapshot.
    StaleClusterTime = 1003,
    /// A conflicting operation holds the resource; retry later.
    ConflictingOperationInProgress = 1010,
    /// The wait exceeded its deadline.
    ExceededTimeLimit = 1011,
    /// A scheduled range deletion was abandoned because the collection
    /// incarnation it belonged to no longer exists.
    RangeDeletionAbandoned = 1012,
    /// No cursor with the given id is registered.
    CursorNotFound = 1020,
    /// The cursor is pinned by another operation.
    CursorInUse = 1021,
    /// The caller is not authorized to use the cursor.
    Unauthorized = 1022,
    /// The cursor registry is at capacity.
    TooManyCursors = 1023,
    /// The service is shutting down and rejects new registrations.
    ShutdownInProgress = 1030,
    /// An unclassified internal failure.
    Internal = 1099,
}

impl ErrorCode {
    /// Returns the stable numeric code.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Returns true if the caller should refresh its routing state and retry.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::StaleConfig | Self::ConflictingOperationInProgress
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StaleConfig => "StaleConfig",
            Self::StaleEpoch => "StaleEpoch",
            Self::StaleClusterTime => "StaleClusterTime",
            Self::ConflictingOperationInProgress => "ConflictingOperationInProgress",
            Self::ExceededTimeLimit => "ExceededTimeLimit",
            Self::RangeDeletionAbandoned => "RangeDeletionAbandoned",
            Self::CursorNotFound => "CursorNotFound",
            Self::CursorInUse => "CursorInUse",
            Self::Unauthorized => "Unauthorized",
            Self::TooManyCursors => "TooManyCursors",
            Self::ShutdownInProgress => "ShutdownInProgress",
            Self::Internal => "Internal",
        };
        write!(f, "{name}({})", self.code())
    }
}
