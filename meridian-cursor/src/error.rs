//! Cursor registry errors.

use meridian_core::ErrorCode;

use crate::id::CursorId;

/// The result type for cursor registry operations.
pub type CursorResult<T> = Result<T, CursorError>;

/// Errors from cursor registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    /// No cursor with the given id is registered (or it is pending kill, or
    /// the caller's session may not see it).
    #[error("cursor {cursor_id} not found")]
    CursorNotFound {
        /// The id that was not found.
        cursor_id: CursorId,
    },

    /// The cursor is pinned by another operation.
    #[error("cursor {cursor_id} is already in use")]
    CursorInUse {
        /// The pinned cursor's id.
        cursor_id: CursorId,
    },

    /// The caller is not authorized to use the cursor.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Why authorization failed.
        reason: String,
    },

    /// The registry is at capacity.
    #[error("too many open cursors: {count} (max {max})")]
    TooManyCursors {
        /// Current open cursor count.
        count: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// The registry is shutting down and rejects new registrations.
    #[error("cursor manager is shutting down")]
    ShutdownInProgress,

    /// A wait exceeded its deadline.
    #[error("timeout: {operation} after {waited_us}us")]
    ExceededTimeLimit {
        /// What operation timed out.
        operation: &'static str,
        /// How long we waited (in microseconds).
        waited_us: u64,
    },

    /// The underlying data source failed while iterating.
    #[error("cursor data source error: {reason}")]
    Source {
        /// What the data source reported.
        reason: String,
    },
}

impl CursorError {
    /// Maps the error to its wire code.
    #[must_use]
    pub const fn to_error_code(&self) -> ErrorCode {
        match self {
            Self::CursorNotFound { .. } => ErrorCode::CursorNotFound,
            Self::CursorInUse { .. } => ErrorCode::CursorInUse,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::TooManyCursors { .. } => ErrorCode::TooManyCursors,
            Self::ShutdownInProgress => ErrorCode::ShutdownInProgress,
            Self::ExceededTimeLimit { .. } => ErrorCode::ExceededTimeLimit,
            Self::Source { .. } => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let id = CursorId::from_parts(1, 2);
        assert_eq!(
            CursorError::CursorNotFound { cursor_id: id }.to_error_code(),
            ErrorCode::CursorNotFound
        );
        assert_eq!(
            CursorError::ShutdownInProgress.to_error_code(),
            ErrorCode::ShutdownInProgress
        );
    }

    #[test]
    fn test_display() {
        let err = CursorError::TooManyCursors {
            count: 100,
            max: 100,
        };
        assert_eq!(err.to_string(), "too many open cursors: 100 (max 100)");
    }
}
