//! The opaque cursor seam and the classification enums the registry tracks.
//!
//! The registry never interprets results: it stores cursors, leases them
//! out, and kills them. Iteration happens through the pinned guard, outside
//! the registry lock.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CursorResult;

/// How many remote data sources a cursor draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    /// Retrieving data from a single remote source.
    SingleTarget,
    /// Retrieving data from multiple remote sources.
    MultiTarget,
}

/// Whether a cursor is subject to idle-timeout reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorLifetime {
    /// Killed automatically after a period of inactivity.
    Mortal,
    /// Exempt from idle timeout.
    Immortal,
}

/// Declared by an operation when returning a pinned cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// More results may remain; the cursor goes back to idle.
    NotExhausted,
    /// The result stream is finished; the cursor is destroyed.
    Exhausted,
}

/// A multi-shard query cursor, as seen by the registry.
///
/// The underlying merge pipeline and remote connections are the host's
/// concern; the registry only needs to iterate batches and to kill.
#[async_trait]
pub trait ClusterCursor: Send {
    /// Fetches the next result batch, or `None` when exhausted.
    ///
    /// # Errors
    ///
    /// Propagates whatever the underlying data source surfaces.
    async fn next(&mut self) -> CursorResult<Option<Bytes>>;

    /// Releases the cursor's remote resources. Idempotent; called exactly
    /// once by the registry when the cursor is destroyed.
    fn kill(&mut self);
}

/// An in-memory cursor serving pre-queued batches, for tests and simulation.
#[derive(Debug, Default)]
pub struct QueuedCursor {
    batches: VecDeque<Bytes>,
    killed: bool,
}

impl QueuedCursor {
    /// Creates a cursor that will serve the given batches in order.
    #[must_use]
    pub fn new(batches: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            killed: false,
        }
    }

    /// Creates a cursor with no results.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `kill` has been invoked.
    #[must_use]
    pub const fn is_killed(&self) -> bool {
        self.killed
    }

    /// Remaining batch count.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

#[async_trait]
impl ClusterCursor for QueuedCursor {
    async fn next(&mut self) -> CursorResult<Option<Bytes>> {
        Ok(self.batches.pop_front())
    }

    fn kill(&mut self) {
        self.killed = true;
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_cursor_serves_in_order() {
        let mut cursor = QueuedCursor::new([Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(cursor.next().await.unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(cursor.next().await.unwrap(), Some(Bytes::from_static(b"b")));
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kill_discards_results() {
        let mut cursor = QueuedCursor::new([Bytes::from_static(b"a")]);
        cursor.kill();
        assert!(cursor.is_killed());
        assert_eq!(cursor.next().await.unwrap(), None);
    }
}
