//! Meridian Cursor - Router-side registry for multi-shard query cursors.
//!
//! Long-lived cursors outlive the request that opened them. This crate owns
//! their lifecycle: registration, exclusive pinning for iteration,
//! timeout-driven reaping, kill propagation through bound operations, and
//! graceful shutdown drain.
//!
//! # Design
//!
//! - **One mutex**: a single lock guards registry mutation; cursor iteration
//!   happens outside it, and kill callbacks run after it is released
//! - **Pin to iterate**: a cursor streams to at most one operation at a time
//! - **Interrupt, don't preempt**: killing a pinned cursor flags its bound
//!   operation; the destroy happens when the operation returns the cursor
//! - **Explicit limits**: open cursors are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cursor;
mod error;
mod id;
mod manager;
mod operation;

pub use cursor::{ClusterCursor, CursorLifetime, CursorState, CursorType, QueuedCursor};
pub use error::{CursorError, CursorResult};
pub use id::CursorId;
pub use manager::{
    CursorEntry, CursorManager, CursorManagerConfig, CursorReport, PinnedCursor, SessionCheck,
    Stats,
};
pub use operation::OperationHandle;
