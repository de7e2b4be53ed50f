//! Meridian Core - Strongly-typed identifiers and configuration for Meridian.
//!
//! This crate provides the types shared by the shard-side routing runtime and
//! the router-side cursor manager. It does NOT provide clocks, executors, or
//! transports - those are supplied by the host process.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up `ShardId` with `SessionId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod namespace;
mod types;

pub use error::ErrorCode;
pub use limits::Limits;
pub use namespace::{Namespace, NamespaceError};
pub use types::{
    ClientId, CollectionUuid, MigrationId, OperationId, OperationKey, SessionId, ShardId,
};
