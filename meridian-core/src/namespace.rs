//! Namespace strings - the "db.collection" names that key all routing state.

use std::fmt;

/// Maximum length of a full namespace string in bytes.
pub const NAMESPACE_LEN_MAX: usize = 255;

/// A fully-qualified collection namespace of the form `db.collection`.
///
/// Namespaces key every per-collection structure in Meridian: the shard-side
/// routing state map and the router-side cursor containers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    /// Parses a namespace from a `db.collection` string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string has no dot separator, has an empty
    /// database or collection part, or exceeds [`NAMESPACE_LEN_MAX`].
    pub fn parse(ns: impl Into<String>) -> Result<Self, NamespaceError> {
        let ns = ns.into();
        if ns.len() > NAMESPACE_LEN_MAX {
            return Err(NamespaceError::TooLong {
                len: ns.len(),
                max: NAMESPACE_LEN_MAX,
            });
        }
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self(ns)),
            _ => Err(NamespaceError::Malformed { ns }),
        }
    }

    /// Returns the database part of the namespace.
    #[must_use]
    pub fn db(&self) -> &str {
        // Constructor guarantees a separator is present.
        self.0.split_once('.').map_or("", |(db, _)| db)
    }

    /// Returns the collection part of the namespace.
    #[must_use]
    pub fn coll(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, coll)| coll)
    }

    /// Returns the full `db.collection` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this namespace can never be sharded.
    ///
    /// Collections in the `local` database and `system.` collections hold
    /// node-private state and are always unsharded.
    #[must_use]
    pub fn is_always_unsharded(&self) -> bool {
        self.db() == "local" || self.coll().starts_with("system.")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns({})", self.0)
    }
}

/// Errors from namespace parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    /// The string is not of the form `db.collection`.
    Malformed {
        /// The offending string.
        ns: String,
    },
    /// The string exceeds the maximum namespace length.
    TooLong {
        /// Actual length in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { ns } => write!(f, "malformed namespace: '{ns}'"),
            Self::TooLong { len, max } => {
                write!(f, "namespace too long: {len} bytes (max {max})")
            }
        }
    }
}

impl std::error::Error for NamespaceError {}
