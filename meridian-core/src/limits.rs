//! System limits and configuration bounds.
//!
//! Put limits on everything. Every map, queue, and report has an explicit
//! maximum size. This prevents unbounded growth and makes the system
//! predictable.

/// System-wide limits for Meridian.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Routing metadata limits.
    /// Maximum number of chunks included in a full-metadata report.
    /// Larger chunk maps are truncated and flagged so responses stay within
    /// the wire's maximum document size.
    pub max_chunks_in_report: u32,
    /// Maximum number of retained metadata snapshots per collection.
    pub max_retained_snapshots: u32,

    // Range deletion limits.
    /// Grace period before a delayed orphan-range deletion begins, in
    /// microseconds.
    pub range_deletion_delay_us: u64,
    /// Default deadline for waiting on an orphan-range cleanup, in
    /// microseconds.
    pub default_wait_for_clean_us: u64,

    // Cursor registry limits.
    /// Maximum number of open cursors across all namespaces.
    pub max_open_cursors: u32,
    /// Idle time after which a mortal cursor may be reaped, in microseconds.
    pub cursor_timeout_us: u64,

    // Timeout limits (in microseconds).
    /// Default request timeout.
    pub default_timeout_us: u64,
    /// Maximum allowed request timeout.
    pub max_timeout_us: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    ///
    /// These defaults are chosen to be conservative and safe for most
    /// deployments. Production systems should tune these based on their
    /// hardware and workload characteristics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Reports: 10k chunks keeps a full-metadata response well under
            // the wire's document size ceiling.
            max_chunks_in_report: 10_000,
            max_retained_snapshots: 1_000,

            // Range deletion: 15 minute grace, 10 minute default wait.
            range_deletion_delay_us: 15 * 60 * 1_000_000,
            default_wait_for_clean_us: 10 * 60 * 1_000_000,

            // Cursors: 100k open, 10 minute idle timeout.
            max_open_cursors: 100_000,
            cursor_timeout_us: 10 * 60 * 1_000_000,

            // Timeouts: 30s default, 1h max.
            default_timeout_us: 30 * 1_000_000,
            max_timeout_us: 60 * 60 * 1_000_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns the name of the offending field if any limit is invalid.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.max_chunks_in_report == 0 {
            return Err("max_chunks_in_report must be positive");
        }
        if self.max_retained_snapshots == 0 {
            return Err("max_retained_snapshots must be positive");
        }
        if self.max_open_cursors == 0 {
            return Err("max_open_cursors must be positive");
        }
        if self.default_timeout_us > self.max_timeout_us {
            return Err("default_timeout_us must be <= max_timeout_us");
        }
        if self.default_wait_for_clean_us > self.max_timeout_us {
            return Err("default_wait_for_clean_us must be <= max_timeout_us");
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
