//! Migration critical section - the two-phase write barrier raised while a
//! chunk migration commits.
//!
//! The catch-up phase blocks writes but admits reads, letting the recipient
//! shard drain the final modifications. The commit phase blocks both while
//! ownership flips. Version checks that observe the barrier reject with a
//! signal that completes on exit, so callers wait instead of spinning.

use std::fmt;

use tokio::sync::watch;

use crate::error::{ShardError, ShardResult};

/// Whether an operation intends to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationIntent {
    /// A read operation.
    Read,
    /// A write operation.
    Write,
}

/// A shareable signal that completes when the critical section exits.
#[derive(Debug, Clone)]
pub struct SectionSignal {
    rx: watch::Receiver<bool>,
}

impl SectionSignal {
    /// Waits until the critical section has exited.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Section owner dropped; the barrier is gone.
                return;
            }
        }
    }

    /// Returns true if the section has already exited.
    #[must_use]
    pub fn is_exited(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Phase of an active critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Writes blocked, reads admitted.
    CatchUp,
    /// Reads and writes blocked.
    Commit,
}

struct ActiveSection {
    phase: Phase,
    reason: String,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

/// Per-collection two-phase write barrier.
///
/// Not internally synchronized: the owning runtime serializes transitions
/// under its exclusive coordination lock and signal reads under the shared
/// one.
#[derive(Default)]
pub struct MigrationCriticalSection {
    active: Option<ActiveSection>,
}

impl MigrationCriticalSection {
    /// Creates an inactive section.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reason of the active section, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.reason.as_str())
    }

    /// Returns true if a section is active in any phase.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Enters the catch-up phase: writes blocked, reads admitted.
    ///
    /// Re-entering with the same reason is idempotent.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if a section with a
    /// different reason is active.
    pub fn enter_catch_up(&mut self, reason: impl Into<String>) -> ShardResult<()> {
        let reason = reason.into();
        if let Some(active) = &self.active {
            if active.reason == reason && active.phase == Phase::CatchUp {
                return Ok(());
            }
            return Err(conflict(&active.reason));
        }
        let (tx, rx) = watch::channel(false);
        self.active = Some(ActiveSection {
            phase: Phase::CatchUp,
            reason,
            tx,
            rx,
        });
        Ok(())
    }

    /// Advances to the commit phase: reads and writes blocked.
    ///
    /// Re-entering with the same reason is idempotent.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if no section with this
    /// reason is in the catch-up phase.
    pub fn enter_commit(&mut self, reason: impl Into<String>) -> ShardResult<()> {
        let reason = reason.into();
        match &mut self.active {
            Some(active) if active.reason == reason => {
                active.phase = Phase::Commit;
                Ok(())
            }
            Some(active) => Err(conflict(&active.reason)),
            None => Err(conflict("no critical section is active")),
        }
    }

    /// Drops back from commit to catch-up (migration abort).
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if no commit-phase section
    /// with this reason is active.
    pub fn rollback_to_catch_up(&mut self, reason: impl Into<String>) -> ShardResult<()> {
        let reason = reason.into();
        match &mut self.active {
            Some(active) if active.reason == reason && active.phase == Phase::Commit => {
                active.phase = Phase::CatchUp;
                Ok(())
            }
            Some(active) => Err(conflict(&active.reason)),
            None => Err(conflict("no critical section is active")),
        }
    }

    /// Exits the section, waking every signal holder.
    ///
    /// # Errors
    ///
    /// Fails with `ConflictingOperationInProgress` if the active section
    /// carries a different reason.
    pub fn exit(&mut self, reason: &str) -> ShardResult<()> {
        match &self.active {
            Some(active) if active.reason == reason => {
                self.exit_no_checks();
                Ok(())
            }
            Some(active) => Err(conflict(&active.reason)),
            None => Ok(()),
        }
    }

    /// Exits the section without verifying the reason. Recovery-path only.
    pub fn exit_no_checks(&mut self) {
        if let Some(active) = self.active.take() {
            // Wake waiters; receivers may all be gone already.
            let _ = active.tx.send(true);
        }
    }

    /// Returns a completion signal if the section blocks the given intent,
    /// `None` when the operation may proceed.
    #[must_use]
    pub fn signal(&self, intent: OperationIntent) -> Option<SectionSignal> {
        let active = self.active.as_ref()?;
        match (active.phase, intent) {
            (Phase::CatchUp, OperationIntent::Read) => None,
            _ => Some(SectionSignal {
                rx: active.rx.clone(),
            }),
        }
    }
}

impl fmt::Debug for MigrationCriticalSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.active {
            None => write!(f, "CriticalSection(inactive)"),
            Some(a) => write!(f, "CriticalSection({:?}, reason={})", a.phase, a.reason),
        }
    }
}

fn conflict(reason: &str) -> ShardError {
    ShardError::ConflictingOperationInProgress {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_returns_to_inactive() {
        let mut section = MigrationCriticalSection::new();
        assert!(!section.is_active());

        section.enter_catch_up("migrate orders").unwrap();
        section.enter_commit("migrate orders").unwrap();
        section.exit("migrate orders").unwrap();

        assert!(!section.is_active());
        assert!(section.signal(OperationIntent::Write).is_none());
    }

    #[test]
    fn test_catch_up_blocks_writes_only() {
        let mut section = MigrationCriticalSection::new();
        section.enter_catch_up("migrate orders").unwrap();

        assert!(section.signal(OperationIntent::Read).is_none());
        assert!(section.signal(OperationIntent::Write).is_some());
    }

    #[test]
    fn test_commit_blocks_both() {
        let mut section = MigrationCriticalSection::new();
        section.enter_catch_up("migrate orders").unwrap();
        section.enter_commit("migrate orders").unwrap();

        assert!(section.signal(OperationIntent::Read).is_some());
        assert!(section.signal(OperationIntent::Write).is_some());
    }

    #[test]
    fn test_rollback_to_catch_up() {
        let mut section = MigrationCriticalSection::new();
        section.enter_catch_up("migrate orders").unwrap();
        section.enter_commit("migrate orders").unwrap();
        section.rollback_to_catch_up("migrate orders").unwrap();

        assert!(section.signal(OperationIntent::Read).is_none());
        assert!(section.signal(OperationIntent::Write).is_some());
    }

    #[test]
    fn test_different_reason_conflicts() {
        let mut section = MigrationCriticalSection::new();
        section.enter_catch_up("migrate orders").unwrap();

        assert!(matches!(
            section.enter_catch_up("drop collection"),
            Err(ShardError::ConflictingOperationInProgress { .. })
        ));
        assert!(matches!(
            section.enter_commit("drop collection"),
            Err(ShardError::ConflictingOperationInProgress { .. })
        ));
        assert!(matches!(
            section.exit("drop collection"),
            Err(ShardError::ConflictingOperationInProgress { .. })
        ));
    }

    #[test]
    fn test_same_reason_reentry_is_idempotent() {
        let mut section = MigrationCriticalSection::new();
        section.enter_catch_up("migrate orders").unwrap();
        section.enter_catch_up("migrate orders").unwrap();
        section.enter_commit("migrate orders").unwrap();
        section.enter_commit("migrate orders").unwrap();
    }

    #[tokio::test]
    async fn test_signal_completes_on_exit() {
        let mut section = MigrationCriticalSection::new();
        section.enter_catch_up("migrate orders").unwrap();

        let mut signal = section.signal(OperationIntent::Write).unwrap();
        assert!(!signal.is_exited());

        section.exit("migrate orders").unwrap();
        signal.wait().await;
        assert!(signal.is_exited());
    }

    #[tokio::test]
    async fn test_signal_survives_section_drop() {
        let mut signal = {
            let mut section = MigrationCriticalSection::new();
            section.enter_catch_up("migrate orders").unwrap();
            section.signal(OperationIntent::Write).unwrap()
        };
        // Owner gone without an explicit exit: waiters must still wake.
        signal.wait().await;
    }
}
