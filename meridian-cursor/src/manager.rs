//! The cursor manager - registration, pinning, kill policy, reaping, and
//! shutdown drain for multi-shard query cursors.
//!
//! # Structure
//!
//! Cursors are grouped per namespace in containers; all cursors of one
//! namespace share the 32-bit id prefix minted when the namespace's first
//! cursor registers. The prefix-to-namespace map and the namespace-to-
//! container map move in lock-step: destroying the last cursor of a
//! namespace erases both entries.
//!
//! # Kill policy
//!
//! Killing an idle cursor detaches and destroys it immediately. Killing a
//! pinned cursor interrupts the bound operation instead; the destroy
//! happens when that operation returns the cursor through its guard.
//! Cursor kill callbacks always run after the registry lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use meridian_core::{ClientId, Limits, Namespace, OperationKey, SessionId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::cursor::{ClusterCursor, CursorLifetime, CursorState, CursorType};
use crate::error::{CursorError, CursorResult};
use crate::id::CursorId;
use crate::operation::OperationHandle;

/// Configuration for the cursor manager.
#[derive(Debug, Clone, Copy)]
pub struct CursorManagerConfig {
    /// Maximum open cursors across all namespaces.
    pub max_open_cursors: u32,
    /// Idle time after which a mortal cursor may be reaped, in microseconds.
    /// Read by the host's reaper job when computing the cutoff it passes to
    /// [`CursorManager::kill_mortal_cursors_inactive_since`].
    pub cursor_timeout_us: u64,
}

impl Default for CursorManagerConfig {
    fn default() -> Self {
        let limits = Limits::new();
        Self {
            max_open_cursors: limits.max_open_cursors,
            cursor_timeout_us: limits.cursor_timeout_us,
        }
    }
}

/// Whether `check_out` verifies the calling session against the cursor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    /// Reject (as not-found, to avoid leaking existence) when the cursor
    /// belongs to a different logical session.
    Enforce,
    /// Skip the session check. Internal callers only.
    Skip,
}

/// Open-cursor counts, broken down by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Cursors registered as single-target.
    pub cursors_single_target: usize,
    /// Cursors registered as multi-target.
    pub cursors_multi_target: usize,
    /// Cursors currently pinned by an operation.
    pub cursors_pinned: usize,
}

/// A registered cursor and its bookkeeping.
///
/// The entry owns the cursor while idle; while pinned, ownership lives in
/// the [`PinnedCursor`] guard and the entry records the bound operation.
pub struct CursorEntry {
    cursor: Option<Box<dyn ClusterCursor>>,
    cursor_type: CursorType,
    lifetime: CursorLifetime,
    last_active_us: u64,
    session: Option<SessionId>,
    op_key: Option<OperationKey>,
    originating_client: ClientId,
    authenticated_users: Vec<String>,
    operation: Option<OperationHandle>,
}

impl CursorEntry {
    /// The cursor's target type.
    #[must_use]
    pub const fn cursor_type(&self) -> CursorType {
        self.cursor_type
    }

    /// Whether the cursor is subject to idle reaping.
    #[must_use]
    pub const fn lifetime(&self) -> CursorLifetime {
        self.lifetime
    }

    /// When the cursor last started or finished serving an operation.
    #[must_use]
    pub const fn last_active_us(&self) -> u64 {
        self.last_active_us
    }

    /// The logical session the cursor was opened under, if any.
    #[must_use]
    pub const fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// The operation key recorded at registration, if any.
    #[must_use]
    pub const fn op_key(&self) -> Option<OperationKey> {
        self.op_key
    }

    /// The client that opened the cursor.
    #[must_use]
    pub const fn originating_client(&self) -> ClientId {
        self.originating_client
    }

    /// The users authorized to use the cursor.
    #[must_use]
    pub fn authenticated_users(&self) -> &[String] {
        &self.authenticated_users
    }

    /// Whether an operation currently has the cursor checked out.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.operation.is_some()
    }

    /// Whether the bound operation has been interrupted: the cursor will be
    /// destroyed when it is returned.
    #[must_use]
    pub fn is_kill_pending(&self) -> bool {
        self.operation
            .as_ref()
            .is_some_and(OperationHandle::is_interrupted)
    }
}

impl std::fmt::Debug for CursorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorEntry")
            .field("type", &self.cursor_type)
            .field("lifetime", &self.lifetime)
            .field("last_active_us", &self.last_active_us)
            .field("pinned", &self.is_pinned())
            .finish_non_exhaustive()
    }
}

/// A report row describing one idle cursor.
#[derive(Debug, Clone)]
pub struct CursorReport {
    /// The cursor's id.
    pub cursor_id: CursorId,
    /// The namespace it was opened on.
    pub nss: Namespace,
    /// Target type.
    pub cursor_type: CursorType,
    /// Reaping lifetime.
    pub lifetime: CursorLifetime,
    /// Last activity, in microseconds.
    pub last_active_us: u64,
    /// Owning logical session, if any.
    pub session: Option<SessionId>,
    /// Operation key recorded at registration, if any.
    pub op_key: Option<OperationKey>,
}

struct CursorContainer {
    prefix: u32,
    entries: HashMap<CursorId, CursorEntry>,
}

struct ManagerInner {
    in_shutdown: bool,
    rng: ChaCha12Rng,
    prefix_to_namespace: HashMap<u32, Namespace>,
    containers: HashMap<Namespace, CursorContainer>,
    cursors_timed_out: u64,
}

/// Registry owning the lifecycle of every open multi-shard cursor on this
/// router.
///
/// All public methods are thread-safe; none blocks on the network.
pub struct CursorManager {
    config: CursorManagerConfig,
    inner: Mutex<ManagerInner>,
    drained: Notify,
}

impl CursorManager {
    /// Creates a manager with a random id-generation seed.
    #[must_use]
    pub fn new(config: CursorManagerConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CursorManagerConfig {
        &self.config
    }

    /// Creates a manager with a fixed id-generation seed, for deterministic
    /// tests.
    #[must_use]
    pub fn with_seed(config: CursorManagerConfig, seed: u64) -> Self {
        Self {
            config,
            inner: Mutex::new(ManagerInner {
                in_shutdown: false,
                rng: ChaCha12Rng::seed_from_u64(seed),
                prefix_to_namespace: HashMap::new(),
                containers: HashMap::new(),
                cursors_timed_out: 0,
            }),
            drained: Notify::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Registers a cursor and returns its id.
    ///
    /// The id's prefix is the namespace's (minted fresh for the first cursor
    /// on the namespace); the suffix is drawn from the seeded random source,
    /// rejecting zero and collisions. Attribution (session, operation key,
    /// client) is recorded from `op`. Does not block.
    ///
    /// # Errors
    ///
    /// Fails with `ShutdownInProgress` after shutdown and `TooManyCursors`
    /// at capacity. The cursor is killed on any error return.
    pub fn register(
        &self,
        cursor: Box<dyn ClusterCursor>,
        nss: &Namespace,
        cursor_type: CursorType,
        lifetime: CursorLifetime,
        op: &OperationHandle,
        authenticated_users: Vec<String>,
        now_us: u64,
    ) -> CursorResult<CursorId> {
        let mut cursor = cursor;
        let mut inner = self.lock_inner();

        if inner.in_shutdown {
            drop(inner);
            cursor.kill();
            return Err(CursorError::ShutdownInProgress);
        }

        let open: usize = inner.containers.values().map(|c| c.entries.len()).sum();
        if open >= self.config.max_open_cursors as usize {
            drop(inner);
            cursor.kill();
            #[allow(clippy::cast_possible_truncation)]
            return Err(CursorError::TooManyCursors {
                count: open as u32,
                max: self.config.max_open_cursors,
            });
        }

        let ManagerInner {
            rng,
            prefix_to_namespace,
            containers,
            ..
        } = &mut *inner;

        let prefix = if let Some(container) = containers.get(nss) {
            container.prefix
        } else {
            let prefix = loop {
                let candidate = rng.gen::<u32>();
                if candidate != 0 && !prefix_to_namespace.contains_key(&candidate) {
                    break candidate;
                }
            };
            prefix_to_namespace.insert(prefix, nss.clone());
            containers.insert(
                nss.clone(),
                CursorContainer {
                    prefix,
                    entries: HashMap::new(),
                },
            );
            prefix
        };

        let container = containers.get_mut(nss).expect("container just ensured");
        let cursor_id = loop {
            let suffix = rng.gen::<u32>();
            if suffix == 0 {
                continue;
            }
            let candidate = CursorId::from_parts(prefix, suffix);
            if !container.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        container.entries.insert(
            cursor_id,
            CursorEntry {
                cursor: Some(cursor),
                cursor_type,
                lifetime,
                last_active_us: now_us,
                session: op.session(),
                op_key: op.op_key(),
                originating_client: op.client(),
                authenticated_users,
                operation: None,
            },
        );
        drop(inner);
        debug!(%cursor_id, nss = %nss, "Registered cursor");
        Ok(cursor_id)
    }

    // -------------------------------------------------------------------------
    // Pinning
    // -------------------------------------------------------------------------

    /// Moves a cursor to the pinned state, transferring it into the returned
    /// guard for exclusive iteration by `op`.
    ///
    /// Updates the cursor's last-active time. Does not block.
    ///
    /// # Errors
    ///
    /// `CursorNotFound` when no such cursor is registered, its kill is
    /// pending, or (under [`SessionCheck::Enforce`]) the caller's session
    /// does not match; `CursorInUse` when another operation holds it; the
    /// auth check's error verbatim when authorization fails.
    pub fn check_out<F>(
        &self,
        nss: &Namespace,
        cursor_id: CursorId,
        op: &OperationHandle,
        auth_check: F,
        session_check: SessionCheck,
        now_us: u64,
    ) -> CursorResult<PinnedCursor<'_>>
    where
        F: FnOnce(&[String]) -> CursorResult<()>,
    {
        let mut inner = self.lock_inner();
        let entry = inner
            .containers
            .get_mut(nss)
            .and_then(|c| c.entries.get_mut(&cursor_id))
            .ok_or(CursorError::CursorNotFound { cursor_id })?;

        if entry.is_kill_pending() {
            return Err(CursorError::CursorNotFound { cursor_id });
        }
        if entry.operation.is_some() {
            return Err(CursorError::CursorInUse { cursor_id });
        }

        auth_check(&entry.authenticated_users)?;

        if session_check == SessionCheck::Enforce {
            if let Some(session) = entry.session {
                // Not-found, not unauthorized: existence must not leak
                // across sessions.
                if op.session() != Some(session) {
                    return Err(CursorError::CursorNotFound { cursor_id });
                }
            }
        }

        let cursor = entry
            .cursor
            .take()
            .expect("idle cursor entry must own its cursor");
        entry.operation = Some(op.clone());
        entry.last_active_us = entry.last_active_us.max(now_us);
        drop(inner);

        debug!(%cursor_id, nss = %nss, op = %op.op_id(), "Checked out cursor");
        Ok(PinnedCursor {
            manager: self,
            cursor: Some(cursor),
            nss: nss.clone(),
            cursor_id,
        })
    }

    /// Runs an auth check against a cursor's authorized users without
    /// pinning it, for kill authorization.
    ///
    /// # Errors
    ///
    /// `CursorNotFound` when no such cursor is registered; otherwise the
    /// auth check's error verbatim.
    pub fn check_auth_for_kill<F>(
        &self,
        nss: &Namespace,
        cursor_id: CursorId,
        auth_check: F,
    ) -> CursorResult<()>
    where
        F: FnOnce(&[String]) -> CursorResult<()>,
    {
        let inner = self.lock_inner();
        let entry = inner
            .containers
            .get(nss)
            .and_then(|c| c.entries.get(&cursor_id))
            .ok_or(CursorError::CursorNotFound { cursor_id })?;
        auth_check(&entry.authenticated_users)
    }

    /// Returns a pinned cursor to the idle state, or destroys it.
    fn check_in(
        &self,
        cursor: Box<dyn ClusterCursor>,
        nss: &Namespace,
        cursor_id: CursorId,
        state: CursorState,
        now_us: u64,
    ) {
        let mut destroy = None;
        {
            let mut inner = self.lock_inner();
            let kill_pending = inner
                .containers
                .get(nss)
                .and_then(|c| c.entries.get(&cursor_id))
                .is_some_and(CursorEntry::is_kill_pending);

            if state == CursorState::Exhausted || kill_pending {
                Self::remove_entry(&mut inner, nss, cursor_id);
                self.notify_if_drained(&inner);
                destroy = Some(cursor);
            } else if let Some(entry) = inner
                .containers
                .get_mut(nss)
                .and_then(|c| c.entries.get_mut(&cursor_id))
            {
                entry.cursor = Some(cursor);
                entry.operation = None;
                entry.last_active_us = entry.last_active_us.max(now_us);
            } else {
                // The entry vanished while pinned; nothing retains the
                // cursor, so destroy it.
                destroy = Some(cursor);
            }
        }
        if let Some(mut cursor) = destroy {
            debug!(%cursor_id, nss = %nss, "Destroying returned cursor");
            cursor.kill();
        }
    }

    /// Detaches and destroys a cursor abandoned by its guard.
    fn return_and_kill(&self, mut cursor: Box<dyn ClusterCursor>, nss: &Namespace, cursor_id: CursorId) {
        {
            let mut inner = self.lock_inner();
            Self::remove_entry(&mut inner, nss, cursor_id);
            self.notify_if_drained(&inner);
        }
        debug!(%cursor_id, nss = %nss, "Killing abandoned cursor");
        cursor.kill();
    }

    // -------------------------------------------------------------------------
    // Kill policy
    // -------------------------------------------------------------------------

    /// Kills one cursor.
    ///
    /// Idle cursors are detached and destroyed immediately. Pinned cursors
    /// have their bound operation interrupted instead; the destroy happens
    /// when the operation returns the cursor.
    ///
    /// # Errors
    ///
    /// `CursorNotFound` when no such cursor is registered.
    pub fn kill_cursor(&self, nss: &Namespace, cursor_id: CursorId) -> CursorResult<()> {
        let removed = {
            let mut inner = self.lock_inner();
            let operation = inner
                .containers
                .get(nss)
                .and_then(|c| c.entries.get(&cursor_id))
                .map(|entry| entry.operation.clone())
                .ok_or(CursorError::CursorNotFound { cursor_id })?;

            if let Some(op) = operation {
                debug!(%cursor_id, op = %op.op_id(), "Interrupting operation using cursor");
                op.interrupt();
                None
            } else {
                let entry = Self::remove_entry(&mut inner, nss, cursor_id);
                self.notify_if_drained(&inner);
                entry
            }
        };

        if let Some(mut entry) = removed {
            if let Some(cursor) = &mut entry.cursor {
                cursor.kill();
            }
            debug!(%cursor_id, nss = %nss, "Killed idle cursor");
        }
        Ok(())
    }

    /// Kills every cursor matching the predicate; returns how many matched.
    ///
    /// Matching idle cursors are destroyed after the lock is released;
    /// matching pinned cursors are interrupted.
    pub fn kill_cursors_satisfying<F>(&self, pred: F) -> usize
    where
        F: Fn(CursorId, &CursorEntry) -> bool,
    {
        let mut to_destroy = Vec::new();
        let mut killed = 0;
        {
            let mut inner = self.lock_inner();
            let matches: Vec<(Namespace, CursorId, Option<OperationHandle>)> = inner
                .containers
                .iter()
                .flat_map(|(nss, container)| {
                    container.entries.iter().filter_map(|(&id, entry)| {
                        pred(id, entry)
                            .then(|| (nss.clone(), id, entry.operation.clone()))
                    })
                })
                .collect();

            for (nss, cursor_id, operation) in matches {
                killed += 1;
                match operation {
                    Some(op) => op.interrupt(),
                    None => {
                        to_destroy.extend(Self::remove_entry(&mut inner, &nss, cursor_id));
                    }
                }
            }
            self.notify_if_drained(&inner);
        }

        for mut entry in to_destroy {
            if let Some(cursor) = &mut entry.cursor {
                cursor.kill();
            }
        }
        killed
    }

    /// Kills every idle mortal cursor whose last activity is at or before
    /// `cutoff_us`, counting them toward the timed-out total.
    pub fn kill_mortal_cursors_inactive_since(&self, cutoff_us: u64) -> usize {
        let killed = self.kill_cursors_satisfying(|_, entry| {
            entry.lifetime() == CursorLifetime::Mortal
                && !entry.is_pinned()
                && entry.last_active_us() <= cutoff_us
        });
        if killed > 0 {
            self.lock_inner().cursors_timed_out += killed as u64;
            info!(killed, "Timed out idle cursors");
        }
        killed
    }

    /// Kills every cursor registered at the time of the call.
    pub fn kill_all_cursors(&self) -> usize {
        self.kill_cursors_satisfying(|_, _| true)
    }

    /// Kills every cursor opened under one of the given sessions.
    pub fn kill_cursors_for_sessions(&self, sessions: &HashSet<SessionId>) -> usize {
        self.kill_cursors_satisfying(|_, entry| {
            entry.session().is_some_and(|s| sessions.contains(&s))
        })
    }

    /// Stops accepting registrations and kills everything registered.
    ///
    /// Pinned cursors are interrupted and destroyed when their operations
    /// return them; use [`Self::await_drained`] to wait for that.
    pub fn shutdown(&self) -> usize {
        self.lock_inner().in_shutdown = true;
        info!("Cursor manager shutting down");
        self.kill_all_cursors()
    }

    /// Waits until no cursors remain registered.
    ///
    /// # Errors
    ///
    /// `ExceededTimeLimit` past the deadline.
    pub async fn await_drained(&self, timeout_us: u64) -> CursorResult<()> {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(Duration::from_micros(timeout_us), wait).await {
            Ok(()) => Ok(()),
            Err(_) => Err(CursorError::ExceededTimeLimit {
                operation: "await_drained",
                waited_us: timeout_us,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Open-cursor counts by type.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let inner = self.lock_inner();
        let mut stats = Stats::default();
        for entry in inner.containers.values().flat_map(|c| c.entries.values()) {
            match entry.cursor_type {
                CursorType::SingleTarget => stats.cursors_single_target += 1,
                CursorType::MultiTarget => stats.cursors_multi_target += 1,
            }
            if entry.is_pinned() {
                stats.cursors_pinned += 1;
            }
        }
        stats
    }

    /// Adds every session with an open cursor to `sessions`.
    pub fn append_active_sessions(&self, sessions: &mut HashSet<SessionId>) {
        let inner = self.lock_inner();
        sessions.extend(
            inner
                .containers
                .values()
                .flat_map(|c| c.entries.values())
                .filter_map(CursorEntry::session),
        );
    }

    /// Ids of every open cursor belonging to the given session.
    #[must_use]
    pub fn get_cursors_for_session(&self, session: SessionId) -> HashSet<CursorId> {
        let inner = self.lock_inner();
        inner
            .containers
            .values()
            .flat_map(|c| c.entries.iter())
            .filter(|(_, entry)| entry.session() == Some(session))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Ids of every open cursor registered under one of the operation keys.
    #[must_use]
    pub fn get_cursors_for_op_keys(&self, op_keys: &[OperationKey]) -> HashSet<CursorId> {
        let keys: HashSet<OperationKey> = op_keys.iter().copied().collect();
        let inner = self.lock_inner();
        inner
            .containers
            .values()
            .flat_map(|c| c.entries.iter())
            .filter(|(_, entry)| entry.op_key().is_some_and(|k| keys.contains(&k)))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Recovers the namespace a cursor id belongs to from its prefix.
    ///
    /// The cursor itself need not still exist; the mapping lives as long as
    /// any cursor on the namespace does.
    #[must_use]
    pub fn get_namespace_for_cursor_id(&self, cursor_id: CursorId) -> Option<Namespace> {
        self.lock_inner()
            .prefix_to_namespace
            .get(&cursor_id.prefix())
            .cloned()
    }

    /// Reports every idle cursor.
    #[must_use]
    pub fn idle_cursors(&self) -> Vec<CursorReport> {
        let inner = self.lock_inner();
        inner
            .containers
            .iter()
            .flat_map(|(nss, container)| {
                container
                    .entries
                    .iter()
                    .filter(|(_, entry)| !entry.is_pinned())
                    .map(|(&cursor_id, entry)| CursorReport {
                        cursor_id,
                        nss: nss.clone(),
                        cursor_type: entry.cursor_type(),
                        lifetime: entry.lifetime(),
                        last_active_us: entry.last_active_us(),
                        session: entry.session(),
                        op_key: entry.op_key(),
                    })
            })
            .collect()
    }

    /// Total cursors reaped by idle timeout since startup.
    #[must_use]
    pub fn cursors_timed_out(&self) -> u64 {
        self.lock_inner().cursors_timed_out
    }

    /// True when no cursors remain registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_inner().containers.is_empty()
    }

    /// Number of open cursors across all namespaces.
    #[must_use]
    pub fn open_cursor_count(&self) -> usize {
        self.lock_inner()
            .containers
            .values()
            .map(|c| c.entries.len())
            .sum()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Removes an entry; erasing the last entry of a container erases the
    /// container and its prefix mapping with it.
    fn remove_entry(
        inner: &mut ManagerInner,
        nss: &Namespace,
        cursor_id: CursorId,
    ) -> Option<CursorEntry> {
        let container = inner.containers.get_mut(nss)?;
        let entry = container.entries.remove(&cursor_id);
        if container.entries.is_empty() {
            let prefix = container.prefix;
            inner.containers.remove(nss);
            inner.prefix_to_namespace.remove(&prefix);
        }
        entry
    }

    fn notify_if_drained(&self, inner: &ManagerInner) {
        if inner.containers.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("cursor manager poisoned")
    }
}

impl std::fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorManager")
            .field("open_cursors", &self.open_cursor_count())
            .finish_non_exhaustive()
    }
}

/// Scoped exclusive lease of a cursor to one operation.
///
/// While the guard lives, the cursor streams only to its holder. Returning
/// with [`CursorState::NotExhausted`] puts the cursor back to idle;
/// [`CursorState::Exhausted`] destroys it. Dropping the guard without an
/// explicit return kills and destroys the cursor.
pub struct PinnedCursor<'a> {
    manager: &'a CursorManager,
    cursor: Option<Box<dyn ClusterCursor>>,
    nss: Namespace,
    cursor_id: CursorId,
}

impl PinnedCursor<'_> {
    /// The pinned cursor's id.
    #[must_use]
    pub const fn cursor_id(&self) -> CursorId {
        self.cursor_id
    }

    /// The namespace the cursor was opened on.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.nss
    }

    /// Fetches the next batch from the leased cursor.
    ///
    /// # Errors
    ///
    /// Propagates the underlying data source's error.
    ///
    /// # Panics
    ///
    /// Panics if called after the cursor was returned.
    pub async fn next(&mut self) -> CursorResult<Option<Bytes>> {
        self.cursor
            .as_mut()
            .expect("pinned cursor already returned")
            .next()
            .await
    }

    /// Returns the cursor to the manager.
    ///
    /// `NotExhausted` restores it for later checkout (unless its kill became
    /// pending while pinned); `Exhausted` destroys it.
    ///
    /// # Panics
    ///
    /// Panics if the cursor was already returned.
    pub fn return_cursor(mut self, state: CursorState, now_us: u64) {
        let cursor = self
            .cursor
            .take()
            .expect("pinned cursor already returned");
        self.manager
            .check_in(cursor, &self.nss, self.cursor_id, state, now_us);
    }
}

impl Drop for PinnedCursor<'_> {
    fn drop(&mut self) {
        // An explicit return leaves nothing behind; an abandoned guard
        // kills and destroys.
        if let Some(cursor) = self.cursor.take() {
            self.manager.return_and_kill(cursor, &self.nss, self.cursor_id);
        }
    }
}

impl std::fmt::Debug for PinnedCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PinnedCursor({}, {})", self.nss, self.cursor_id)
    }
}
