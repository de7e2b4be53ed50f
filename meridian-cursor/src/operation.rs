//! Operation handles - the registry's view of an in-flight request.
//!
//! A handle carries the attribution a cursor records at registration
//! (client, session, operation key) and the shared interrupt flag that is
//! the registry's only cancellation mechanism: killing a pinned cursor flags
//! the bound operation, which observes the interrupt and returns the cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meridian_core::{ClientId, OperationId, OperationKey, SessionId};

#[derive(Debug)]
struct OperationInner {
    op_id: OperationId,
    client: ClientId,
    session: Option<SessionId>,
    op_key: Option<OperationKey>,
    interrupted: AtomicBool,
}

/// Cheap-to-clone handle on one in-flight operation.
///
/// Clones share the interrupt flag.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    inner: Arc<OperationInner>,
}

impl OperationHandle {
    /// Creates a handle for an operation with no session or operation key.
    #[must_use]
    pub fn new(op_id: OperationId, client: ClientId) -> Self {
        Self::with_context(op_id, client, None, None)
    }

    /// Creates a handle carrying full attribution context.
    #[must_use]
    pub fn with_context(
        op_id: OperationId,
        client: ClientId,
        session: Option<SessionId>,
        op_key: Option<OperationKey>,
    ) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                op_id,
                client,
                session,
                op_key,
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// The operation's identifier.
    #[must_use]
    pub fn op_id(&self) -> OperationId {
        self.inner.op_id
    }

    /// The client that originated the operation.
    #[must_use]
    pub fn client(&self) -> ClientId {
        self.inner.client
    }

    /// The logical session the operation runs under, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.inner.session
    }

    /// The caller-supplied operation key, if any.
    #[must_use]
    pub fn op_key(&self) -> Option<OperationKey> {
        self.inner.op_key
    }

    /// Flags the operation as interrupted. The operation observes the flag
    /// at its next check and unwinds, releasing whatever it holds.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
    }

    /// Whether the operation has been interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }
}
