//! Cancellation tokens for transactions and background tasks.
//!
//! A [`CancelToken`] is a cheaply clonable handle that can be fired exactly
//! once. Tokens form a parent/child hierarchy: a child observes its parent's
//! cancellation but can also be fired independently, so the deadlock detector
//! can abort a single transaction without touching the caller's token.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why a token was fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller (or a parent token) requested cancellation.
    Caller,
    /// The deadlock detector chose this transaction as the victim.
    Deadlock,
    /// The owning map is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "canceled by caller"),
            CancelReason::Deadlock => write!(f, "aborted by deadlock detector"),
            CancelReason::Shutdown => write!(f, "map shutting down"),
        }
    }
}

/// A fire-once cancellation handle.
///
/// Cloning a token yields another handle to the same underlying state.
/// Use [`CancelToken::child`] to derive a token that is also canceled
/// whenever this one is.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    fired: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Creates a new root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                reason: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Derives a child token.
    ///
    /// The child reports canceled when either it or any ancestor has fired.
    /// Firing the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                reason: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Fires the token. The first recorded reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.inner.fired.store(true, Ordering::Release);
    }

    /// Returns true if this token or any ancestor has fired.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_canceled)
    }

    /// Returns the cancellation reason, or `None` if the token is still live.
    ///
    /// When the cancellation came from an ancestor, the ancestor's reason is
    /// reported.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if self.inner.fired.load(Ordering::Acquire) {
            return *self.inner.reason.lock();
        }
        self.inner.parent.as_ref().and_then(CancelToken::reason)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn cancel_records_reason() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Deadlock);
        assert!(token.is_canceled());
        assert_eq!(token.reason(), Some(CancelReason::Deadlock));
    }

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Caller);
        token.cancel(CancelReason::Deadlock);
        assert_eq!(token.reason(), Some(CancelReason::Caller));
    }

    #[test]
    fn child_observes_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_canceled());

        parent.cancel(CancelReason::Shutdown);
        assert!(child.is_canceled());
        assert_eq!(child.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn child_does_not_affect_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel(CancelReason::Deadlock);
        assert!(child.is_canceled());
        assert!(!parent.is_canceled());
    }

    #[test]
    fn own_reason_shadows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel(CancelReason::Deadlock);
        parent.cancel(CancelReason::Caller);
        assert_eq!(child.reason(), Some(CancelReason::Deadlock));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel(CancelReason::Caller);
        assert!(token.is_canceled());
    }
}
