//! Hierarchical cancellation tokens.
//!
//! A token is cancelled when it was cancelled explicitly, when its own
//! deadline has passed, or when any ancestor is cancelled. Batch code holds
//! the root token; each compile or run job gets a child carrying that job's
//! deadline, so one slow job times out without tearing down the batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// Derives a child token whose deadline is `timeout` from now. A zero
    /// timeout means no deadline; the child still observes parent
    /// cancellation.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if self.deadline_exceeded() {
            return true;
        }
        match &self.inner.parent {
            Some(p) => p.is_cancelled(),
            None => false,
        }
    }

    /// True only for deadline expiry, on this token or an ancestor. Lets
    /// callers tell a timeout apart from an explicit cancel.
    pub fn deadline_exceeded(&self) -> bool {
        if let Some(d) = self.inner.deadline {
            if Instant::now() >= d {
                return true;
            }
        }
        match &self.inner.parent {
            Some(p) => p.deadline_exceeded(),
            None => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl crucible_recipe::Cancellation for CancelToken {
    fn is_cancelled(&self) -> bool {
        CancelToken::is_cancelled(self)
    }
}
