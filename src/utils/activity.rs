//! Counting guard for shared resources.
//!
//! [`ActivityGate`] tracks how many holders are currently using a resource.
//! Each holder gets an [`ActivityGuard`]; when the guard that brings the count
//! back to zero is dropped, the `on_inactive` callback fires and any task
//! parked in [`ActivityGate::wait_inactive`] is woken.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

type InactiveCallback = Box<dyn Fn() + Send + Sync>;

struct GateInner {
    active: AtomicUsize,
    idle: Notify,
    on_inactive: Option<InactiveCallback>,
}

/// Shared counter of active resource holders
#[derive(Clone)]
pub struct ActivityGate {
    inner: Arc<GateInner>,
}

impl fmt::Debug for ActivityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityGate")
            .field("active", &self.active())
            .finish()
    }
}

impl Default for ActivityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                on_inactive: None,
            }),
        }
    }

    /// Create a gate that calls `on_inactive` every time the last holder releases
    pub fn with_callback<F>(on_inactive: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(GateInner {
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                on_inactive: Some(Box::new(on_inactive)),
            }),
        }
    }

    /// Register a new holder
    pub fn enter(&self) -> ActivityGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of live guards
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Resolve once no guard is alive
    pub async fn wait_inactive(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Proof of activity; releasing it decrements the gate
pub struct ActivityGuard {
    inner: Arc<GateInner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(callback) = &self.inner.on_inactive {
                callback();
            }
            self.inner.idle.notify_waiters();
        }
    }
}
