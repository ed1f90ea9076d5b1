//! One-shot close signal shared between a component and its workers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Idempotent one-shot fuse. Once closed it stays closed; workers poll it
/// or park on it with a timeout to implement their tick loops.
#[derive(Clone, Default)]
pub struct Fuse {
    inner: Arc<FuseInner>,
}

#[derive(Default)]
struct FuseInner {
    closed: Mutex<bool>,
    cond: Condvar,
}

impl Fuse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        let mut closed = self.inner.closed.lock();
        if !*closed {
            *closed = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// Parks the caller for up to `timeout`. Returns `true` when the fuse
    /// is closed, `false` when the timeout elapsed (tick).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut closed = self.inner.closed.lock();
        if *closed {
            return true;
        }
        self.inner.cond.wait_for(&mut closed, timeout);
        *closed
    }

    /// Blocks until the fuse is closed.
    pub fn wait(&self) {
        let mut closed = self.inner.closed.lock();
        while !*closed {
            self.inner.cond.wait(&mut closed);
        }
    }
}
