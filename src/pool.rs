use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Fixed-size blocking resource pool. Checkout waits up to a bounded time
/// for a free resource and fails with a retryable error rather than waiting
/// forever, so a stuck lane surfaces as a window failure instead of a hang.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Pool<T> {
    /// Fill the pool eagerly so connection failures surface at startup, not
    /// mid-window.
    pub fn build(capacity: usize, factory: impl Fn() -> Result<T>) -> Result<Self> {
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(factory()?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                available: Condvar::new(),
                capacity,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Check out a resource, blocking up to `wait` for one to be returned.
    pub fn checkout(&self, wait: Duration) -> Result<PoolGuard<T>> {
        let deadline = Instant::now() + wait;
        let mut idle = self.inner.idle.lock();
        loop {
            if let Some(resource) = idle.pop() {
                return Ok(PoolGuard {
                    pool: Arc::clone(&self.inner),
                    resource: Some(resource),
                });
            }
            if Instant::now() >= deadline {
                return Err(SyncError::PoolExhausted(wait));
            }
            // A woken waiter can lose the returned resource to another
            // checkout; keep waiting until the budget is spent.
            self.inner.available.wait_until(&mut idle, deadline);
        }
    }
}

/// Checked-out resource; returns to the pool on drop.
pub struct PoolGuard<T> {
    pool: Arc<PoolInner<T>>,
    resource: Option<T>,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let mut idle = self.pool.idle.lock();
            idle.push(resource);
            debug!(idle = idle.len(), "resource returned to pool");
            self.pool.available.notify_one();
        }
    }
}
