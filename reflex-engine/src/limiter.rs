//! Bounded pool for reasoner calls
//!
//! Callers beyond capacity queue for a permit instead of being dropped.
//! Permits are scoped: they are released when the guard drops, on success,
//! error, timeout or cancellation alike.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::trace;

use crate::error::{ReflexError, Result};

/// Point-in-time view of the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStats {
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Counting semaphore gating expensive reasoner calls
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Semaphore,
    capacity: usize,
    waiting: AtomicUsize,
}

/// Held while a reasoner call is in flight
#[derive(Debug)]
pub struct LimiterPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot; fails only once the limiter is closed
    pub async fn acquire(&self) -> Result<LimiterPermit<'_>> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitGuard(&self.waiting);
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ReflexError::Unavailable("reasoner pool is shut down".into()))?;
        Ok(LimiterPermit { _permit: permit })
    }

    /// Run `call` while holding a permit, bounded by `budget`
    ///
    /// The budget starts once the permit is held; time spent queueing is not
    /// counted against it.
    pub async fn run<F, T>(&self, budget: Duration, call: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        trace!(in_flight = self.in_flight(), "reasoner permit acquired");
        tokio::time::timeout(budget, call)
            .await
            .map_err(|_| ReflexError::ReasonerTimeout(budget))
    }

    /// Refuse new callers and wake everyone waiting with an error
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits().min(self.capacity)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            capacity: self.capacity,
            in_flight: self.in_flight(),
            available: self.available(),
            waiting: self.waiting(),
        }
    }
}
