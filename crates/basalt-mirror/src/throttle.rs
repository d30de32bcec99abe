//! Fleet-wide concurrency throttling.
//!
//! Bounds how many operations of one kind (image syncs, image deletions) may
//! be in flight across every namespace coordinator in the process. The
//! coordinator itself never acquires permits; it holds two shared handles and
//! passes them to the subsystems it constructs.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrency limit configuration for one throttler.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Maximum operations in flight at once.
    pub max_concurrent_ops: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 5,
        }
    }
}

/// Permit gate shared by all coordinators in a process.
#[derive(Debug)]
pub struct Throttler {
    max_concurrent_ops: usize,
    permits: Arc<Semaphore>,
}

impl Throttler {
    /// Create a throttler from config.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            max_concurrent_ops: config.max_concurrent_ops,
            permits: Arc::new(Semaphore::new(config.max_concurrent_ops)),
        }
    }

    /// Create a throttler allowing `limit` concurrent operations.
    pub fn with_limit(limit: usize) -> Self {
        Self::new(ThrottleConfig {
            max_concurrent_ops: limit,
        })
    }

    /// Wait for a free slot. The returned permit releases the slot on drop.
    pub async fn acquire(&self) -> ThrottlePermit {
        // Private semaphore, never closed.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("throttler semaphore closed");
        ThrottlePermit { _permit: permit }
    }

    /// Take a slot without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<ThrottlePermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| ThrottlePermit { _permit: permit })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured concurrency limit.
    pub fn max_concurrent_ops(&self) -> usize {
        self.max_concurrent_ops
    }
}

/// RAII permit for one throttled operation.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}
