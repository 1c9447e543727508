//! Per-key mutual exclusion for intake.
//!
//! Concurrent submissions carrying the same idempotency key run one after
//! the other, so the second one observes the first one's write. Distinct keys
//! never contend. A key's entry is dropped as soon as nobody holds or waits on
//! it, which keeps the map bounded by the number of in-flight keys.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

/// Map of per-key async mutexes.
#[derive(Debug, Default)]
pub struct IdempotencyLock {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdempotencyLock {
    /// Creates an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` while holding the lock for `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.lease(key);
        let _guard = lease.lock.lock().await;
        body().await
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn lease(&self, key: &str) -> Lease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks.entry(key.to_string()).or_default().clone();
        Lease { owner: self, key: key.to_string(), lock }
    }
}

/// Reference to a key's mutex that removes the map entry when the last
/// reference goes away, including when the caller's future is dropped.
struct Lease<'a> {
    owner: &'a IdempotencyLock,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // map entry + this lease
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}
