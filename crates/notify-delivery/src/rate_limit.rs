//! Fixed-window admission control.
//!
//! Each key gets a one-second window with a fixed number of permits. Every
//! check consumes a permit, admitted or not, until the window rolls over.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use notify_core::Clock;

/// Default permits per key per window.
pub const DEFAULT_PERMITS_PER_SECOND: u32 = 100;

/// Number of tracked keys above which expired windows are pruned.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Per-key fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    permits: u32,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `permits_per_second` checks per key.
    pub fn new(permits_per_second: u32, clock: Arc<dyn Clock>) -> Self {
        Self::with_window(permits_per_second, Duration::from_secs(1), clock)
    }

    /// Creates a limiter with a custom window length.
    pub fn with_window(permits: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            permits,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(1)),
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes a permit for `key`. Returns false if the window is exhausted.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = self.clock.now_utc();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now - w.started_at < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window { started_at: now, count: 0 });
        if now - entry.started_at >= self.window {
            *entry = Window { started_at: now, count: 0 };
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.permits
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
