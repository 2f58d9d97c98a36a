//! Per-host rate limiting
//!
//! Enforces a minimum interval between outbound requests to the same
//! hostname across all workers sharing one limiter instance. The map is
//! process-local; cross-process politeness is out of scope (replicas would
//! need a distributed token bucket keyed by host).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Minimum-interval limiter keyed by hostname.
///
/// Callers reserve the next free slot for their host under the lock and
/// then sleep until it without holding the lock, so two workers contending
/// for one host serialize at `delay` spacing while other hosts proceed
/// untouched.
pub struct HostRateLimiter {
    last_request: Mutex<HashMap<String, Instant>>,
    delay: Duration,
}

impl HostRateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            last_request: Mutex::new(HashMap::new()),
            delay,
        }
    }

    /// Block until the calling worker may issue a request to `host`.
    pub async fn wait(&self, host: &str) {
        let ready_at = self.reserve(host);
        tokio::time::sleep_until(ready_at).await;
    }

    /// Atomically claim the next request slot for a host.
    fn reserve(&self, host: &str) -> Instant {
        let mut map = self.last_request.lock();
        let now = Instant::now();
        let ready_at = match map.get(host) {
            Some(&last) => (last + self.delay).max(now),
            None => now,
        };
        map.insert(host.to_string(), ready_at);
        ready_at
    }

    /// Number of hosts seen so far.
    pub fn tracked_hosts(&self) -> usize {
        self.last_request.lock().len()
    }
}
