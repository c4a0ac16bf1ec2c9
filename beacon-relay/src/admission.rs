//! Per-source-address admission gate.
//!
//! Each source IP gets a token bucket of `burst` tokens refilled
//! continuously over `window`. A connection attempt consumes one token;
//! an empty bucket rejects the attempt immediately -- there is no
//! blocking wait. Bucket state is pruned lazily once the tracked-address
//! map grows past a cap, so memory stays bounded without a background
//! task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracked-address cap; exceeding it triggers a prune of idle buckets.
const MAX_TRACKED_ADDRS: usize = 4096;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    /// Refills proportionally to elapsed time, then tries to take one token.
    fn try_take(&mut self, burst: u32, window: Duration) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let rate = f64::from(burst) / window.as_secs_f64();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(f64::from(burst));
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate gate applied to every connection attempt before any session work.
pub struct AdmissionFilter {
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
    burst: u32,
    window: Duration,
}

impl AdmissionFilter {
    /// Creates a filter granting `burst` connection attempts per source
    /// address per `window`.
    #[must_use]
    pub fn new(burst: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            burst,
            window,
        }
    }

    /// Admits or rejects a connection attempt from `addr`.
    ///
    /// Returns `false` when the address's bucket is empty; the caller must
    /// refuse the connection attempt without further session work.
    pub fn admit(&self, addr: IpAddr) -> bool {
        let mut buckets = self.buckets.lock();
        if buckets.len() >= MAX_TRACKED_ADDRS && !buckets.contains_key(&addr) {
            let window = self.window;
            buckets.retain(|_, bucket| bucket.last_refill.elapsed() < window);
        }
        let bucket = buckets
            .entry(addr)
            .or_insert_with(|| TokenBucket::full(self.burst));
        bucket.try_take(self.burst, self.window)
    }

    #[cfg(test)]
    fn tracked_addrs(&self) -> usize {
        self.buckets.lock().len()
    }
}
