/// Per-PDS crawl rate limiter registry
///
/// Token buckets with capacity 1, refilled at each host's configured crawl
/// rate. The limiter is awaited immediately before each outbound repo fetch
/// so bursts of newly-admitted users for one PDS do not saturate the host.
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A direct token-bucket limiter for one PDS
pub type PdsLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build a capacity-1 limiter refilling at `rate` events/sec.
pub fn new_limiter(rate: f64) -> Arc<PdsLimiter> {
    let rate = if rate > 0.0 { rate } else { 1.0 };
    let period = Duration::from_secs_f64(1.0 / rate);
    let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(
        std::num::NonZeroU32::new(1).unwrap(),
    ));
    Arc::new(RateLimiter::direct(quota))
}

/// Concurrent mapping from PDS id to its limiter. Reads dominate.
pub struct LimiterRegistry {
    limiters: RwLock<HashMap<i64, Arc<PdsLimiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, pds_id: i64) -> Option<Arc<PdsLimiter>> {
        self.limiters.read().unwrap().get(&pds_id).cloned()
    }

    /// Return the existing limiter or install a new one at `rate`.
    pub fn get_or_create(&self, pds_id: i64, rate: f64) -> Arc<PdsLimiter> {
        if let Some(lim) = self.get(pds_id) {
            return lim;
        }

        let mut limiters = self.limiters.write().unwrap();
        limiters
            .entry(pds_id)
            .or_insert_with(|| new_limiter(rate))
            .clone()
    }

    /// Replace a host's limiter at runtime.
    pub fn set(&self, pds_id: i64, limiter: Arc<PdsLimiter>) {
        self.limiters.write().unwrap().insert(pds_id, limiter);
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
