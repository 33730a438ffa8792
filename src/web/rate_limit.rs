//! Per-client-IP request rate limiting
//!
//! Each source IP gets a token bucket (rate = requests/sec, capacity =
//! burst). The table is bounded: when it is full, requests from unknown
//! IPs are refused outright — a live entry is never evicted to make room,
//! so a flood of newcomers cannot flush an honest client's bucket. A
//! background sweeper drops entries idle past the TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::metrics::Metrics;

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
        }
    }

    fn try_take(&mut self, rps: f64, burst: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rps).min(burst as f64);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Entry {
    bucket: TokenBucket,
    last_seen: Instant,
}

pub struct RateLimiter {
    ttl: Duration,
    max_entries: usize,
    metrics: Arc<Metrics>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    /// Create the limiter and start the idle sweeper. A zero `ttl` falls
    /// back to 30 minutes, a zero `max_entries` to 10 000.
    pub fn new(ttl: Duration, max_entries: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        let limiter = Arc::new(Self {
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
            max_entries: if max_entries == 0 {
                DEFAULT_MAX_ENTRIES
            } else {
                max_entries
            },
            metrics,
            entries: Mutex::new(HashMap::new()),
        });
        tokio::spawn(sweep_loop(Arc::downgrade(&limiter)));
        limiter
    }

    /// Consume one token from `key`'s bucket, creating it on first use.
    pub fn allow(&self, key: &str, rps: f64, burst: u32) -> bool {
        self.allow_at(key, rps, burst, Instant::now())
    }

    fn allow_at(&self, key: &str, rps: f64, burst: u32, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("rate limiter lock");
        if !entries.contains_key(key) {
            if entries.len() >= self.max_entries {
                self.metrics.rate_limiter_evictions_total.inc();
                warn!(ip = %key, entries = entries.len(), "rate limiter table full, rejecting new IP");
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    bucket: TokenBucket::new(burst, now),
                    last_seen: now,
                },
            );
            self.metrics.rate_limiter_entries.set(entries.len() as i64);
        }
        let entry = entries.get_mut(key).expect("entry just ensured");
        entry.last_seen = now;
        entry.bucket.try_take(rps, burst, now)
    }

    /// Drop entries whose last use is older than the TTL as of `now`.
    pub fn run_cleanup(&self, now: Instant) {
        let mut entries = self.entries.lock().expect("rate limiter lock");
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_seen) <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            self.metrics
                .rate_limiter_evictions_total
                .inc_by(removed as u64);
        }
        self.metrics.rate_limiter_entries.set(entries.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("rate limiter lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn sweep_loop(limiter: Weak<RateLimiter>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match limiter.upgrade() {
            Some(limiter) => limiter.run_cleanup(Instant::now()),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limiter(ttl: Duration, max: usize) -> Arc<RateLimiter> {
        RateLimiter::new(ttl, max, Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn burst_is_honored_then_exhausted() {
        let limiter = test_limiter(Duration::from_secs(60), 100);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("1.2.3.4", 1.0, 3, now));
        }
        assert!(!limiter.allow_at("1.2.3.4", 1.0, 3, now));
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = test_limiter(Duration::from_secs(60), 100);
        let now = Instant::now();

        assert!(limiter.allow_at("ip", 2.0, 1, now));
        assert!(!limiter.allow_at("ip", 2.0, 1, now));
        // 2 rps → one token back after 500ms.
        assert!(limiter.allow_at("ip", 2.0, 1, now + Duration::from_millis(600)));
    }

    #[tokio::test]
    async fn refill_is_capped_at_burst() {
        let limiter = test_limiter(Duration::from_secs(60), 100);
        let now = Instant::now();

        assert!(limiter.allow_at("ip", 100.0, 2, now));
        // A long quiet period must not bank more than `burst` tokens.
        let later = now + Duration::from_secs(60);
        assert!(limiter.allow_at("ip", 100.0, 2, later));
        assert!(limiter.allow_at("ip", 100.0, 2, later));
        assert!(!limiter.allow_at("ip", 100.0, 2, later));
    }

    #[tokio::test]
    async fn full_table_refuses_newcomers_without_evicting() {
        let limiter = test_limiter(Duration::from_secs(60), 2);
        let now = Instant::now();

        assert!(limiter.allow_at("a", 10.0, 5, now));
        assert!(limiter.allow_at("b", 10.0, 5, now));
        assert!(!limiter.allow_at("c", 10.0, 5, now));
        assert_eq!(limiter.len(), 2);

        // Known keys keep working while the table is full.
        assert!(limiter.allow_at("a", 10.0, 5, now));
    }

    #[tokio::test]
    async fn idle_entries_are_swept() {
        let limiter = test_limiter(Duration::from_millis(50), 10);
        let now = Instant::now();

        assert!(limiter.allow_at("a", 10.0, 5, now));
        assert!(limiter.allow_at("b", 10.0, 5, now + Duration::from_millis(40)));
        limiter.run_cleanup(now + Duration::from_millis(100));

        // "a" idled past the TTL, "b" did not.
        assert_eq!(limiter.len(), 1);
        assert!(limiter.allow_at("c", 10.0, 5, now + Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn keys_have_independent_buckets() {
        let limiter = test_limiter(Duration::from_secs(60), 10);
        let now = Instant::now();

        assert!(limiter.allow_at("a", 1.0, 1, now));
        assert!(!limiter.allow_at("a", 1.0, 1, now));
        assert!(limiter.allow_at("b", 1.0, 1, now));
    }
}
