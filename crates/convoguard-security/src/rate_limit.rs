use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

struct Bucket {
    count: u32,
    window_start: Instant,
    last_touch: Instant,
}

/// Limits for the per-sender rate limiter.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Events admitted per sender per window.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Maximum number of distinct senders tracked at once.
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
    /// Senders silent this long, in seconds, are forgotten by the periodic cleanup.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_secs: default_window_secs(),
            max_buckets: default_max_buckets(),
            idle_secs: default_idle_secs(),
        }
    }
}

fn default_threshold() -> u32 {
    50
}
fn default_window_secs() -> u64 {
    60
}
fn default_max_buckets() -> usize {
    10_000
}
fn default_idle_secs() -> u64 {
    600
}

/// Outcome of [`RateLimiter::admit`]. Denial is expected traffic shaping,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The event may proceed.
    Allowed,
    /// The sender exhausted its window; drop the event.
    Denied,
}

impl RateDecision {
    /// Returns `true` for [`RateDecision::Allowed`].
    pub fn is_allowed(self) -> bool {
        self == RateDecision::Allowed
    }
}

/// Fixed-window rate limiter keyed by sender.
///
/// The bucket map is capped. When a new sender would push it past the cap,
/// the least-recently-touched half is dropped in a single pass so sustained
/// floods of distinct senders do not trigger a compaction per insert.
pub struct RateLimiter {
    threshold: u32,
    window: Duration,
    max_buckets: usize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    /// - `threshold`: events admitted per window
    /// - `window`: window length
    /// - `max_buckets`: cap on tracked senders (at least 1)
    pub fn new(threshold: u32, window: Duration, max_buckets: usize) -> Self {
        Self {
            threshold,
            window,
            max_buckets: max_buckets.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Build a limiter from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.threshold,
            Duration::from_secs(config.window_secs),
            config.max_buckets,
        )
    }

    /// Count one event for `sender` and decide whether it may proceed.
    pub async fn admit(&self, sender: &str) -> RateDecision {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();

        if !buckets.contains_key(sender) && buckets.len() >= self.max_buckets {
            compact(&mut buckets, self.max_buckets);
        }

        let bucket = buckets.entry(sender.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
            last_touch: now,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.last_touch = now;
        bucket.count = bucket.count.saturating_add(1);

        if bucket.count > self.threshold {
            RateDecision::Denied
        } else {
            RateDecision::Allowed
        }
    }

    /// Number of senders currently tracked.
    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }

    /// Remove buckets with no activity for the given duration. Returns how
    /// many were removed.
    pub async fn cleanup(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_touch) < max_idle);
        before - buckets.len()
    }
}

/// Drop the oldest half of the buckets by last touch.
fn compact(buckets: &mut HashMap<String, Bucket>, cap: usize) {
    let evict = (buckets.len() / 2).max(1);
    let mut by_age: Vec<(Instant, String)> = buckets
        .iter()
        .map(|(sender, b)| (b.last_touch, sender.clone()))
        .collect();
    by_age.sort_unstable_by_key(|(touched, _)| *touched);
    for (_, sender) in by_age.into_iter().take(evict) {
        buckets.remove(&sender);
    }
    warn!(
        evicted = evict,
        remaining = buckets.len(),
        cap,
        "Rate limiter bucket cap reached, compacted"
    );
}
