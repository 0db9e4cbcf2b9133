//! Sliding-window rate limiting per traffic category.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{Category, CategoryLimits, LimitsConfig};

/// Per-category mutable rate state.
///
/// An explicit timestamp log (rather than a refill-rate token bucket) gives
/// exact sliding-window accounting with no double-burst at window boundaries.
/// The O(window) bookkeeping is acceptable because category ceilings are
/// small.
#[derive(Debug)]
struct Bucket {
    limits: CategoryLimits,
    tokens: u32,
    request_timestamps: VecDeque<Instant>,
    last_refill: Instant,
}

impl Bucket {
    fn new(limits: CategoryLimits) -> Self {
        Self {
            limits,
            tokens: limits.max_requests,
            request_timestamps: VecDeque::new(),
            last_refill: Instant::now(),
        }
    }

    /// Drop timestamps older than the window and recompute available tokens.
    fn refill(&mut self, now: Instant) {
        let window = self.limits.window();
        while let Some(oldest) = self.request_timestamps.front() {
            if now.duration_since(*oldest) >= window {
                self.request_timestamps.pop_front();
            } else {
                break;
            }
        }
        let in_window = self.request_timestamps.len() as u32;
        self.tokens = self.limits.max_requests.saturating_sub(in_window);
        self.last_refill = now;
    }
}

/// Snapshot of one category's rate state, for monitoring surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatus {
    pub available_tokens: u32,
    pub max_tokens: u32,
    pub requests_in_window: u32,
    pub window_ms: u64,
    pub utilization_percent: f64,
}

/// The rate limiter tracking a sliding window of requests per category.
///
/// Buckets are created lazily on first access and live for the limiter's
/// lifetime. The struct is thread-safe; each bucket is guarded independently,
/// so one category's accounting never blocks another's.
pub struct RateLimiter {
    limits: LimitsConfig,
    buckets: DashMap<Category, Bucket>,
}

impl RateLimiter {
    /// Create a rate limiter with the given per-category budgets.
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            buckets: DashMap::new(),
        }
    }

    /// The configured per-category budgets.
    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Whether a request in this category could proceed right now.
    pub fn can_consume(&self, category: Category) -> bool {
        let now = Instant::now();
        let mut bucket = self.bucket(category);
        bucket.refill(now);
        bucket.tokens > 0
    }

    /// Consume one token for this category if available.
    ///
    /// Returns whether consumption succeeded.
    pub fn consume(&self, category: Category) -> bool {
        let now = Instant::now();
        let mut bucket = self.bucket(category);
        bucket.refill(now);
        if bucket.tokens == 0 {
            trace!(category = %category, "no tokens available");
            return false;
        }
        bucket.tokens -= 1;
        bucket.request_timestamps.push_back(now);
        trace!(
            category = %category,
            remaining = bucket.tokens,
            "consumed rate limit token"
        );
        true
    }

    /// How long a caller should wait before re-checking this category.
    ///
    /// When capacity exists this is the category's floor spacing, enforced
    /// even under capacity to avoid micro-bursts. When exhausted it is the
    /// time until the oldest request ages out of the window, floored at the
    /// same spacing.
    pub fn wait_time(&self, category: Category) -> Duration {
        let now = Instant::now();
        let mut bucket = self.bucket(category);
        bucket.refill(now);

        let min_delay = bucket.limits.min_delay();
        if bucket.tokens > 0 {
            return min_delay;
        }
        let until_free = bucket
            .request_timestamps
            .front()
            .map(|oldest| {
                (*oldest + bucket.limits.window()).saturating_duration_since(now)
            })
            .unwrap_or(Duration::ZERO);
        until_free.max(min_delay)
    }

    /// Force the category's bucket to zero remaining tokens.
    ///
    /// Used when the upstream returns an explicit rate-limit response; the
    /// server's signal overrides our local estimate. The timestamp log is
    /// saturated so the exhaustion holds until a full window passes.
    pub fn exhaust(&self, category: Category) {
        let now = Instant::now();
        let mut bucket = self.bucket(category);
        bucket.refill(now);
        while (bucket.request_timestamps.len() as u32) < bucket.limits.max_requests {
            bucket.request_timestamps.push_back(now);
        }
        bucket.tokens = 0;
        debug!(category = %category, "bucket exhausted on upstream signal");
    }

    /// Read-only snapshot of every category's rate state.
    ///
    /// Categories not yet touched report full availability. No bucket state
    /// is mutated; safe to expose on a monitoring endpoint.
    pub fn all_status(&self) -> HashMap<Category, CategoryStatus> {
        let now = Instant::now();
        let mut statuses = HashMap::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let limits = self.limits.for_category(category);
            let in_window = self
                .buckets
                .get(&category)
                .map(|bucket| {
                    bucket
                        .request_timestamps
                        .iter()
                        .filter(|t| now.duration_since(**t) < limits.window())
                        .count() as u32
                })
                .unwrap_or(0);
            let available = limits.max_requests.saturating_sub(in_window);
            statuses.insert(
                category,
                CategoryStatus {
                    available_tokens: available,
                    max_tokens: limits.max_requests,
                    requests_in_window: in_window,
                    window_ms: limits.window_ms,
                    utilization_percent: f64::from(in_window)
                        / f64::from(limits.max_requests)
                        * 100.0,
                },
            );
        }
        statuses
    }

    fn bucket(&self, category: Category) -> dashmap::mapref::one::RefMut<'_, Category, Bucket> {
        self.buckets.entry(category).or_insert_with(|| {
            let limits = self.limits.for_category(category);
            debug!(
                category = %category,
                max_requests = limits.max_requests,
                window_ms = limits.window_ms,
                "creating rate limit bucket"
            );
            Bucket::new(limits)
        })
    }
}
