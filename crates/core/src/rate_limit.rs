//! Per-caller token-bucket admission control.
//!
//! Every caller has a minute bucket and an hour bucket; a request is admitted only when
//! both hold a token, and then takes one from each. Buckets are keyed by
//! `(caller_id, tier)` in a sharded map. The map shard is only held long enough to clone
//! the bucket handle; the token arithmetic itself runs under the caller's own mutex, so
//! callers never contend with each other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::tier::Tier;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub fn per_minute(requests: u32) -> Self {
        Self { capacity: requests, refill_per_sec: f64::from(requests) / 60.0 }
    }

    pub fn per_hour(requests: u32) -> Self {
        Self { capacity: requests, refill_per_sec: f64::from(requests) / 3_600.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub free: BucketConfig,
    pub pro: BucketConfig,
    pub enterprise: BucketConfig,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: BucketConfig::per_minute(20),
            pro: BucketConfig::per_minute(60),
            enterprise: BucketConfig::per_minute(120),
        }
    }
}

impl TierLimits {
    /// Hour-window defaults that sit alongside the per-minute `Default`.
    pub fn hourly() -> Self {
        Self {
            free: BucketConfig::per_hour(100),
            pro: BucketConfig::per_hour(1_000),
            enterprise: BucketConfig::per_hour(5_000),
        }
    }

    pub fn for_tier(&self, tier: Tier) -> BucketConfig {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// Whole tokens left in each window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub minute: u32,
    pub hour: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Admission {
    Admitted { remaining: Remaining },
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

#[derive(Debug)]
struct TokenBucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(config: BucketConfig, now: Instant) -> Self {
        Self { config, tokens: f64::from(config.capacity), last_refill: now, last_seen: now }
    }

    fn refill(&mut self, now: Instant) {
        // `now` earlier than the last refill (callers racing with stale instants) adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = f64::from(self.config.capacity);
        self.tokens = (self.tokens + elapsed * self.config.refill_per_sec).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn touch(&mut self, now: Instant) {
        self.refill(now);
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    fn time_until_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        if self.config.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(missing / self.config.refill_per_sec)
    }

    fn is_full(&self) -> bool {
        self.tokens >= f64::from(self.config.capacity)
    }

    fn whole_tokens(&self) -> u32 {
        self.tokens.floor() as u32
    }
}

#[derive(Debug)]
struct CallerBuckets {
    minute: TokenBucket,
    hour: TokenBucket,
}

impl CallerBuckets {
    fn full(minute: BucketConfig, hour: BucketConfig, now: Instant) -> Self {
        Self { minute: TokenBucket::full(minute, now), hour: TokenBucket::full(hour, now) }
    }

    fn refill(&mut self, now: Instant) {
        self.minute.refill(now);
        self.hour.refill(now);
    }

    fn try_consume(&mut self, now: Instant) -> Admission {
        self.minute.touch(now);
        self.hour.touch(now);
        if self.minute.tokens >= 1.0 && self.hour.tokens >= 1.0 {
            self.minute.tokens -= 1.0;
            self.hour.tokens -= 1.0;
            return Admission::Admitted { remaining: self.remaining() };
        }
        // An empty window is never charged for a request the other window refused.
        let retry_after = self.minute.time_until_token().max(self.hour.time_until_token());
        Admission::Rejected { retry_after }
    }

    fn remaining(&self) -> Remaining {
        Remaining { minute: self.minute.whole_tokens(), hour: self.hour.whole_tokens() }
    }

    fn is_full(&self) -> bool {
        self.minute.is_full() && self.hour.is_full()
    }

    fn last_seen(&self) -> Instant {
        self.minute.last_seen.max(self.hour.last_seen)
    }
}

type BucketKey = (String, Tier);

pub struct RateLimiter {
    limits: TierLimits,
    hourly: TierLimits,
    enabled: bool,
    buckets: DashMap<BucketKey, Arc<Mutex<CallerBuckets>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(TierLimits::default())
    }
}

impl RateLimiter {
    /// Per-minute `limits` with the default hour windows.
    pub fn new(limits: TierLimits) -> Self {
        Self::with_hourly(limits, TierLimits::hourly())
    }

    pub fn with_hourly(limits: TierLimits, hourly: TierLimits) -> Self {
        Self { limits, hourly, enabled: true, buckets: DashMap::new() }
    }

    /// A limiter that admits everything; used when admission control is switched off.
    pub fn disabled() -> Self {
        Self {
            limits: TierLimits::default(),
            hourly: TierLimits::hourly(),
            enabled: false,
            buckets: DashMap::new(),
        }
    }

    /// Per-minute limits.
    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    pub fn hourly_limits(&self) -> &TierLimits {
        &self.hourly
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn admit(&self, caller_id: &str, tier: Tier) -> Admission {
        self.admit_at(caller_id, tier, Instant::now())
    }

    pub fn admit_at(&self, caller_id: &str, tier: Tier, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Admitted { remaining: self.capacity(tier) };
        }
        let bucket = self.bucket(caller_id, tier, now);
        let mut bucket = bucket.lock();
        bucket.try_consume(now)
    }

    /// Tokens currently available to the caller, without consuming any.
    pub fn remaining(&self, caller_id: &str, tier: Tier) -> Remaining {
        self.remaining_at(caller_id, tier, Instant::now())
    }

    pub fn remaining_at(&self, caller_id: &str, tier: Tier, now: Instant) -> Remaining {
        let key = (caller_id.to_string(), tier);
        let Some(bucket) = self.buckets.get(&key).map(|entry| Arc::clone(entry.value())) else {
            return self.capacity(tier);
        };
        let mut bucket = bucket.lock();
        bucket.refill(now);
        bucket.remaining()
    }

    /// Full-bucket token counts for `tier`.
    pub fn capacity(&self, tier: Tier) -> Remaining {
        Remaining {
            minute: self.limits.for_tier(tier).capacity,
            hour: self.hourly.for_tier(tier).capacity,
        }
    }

    /// Drops buckets that have refilled completely and seen no traffic for `idle_for`.
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self, now: Instant, idle_for: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            let idle = now.saturating_duration_since(bucket.last_seen()) >= idle_for;
            bucket.refill(now);
            !(bucket.is_full() && idle)
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, caller_id: &str, tier: Tier, now: Instant) -> Arc<Mutex<CallerBuckets>> {
        let key = (caller_id.to_string(), tier);
        if let Some(existing) = self.buckets.get(&key) {
            return Arc::clone(existing.value());
        }
        let minute = self.limits.for_tier(tier);
        let hour = self.hourly.for_tier(tier);
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(CallerBuckets::full(minute, hour, now))));
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{Admission, BucketConfig, RateLimiter, Remaining, TierLimits};
    use crate::domain::tier::Tier;

    fn limiter_with_free(capacity: u32, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(TierLimits {
            free: BucketConfig { capacity, refill_per_sec },
            ..TierLimits::default()
        })
    }

    #[test]
    fn capacity_five_admits_five_then_rejects_then_recovers() {
        let limiter = limiter_with_free(5, 1.0);
        let start = Instant::now();

        for attempt in 0..5 {
            assert!(
                limiter.admit_at("caller-a", Tier::Free, start).is_admitted(),
                "request {attempt} should be admitted"
            );
        }
        let sixth = limiter.admit_at("caller-a", Tier::Free, start);
        assert!(matches!(sixth, Admission::Rejected { .. }));

        let later = start + Duration::from_secs(1);
        assert!(limiter.admit_at("caller-a", Tier::Free, later).is_admitted());
        assert!(!limiter.admit_at("caller-a", Tier::Free, later).is_admitted());
    }

    #[test]
    fn rejection_does_not_consume_and_reports_retry_after() {
        let limiter = limiter_with_free(1, 0.5);
        let start = Instant::now();
        assert!(limiter.admit_at("caller-b", Tier::Free, start).is_admitted());

        let rejected = limiter.admit_at("caller-b", Tier::Free, start);
        let Admission::Rejected { retry_after } = rejected else {
            panic!("expected rejection, got {rejected:?}");
        };
        assert_eq!(retry_after, Duration::from_secs(2));

        // Repeated rejections must not push the recovery point further out.
        let _ = limiter.admit_at("caller-b", Tier::Free, start);
        let recovered = start + Duration::from_secs(2);
        assert!(limiter.admit_at("caller-b", Tier::Free, recovered).is_admitted());
    }

    #[test]
    fn callers_and_tiers_have_independent_buckets() {
        let limiter = limiter_with_free(1, 0.1);
        let now = Instant::now();

        assert!(limiter.admit_at("caller-a", Tier::Free, now).is_admitted());
        assert!(!limiter.admit_at("caller-a", Tier::Free, now).is_admitted());
        assert!(limiter.admit_at("caller-b", Tier::Free, now).is_admitted());
        assert!(limiter.admit_at("caller-a", Tier::Pro, now).is_admitted());
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let limiter = limiter_with_free(3, 1.0);
        let start = Instant::now();
        assert!(limiter.admit_at("caller-c", Tier::Free, start).is_admitted());

        let much_later = start + Duration::from_secs(3_600);
        assert_eq!(limiter.remaining_at("caller-c", Tier::Free, much_later).minute, 3);
    }

    #[test]
    fn remaining_reports_capacity_for_unknown_callers() {
        let limiter = RateLimiter::default();
        assert_eq!(
            limiter.remaining("nobody", Tier::Enterprise),
            Remaining { minute: 120, hour: 5_000 }
        );
        assert_eq!(limiter.capacity(Tier::Free), Remaining { minute: 20, hour: 100 });
        assert_eq!(limiter.capacity(Tier::Pro), Remaining { minute: 60, hour: 1_000 });
    }

    #[test]
    fn hour_window_caps_callers_the_minute_window_would_admit() {
        let minute = BucketConfig { capacity: 10, refill_per_sec: 10.0 };
        let limiter = RateLimiter::with_hourly(
            TierLimits { free: minute, ..TierLimits::default() },
            TierLimits { free: BucketConfig::per_hour(3), ..TierLimits::hourly() },
        );
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.admit_at("caller-h", Tier::Free, start).is_admitted());
        }
        let Admission::Rejected { retry_after } = limiter.admit_at("caller-h", Tier::Free, start)
        else {
            panic!("hour window should be exhausted");
        };
        assert!(retry_after > Duration::from_secs(1_199));
        assert!(retry_after < Duration::from_secs(1_201));

        // The refused request took nothing from the minute window.
        let remaining = limiter.remaining_at("caller-h", Tier::Free, start);
        assert_eq!(remaining, Remaining { minute: 7, hour: 0 });

        let admitted = limiter.admit_at("caller-h", Tier::Free, start + Duration::from_secs(1_201));
        assert_eq!(admitted, Admission::Admitted { remaining: Remaining { minute: 9, hour: 0 } });
    }

    #[test]
    fn idle_full_buckets_are_evicted() {
        let limiter = limiter_with_free(2, 1.0);
        let start = Instant::now();
        let _ = limiter.admit_at("caller-d", Tier::Free, start);
        let _ = limiter.admit_at("caller-e", Tier::Free, start);
        assert_eq!(limiter.tracked_buckets(), 2);

        let evicted = limiter.evict_idle(start + Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(evicted, 2);
        assert_eq!(limiter.tracked_buckets(), 0);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::disabled();
        for _ in 0..500 {
            assert!(limiter.admit("flood", Tier::Free).is_admitted());
        }
    }

    #[test]
    fn concurrent_admissions_for_one_caller_never_overspend() {
        let limiter = Arc::new(limiter_with_free(50, 0.0));
        let now = Instant::now();

        let handles = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.admit_at("shared", Tier::Free, now).is_admitted())
                        .count()
                })
            })
            .collect::<Vec<_>>();

        let admitted: usize =
            handles.into_iter().map(|handle| handle.join().expect("thread should finish")).sum();
        assert_eq!(admitted, 50);
    }
}
