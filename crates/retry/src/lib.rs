//! Rate-limited retry: a per-service token bucket gates how many
//! concurrent retry attempts are in flight, and a backoff calculator
//! turns an attempt number (or a server-supplied `Retry-After`) into a
//! delay.
//!
//! The bucket's effective capacity adapts to observed failures: a
//! rate-limit response (429, explicit `RateLimitError`) shrinks it
//! sharply, a generic transient failure (timeout, reset, unavailable)
//! shrinks it gently, and a run of successes grows it back toward the
//! configured base capacity.

use std::collections::HashMap;
use std::sync::Arc;

use openclaw_clock::SharedClock;
use parking_lot::Mutex;
use rand::Rng;

pub const DEFAULT_BUCKET_CAPACITY: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER_MS: u64 = 250;
pub const DEFAULT_REFILL_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    NonRetryable,
}

/// Classifies an HTTP-style status code for retry eligibility: 408, 429,
/// and 5xx are retryable; everything else is not.
pub fn classify_status(status: u16) -> RetryClass {
    match status {
        408 | 429 => RetryClass::Retryable,
        500..=599 => RetryClass::Retryable,
        _ => RetryClass::NonRetryable,
    }
}

pub fn classify_io_error(err: &std::io::Error) -> RetryClass {
    use std::io::ErrorKind::*;
    match err.kind() {
        TimedOut | ConnectionReset | ConnectionAborted | Interrupted | WouldBlock => {
            RetryClass::Retryable
        }
        _ => RetryClass::NonRetryable,
    }
}

/// Matches the service-specific substrings spec.md names as retryable:
/// "429 | timeout | connect | reset | closed | unavailable | temporarily".
pub fn classify_message(message: &str) -> RetryClass {
    let lower = message.to_ascii_lowercase();
    const NEEDLES: [&str; 7] = [
        "429",
        "timeout",
        "connect",
        "reset",
        "closed",
        "unavailable",
        "temporarily",
    ];
    if NEEDLES.iter().any(|n| lower.contains(n)) {
        RetryClass::Retryable
    } else {
        RetryClass::NonRetryable
    }
}

/// How sharply a failure should shrink a service's effective bucket
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    /// Explicit rate-limit signal (429, `RateLimitError`): halve capacity.
    RateLimited,
    /// Generic transient failure (timeout, reset, unavailable): shrink
    /// by one token.
    Transient,
}

struct Bucket {
    tokens: u32,
    base_capacity: u32,
    effective_capacity: u32,
    last_refill_ms: i64,
    refill_interval_ms: i64,
}

impl Bucket {
    fn new(capacity: u32, now_ms: i64, refill_interval_ms: i64) -> Self {
        Self {
            tokens: capacity,
            base_capacity: capacity,
            effective_capacity: capacity,
            last_refill_ms: now_ms,
            refill_interval_ms,
        }
    }

    fn refill(&mut self, now_ms: i64) {
        if self.refill_interval_ms <= 0 {
            return;
        }
        let elapsed = now_ms - self.last_refill_ms;
        if elapsed <= 0 {
            return;
        }
        let periods = elapsed / self.refill_interval_ms;
        if periods > 0 {
            self.tokens = (self.tokens + periods as u32).min(self.effective_capacity);
            self.last_refill_ms += periods * self.refill_interval_ms;
        }
    }

    fn shrink(&mut self, severity: FailureSeverity) {
        self.effective_capacity = match severity {
            FailureSeverity::RateLimited => (self.effective_capacity / 2).max(1),
            FailureSeverity::Transient => self.effective_capacity.saturating_sub(1).max(1),
        };
        self.tokens = self.tokens.min(self.effective_capacity);
    }

    fn grow(&mut self) {
        if self.effective_capacity < self.base_capacity {
            self.effective_capacity += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

/// `min(base * 2^(attempt-1) + jitter, max)`, or the server's
/// `retry_after_ms` verbatim when present.
pub fn compute_delay_ms(config: &BackoffConfig, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
    if let Some(retry_after) = retry_after_ms {
        return retry_after;
    }
    let exp = attempt.saturating_sub(1).min(20);
    let scaled = config.base_delay_ms.saturating_mul(1u64 << exp);
    let jitter = if config.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=config.jitter_ms)
    } else {
        0
    };
    scaled.saturating_add(jitter).min(config.max_delay_ms)
}

pub struct RetryLimiter {
    clock: SharedClock,
    capacity: u32,
    refill_interval_ms: i64,
    backoff: BackoffConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RetryLimiter {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            capacity: DEFAULT_BUCKET_CAPACITY,
            refill_interval_ms: DEFAULT_REFILL_INTERVAL_MS,
            backoff: BackoffConfig::default(),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_capacity(mut self: Arc<Self>, capacity: u32) -> Arc<Self> {
        Arc::get_mut(&mut self).expect("no clones yet").capacity = capacity;
        self
    }

    fn bucket_for<'a>(&self, buckets: &'a mut HashMap<String, Bucket>, service: &str, now_ms: i64) -> &'a mut Bucket {
        buckets
            .entry(service.to_string())
            .or_insert_with(|| Bucket::new(self.capacity, now_ms, self.refill_interval_ms))
    }

    /// Attempts to reserve a token for `service`'s very first retry
    /// attempt on a freshly failed call. Returns false if the service's
    /// bucket is exhausted, meaning the caller should surface the
    /// original failure instead of retrying.
    pub fn acquire_initial_retry_token(&self, service: &str) -> bool {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = self.bucket_for(&mut buckets, service, now);
        bucket.refill(now);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn release_token(&self, service: &str) {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(service) {
            bucket.refill(now);
            bucket.tokens = (bucket.tokens + 1).min(bucket.effective_capacity);
        }
    }

    /// Feeds a failed attempt back into the limiter: a rate-limit signal
    /// shrinks the bucket sharply, a generic transient failure shrinks
    /// it gently. Returns whether the error was classified retryable.
    pub fn record_failure(&self, service: &str, severity: FailureSeverity) {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = self.bucket_for(&mut buckets, service, now);
        bucket.shrink(severity);
        tracing::debug!(service, effective_capacity = bucket.effective_capacity, "bucket shrunk after failure");
    }

    /// Feeds a successful attempt back into the limiter, growing the
    /// bucket one token closer to its base capacity.
    pub fn record_success(&self, service: &str) {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = self.bucket_for(&mut buckets, service, now);
        bucket.grow();
    }

    pub fn available_tokens(&self, service: &str) -> u32 {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(service) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.tokens
            }
            None => self.capacity,
        }
    }

    pub fn effective_capacity(&self, service: &str) -> u32 {
        let buckets = self.buckets.lock();
        buckets
            .get(service)
            .map(|b| b.effective_capacity)
            .unwrap_or(self.capacity)
    }

    pub fn next_delay_ms(&self, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
        compute_delay_ms(&self.backoff, attempt, retry_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_clock::mock_clock;

    #[test]
    fn classify_status_flags_retryable_codes() {
        assert_eq!(classify_status(429), RetryClass::Retryable);
        assert_eq!(classify_status(503), RetryClass::Retryable);
        assert_eq!(classify_status(404), RetryClass::NonRetryable);
        assert_eq!(classify_status(200), RetryClass::NonRetryable);
    }

    #[test]
    fn classify_message_matches_named_substrings() {
        assert_eq!(classify_message("connection reset by peer"), RetryClass::Retryable);
        assert_eq!(classify_message("service temporarily unavailable"), RetryClass::Retryable);
        assert_eq!(classify_message("invalid API key"), RetryClass::NonRetryable);
    }

    #[test]
    fn retry_after_overrides_computed_backoff() {
        let config = BackoffConfig::default();
        let delay = compute_delay_ms(&config, 5, Some(777));
        assert_eq!(delay, 777);
    }

    #[test]
    fn computed_backoff_grows_exponentially_and_caps_at_max() {
        let config = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 0,
        };
        assert_eq!(compute_delay_ms(&config, 1, None), 100);
        assert_eq!(compute_delay_ms(&config, 2, None), 200);
        assert_eq!(compute_delay_ms(&config, 3, None), 400);
        assert_eq!(compute_delay_ms(&config, 10, None), 1_000);
    }

    #[test]
    fn token_bucket_denies_once_exhausted() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(2);
        assert!(limiter.acquire_initial_retry_token("svc-a"));
        assert!(limiter.acquire_initial_retry_token("svc-a"));
        assert!(!limiter.acquire_initial_retry_token("svc-a"));
    }

    #[test]
    fn token_bucket_refills_after_interval() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(1);
        assert!(limiter.acquire_initial_retry_token("svc-b"));
        assert!(!limiter.acquire_initial_retry_token("svc-b"));

        clock.advance(1_000);
        assert!(limiter.acquire_initial_retry_token("svc-b"));
    }

    #[test]
    fn buckets_are_isolated_per_service() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(1);
        assert!(limiter.acquire_initial_retry_token("svc-a"));
        assert!(limiter.acquire_initial_retry_token("svc-c"));
    }

    #[test]
    fn release_token_returns_capacity() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(1);
        assert!(limiter.acquire_initial_retry_token("svc-d"));
        limiter.release_token("svc-d");
        assert_eq!(limiter.available_tokens("svc-d"), 1);
    }

    #[test]
    fn rate_limit_failure_halves_effective_capacity() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(8);
        limiter.record_failure("discord", FailureSeverity::RateLimited);
        assert_eq!(limiter.effective_capacity("discord"), 4);
    }

    #[test]
    fn transient_failure_shrinks_by_one() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(5);
        limiter.record_failure("telegram", FailureSeverity::Transient);
        assert_eq!(limiter.effective_capacity("telegram"), 4);
    }

    #[test]
    fn success_grows_capacity_back_toward_base() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(4);
        limiter.record_failure("webfetch", FailureSeverity::RateLimited);
        assert_eq!(limiter.effective_capacity("webfetch"), 2);
        limiter.record_success("webfetch");
        limiter.record_success("webfetch");
        assert_eq!(limiter.effective_capacity("webfetch"), 4);
        limiter.record_success("webfetch");
        assert_eq!(limiter.effective_capacity("webfetch"), 4);
    }

    #[test]
    fn shrunk_bucket_caps_available_tokens() {
        let clock = mock_clock();
        let limiter = RetryLimiter::new(clock.clone()).with_capacity(4);
        assert!(limiter.acquire_initial_retry_token("gateway"));
        assert!(limiter.acquire_initial_retry_token("gateway"));
        limiter.record_failure("gateway", FailureSeverity::RateLimited);
        assert_eq!(limiter.available_tokens("gateway"), 2);
    }
}
