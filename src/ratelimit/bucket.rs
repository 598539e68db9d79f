//! Token bucket implementation.

use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use super::clock::Clock;
use crate::error::{Result, TurnstileError};

/// A validated (rate, burst) pair.
///
/// `rate` is the number of permits accrued per second and `burst` the
/// bucket capacity. Construction fails for non-positive rates and zero
/// bursts, so a `LimitConfig` in hand is always usable at request time.
#[derive(Debug, Clone, Copy)]
pub struct LimitConfig {
    rate: f64,
    burst: u32,
}

impl LimitConfig {
    /// Create a new limit, rejecting `rate <= 0` and `burst < 1`.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TurnstileError::InvalidRate(rate));
        }
        if burst < 1 {
            return Err(TurnstileError::InvalidBurst(burst));
        }
        Ok(Self { rate, burst })
    }

    /// 5 requests per second, burst of 10. For writes and sensitive endpoints.
    pub fn strict() -> Self {
        Self { rate: 5.0, burst: 10 }
    }

    /// 50 requests per second, burst of 100. For general endpoints.
    pub fn moderate() -> Self {
        Self { rate: 50.0, burst: 100 }
    }

    /// 100 requests per second, burst of 200. For read-heavy endpoints.
    pub fn relaxed() -> Self {
        Self { rate: 100.0, burst: 200 }
    }

    /// Permits accrued per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum permits held at once.
    pub fn burst(&self) -> u32 {
        self.burst
    }
}

// Construction guarantees a finite positive rate, so comparing the rate's bits
// matches numeric equality.
impl PartialEq for LimitConfig {
    fn eq(&self, other: &Self) -> bool {
        self.rate.to_bits() == other.rate.to_bits() && self.burst == other.burst
    }
}

impl Eq for LimitConfig {}

impl Hash for LimitConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rate.to_bits().hash(state);
        self.burst.hash(state);
    }
}

/// Mutable part of a bucket, guarded by the bucket's own lock.
#[derive(Debug)]
struct BucketState {
    /// Fractional token count, kept unrounded between calls.
    tokens: f64,
    last_refill: Instant,
}

/// Admission state for one identity under one [`LimitConfig`].
///
/// Tokens refill continuously at `rate` per second up to `burst`. Each
/// admitted request consumes one token. A bucket starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket for the given limit.
    pub fn new(limit: LimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            capacity: f64::from(limit.burst),
            refill_rate: limit.rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(limit.burst),
                last_refill: now,
            }),
            clock,
        }
    }

    /// Try to take one token now.
    ///
    /// Returns `true` if the request is admitted, `false` if the bucket holds
    /// less than one token. A denial leaves the token count untouched.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(self.clock.now())
    }

    /// Try to take one token as of `now`.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after applying any pending refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, self.clock.now());
        state.tokens
    }

    /// Maximum number of tokens this bucket holds.
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // A caller holding an older instant than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    fn bucket(rate: f64, burst: u32) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limit = LimitConfig::new(rate, burst).unwrap();
        (TokenBucket::new(limit, clock.clone()), clock)
    }

    #[test]
    fn test_limit_config_rejects_invalid_values() {
        assert!(matches!(
            LimitConfig::new(0.0, 1),
            Err(TurnstileError::InvalidRate(_))
        ));
        assert!(matches!(
            LimitConfig::new(-3.0, 1),
            Err(TurnstileError::InvalidRate(_))
        ));
        assert!(matches!(
            LimitConfig::new(f64::NAN, 1),
            Err(TurnstileError::InvalidRate(_))
        ));
        assert!(matches!(
            LimitConfig::new(1.0, 0),
            Err(TurnstileError::InvalidBurst(0))
        ));
        assert!(LimitConfig::new(0.5, 1).is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(LimitConfig::strict().rate(), 5.0);
        assert_eq!(LimitConfig::strict().burst(), 10);
        assert_eq!(LimitConfig::moderate().burst(), 100);
        assert_eq!(LimitConfig::relaxed().rate(), 100.0);
        assert_eq!(LimitConfig::relaxed().burst(), 200);
    }

    #[test]
    fn test_burst_then_deny() {
        let (bucket, _clock) = bucket(2.0, 3);

        for i in 0..3 {
            assert!(bucket.try_acquire(), "request {} should be admitted", i + 1);
        }
        assert!(!bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refill_after_one_interval() {
        let (bucket, clock) = bucket(2.0, 3);
        while bucket.try_acquire() {}

        // 1/R seconds yields exactly one token
        clock.advance(Duration::from_millis(500));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_example_scenario() {
        let (bucket, clock) = bucket(2.0, 3);

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        clock.advance(Duration::from_secs(1));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let (bucket, clock) = bucket(10.0, 4);
        assert!(bucket.try_acquire());

        clock.advance(Duration::from_secs(3600));
        assert_eq!(bucket.available(), 4.0);

        for _ in 0..4 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_fractional_tokens_are_retained() {
        let (bucket, clock) = bucket(1.0, 1);
        assert!(bucket.try_acquire());

        // Four quarter-second steps add up to one token.
        for _ in 0..3 {
            clock.advance(Duration::from_millis(250));
            assert!(!bucket.try_acquire());
        }
        clock.advance(Duration::from_millis(250));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_denial_leaves_tokens_unchanged() {
        let (bucket, clock) = bucket(4.0, 1);
        assert!(bucket.try_acquire());

        clock.advance(Duration::from_millis(125));
        assert!(!bucket.try_acquire());
        assert!((bucket.available() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_stale_instant_adds_nothing() {
        let (bucket, clock) = bucket(1.0, 2);
        let earlier = clock.now();
        clock.advance(Duration::from_secs(1));

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire_at(earlier));
    }

    #[test]
    fn test_concurrent_acquire_never_overdraws() {
        let (bucket, _clock) = bucket(1.0, 50);
        let bucket = Arc::new(bucket);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || (0..20).filter(|_| bucket.try_acquire()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert!(bucket.available() >= 0.0);
    }
}
