use std::time::{Duration, Instant};

use sentra_types::RateLimits;

/// Decision returned by [`RateLimiter::check_request`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Longest wait among exhausted windows; zero when allowed.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct Window {
    capacity: f64,
    period: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl Window {
    fn new(capacity: u32, period: Duration, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            period,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let rate = self.capacity / self.period.as_secs_f64();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(self.capacity);
        self.last_refill = now;
    }

    fn wait_for(&self, n: f64) -> Duration {
        if self.tokens >= n {
            return Duration::ZERO;
        }
        let deficit = n - self.tokens;
        let rate = self.capacity / self.period.as_secs_f64();
        Duration::from_secs_f64(deficit / rate)
    }
}

/// Multi-window token bucket. Every configured window must simultaneously
/// permit a request; consumption is atomic across windows.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Vec<Window>,
}

impl RateLimiter {
    pub fn new(limits: &RateLimits, now: Instant) -> Self {
        let mut windows = Vec::new();
        if let Some(per_second) = limits.requests_per_second {
            windows.push(Window::new(per_second, Duration::from_secs(1), now));
        }
        if let Some(per_minute) = limits.requests_per_minute {
            windows.push(Window::new(per_minute, Duration::from_secs(60), now));
        }
        if let Some(per_hour) = limits.requests_per_hour {
            windows.push(Window::new(per_hour, Duration::from_secs(3_600), now));
        }
        Self { windows }
    }

    /// An unlimited limiter (no configured windows).
    pub fn unlimited(now: Instant) -> Self {
        let _ = now;
        Self {
            windows: Vec::new(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.windows.is_empty()
    }

    /// Atomically consume `n` tokens from every window, or none at all.
    pub fn try_consume(&mut self, n: u32, now: Instant) -> bool {
        let want = f64::from(n);
        for window in &mut self.windows {
            window.refill(now);
        }
        if self.windows.iter().any(|w| w.tokens < want) {
            return false;
        }
        for window in &mut self.windows {
            window.tokens -= want;
        }
        true
    }

    /// Check-and-consume a single request. On rejection, reports the longest
    /// wait among the windows that refused it.
    pub fn check_request(&mut self, now: Instant) -> RateDecision {
        for window in &mut self.windows {
            window.refill(now);
        }
        let blocked: Vec<&Window> = self.windows.iter().filter(|w| w.tokens < 1.0).collect();
        if blocked.is_empty() {
            for window in &mut self.windows {
                window.tokens -= 1.0;
            }
            return RateDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        }
        let wait = blocked
            .iter()
            .map(|w| w.wait_for(1.0))
            .max()
            .unwrap_or(Duration::ZERO);
        RateDecision {
            allowed: false,
            retry_after_ms: wait.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_second: Option<u32>, per_minute: Option<u32>) -> RateLimits {
        RateLimits {
            requests_per_second: per_second,
            requests_per_minute: per_minute,
            requests_per_hour: None,
        }
    }

    #[test]
    fn consumes_until_window_exhausted() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(&limits(Some(2), None), now);
        assert!(limiter.check_request(now).allowed);
        assert!(limiter.check_request(now).allowed);
        let decision = limiter.check_request(now);
        assert!(!decision.allowed);
        assert!(decision.retry_after_ms > 0);
    }

    #[test]
    fn refills_with_elapsed_time() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(&limits(Some(1), None), now);
        assert!(limiter.check_request(now).allowed);
        assert!(!limiter.check_request(now).allowed);
        let later = now + Duration::from_millis(1_100);
        assert!(limiter.check_request(later).allowed);
    }

    #[test]
    fn all_windows_must_permit() {
        let now = Instant::now();
        // Per-second window would allow a burst, per-minute window caps it.
        let mut limiter = RateLimiter::new(&limits(Some(10), Some(2)), now);
        assert!(limiter.check_request(now).allowed);
        assert!(limiter.check_request(now).allowed);
        let decision = limiter.check_request(now);
        assert!(!decision.allowed);
        // The minute window dictates the wait, so it exceeds a second-window wait.
        assert!(decision.retry_after_ms >= 1_000);
    }

    #[test]
    fn rejection_reports_longest_wait() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(&limits(Some(1), Some(1)), now);
        assert!(limiter.check_request(now).allowed);
        let decision = limiter.check_request(now);
        assert!(!decision.allowed);
        // Minute window refill dominates the one-second window.
        assert!(decision.retry_after_ms > 50_000);
    }

    #[test]
    fn try_consume_is_atomic_across_windows() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(&limits(Some(5), Some(3)), now);
        assert!(limiter.try_consume(3, now));
        // Second window is out of tokens: nothing is deducted anywhere.
        assert!(!limiter.try_consume(2, now));
        let later = now + Duration::from_secs(21);
        // Minute window refilled one token (3/60s * 21s ≈ 1.05).
        assert!(limiter.try_consume(1, later));
    }

    #[test]
    fn unlimited_limiter_always_allows() {
        let now = Instant::now();
        let mut limiter = RateLimiter::unlimited(now);
        for _ in 0..1_000 {
            assert!(limiter.check_request(now).allowed);
        }
    }
}
