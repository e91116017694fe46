//! Service-loop timing
//!
//! The engine timestamps everything with a 32-bit millisecond clock anchored
//! at host creation. The clock wraps after ~49 days; all comparisons use
//! wrapping subtraction so the wrap is harmless. Timers and the rate
//! limiter take the current time as a parameter instead of reading a global
//! clock, which keeps them deterministic under test.

use std::time::Instant;

/// Millisecond clock anchored at an epoch
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the epoch, wrapping at `u32::MAX`
    #[inline]
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed distance between two wrapping millisecond timestamps
///
/// Positive when `a` is later than `b`.
#[inline]
pub fn ms_since(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Periodic timer over the wrapping millisecond clock
#[derive(Debug, Clone)]
pub struct Timer {
    interval_ms: u32,
    last_fire: u32,
}

impl Timer {
    pub fn new(interval_ms: u32, now_ms: u32) -> Self {
        Timer {
            interval_ms,
            last_fire: now_ms,
        }
    }

    /// Check whether the interval has elapsed
    pub fn expired(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.last_fire) >= self.interval_ms
    }

    /// Restart the interval from `now_ms`
    pub fn reset(&mut self, now_ms: u32) {
        self.last_fire = now_ms;
    }

    /// Fire the timer if expired, returning true when it fired
    pub fn try_fire(&mut self, now_ms: u32) -> bool {
        if self.expired(now_ms) {
            self.reset(now_ms);
            true
        } else {
            false
        }
    }
}

/// Token bucket pacing outgoing bytes
///
/// A rate of zero means unlimited; `consume` then always succeeds. The
/// bucket holds up to one second of budget so short bursts pass through
/// without artificial delay.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bytes_per_second: u32,
    tokens: u64,
    last_update: u32,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u32, now_ms: u32) -> Self {
        RateLimiter {
            bytes_per_second,
            tokens: bytes_per_second as u64,
            last_update: now_ms,
        }
    }

    /// Change the rate; zero disables limiting
    pub fn set_rate(&mut self, bytes_per_second: u32, now_ms: u32) {
        self.refill(now_ms);
        self.bytes_per_second = bytes_per_second;
        self.tokens = self.tokens.min(bytes_per_second as u64);
    }

    fn refill(&mut self, now_ms: u32) {
        let elapsed = now_ms.wrapping_sub(self.last_update) as u64;
        if elapsed == 0 {
            return;
        }
        let earned = elapsed * self.bytes_per_second as u64 / 1_000;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.bytes_per_second as u64);
            self.last_update = now_ms;
        }
    }

    /// Spend budget for `bytes`; returns false when the bucket is empty
    pub fn consume(&mut self, bytes: usize, now_ms: u32) -> bool {
        if self.bytes_per_second == 0 {
            return true;
        }
        self.refill(now_ms);
        if self.tokens >= bytes as u64 {
            self.tokens -= bytes as u64;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = Clock::new();
        let start = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= start + 5);
    }

    #[test]
    fn test_ms_since_wraps() {
        assert_eq!(ms_since(10, u32::MAX - 9), 20);
        assert_eq!(ms_since(u32::MAX - 9, 10), -20);
    }

    #[test]
    fn test_timer_fires_once_per_interval() {
        let mut timer = Timer::new(100, 0);
        assert!(!timer.try_fire(50));
        assert!(timer.try_fire(100));
        assert!(!timer.try_fire(150));
        assert!(timer.try_fire(200));
    }

    #[test]
    fn test_timer_across_wrap() {
        let mut timer = Timer::new(100, u32::MAX - 50);
        assert!(!timer.expired(u32::MAX - 10));
        assert!(timer.expired(49));
    }

    #[test]
    fn test_rate_limiter_budget() {
        let mut limiter = RateLimiter::new(1_000, 0);

        // Full bucket at creation
        assert!(limiter.consume(600, 0));
        assert!(limiter.consume(400, 0));
        assert!(!limiter.consume(1, 0));

        // Half a second earns half the rate back
        assert!(limiter.consume(500, 500));
        assert!(!limiter.consume(1, 500));
    }

    #[test]
    fn test_rate_limiter_unlimited() {
        let mut limiter = RateLimiter::new(0, 0);
        assert!(limiter.consume(usize::MAX, 0));
    }
}
