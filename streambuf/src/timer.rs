//! Remaining-time tracking across repeated waits.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::{BufferError, Result};

/// Timeout sentinel meaning "wait forever".
pub const INFINITE_TIMEOUT: i32 = -1;

/// Checks that `timeout_ms` is either non-negative or [`INFINITE_TIMEOUT`].
pub(crate) fn validate_timeout(timeout_ms: i32) -> Result<()> {
    if timeout_ms < INFINITE_TIMEOUT {
        return Err(BufferError::InvalidTimeout(timeout_ms));
    }
    Ok(())
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Millisecond tick counter. Truncated to 32 bits, so it wraps about every
/// 49.7 days; all arithmetic on ticks is modular.
fn tick_ms() -> u32 {
    epoch().elapsed().as_millis() as u32
}

/// Tracks how much of a timeout is left.
///
/// A `TimerExpiry` is armed with a duration in milliseconds (or
/// [`INFINITE_TIMEOUT`]) and answers "how long may I still wait?" each time a
/// blocking loop wakes up. Once a finite timer reports zero it keeps
/// reporting zero until [`reset`](Self::reset) or
/// [`set_timeout`](Self::set_timeout) re-arms it.
///
/// # Example
///
/// ```
/// use giztoy_streambuf::{TimerExpiry, INFINITE_TIMEOUT};
///
/// let mut timer = TimerExpiry::new(0).unwrap();
/// assert!(timer.expired());
///
/// let mut forever = TimerExpiry::new(INFINITE_TIMEOUT).unwrap();
/// assert_eq!(forever.remaining_time(), INFINITE_TIMEOUT);
/// assert!(!forever.expired());
/// ```
#[derive(Debug, Clone)]
pub struct TimerExpiry {
    timeout_ms: i32,
    start_tick: u32,
    expired: bool,
}

impl TimerExpiry {
    /// Arms a timer that expires `timeout_ms` milliseconds from now.
    pub fn new(timeout_ms: i32) -> Result<Self> {
        validate_timeout(timeout_ms)?;
        Ok(Self {
            timeout_ms,
            start_tick: tick_ms(),
            expired: timeout_ms == 0,
        })
    }

    /// A timer that never expires.
    pub fn infinite() -> Self {
        Self {
            timeout_ms: INFINITE_TIMEOUT,
            start_tick: tick_ms(),
            expired: false,
        }
    }

    /// Returns the configured timeout in milliseconds.
    pub fn timeout(&self) -> i32 {
        self.timeout_ms
    }

    /// Returns true if the timer never expires.
    pub fn is_infinite(&self) -> bool {
        self.timeout_ms == INFINITE_TIMEOUT
    }

    /// Replaces the timeout and re-arms the timer from now.
    pub fn set_timeout(&mut self, timeout_ms: i32) -> Result<()> {
        validate_timeout(timeout_ms)?;
        self.timeout_ms = timeout_ms;
        self.start_tick = tick_ms();
        self.expired = timeout_ms == 0;
        Ok(())
    }

    /// Re-arms the timer from now with the same timeout.
    pub fn reset(&mut self) {
        if self.is_infinite() {
            return;
        }
        self.start_tick = tick_ms();
        self.expired = self.timeout_ms == 0;
    }

    /// Returns the milliseconds left, `0` once expired, or
    /// [`INFINITE_TIMEOUT`] for an infinite timer.
    pub fn remaining_time(&mut self) -> i32 {
        if self.is_infinite() {
            return INFINITE_TIMEOUT;
        }
        if self.expired {
            return 0;
        }
        self.remaining_at(tick_ms())
    }

    /// Like [`remaining_time`](Self::remaining_time), as a `Duration`.
    /// `None` means infinite.
    pub fn remaining(&mut self) -> Option<Duration> {
        match self.remaining_time() {
            INFINITE_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    /// Returns true once the timeout has fully elapsed.
    pub fn expired(&mut self) -> bool {
        self.remaining_time() == 0
    }

    fn remaining_at(&mut self, now: u32) -> i32 {
        let timeout = self.timeout_ms as u32;
        let elapsed = now.wrapping_sub(self.start_tick);
        if elapsed >= timeout {
            self.expired = true;
            return 0;
        }
        (timeout - elapsed) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_timeout_is_expired() {
        let mut timer = TimerExpiry::new(0).unwrap();
        assert!(timer.expired());
        assert_eq!(timer.remaining_time(), 0);
        assert_eq!(timer.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_infinite_never_expires() {
        let mut timer = TimerExpiry::new(INFINITE_TIMEOUT).unwrap();
        for _ in 0..3 {
            assert_eq!(timer.remaining_time(), INFINITE_TIMEOUT);
            assert_eq!(timer.remaining(), None);
            assert!(!timer.expired());
        }
        timer.reset();
        assert!(timer.is_infinite());
        assert!(!TimerExpiry::infinite().expired());
    }

    #[test]
    fn test_invalid_timeout() {
        assert_eq!(
            TimerExpiry::new(-2).unwrap_err(),
            BufferError::InvalidTimeout(-2)
        );
        let mut timer = TimerExpiry::new(10).unwrap();
        assert!(timer.set_timeout(-7).is_err());
        assert_eq!(timer.timeout(), 10);
    }

    #[test]
    fn test_remaining_is_non_increasing() {
        let mut timer = TimerExpiry::new(200).unwrap();
        let mut last = timer.remaining_time();
        assert!(last <= 200);
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(2));
            let now = timer.remaining_time();
            assert!(now <= last);
            last = now;
        }
    }

    #[test]
    fn test_expiry_is_sticky_until_reset() {
        let mut timer = TimerExpiry::new(5).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(timer.expired());

        // Pretend the clock went backwards; the sticky flag still wins.
        timer.start_tick = tick_ms();
        assert_eq!(timer.remaining_time(), 0);

        timer.set_timeout(10_000).unwrap();
        assert!(!timer.expired());
        assert!(timer.remaining_time() > 0);
    }

    #[test]
    fn test_reset_rearms() {
        let mut timer = TimerExpiry::new(5).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(timer.expired());

        timer.set_timeout(1_000).unwrap();
        thread::sleep(Duration::from_millis(20));
        let before = timer.remaining_time();
        timer.reset();
        assert!(timer.remaining_time() >= before);
    }

    #[test]
    fn test_tick_wraparound() {
        let mut timer = TimerExpiry {
            timeout_ms: 100,
            start_tick: u32::MAX - 10,
            expired: false,
        };
        // 30ms after start, across the wrap.
        assert_eq!(timer.remaining_at(19), 70);
        // 111ms after start.
        assert_eq!(timer.remaining_at(100), 0);
        assert!(timer.expired);
    }
}
