//! Level-triggered signal for driver-side multiplexing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A manual-reset event.
///
/// The signal stays set until it is explicitly reset, so any number of
/// waiters observe it. Buffers use it to publish "not empty" or "not full" to
/// a driver that waits on several sources at once. Only the owning buffer
/// flips it, and only while holding its state lock; drivers get read access
/// through [`is_set`](Self::is_set) (a lock-free read) and
/// [`wait`](Self::wait).
///
/// ```compile_fail
/// let buf = giztoy_streambuf::ConsumerBuffer::new(4).unwrap();
/// buf.not_full().reset();
/// ```
pub struct Signal {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    /// Creates a signal in the given state.
    pub(crate) fn new(set: bool) -> Self {
        Self {
            flag: AtomicBool::new(set),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Returns true if the signal is set.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sets the signal and wakes every waiter.
    pub(crate) fn set(&self) {
        let _guard = self.lock.lock();
        self.flag.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Clears the signal.
    pub(crate) fn reset(&self) {
        let _guard = self.lock.lock();
        self.flag.store(false, Ordering::Release);
    }

    pub(crate) fn update(&self, set: bool) {
        if set != self.is_set() {
            if set { self.set() } else { self.reset() }
        }
    }

    /// Blocks until the signal is set or `timeout` elapses (`None` waits
    /// forever). Returns the state of the signal on return.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.lock.lock();
        match timeout {
            None => {
                while !self.is_set() {
                    self.cond.wait(&mut guard);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !self.is_set() {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return self.is_set();
                    }
                }
                true
            }
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_level_triggered() {
        let signal = Signal::new(false);
        assert!(!signal.is_set());
        signal.set();
        assert!(signal.wait(Some(Duration::ZERO)));
        // Still set for a second waiter.
        assert!(signal.wait(None));
        signal.reset();
        assert!(!signal.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_update() {
        let signal = Signal::new(true);
        signal.update(true);
        assert!(signal.is_set());
        signal.update(false);
        assert!(!signal.is_set());
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let signal = Arc::new(Signal::new(false));
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(20));
        signal.set();
        assert!(waiter.join().unwrap());
    }
}
