//! Shared state and the wait loop used by both stream buffers.
//!
//! A single condition variable ("state changed") is broadcast on every
//! mutation. Waiters with different thresholds share it, so every wake is
//! followed by a recheck of the waiter's own predicate under the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{BufferError, Result};
use crate::options::BufferOptions;
use crate::ring::RingBuffer;
use crate::signal::Signal;
use crate::timer::{TimerExpiry, validate_timeout};

/// Upper bound on a single blocking slice while a cancellation token is
/// attached, so cancellation is noticed even without a state change.
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lock-protected buffer state.
pub(crate) struct State {
    pub(crate) ring: RingBuffer<u8>,
    pub(crate) device_dead: bool,
}

/// Outcome of a predicate evaluated under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStatus {
    Satisfied,
    Failed,
    Pending,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    closed: AtomicBool,
    capacity: usize,
    /// "not full" on the read side, "not empty" on the write side.
    pub(crate) signal: Signal,
}

impl Shared {
    pub(crate) fn new(options: &BufferOptions, signal_set: bool) -> Result<Self> {
        let ring = if options.pinned {
            RingBuffer::pinned(options.capacity)?
        } else {
            RingBuffer::new(options.capacity)?
        };
        Ok(Self {
            capacity: ring.capacity(),
            state: Mutex::new(State {
                ring,
                device_dead: false,
            }),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
            signal: Signal::new(signal_set),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Locks the state, failing once the buffer has been closed.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.is_closed() {
            return Err(BufferError::Closed);
        }
        Ok(self.state.lock())
    }

    /// Wakes every waiter so it rechecks its predicate.
    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Marks the buffer closed. Returns false if it already was.
    ///
    /// `on_close` runs under the lock before waiters are released.
    pub(crate) fn close(&self, on_close: impl FnOnce(&mut State)) -> bool {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        state.device_dead = true;
        on_close(&mut state);
        self.changed.notify_all();
        true
    }

    /// Argument checks and answers that need no lock.
    ///
    /// `count` is `None` for sentinel waits (such as "until empty") that are
    /// not measured in bytes.
    pub(crate) fn precheck(
        &self,
        count: Option<usize>,
        timeout_ms: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<bool>> {
        validate_timeout(timeout_ms)?;
        if self.is_closed() {
            return Err(BufferError::Closed);
        }
        match count {
            Some(0) => return Ok(Some(true)),
            Some(n) if n > self.capacity => return Ok(Some(false)),
            _ => {}
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Ok(Some(false));
        }
        Ok(None)
    }

    /// Blocks until `check` settles, the timeout runs out, `cancel` fires,
    /// or the buffer is closed.
    pub(crate) fn wait_until<F>(
        &self,
        timeout_ms: i32,
        cancel: Option<&CancellationToken>,
        mut check: F,
    ) -> Result<bool>
    where
        F: FnMut(&State) -> WaitStatus,
    {
        let mut state = self.lock()?;
        match check(&*state) {
            WaitStatus::Satisfied => return Ok(true),
            WaitStatus::Failed => return Ok(false),
            WaitStatus::Pending => {}
        }
        if timeout_ms == 0 {
            return Ok(false);
        }

        trace!("waiting up to {}ms", timeout_ms);
        let mut timer = TimerExpiry::new(timeout_ms)?;
        loop {
            let slice = match (timer.remaining(), cancel) {
                (Some(left), Some(_)) => Some(left.min(CANCEL_POLL_INTERVAL)),
                (None, Some(_)) => Some(CANCEL_POLL_INTERVAL),
                (left, None) => left,
            };
            match slice {
                Some(slice) => {
                    self.changed.wait_for(&mut state, slice);
                }
                None => self.changed.wait(&mut state),
            }

            if self.is_closed() {
                trace!("wait released by close");
                return Ok(false);
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                trace!("wait cancelled");
                return Ok(false);
            }
            match check(&*state) {
                WaitStatus::Satisfied => return Ok(true),
                WaitStatus::Failed => return Ok(false),
                WaitStatus::Pending => {}
            }
            if timer.expired() {
                trace!("wait timed out after {}ms", timeout_ms);
                return Ok(false);
            }
        }
    }
}

/// Runs [`Shared::wait_until`] without blocking the calling task.
///
/// A predicate that is already settled resolves here without scheduling.
/// Otherwise the blocking loop moves to tokio's blocking pool and races the
/// cancellation token. The worker always polls an internal token that is
/// cancelled when this future completes or is dropped, so it never outlives
/// its caller.
pub(crate) async fn wait_async<F>(
    shared: Arc<Shared>,
    timeout_ms: i32,
    cancel: Option<CancellationToken>,
    mut check: F,
) -> Result<bool>
where
    F: FnMut(&State) -> WaitStatus + Send + 'static,
{
    {
        let state = shared.lock()?;
        match check(&*state) {
            WaitStatus::Satisfied => return Ok(true),
            WaitStatus::Failed => return Ok(false),
            WaitStatus::Pending => {}
        }
        if timeout_ms == 0 {
            return Ok(false);
        }
    }

    let stop = match &cancel {
        Some(cancel) => cancel.child_token(),
        None => CancellationToken::new(),
    };
    let _stop_on_drop = stop.clone().drop_guard();

    let mut worker = {
        let shared = Arc::clone(&shared);
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || shared.wait_until(timeout_ms, Some(&stop), check))
    };

    tokio::select! {
        joined = &mut worker => joined.map_err(|e| BufferError::WaitAborted(e.to_string()))?,
        _ = stop.cancelled() => {
            // Let the blocking loop observe the token right away.
            shared.notify();
            Ok(false)
        }
    }
}
