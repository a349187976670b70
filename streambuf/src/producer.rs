//! Write-side stream buffer: user code produces bytes, a driver consumes them.

use std::fmt;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::options::BufferOptions;
use crate::signal::Signal;
use crate::wait::{Shared, State, WaitStatus, wait_async};

/// A thread-safe write buffer sitting between a stream writer and a driver.
///
/// The writer queues bytes with [`write`](Self::write) and waits for room
/// with [`wait_for_write`](Self::wait_for_write). The driver sends them on,
/// either through [`take`](Self::take) or by reading the storage under the
/// [`lock`](Self::lock) guard and then calling [`ProducerGuard::consume`].
///
/// # Semantics
///
/// - **Write**: never blocks, accepts what fits; silently dropped once the
///   device is dead
/// - **Wait**: blocks until `count` bytes are free (or the buffer is empty),
///   the timeout runs out, the token is cancelled or the device dies
/// - **Device dead**: purges the buffer and fails every wait until
///   [`reset`](Self::reset)
///
/// `not_empty` is published as a level-triggered [`Signal`] so the driver
/// can multiplex it with its own handles.
///
/// # Example
///
/// ```
/// use giztoy_streambuf::ProducerBuffer;
///
/// let buf = ProducerBuffer::new(8).unwrap();
/// assert_eq!(buf.write(b"ping").unwrap(), 4);
/// assert!(buf.not_empty().is_set());
///
/// // Driver side.
/// let mut out = [0u8; 8];
/// assert_eq!(buf.take(&mut out).unwrap(), 4);
/// assert!(buf.wait_for_empty(0).unwrap());
/// ```
#[derive(Clone)]
pub struct ProducerBuffer {
    inner: Arc<Shared>,
}

fn write_status(state: &State, count: usize) -> WaitStatus {
    if state.device_dead {
        WaitStatus::Failed
    } else if state.ring.free() >= count {
        WaitStatus::Satisfied
    } else {
        WaitStatus::Pending
    }
}

fn empty_status(state: &State) -> WaitStatus {
    if state.device_dead {
        WaitStatus::Failed
    } else if state.ring.is_empty() {
        WaitStatus::Satisfied
    } else {
        WaitStatus::Pending
    }
}

fn discard(state: &mut State) {
    state.ring.clear();
}

impl ProducerBuffer {
    /// Creates a write buffer holding up to `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_options(&BufferOptions::new(capacity))
    }

    /// Creates a write buffer whose storage keeps a stable address.
    pub fn pinned(capacity: usize) -> Result<Self> {
        Self::with_options(&BufferOptions::new(capacity).pinned(true))
    }

    /// Creates a write buffer from options.
    pub fn with_options(options: &BufferOptions) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Shared::new(options, false)?),
        })
    }

    /// Returns the fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    // ------------------------------------------------------------------
    // User side
    // ------------------------------------------------------------------

    /// Queues as much of `data` as fits without blocking.
    ///
    /// Returns the number of bytes accepted. Writing to a dead device is a
    /// no-op that returns 0.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.inner.lock()?;
        if state.device_dead {
            return Ok(0);
        }
        let n = state.ring.append(data);
        if n > 0 {
            self.inner.signal.set();
            self.inner.notify();
        }
        Ok(n)
    }

    /// Queues a single byte. Returns false if there was no room or the
    /// device is dead.
    pub fn write_one(&self, byte: u8) -> Result<bool> {
        Ok(self.write(&[byte])? == 1)
    }

    /// Returns the number of bytes that can be written without waiting.
    pub fn bytes_free(&self) -> Result<usize> {
        Ok(self.inner.lock()?.ring.free())
    }

    /// Returns the number of bytes still waiting for the driver.
    pub fn bytes_to_write(&self) -> Result<usize> {
        Ok(self.inner.lock()?.ring.len())
    }

    /// Discards queued data. Unlike [`device_dead`](Self::device_dead) the
    /// buffer stays usable.
    pub fn purge(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        let len = state.ring.len();
        discard(&mut state);
        self.inner.signal.reset();
        self.inner.notify();
        debug!("write buffer: purged {} bytes", len);
        Ok(())
    }

    /// Empties the buffer and brings the device back to life.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        state.ring.reset();
        state.device_dead = false;
        self.inner.signal.reset();
        self.inner.notify();
        debug!("write buffer: reset");
        Ok(())
    }

    /// Closes the buffer. Blocked waiters return `false` and every later
    /// call fails with [`BufferError::Closed`](crate::BufferError::Closed).
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let closed = self.inner.close(discard);
        if closed {
            self.inner.signal.reset();
            debug!("write buffer: closed");
        }
    }

    /// Blocks until at least `count` bytes are free.
    ///
    /// `timeout_ms` is in milliseconds, `-1` waits forever. Returns `false`
    /// on timeout or once the device is dead.
    pub fn wait_for_write(&self, count: usize, timeout_ms: i32) -> Result<bool> {
        self.wait_for_write_inner(count, timeout_ms, None)
    }

    /// Like [`wait_for_write`](Self::wait_for_write), also returning `false`
    /// once `cancel` fires.
    pub fn wait_for_write_cancellable(
        &self,
        count: usize,
        timeout_ms: i32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.wait_for_write_inner(count, timeout_ms, Some(cancel))
    }

    fn wait_for_write_inner(
        &self,
        count: usize,
        timeout_ms: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if let Some(done) = self.inner.precheck(Some(count), timeout_ms, cancel)? {
            return Ok(done);
        }
        self.inner
            .wait_until(timeout_ms, cancel, |state| write_status(state, count))
    }

    /// Async form of [`wait_for_write`](Self::wait_for_write).
    pub async fn wait_for_write_async(
        &self,
        count: usize,
        timeout_ms: i32,
        cancel: Option<CancellationToken>,
    ) -> Result<bool> {
        if let Some(done) = self.inner.precheck(Some(count), timeout_ms, cancel.as_ref())? {
            return Ok(done);
        }
        wait_async(Arc::clone(&self.inner), timeout_ms, cancel, move |state| {
            write_status(state, count)
        })
        .await
    }

    /// Blocks until the driver has sent everything.
    pub fn wait_for_empty(&self, timeout_ms: i32) -> Result<bool> {
        self.wait_for_empty_inner(timeout_ms, None)
    }

    /// Like [`wait_for_empty`](Self::wait_for_empty), also returning `false`
    /// once `cancel` fires.
    pub fn wait_for_empty_cancellable(
        &self,
        timeout_ms: i32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.wait_for_empty_inner(timeout_ms, Some(cancel))
    }

    fn wait_for_empty_inner(
        &self,
        timeout_ms: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if let Some(done) = self.inner.precheck(None, timeout_ms, cancel)? {
            return Ok(done);
        }
        self.inner.wait_until(timeout_ms, cancel, empty_status)
    }

    /// Async form of [`wait_for_empty`](Self::wait_for_empty).
    pub async fn wait_for_empty_async(
        &self,
        timeout_ms: i32,
        cancel: Option<CancellationToken>,
    ) -> Result<bool> {
        if let Some(done) = self.inner.precheck(None, timeout_ms, cancel.as_ref())? {
            return Ok(done);
        }
        wait_async(Arc::clone(&self.inner), timeout_ms, cancel, empty_status).await
    }

    // ------------------------------------------------------------------
    // Driver side
    // ------------------------------------------------------------------

    /// Locks the buffer for direct storage access.
    pub fn lock(&self) -> Result<ProducerGuard<'_>> {
        Ok(ProducerGuard {
            state: self.inner.lock()?,
            shared: &self.inner,
        })
    }

    /// Drops `n` bytes the driver has sent.
    pub fn consume(&self, n: usize) -> Result<()> {
        self.lock()?.consume(n)
    }

    /// Copies queued bytes into `dst` and consumes them.
    pub fn take(&self, dst: &mut [u8]) -> Result<usize> {
        Ok(self.lock()?.take(dst))
    }

    /// Level-triggered "not empty" signal for the driver.
    pub fn not_empty(&self) -> &Signal {
        &self.inner.signal
    }

    /// Marks the device dead, purges queued data and releases every waiter.
    pub fn device_dead(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        if !state.device_dead {
            debug!("write buffer: device dead, dropping {} bytes", state.ring.len());
            state.device_dead = true;
        }
        discard(&mut state);
        self.inner.signal.reset();
        self.inner.notify();
        Ok(())
    }

    /// Returns true if the device has been marked dead.
    pub fn is_device_dead(&self) -> Result<bool> {
        Ok(self.inner.lock()?.device_dead)
    }
}

impl fmt::Debug for ProducerBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBuffer")
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Locked driver view of a [`ProducerBuffer`].
///
/// Holding the guard holds the buffer's lock. Bytes read through
/// [`storage`](Self::storage) or [`as_slices`](Self::as_slices) are released
/// only by [`consume`](Self::consume).
pub struct ProducerGuard<'a> {
    state: MutexGuard<'a, State>,
    shared: &'a Shared,
}

impl ProducerGuard<'_> {
    /// The whole backing storage.
    pub fn storage(&self) -> &[u8] {
        self.state.ring.storage()
    }

    /// Queued data as two runs; the second is empty unless it wraps.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        self.state.ring.as_slices()
    }

    /// Physical index of the oldest queued byte.
    pub fn start(&self) -> usize {
        self.state.ring.start()
    }

    /// Physical index one past the newest queued byte.
    pub fn end(&self) -> usize {
        self.state.ring.end()
    }

    /// Contiguous queued bytes starting at logical `offset`.
    pub fn read_length(&self, offset: usize) -> Result<usize> {
        self.state.ring.read_length(offset)
    }

    /// Queued bytes.
    pub fn len(&self) -> usize {
        self.state.ring.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.ring.is_empty()
    }

    /// Stable storage address when the buffer is pinned.
    pub fn address(&self) -> Option<*const u8> {
        self.state.ring.address()
    }

    /// Releases `n` sent bytes and wakes writers.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        self.state.ring.consume(n)?;
        trace!("consumed {} bytes, {} buffered", n, self.state.ring.len());
        self.released();
        Ok(())
    }

    /// Copies queued bytes into `dst` and releases them.
    pub fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = self.state.ring.move_to(dst);
        if n > 0 {
            self.released();
        }
        n
    }

    fn released(&self) {
        self.shared.signal.update(!self.state.ring.is_empty());
        self.shared.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferError;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_write_take() {
        let buf = ProducerBuffer::new(8).unwrap();
        assert!(!buf.not_empty().is_set());
        assert_eq!(buf.write(b"hello world").unwrap(), 8);
        assert_eq!(buf.bytes_free().unwrap(), 0);
        assert!(!buf.write_one(b'!').unwrap());

        let mut out = [0u8; 5];
        assert_eq!(buf.take(&mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");
        assert!(buf.not_empty().is_set());
        assert_eq!(buf.bytes_to_write().unwrap(), 3);
        assert!(buf.write_one(b'!').unwrap());
    }

    #[test]
    fn test_not_empty_signal() {
        let buf = ProducerBuffer::new(8).unwrap();
        buf.write(b"ab").unwrap();
        assert!(buf.not_empty().is_set());
        buf.consume(1).unwrap();
        assert!(buf.not_empty().is_set());
        buf.consume(1).unwrap();
        assert!(!buf.not_empty().is_set());
        assert!(buf.consume(1).is_err());
    }

    #[test]
    fn test_driver_reads_through_guard() {
        let buf = ProducerBuffer::pinned(8).unwrap();
        buf.write(b"123456").unwrap();
        buf.consume(4).unwrap();
        buf.write(b"abcd").unwrap();

        let mut guard = buf.lock().unwrap();
        assert!(guard.address().is_some());
        let (head, tail) = guard.as_slices();
        assert_eq!(head, b"56ab");
        assert_eq!(tail, b"cd");
        assert_eq!(guard.read_length(0).unwrap(), 4);
        let start = guard.start();
        assert_eq!(&guard.storage()[start..start + 2], b"56");
        guard.consume(6).unwrap();
        assert!(guard.is_empty());
    }

    #[test]
    fn test_wait_for_write_blocks_until_consume() {
        let buf = ProducerBuffer::new(16).unwrap();
        buf.write(&[0u8; 16]).unwrap();
        assert!(!buf.wait_for_write(1, 0).unwrap());

        let driver = buf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            driver.consume(3).unwrap();
        });

        assert!(buf.wait_for_write(1, -1).unwrap());
        assert!(buf.bytes_free().unwrap() > 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_argument_checks() {
        let buf = ProducerBuffer::new(8).unwrap();
        assert_eq!(buf.wait_for_write(1, -9), Err(BufferError::InvalidTimeout(-9)));
        assert_eq!(buf.wait_for_empty(-9), Err(BufferError::InvalidTimeout(-9)));
        assert!(buf.wait_for_write(0, 0).unwrap());

        let start = Instant::now();
        assert!(!buf.wait_for_write(9, -1).unwrap());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_wait_for_empty() {
        let buf = ProducerBuffer::new(8).unwrap();
        assert!(buf.wait_for_empty(0).unwrap());
        buf.write(b"abc").unwrap();
        assert!(!buf.wait_for_empty(20).unwrap());

        let driver = buf.clone();
        let handle = thread::spawn(move || {
            let mut out = [0u8; 1];
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(5));
                driver.take(&mut out).unwrap();
            }
        });
        assert!(buf.wait_for_empty(5_000).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_device_dead_purges_and_fails() {
        let buf = ProducerBuffer::new(8).unwrap();
        buf.write(b"abc").unwrap();
        buf.device_dead().unwrap();

        assert_eq!(buf.bytes_to_write().unwrap(), 0);
        assert!(!buf.not_empty().is_set());
        assert!(!buf.wait_for_write(1, -1).unwrap());
        assert!(!buf.wait_for_empty(-1).unwrap());

        // Writes to a dead sink are dropped.
        assert_eq!(buf.write(b"xyz").unwrap(), 0);
        assert_eq!(buf.bytes_to_write().unwrap(), 0);

        buf.reset().unwrap();
        assert!(buf.wait_for_write(8, 0).unwrap());
        assert_eq!(buf.write(b"xyz").unwrap(), 3);
    }

    #[test]
    fn test_device_dead_releases_waiter() {
        let buf = ProducerBuffer::new(4).unwrap();
        buf.write(b"full").unwrap();
        let waiter = {
            let buf = buf.clone();
            thread::spawn(move || buf.wait_for_write(2, -1))
        };
        thread::sleep(Duration::from_millis(20));
        buf.device_dead().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(false));
    }

    #[test]
    fn test_purge_is_recoverable() {
        let buf = ProducerBuffer::new(8).unwrap();
        buf.write(b"abcdefgh").unwrap();
        buf.purge().unwrap();

        assert!(!buf.is_device_dead().unwrap());
        assert_eq!(buf.bytes_free().unwrap(), 8);
        assert!(buf.wait_for_empty(0).unwrap());
        assert_eq!(buf.write(b"ok").unwrap(), 2);
    }

    #[test]
    fn test_cancel_while_waiting_for_space() {
        let buf = ProducerBuffer::new(4).unwrap();
        buf.write(b"full").unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert!(!buf.wait_for_write_cancellable(1, -1, &token).unwrap());
        assert_eq!(buf.bytes_to_write().unwrap(), 4);
        handle.join().unwrap();
    }

    #[test]
    fn test_close() {
        let buf = ProducerBuffer::new(4).unwrap();
        buf.write(b"ab").unwrap();
        let waiter = {
            let buf = buf.clone();
            thread::spawn(move || buf.wait_for_empty(-1))
        };
        thread::sleep(Duration::from_millis(20));
        buf.close();
        buf.close();

        assert_eq!(waiter.join().unwrap(), Ok(false));
        assert_eq!(buf.write(b"x"), Err(BufferError::Closed));
        assert_eq!(buf.consume(0), Err(BufferError::Closed));
        let token = CancellationToken::new();
        assert_eq!(
            buf.wait_for_write_cancellable(1, 0, &token),
            Err(BufferError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_wait_for_write() {
        let buf = ProducerBuffer::new(4).unwrap();
        buf.write(b"full").unwrap();

        let driver = buf.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            driver.consume(4).unwrap();
        });
        assert!(buf.wait_for_write_async(4, 5_000, None).await.unwrap());
        assert!(buf.wait_for_empty_async(0, None).await.unwrap());
    }

    #[test]
    fn test_cancel_while_waiting_for_empty() {
        let buf = ProducerBuffer::new(4).unwrap();
        buf.write(b"ab").unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert!(!buf.wait_for_empty_cancellable(-1, &token).unwrap());
        assert_eq!(buf.bytes_to_write().unwrap(), 2);
        handle.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_wait_for_empty_wakes_on_take() {
        let buf = ProducerBuffer::new(8).unwrap();
        buf.write(b"abcdef").unwrap();

        let driver = buf.clone();
        let handle = thread::spawn(move || {
            let mut out = [0u8; 4];
            while driver.bytes_to_write().unwrap() > 0 {
                thread::sleep(Duration::from_millis(10));
                driver.take(&mut out).unwrap();
            }
        });

        assert!(buf.wait_for_empty_async(5_000, None).await.unwrap());
        assert_eq!(buf.bytes_to_write().unwrap(), 0);
        assert!(!buf.not_empty().is_set());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_fast_paths() {
        let buf = ProducerBuffer::new(4).unwrap();
        assert!(buf.wait_for_write_async(0, 0, None).await.unwrap());
        assert!(!buf.wait_for_write_async(5, -1, None).await.unwrap());
        assert!(buf.wait_for_empty_async(-1, None).await.unwrap());

        buf.device_dead().unwrap();
        assert!(!buf.wait_for_write_async(1, -1, None).await.unwrap());
        assert!(!buf.wait_for_empty_async(-1, None).await.unwrap());
    }
}
