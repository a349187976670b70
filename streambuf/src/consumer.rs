//! Read-side stream buffer: a driver produces bytes, user code consumes them.

use std::fmt;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::options::BufferOptions;
use crate::signal::Signal;
use crate::wait::{Shared, State, WaitStatus, wait_async};

/// A thread-safe read buffer sitting between a driver and a stream reader.
///
/// The driver appends received bytes, either through [`append`](Self::append)
/// or by writing straight into the storage while holding the
/// [`lock`](Self::lock) guard and then calling
/// [`ConsumerGuard::produce`]. The reader drains them with
/// [`read`](Self::read) and waits for more with
/// [`wait_for_read`](Self::wait_for_read).
///
/// # Semantics
///
/// - **Read**: never blocks, returns what is buffered
/// - **Wait**: blocks until `count` bytes are buffered, the timeout runs out,
///   the token is cancelled or the device dies
/// - **Device dead**: buffered bytes stay readable; waits succeed at once
///   while any data is left and fail at once after it is drained
///
/// `not_full` is published as a level-triggered [`Signal`] so the driver can
/// multiplex it with its own handles.
///
/// # Example
///
/// ```
/// use giztoy_streambuf::ConsumerBuffer;
/// use std::thread;
///
/// let buf = ConsumerBuffer::new(64).unwrap();
/// let driver = buf.clone();
///
/// let handle = thread::spawn(move || {
///     driver.append(b"hello").unwrap();
/// });
///
/// assert!(buf.wait_for_read(5, 1_000).unwrap());
/// let mut data = [0u8; 5];
/// assert_eq!(buf.read(&mut data).unwrap(), 5);
/// assert_eq!(&data, b"hello");
/// handle.join().unwrap();
/// ```
#[derive(Clone)]
pub struct ConsumerBuffer {
    inner: Arc<Shared>,
}

fn read_status(state: &State, count: usize) -> WaitStatus {
    let len = state.ring.len();
    if len >= count || (state.device_dead && len > 0) {
        WaitStatus::Satisfied
    } else if state.device_dead {
        WaitStatus::Failed
    } else {
        WaitStatus::Pending
    }
}

impl ConsumerBuffer {
    /// Creates a read buffer holding up to `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_options(&BufferOptions::new(capacity))
    }

    /// Creates a read buffer whose storage keeps a stable address.
    pub fn pinned(capacity: usize) -> Result<Self> {
        Self::with_options(&BufferOptions::new(capacity).pinned(true))
    }

    /// Creates a read buffer from options.
    pub fn with_options(options: &BufferOptions) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Shared::new(options, true)?),
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
    // Driver side
    // ------------------------------------------------------------------

    /// Locks the buffer for direct storage access.
    pub fn lock(&self) -> Result<ConsumerGuard<'_>> {
        Ok(ConsumerGuard {
            state: self.inner.lock()?,
            shared: &self.inner,
        })
    }

    /// Commits `n` bytes the driver wrote directly into the storage.
    pub fn produce(&self, n: usize) -> Result<()> {
        self.lock()?.produce(n)
    }

    /// Copies received bytes into the buffer.
    ///
    /// Returns how many bytes fit.
    pub fn append(&self, data: &[u8]) -> Result<usize> {
        Ok(self.lock()?.append(data))
    }

    /// Level-triggered "not full" signal for the driver.
    pub fn not_full(&self) -> &Signal {
        &self.inner.signal
    }

    /// Marks the device dead and releases every waiter.
    ///
    /// Buffered data is kept so the reader can still drain it.
    pub fn device_dead(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        if !state.device_dead {
            debug!("read buffer: device dead, {} bytes left", state.ring.len());
            state.device_dead = true;
        }
        self.inner.notify();
        Ok(())
    }

    /// Returns true if the device has been marked dead.
    pub fn is_device_dead(&self) -> Result<bool> {
        Ok(self.inner.lock()?.device_dead)
    }

    // ------------------------------------------------------------------
    // User side
    // ------------------------------------------------------------------

    /// Returns the number of bytes ready to read.
    pub fn bytes_to_read(&self) -> Result<usize> {
        Ok(self.inner.lock()?.ring.len())
    }

    /// Reads up to `dst.len()` bytes without blocking.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut state = self.inner.lock()?;
        let n = state.ring.move_to(dst);
        if n > 0 {
            self.inner.signal.set();
            self.inner.notify();
        }
        Ok(n)
    }

    /// Reads a single byte without blocking.
    pub fn read_one(&self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok((self.read(&mut byte)? == 1).then_some(byte[0]))
    }

    /// Copies up to `dst.len()` bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> Result<usize> {
        let state = self.inner.lock()?;
        state.ring.copy_to(dst, 0)
    }

    /// Returns the offset of the first occurrence of `needle` in the
    /// buffered data.
    pub fn find(&self, needle: &[u8]) -> Result<Option<usize>> {
        let state = self.inner.lock()?;
        state.ring.find_slice(needle, 0)
    }

    /// Discards all buffered data. The device state is unchanged.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        state.ring.clear();
        self.inner.signal.set();
        self.inner.notify();
        Ok(())
    }

    /// Empties the buffer and brings the device back to life.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        state.ring.reset();
        state.device_dead = false;
        self.inner.signal.set();
        self.inner.notify();
        debug!("read buffer: reset");
        Ok(())
    }

    /// Closes the buffer. Blocked waiters return `false` and every later
    /// call fails with [`BufferError::Closed`](crate::BufferError::Closed).
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let closed = self.inner.close(|_| {});
        if closed {
            // Release a driver blocked on space.
            self.inner.signal.set();
            debug!("read buffer: closed");
        }
    }

    /// Blocks until at least `count` bytes can be read.
    ///
    /// `timeout_ms` is in milliseconds, `-1` waits forever. Returns `false`
    /// on timeout, or when the device is dead and nothing is buffered.
    pub fn wait_for_read(&self, count: usize, timeout_ms: i32) -> Result<bool> {
        self.wait_for_read_inner(count, timeout_ms, None)
    }

    /// Like [`wait_for_read`](Self::wait_for_read), also returning `false`
    /// once `cancel` fires.
    pub fn wait_for_read_cancellable(
        &self,
        count: usize,
        timeout_ms: i32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.wait_for_read_inner(count, timeout_ms, Some(cancel))
    }

    fn wait_for_read_inner(
        &self,
        count: usize,
        timeout_ms: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if let Some(done) = self.inner.precheck(Some(count), timeout_ms, cancel)? {
            return Ok(done);
        }
        self.inner
            .wait_until(timeout_ms, cancel, |state| read_status(state, count))
    }

    /// Async form of [`wait_for_read`](Self::wait_for_read).
    ///
    /// Settled outcomes resolve without scheduling; otherwise the wait runs
    /// on tokio's blocking pool and resolves to `false` as soon as `cancel`
    /// fires.
    pub async fn wait_for_read_async(
        &self,
        count: usize,
        timeout_ms: i32,
        cancel: Option<CancellationToken>,
    ) -> Result<bool> {
        if let Some(done) = self.inner.precheck(Some(count), timeout_ms, cancel.as_ref())? {
            return Ok(done);
        }
        wait_async(Arc::clone(&self.inner), timeout_ms, cancel, move |state| {
            read_status(state, count)
        })
        .await
    }
}

impl fmt::Debug for ConsumerBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBuffer")
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Locked driver view of a [`ConsumerBuffer`].
///
/// Holding the guard holds the buffer's lock. Bytes written through
/// [`storage_mut`](Self::storage_mut) or [`as_mut_slices`](Self::as_mut_slices)
/// become readable only after [`produce`](Self::produce).
pub struct ConsumerGuard<'a> {
    state: MutexGuard<'a, State>,
    shared: &'a Shared,
}

impl ConsumerGuard<'_> {
    /// The whole backing storage.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        self.state.ring.storage_mut()
    }

    /// The free region as two runs starting at [`end`](Self::end).
    pub fn as_mut_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        self.state.ring.as_mut_slices()
    }

    /// Physical index of the oldest buffered byte.
    pub fn start(&self) -> usize {
        self.state.ring.start()
    }

    /// Physical index where the next produced byte goes.
    pub fn end(&self) -> usize {
        self.state.ring.end()
    }

    /// Contiguous free bytes at [`end`](Self::end).
    pub fn write_length(&self) -> usize {
        self.state.ring.write_length()
    }

    /// Total free bytes.
    pub fn free(&self) -> usize {
        self.state.ring.free()
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.state.ring.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.state.ring.is_empty()
    }

    /// Stable storage address when the buffer is pinned.
    pub fn address(&self) -> Option<*const u8> {
        self.state.ring.address()
    }

    /// Commits `n` bytes written at [`end`](Self::end) and wakes readers.
    pub fn produce(&mut self, n: usize) -> Result<()> {
        self.state.ring.produce(n)?;
        trace!("produced {} bytes, {} buffered", n, self.state.ring.len());
        self.committed();
        Ok(())
    }

    /// Copies `data` in and commits it. Returns how many bytes fit.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = self.state.ring.append(data);
        if n > 0 {
            self.committed();
        }
        n
    }

    fn committed(&self) {
        self.shared.signal.update(!self.state.ring.is_full());
        self.shared.notify();
    }
}
