//! Fixed-capacity ring buffer with explicit produce/consume bookkeeping.

use std::fmt;
use std::ops::{Deref, DerefMut, Index, IndexMut};
use std::pin::Pin;

use crate::error::{BufferError, Result};

/// Backing memory of a [`RingBuffer`].
///
/// `Pinned` storage promises that its address stays the same for as long as
/// the owner lives, so it can be handed to native I/O calls.
pub enum Storage<T> {
    /// Ordinary heap allocation.
    Heap(Box<[T]>),
    /// Heap allocation with a stable, published address.
    Pinned(Pin<Box<[T]>>),
}

impl<T: Default> Storage<T> {
    /// Allocates `capacity` default-initialized elements on the heap.
    pub fn heap(capacity: usize) -> Self {
        Storage::Heap(alloc_default(capacity))
    }

    /// Allocates `capacity` default-initialized elements with a stable address.
    pub fn pinned(capacity: usize) -> Self {
        Storage::Pinned(Box::into_pin(alloc_default(capacity)))
    }
}

impl<T> Storage<T> {
    /// Returns true for pinned storage.
    pub fn is_pinned(&self) -> bool {
        matches!(self, Storage::Pinned(_))
    }

    /// Returns the stable address of pinned storage.
    pub fn address(&self) -> Option<*const T> {
        match self {
            Storage::Heap(_) => None,
            Storage::Pinned(buf) => Some(buf.as_ptr()),
        }
    }
}

impl<T> From<Vec<T>> for Storage<T> {
    fn from(data: Vec<T>) -> Self {
        Storage::Heap(data.into_boxed_slice())
    }
}

impl<T> Deref for Storage<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Storage::Heap(buf) => &**buf,
            Storage::Pinned(buf) => buf.as_ref().get_ref(),
        }
    }
}

impl<T: Unpin> DerefMut for Storage<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match self {
            Storage::Heap(buf) => &mut **buf,
            Storage::Pinned(buf) => buf.as_mut().get_mut(),
        }
    }
}

fn alloc_default<T: Default>(capacity: usize) -> Box<[T]> {
    let mut buf = Vec::with_capacity(capacity);
    buf.resize_with(capacity, T::default);
    buf.into_boxed_slice()
}

/// A fixed-capacity circular buffer.
///
/// Logical index `0` is the oldest element and maps to the physical slot
/// `start`. Unlike a queue, the caller drives the bookkeeping explicitly:
/// data written straight into the free region (see
/// [`as_mut_slices`](Self::as_mut_slices)) becomes visible only after
/// [`produce`](Self::produce), and [`consume`](Self::consume) drops data from
/// the head. This lets a driver hand raw slices to native I/O and commit the
/// result afterwards.
///
/// `consume` never rewinds `start` to zero when the buffer empties, so a
/// produce for a write that was started before the consume still lands at the
/// right physical offset.
///
/// # Example
///
/// ```
/// use giztoy_streambuf::RingBuffer;
///
/// let mut ring = RingBuffer::<u8>::new(4).unwrap();
/// assert_eq!(ring.append(b"abc"), 3);
/// ring.consume(2).unwrap();
///
/// // Wraps around the end of storage.
/// assert_eq!(ring.append(b"def"), 3);
/// let mut out = [0u8; 4];
/// assert_eq!(ring.move_to(&mut out), 4);
/// assert_eq!(&out, b"cdef");
/// ```
pub struct RingBuffer<T> {
    storage: Storage<T>,
    start: usize,
    count: usize,
}

impl<T: Default> RingBuffer<T> {
    /// Creates an empty ring buffer on the heap.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity);
        }
        Self::from_storage(Storage::heap(capacity), 0, 0)
    }

    /// Creates an empty ring buffer whose storage address never changes.
    pub fn pinned(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity);
        }
        Self::from_storage(Storage::pinned(capacity), 0, 0)
    }
}

impl<T> RingBuffer<T> {
    /// Wraps existing storage that already holds `count` elements starting at
    /// physical index `start`.
    pub fn from_storage(storage: Storage<T>, start: usize, count: usize) -> Result<Self> {
        let capacity = storage.len();
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity);
        }
        if start >= capacity {
            return Err(BufferError::out_of_range("start", start, capacity - 1));
        }
        if count > capacity {
            return Err(BufferError::out_of_range("count", count, capacity));
        }
        Ok(Self {
            storage,
            start,
            count,
        })
    }

    /// Returns the fixed capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the number of elements held.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no elements are held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if no space is left.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Returns the number of elements that can still be produced.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.count
    }

    /// Physical index of logical element `0`.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Physical index one past the last element, where the next produce lands.
    #[inline]
    pub fn end(&self) -> usize {
        self.physical(self.count)
    }

    /// Returns the whole backing storage.
    pub fn storage(&self) -> &[T] {
        &self.storage
    }

    /// Returns the stable storage address when the buffer is pinned.
    pub fn address(&self) -> Option<*const T> {
        self.storage.address()
    }

    /// Returns true if the storage is pinned.
    pub fn is_pinned(&self) -> bool {
        self.storage.is_pinned()
    }

    // logical < 2 * capacity always holds for the callers below.
    #[inline]
    fn physical(&self, logical: usize) -> usize {
        let idx = self.start + logical;
        let capacity = self.capacity();
        if idx >= capacity { idx - capacity } else { idx }
    }

    /// Commits `n` elements already written at [`end`](Self::end).
    pub fn produce(&mut self, n: usize) -> Result<()> {
        if n > self.free() {
            return Err(BufferError::out_of_range("produce", n, self.free()));
        }
        self.count += n;
        Ok(())
    }

    /// Drops `n` elements from the head.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.count {
            return Err(BufferError::out_of_range("consume", n, self.count));
        }
        self.advance(n);
        Ok(())
    }

    /// Drops every element, keeping the wrap position.
    pub fn clear(&mut self) {
        self.advance(self.count);
    }

    fn advance(&mut self, n: usize) {
        self.start = self.physical(n);
        self.count -= n;
    }

    /// Undoes the last `n` produced elements without moving `start`.
    ///
    /// At least one element must remain after the revert.
    pub fn revert(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if n >= self.count {
            return Err(BufferError::out_of_range("revert", n, self.count.saturating_sub(1)));
        }
        self.count -= n;
        Ok(())
    }

    /// Forgets all content and rewinds to physical index 0.
    pub fn reset(&mut self) {
        self.start = 0;
        self.count = 0;
    }

    /// Length of the contiguous readable run beginning at logical `offset`.
    pub fn read_length(&self, offset: usize) -> Result<usize> {
        if offset > self.count {
            return Err(BufferError::out_of_range("offset", offset, self.count));
        }
        let pos = self.physical(offset);
        Ok((self.count - offset).min(self.capacity() - pos))
    }

    /// Length of the contiguous writable run beginning at [`end`](Self::end).
    pub fn write_length(&self) -> usize {
        let free = self.free();
        if free == 0 {
            return 0;
        }
        free.min(self.capacity() - self.end())
    }

    /// Returns the element at logical index `i`, if held.
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.count {
            return None;
        }
        Some(&self.storage[self.physical(i)])
    }

    /// Iterates the held elements, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let (head, tail) = self.as_slices();
        head.iter().chain(tail.iter())
    }

    /// Returns the held data as two runs; the second is empty unless the
    /// data wraps.
    pub fn as_slices(&self) -> (&[T], &[T]) {
        self.runs(0, self.count)
    }

    // Two physical runs covering logical [offset, offset + len).
    fn runs(&self, offset: usize, len: usize) -> (&[T], &[T]) {
        debug_assert!(offset + len <= self.count);
        if len == 0 {
            return (&[], &[]);
        }
        let pos = self.physical(offset);
        let first = len.min(self.capacity() - pos);
        (&self.storage[pos..pos + first], &self.storage[..len - first])
    }
}

impl<T: Unpin> RingBuffer<T> {
    /// Returns the whole backing storage for direct writes.
    pub fn storage_mut(&mut self) -> &mut [T] {
        &mut self.storage
    }

    /// Returns the free region as two runs starting at [`end`](Self::end).
    pub fn as_mut_slices(&mut self) -> (&mut [T], &mut [T]) {
        let free = self.free();
        if free == 0 {
            return (&mut [], &mut []);
        }
        let end = self.end();
        let first = self.write_length();
        let (low, high) = self.storage.split_at_mut(end);
        (&mut high[..first], &mut low[..free - first])
    }
}

impl<T: Copy + Unpin> RingBuffer<T> {
    /// Copies as much of `src` as fits into the tail and produces it.
    ///
    /// Returns the number of elements copied, which may be less than
    /// `src.len()`.
    pub fn append(&mut self, src: &[T]) -> usize {
        let n = src.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let (head, tail) = self.as_mut_slices();
        let first = n.min(head.len());
        head[..first].copy_from_slice(&src[..first]);
        tail[..n - first].copy_from_slice(&src[first..n]);
        self.count += n;
        n
    }

    /// Copies up to `count` elements of `src`, starting at its logical
    /// `offset`, into the tail of this buffer. `src` is left untouched.
    pub fn append_ring(
        &mut self,
        src: &RingBuffer<T>,
        offset: usize,
        count: usize,
    ) -> Result<usize> {
        if offset > src.len() {
            return Err(BufferError::out_of_range("offset", offset, src.len()));
        }
        if count > src.len() - offset {
            return Err(BufferError::out_of_range("count", count, src.len() - offset));
        }
        let n = count.min(self.free());
        let (head, tail) = src.runs(offset, n);
        let copied = self.append(head);
        Ok(copied + self.append(tail))
    }
}

impl<T: Copy> RingBuffer<T> {
    /// Copies elements from logical `offset` into `dst` without consuming them.
    ///
    /// Returns the number copied: `min(dst.len(), len - offset)`.
    pub fn copy_to(&self, dst: &mut [T], offset: usize) -> Result<usize> {
        if offset > self.count {
            return Err(BufferError::out_of_range("offset", offset, self.count));
        }
        Ok(self.copy_runs(dst, offset))
    }

    /// Copies from the head into `dst` and consumes what was copied.
    pub fn move_to(&mut self, dst: &mut [T]) -> usize {
        let n = self.copy_runs(dst, 0);
        self.advance(n);
        n
    }

    fn copy_runs(&self, dst: &mut [T], offset: usize) -> usize {
        let n = dst.len().min(self.count - offset);
        let (head, tail) = self.runs(offset, n);
        dst[..head.len()].copy_from_slice(head);
        dst[head.len()..n].copy_from_slice(tail);
        n
    }
}

impl<T: PartialEq> RingBuffer<T> {
    /// Finds the first logical index at or after `from` holding `needle`.
    pub fn find(&self, needle: &T, from: usize) -> Result<Option<usize>> {
        if from > self.count {
            return Err(BufferError::out_of_range("offset", from, self.count));
        }
        let (head, tail) = self.runs(from, self.count - from);
        let found = head
            .iter()
            .position(|v| v == needle)
            .or_else(|| tail.iter().position(|v| v == needle).map(|i| i + head.len()));
        Ok(found.map(|i| i + from))
    }

    /// Finds the first logical index at or after `from` where `needle`
    /// starts. Plain linear scan; matches may straddle the wrap point.
    pub fn find_slice(&self, needle: &[T], from: usize) -> Result<Option<usize>> {
        if from > self.count {
            return Err(BufferError::out_of_range("offset", from, self.count));
        }
        if from == self.count || needle.len() > self.count - from {
            return Ok(None);
        }
        let last = self.count - needle.len();
        let found = (from..=last).find(|&i| {
            needle
                .iter()
                .enumerate()
                .all(|(j, v)| self.storage[self.physical(i + j)] == *v)
        });
        Ok(found)
    }
}

impl<T> Index<usize> for RingBuffer<T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        assert!(i < self.count, "index {} out of range for length {}", i, self.count);
        &self.storage[self.physical(i)]
    }
}

impl<T: Unpin> IndexMut<usize> for RingBuffer<T> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        assert!(i < self.count, "index {} out of range for length {}", i, self.count);
        let idx = self.physical(i);
        &mut self.storage[idx]
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("start", &self.start)
            .field("len", &self.count)
            .field("pinned", &self.is_pinned())
            .finish()
    }
}
