//! Construction parameters for the stream buffers.

/// Default buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Options for creating a [`ConsumerBuffer`](crate::ConsumerBuffer) or
/// [`ProducerBuffer`](crate::ProducerBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOptions {
    /// Fixed capacity in bytes. Must be greater than 0.
    pub capacity: usize,
    /// Keep the storage at a stable address so a driver can hand it to
    /// native I/O calls.
    pub pinned: bool,
}

impl BufferOptions {
    /// Create options for an unpinned buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pinned: false,
        }
    }

    /// Set the capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Request pinned storage.
    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
