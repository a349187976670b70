//! Thread-safe byte buffers between stream users and device drivers.
//!
//! A driver (a serial port, a socket pump, a codec) moves bytes in one
//! direction while user code reads or writes at its own pace. This crate
//! provides the two halves of that handoff, both backed by a fixed-capacity
//! [`RingBuffer`]:
//!
//! - [`ConsumerBuffer`]: the driver produces, the user reads
//! - [`ProducerBuffer`]: the user writes, the driver consumes
//!
//! # Reading
//!
//! ```
//! use giztoy_streambuf::ConsumerBuffer;
//!
//! let buf = ConsumerBuffer::new(64).unwrap();
//!
//! // Driver side: data arrives.
//! buf.append(b"OK\r\n").unwrap();
//!
//! // User side: wait for a full line, then read it.
//! assert!(buf.wait_for_read(4, 100).unwrap());
//! let mut line = [0u8; 4];
//! buf.read(&mut line).unwrap();
//! assert_eq!(&line, b"OK\r\n");
//! ```
//!
//! # Writing
//!
//! ```
//! use giztoy_streambuf::ProducerBuffer;
//!
//! let buf = ProducerBuffer::new(4).unwrap();
//! assert_eq!(buf.write(b"hello").unwrap(), 4);
//! assert!(!buf.wait_for_write(1, 0).unwrap());
//!
//! // Driver side: send two bytes, freeing room.
//! buf.consume(2).unwrap();
//! assert!(buf.wait_for_write(2, 0).unwrap());
//! ```
//!
//! # Waiting
//!
//! Timeouts are milliseconds; [`INFINITE_TIMEOUT`] (`-1`) waits forever and
//! `0` polls. Every wait has a blocking form, a form taking a
//! [`CancellationToken`], and an async form for tokio tasks. A wait returns
//! `Ok(false)` on timeout, cancellation, a dead device or close.
//!
//! # Device death
//!
//! When the driver reports the device dead, a [`ConsumerBuffer`] keeps what
//! it already received so the user can drain it, while a [`ProducerBuffer`]
//! drops queued data. Both release their waiters until `reset` is called.
//!
//! # Thread Safety
//!
//! Both buffers are `Send + Sync` and `Clone`; clones share the same
//! underlying buffer via `Arc`.

mod consumer;
mod error;
mod options;
mod producer;
mod ring;
mod signal;
mod timer;
mod wait;

pub use consumer::{ConsumerBuffer, ConsumerGuard};
pub use error::{BufferError, Result};
pub use options::{BufferOptions, DEFAULT_CAPACITY};
pub use producer::{ProducerBuffer, ProducerGuard};
pub use ring::{RingBuffer, Storage};
pub use signal::Signal;
pub use timer::{INFINITE_TIMEOUT, TimerExpiry};
pub use tokio_util::sync::CancellationToken;
