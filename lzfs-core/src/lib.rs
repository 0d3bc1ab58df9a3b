//! LZFS Core - Asynchronous file I/O with optional LZ4 framing
//!
//! This library moves whole-file reads and writes off the caller's thread.
//! A [`Dispatcher`] owns an I/O worker and a compression worker connected by
//! bounded queues; every submission returns a [`WorkHandle`] that completes
//! exactly once, with the data or with an error.
//!
//! ```no_run
//! use lzfs_core::{Dispatcher, DispatcherConfig, SystemHeap, WorkFlags};
//!
//! # fn main() -> anyhow::Result<()> {
//! let heap = SystemHeap::shared("app");
//! let dispatcher = Dispatcher::new(DispatcherConfig::default(), heap.clone())?;
//!
//! let write = dispatcher.submit_write("save.bin", &b"hello"[..], true);
//! assert_eq!(write.status_code(), 0);
//!
//! let read = dispatcher.submit_read("save.bin", &heap, WorkFlags::NONE.compressed(true));
//! assert_eq!(read.buffer(), Some(&b"hello"[..]));
//!
//! dispatcher.shutdown()?;
//! # Ok(())
//! # }
//! ```

/// CPU detection and worker thread management
pub mod arch;

/// Platform file access used by the I/O worker
pub mod backend;

/// Compression codec and frame layout
pub mod codec;

/// Dispatcher configuration
pub mod config;

/// The two-stage dispatcher
pub mod dispatcher;

/// Error types and status codes
pub mod error;

/// One-shot completion signal
pub mod event;

/// Allocators for work buffers
pub mod heap;

/// Bounded work queue
pub mod queue;

/// Dispatcher counters
pub mod stats;

/// Work descriptors and handles
pub mod work;

pub use backend::{IoBackend, OpenMode, StdBackend};
pub use codec::{Codec, Lz4Codec};
pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use error::{AllocError, CodecError, PathError, WorkError};
pub use event::CompletionEvent;
pub use heap::{Heap, HeapBuffer, SharedHeap, SystemHeap, TrackingHeap};
pub use stats::StatsSnapshot;
pub use work::{WorkFlags, WorkHandle, WorkId, WorkOp};
