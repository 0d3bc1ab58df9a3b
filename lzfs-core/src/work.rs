//! Work descriptors and the handles callers keep for them.
//!
//! A submission produces two halves:
//!
//! - a [`Work`] box, the descriptor proper, which travels through the queues
//!   and is owned by exactly one worker at a time;
//! - a [`WorkHandle`], which the submitter keeps and which can only observe
//!   the descriptor's completion event until a worker publishes the outcome.
//!
//! The terminal stage moves the buffer, size and result into the shared
//! outcome slot and raises the completion event. A descriptor that is
//! dropped without being completed (for example when a worker panics)
//! completes itself as [`WorkError::Abandoned`], so every handle is
//! released exactly once.

use crate::error::{self, PathError, WorkError};
use crate::event::{CompletionEvent, Raised};
use crate::heap::{HeapBuffer, SharedHeap};
use crate::stats::DispatcherStats;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use uuid::Uuid;

/// Size of the fixed path field, terminator included.
pub const MAX_PATH_LEN: usize = 1024;

/// Kind of file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkOp {
    /// Read a whole file.
    Read,

    /// Create or truncate a file and write a buffer into it.
    Write,
}

/// Options of a read submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkFlags {
    /// Append a zero byte after the data, not counted in the size.
    pub null_terminate: bool,

    /// The file holds a compressed frame.
    pub use_compression: bool,
}

impl WorkFlags {
    /// Plain read.
    pub const NONE: Self = Self {
        null_terminate: false,
        use_compression: false,
    };

    /// Sets whether the data is null-terminated.
    pub fn null_terminate(mut self, enabled: bool) -> Self {
        self.null_terminate = enabled;
        self
    }

    /// Sets whether the file is a compressed frame.
    pub fn compressed(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }
}

/// Unique identifier of a work descriptor, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkId(Uuid);

impl WorkId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// A UTF-8 path stored inline in a fixed-size field.
#[derive(Clone)]
pub struct WorkPath {
    bytes: [u8; MAX_PATH_LEN],
    len: usize,
}

impl WorkPath {
    /// Copies `path` into the field.
    ///
    /// The field keeps room for a terminator, so at most
    /// `MAX_PATH_LEN - 1` bytes fit.
    pub fn new(path: &str) -> Result<Self, PathError> {
        let max = MAX_PATH_LEN - 1;
        if path.len() > max {
            return Err(PathError::TooLong {
                len: path.len(),
                max,
            });
        }

        let mut bytes = [0u8; MAX_PATH_LEN];
        bytes[..path.len()].copy_from_slice(path.as_bytes());
        Ok(Self {
            bytes,
            len: path.len(),
        })
    }

    fn empty() -> Self {
        Self {
            bytes: [0u8; MAX_PATH_LEN],
            len: 0,
        }
    }

    /// The stored path.
    pub fn as_str(&self) -> &str {
        // Only ever filled from a `&str`.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }
}

impl fmt::Debug for WorkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for WorkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The buffer a descriptor currently carries.
#[derive(Default)]
pub(crate) enum WorkBuffer {
    /// No buffer yet, or it was released.
    #[default]
    Empty,

    /// Bytes owned by the submitter; the dispatcher only holds a reference.
    Caller(Arc<[u8]>),

    /// A buffer allocated by the dispatcher.
    Owned(HeapBuffer),
}

impl WorkBuffer {
    pub(crate) fn as_slice(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => None,
            Self::Caller(bytes) => Some(&bytes[..]),
            Self::Owned(buffer) => Some(buffer.as_slice()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().map_or(0, <[u8]>::len)
    }
}

impl fmt::Debug for WorkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Caller(bytes) => write!(f, "Caller({} bytes)", bytes.len()),
            Self::Owned(buffer) => write!(f, "Owned({} bytes)", buffer.len()),
        }
    }
}

/// Terminal state of a descriptor.
#[derive(Debug)]
struct WorkOutcome {
    result: Result<(), WorkError>,
    buffer: WorkBuffer,
    size: usize,
}

impl WorkOutcome {
    fn abandoned() -> Self {
        Self {
            result: Err(WorkError::Abandoned),
            buffer: WorkBuffer::Empty,
            size: 0,
        }
    }
}

#[derive(Debug)]
struct WorkShared {
    done: CompletionEvent,
    outcome: Mutex<Option<WorkOutcome>>,
}

/// A file operation in flight.
///
/// Moved by value between the submitter and the worker stages, never
/// shared.
pub(crate) struct Work {
    pub(crate) id: WorkId,
    pub(crate) op: WorkOp,
    pub(crate) path: WorkPath,
    pub(crate) flags: WorkFlags,
    pub(crate) buffer: WorkBuffer,
    pub(crate) size: usize,
    /// Heap for buffers handed to the caller.
    pub(crate) heap: SharedHeap,
    shared: Arc<WorkShared>,
    stats: Arc<DispatcherStats>,
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("heap", &self.heap.name())
            .finish()
    }
}

impl Work {
    /// Creates a descriptor and the handle observing it.
    pub(crate) fn new(
        op: WorkOp,
        path: &str,
        flags: WorkFlags,
        heap: SharedHeap,
        buffer: WorkBuffer,
        stats: Arc<DispatcherStats>,
    ) -> (Result<Box<Work>, PathError>, WorkHandle) {
        let shared = Arc::new(WorkShared {
            done: CompletionEvent::new(),
            outcome: Mutex::new(None),
        });
        stats.record_submitted(op);

        let size = buffer.len();
        let mut work = Box::new(Work {
            id: WorkId::new(),
            op,
            path: WorkPath::empty(),
            flags,
            buffer,
            size,
            heap,
            shared: Arc::clone(&shared),
            stats,
        });
        let handle = WorkHandle {
            id: work.id,
            op,
            shared,
            settled: OnceLock::new(),
        };

        match WorkPath::new(path) {
            Ok(path) => {
                work.path = path;
                (Ok(work), handle)
            }
            Err(e) => {
                work.complete(Err(e.clone().into()));
                (Err(e), handle)
            }
        }
    }

    /// Publishes the outcome and raises the completion event.
    pub(crate) fn complete(mut self: Box<Self>, result: Result<(), WorkError>) {
        self.settle(result);
    }

    fn settle(&mut self, result: Result<(), WorkError>) {
        if self.shared.done.is_raised() {
            return;
        }

        match &result {
            Ok(()) => tracing::debug!(
                work_id = %self.id,
                op = ?self.op,
                path = %self.path,
                size = self.size,
                "Work completed"
            ),
            Err(e) => tracing::warn!(
                work_id = %self.id,
                op = ?self.op,
                path = %self.path,
                status = e.status_code(),
                "Work failed: {}",
                e
            ),
        }
        self.stats.record_completed(self.op, &result, self.size);

        let outcome = WorkOutcome {
            result,
            buffer: std::mem::take(&mut self.buffer),
            size: self.size,
        };
        *self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.shared.done.signal();
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if !self.shared.done.is_raised() {
            self.settle(Err(WorkError::Abandoned));
        }
    }
}

/// The submitter's side of a work descriptor.
///
/// Accessors other than [`is_done`](Self::is_done) block until the work is
/// complete. Dropping the handle also waits for completion, then releases
/// whatever buffer the dispatcher still owns for this work.
pub struct WorkHandle {
    id: WorkId,
    op: WorkOp,
    shared: Arc<WorkShared>,
    settled: OnceLock<WorkOutcome>,
}

impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkHandle")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("done", &self.is_done())
            .finish()
    }
}

impl WorkHandle {
    /// Identifier of the descriptor.
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Kind of operation.
    pub fn op(&self) -> WorkOp {
        self.op
    }

    /// Checks for completion without blocking.
    pub fn is_done(&self) -> bool {
        self.shared.done.is_raised()
    }

    /// Blocks until the work is complete.
    pub fn wait(&self) {
        self.shared.done.wait();
    }

    /// Resolves once the work is complete.
    pub fn completion(&self) -> Raised<'_> {
        self.shared.done.raised()
    }

    /// Result of the operation.
    pub fn result(&self) -> Result<(), &WorkError> {
        self.outcome().result.as_ref().map(|_| ())
    }

    /// Result of the operation as a status code, zero on success.
    pub fn status_code(&self) -> i32 {
        error::status_code(&self.outcome().result)
    }

    /// The work's buffer.
    ///
    /// For reads, the file contents. For writes, the bytes that were handed
    /// to the platform: the caller's own data, or the compressed frame.
    /// `None` when the operation failed.
    pub fn buffer(&self) -> Option<&[u8]> {
        let outcome = self.outcome();
        outcome.result.as_ref().ok()?;
        outcome.buffer.as_slice()
    }

    /// The read buffer followed by its terminator, for null-terminated
    /// reads.
    pub fn buffer_with_terminator(&self) -> Option<&[u8]> {
        match &self.outcome().buffer {
            WorkBuffer::Owned(buffer) if self.op == WorkOp::Read => buffer.with_terminator(),
            _ => None,
        }
    }

    /// Number of bytes read or written.
    pub fn size(&self) -> usize {
        self.outcome().size
    }

    /// Takes ownership of a read buffer.
    ///
    /// Returns `None` for writes, whose buffers are never handed over, for
    /// failed reads, and once the buffer was already taken.
    pub fn take_buffer(&mut self) -> Option<HeapBuffer> {
        if self.op != WorkOp::Read {
            return None;
        }
        self.outcome();
        let outcome = self.settled.get_mut()?;
        match std::mem::take(&mut outcome.buffer) {
            WorkBuffer::Owned(buffer) => Some(buffer),
            other => {
                outcome.buffer = other;
                None
            }
        }
    }

    fn outcome(&self) -> &WorkOutcome {
        self.settled.get_or_init(|| {
            self.shared.done.wait();
            self.shared
                .outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or_else(WorkOutcome::abandoned)
        })
    }
}

impl Drop for WorkHandle {
    fn drop(&mut self) {
        // Pull the outcome in so its buffer is released here.
        self.outcome();
    }
}
