//! The I/O stage: raw file access through the backend.

use super::{StageGuard, WorkQueue};
use crate::backend::{read_full, write_full, IoBackend, OpenMode};
use crate::error::{AllocError, WorkError};
use crate::heap::{HeapBuffer, SharedHeap};
use crate::queue::QueueItem;
use crate::work::{Work, WorkBuffer, WorkOp};

/// Owns the backend and drains the I/O queue.
pub(crate) struct IoWorker<B: IoBackend> {
    backend: B,
    queue: WorkQueue,
    compression_queue: WorkQueue,
    /// Serves raw buffers of compressed reads.
    heap: SharedHeap,
    alignment: usize,
}

impl<B: IoBackend> IoWorker<B> {
    pub(crate) fn new(
        backend: B,
        queue: WorkQueue,
        compression_queue: WorkQueue,
        heap: SharedHeap,
        alignment: usize,
    ) -> Self {
        Self {
            backend,
            queue,
            compression_queue,
            heap,
            alignment,
        }
    }

    /// Serves the queue until the shutdown pill comes back from the
    /// compression stage.
    pub(crate) fn run(mut self) {
        let span = tracing::info_span!("io_worker");
        let _enter = span.enter();

        let queue = self.queue.clone();
        let compression_queue = self.compression_queue.clone();
        let _guard = StageGuard::new("io", &queue, &compression_queue);

        tracing::debug!("I/O worker started");
        let mut draining = false;
        loop {
            match queue.pop() {
                QueueItem::Work(work) => self.process(work),
                QueueItem::Shutdown if draining => break,
                QueueItem::Shutdown => {
                    // Compressed writes may still be on their way back from
                    // the compression stage, keep serving until they are.
                    if compression_queue.forward(QueueItem::Shutdown).is_err() {
                        break;
                    }
                    draining = true;
                }
            }
        }
        tracing::debug!("I/O worker stopped");
    }

    fn process(&mut self, mut work: Box<Work>) {
        tracing::debug!(
            work_id = %work.id,
            op = ?work.op,
            path = %work.path,
            compressed = work.flags.use_compression,
            "I/O stage"
        );

        match work.op {
            WorkOp::Read => match self.read(&mut work) {
                Ok(()) if work.flags.use_compression => {
                    let id = work.id;
                    if self
                        .compression_queue
                        .forward(QueueItem::Work(work))
                        .is_err()
                    {
                        tracing::warn!(work_id = %id, "Compression stage is gone");
                    }
                }
                result => work.complete(result),
            },
            WorkOp::Write => {
                let result = self.write(&mut work);
                work.complete(result);
            }
        }
    }

    fn read(&mut self, work: &mut Work) -> Result<(), WorkError> {
        let path = self.backend.translate_path(work.path.as_str())?;
        let mut handle = self.backend.open(&path, OpenMode::SharedRead)?;

        let result = self.read_contents(&mut handle, work);

        if let Err(e) = self.backend.close(handle) {
            tracing::warn!(work_id = %work.id, path = %work.path, "Close failed: {}", e);
        }
        result
    }

    fn read_contents(&mut self, handle: &mut B::Handle, work: &mut Work) -> Result<(), WorkError> {
        let file_size = self.backend.query_size(handle)?;
        let len = usize::try_from(file_size).map_err(|_| AllocError {
            heap: work.heap.name().to_string(),
            size: usize::MAX,
            align: self.alignment,
        })?;

        // Raw frames stay with the dispatcher and are never terminated; the
        // compression stage terminates the decompressed data instead.
        let mut buffer = if work.flags.use_compression {
            HeapBuffer::allocate(&self.heap, len, self.alignment)?
        } else {
            let extra = usize::from(work.flags.null_terminate);
            HeapBuffer::allocate(&work.heap, len.saturating_add(extra), self.alignment)?
        };

        let read = read_full(&mut self.backend, handle, &mut buffer.storage_mut()[..len])?;
        buffer.set_len(read);
        if work.flags.null_terminate && !work.flags.use_compression {
            buffer.terminate();
        }

        work.size = read;
        work.buffer = WorkBuffer::Owned(buffer);
        Ok(())
    }

    fn write(&mut self, work: &mut Work) -> Result<(), WorkError> {
        let path = self.backend.translate_path(work.path.as_str())?;
        let mut handle = self.backend.open(&path, OpenMode::CreateTruncate)?;

        let data = work.buffer.as_slice().unwrap_or_default();
        let result = write_full(&mut self.backend, &mut handle, data);

        if let Err(e) = self.backend.close(handle) {
            tracing::warn!(work_id = %work.id, path = %work.path, "Close failed: {}", e);
        }

        work.size = result?;
        Ok(())
    }
}
