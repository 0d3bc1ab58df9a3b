//! The compression stage: framing of outgoing writes and unframing of
//! incoming reads.

use super::{StageGuard, WorkQueue};
use crate::codec::{check_header, decode_frame, encode_frame, frame_bound, Codec};
use crate::error::WorkError;
use crate::heap::{HeapBuffer, SharedHeap};
use crate::queue::QueueItem;
use crate::work::{Work, WorkBuffer, WorkOp};

/// Owns the codec and drains the compression queue.
pub(crate) struct CompressionWorker<C: Codec> {
    codec: C,
    queue: WorkQueue,
    io_queue: WorkQueue,
    /// Serves compressed frames of outgoing writes.
    heap: SharedHeap,
    alignment: usize,
}

impl<C: Codec> CompressionWorker<C> {
    pub(crate) fn new(
        codec: C,
        queue: WorkQueue,
        io_queue: WorkQueue,
        heap: SharedHeap,
        alignment: usize,
    ) -> Self {
        Self {
            codec,
            queue,
            io_queue,
            heap,
            alignment,
        }
    }

    /// Serves the queue until the shutdown pill arrives, then hands the pill
    /// back to the I/O stage.
    pub(crate) fn run(mut self) {
        let span = tracing::info_span!("compression_worker");
        let _enter = span.enter();

        let queue = self.queue.clone();
        let io_queue = self.io_queue.clone();
        let _guard = StageGuard::new("compression", &queue, &io_queue);

        tracing::debug!("Compression worker started");
        while let QueueItem::Work(work) = queue.pop() {
            self.process(work);
        }

        if io_queue.forward(QueueItem::Shutdown).is_err() {
            tracing::warn!("I/O stage stopped before the compression stage");
        }
        tracing::debug!("Compression worker stopped");
    }

    fn process(&mut self, mut work: Box<Work>) {
        tracing::debug!(
            work_id = %work.id,
            op = ?work.op,
            path = %work.path,
            "Compression stage"
        );

        match work.op {
            WorkOp::Write => match self.compress(&mut work) {
                Ok(()) => {
                    let id = work.id;
                    if self.io_queue.forward(QueueItem::Work(work)).is_err() {
                        tracing::warn!(work_id = %id, "I/O stage is gone");
                    }
                }
                Err(e) => work.complete(Err(e)),
            },
            WorkOp::Read => {
                let result = self.decompress(&mut work);
                work.complete(result);
            }
        }
    }

    /// Replaces the caller's bytes with a compressed frame.
    fn compress(&mut self, work: &mut Work) -> Result<(), WorkError> {
        let src = work.buffer.as_slice().unwrap_or_default();

        let capacity = frame_bound(&self.codec, src.len());
        let mut frame = HeapBuffer::allocate(&self.heap, capacity, self.alignment)?;
        let len = encode_frame(&mut self.codec, src, frame.storage_mut())?;
        frame.set_len(len);

        tracing::debug!(
            work_id = %work.id,
            original = src.len(),
            compressed = len,
            "Payload compressed"
        );

        // Releases the dispatcher's reference to the caller's bytes.
        work.buffer = WorkBuffer::Owned(frame);
        work.size = len;
        Ok(())
    }

    /// Replaces the raw frame with the decompressed payload.
    fn decompress(&mut self, work: &mut Work) -> Result<(), WorkError> {
        let raw = std::mem::take(&mut work.buffer);
        let frame = raw.as_slice().unwrap_or_default();

        // The header is checked against the payload before it sizes a buffer
        let original = check_header(&self.codec, frame)?;
        let extra = usize::from(work.flags.null_terminate);
        let mut buffer =
            HeapBuffer::allocate(&work.heap, original.saturating_add(extra), self.alignment)?;
        let len = decode_frame(&mut self.codec, frame, buffer.storage_mut())?;
        drop(raw);

        buffer.set_len(len);
        if work.flags.null_terminate {
            buffer.terminate();
        }

        work.size = len;
        work.buffer = WorkBuffer::Owned(buffer);
        Ok(())
    }
}
