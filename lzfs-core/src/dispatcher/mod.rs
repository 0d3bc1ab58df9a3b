//! The async file dispatcher.
//!
//! A [`Dispatcher`] owns two bounded queues and one worker thread per queue:
//!
//! - the I/O worker opens, reads, writes and closes files through an
//!   [`IoBackend`];
//! - the compression worker frames outgoing writes and unframes incoming
//!   reads with a [`Codec`].
//!
//! Plain work only visits the I/O queue. A compressed write visits the
//! compression queue first and the I/O queue second; a compressed read goes
//! the other way round. Submission returns a [`WorkHandle`] immediately and
//! only blocks while the first queue of the route is full.

mod compression_worker;
mod io_worker;

#[cfg(test)]
mod tests;

use crate::arch::{self, ThreadBuilder, WorkerThread};
use crate::backend::{IoBackend, StdBackend};
use crate::codec::{Codec, Lz4Codec};
use crate::config::DispatcherConfig;
use crate::heap::SharedHeap;
use crate::queue::{BoundedQueue, QueueItem};
use crate::stats::{DispatcherStats, StatsSnapshot};
use crate::work::{Work, WorkBuffer, WorkFlags, WorkHandle, WorkOp};
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::thread;

use compression_worker::CompressionWorker;
use io_worker::IoWorker;

/// Queue connecting the submitters and the two workers.
pub(crate) type WorkQueue = BoundedQueue<Box<Work>>;

/// Two-stage file I/O pipeline bound to a pair of worker threads.
pub struct Dispatcher {
    config: DispatcherConfig,

    /// Heap for buffers the dispatcher keeps for itself.
    heap: SharedHeap,

    io_queue: WorkQueue,
    compression_queue: WorkQueue,

    stats: Arc<DispatcherStats>,

    /// Empty once the dispatcher was shut down.
    workers: Vec<WorkerThread>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("heap", &self.heap.name())
            .field("io_queue", &self.io_queue)
            .field("compression_queue", &self.compression_queue)
            .field("workers", &self.workers)
            .finish()
    }
}

impl Dispatcher {
    /// Starts a dispatcher over `std::fs` with LZ4 compression.
    ///
    /// `heap` serves the dispatcher's own buffers: compressed frames of
    /// outgoing writes and raw bytes of compressed reads.
    pub fn new(config: DispatcherConfig, heap: SharedHeap) -> Result<Self> {
        Self::with_components(config, heap, StdBackend, Lz4Codec)
    }

    /// Starts a dispatcher with a custom backend and codec.
    ///
    /// The backend is moved into the I/O worker and the codec into the
    /// compression worker.
    pub fn with_components<B, C>(
        config: DispatcherConfig,
        heap: SharedHeap,
        backend: B,
        codec: C,
    ) -> Result<Self>
    where
        B: IoBackend,
        C: Codec,
    {
        config.validate().context("Invalid dispatcher configuration")?;

        let io_queue = WorkQueue::new(config.queue_capacity);
        let compression_queue = WorkQueue::new(config.queue_capacity);

        let cpu_info = arch::detect_cpu_topology();
        let mut builder = ThreadBuilder::new(config.pin_threads, &cpu_info);

        let io_worker = IoWorker::new(
            backend,
            io_queue.clone(),
            compression_queue.clone(),
            Arc::clone(&heap),
            config.buffer_alignment,
        );
        let io_thread = builder
            .spawn(&config.io_thread_name, move || io_worker.run())
            .context("Failed to start the I/O worker")?;

        let compression_worker = CompressionWorker::new(
            codec,
            compression_queue.clone(),
            io_queue.clone(),
            Arc::clone(&heap),
            config.buffer_alignment,
        );
        let compression_thread = match builder
            .spawn(&config.compression_thread_name, move || {
                compression_worker.run()
            }) {
            Ok(thread) => thread,
            Err(e) => {
                // A closed, empty queue stops the I/O worker on its own.
                io_queue.close();
                if let Err(join_err) = io_thread.join() {
                    tracing::error!("{:#}", join_err);
                }
                return Err(e.context("Failed to start the compression worker"));
            }
        };

        tracing::info!(
            queue_capacity = config.queue_capacity,
            pinned = config.pin_threads,
            logical_cores = cpu_info.logical_cores(),
            physical_cores = ?cpu_info.physical_cores(),
            io_core = ?io_thread.core_id(),
            compression_core = ?compression_thread.core_id(),
            heap = heap.name(),
            "Dispatcher started"
        );

        Ok(Self {
            config,
            heap,
            io_queue,
            compression_queue,
            stats: Arc::new(DispatcherStats::default()),
            workers: vec![io_thread, compression_thread],
        })
    }

    /// Submits a whole-file read.
    ///
    /// The file's contents land in a buffer allocated from `heap`, which the
    /// caller may take over with [`WorkHandle::take_buffer`]. Returns without
    /// waiting for the read; blocks only while the I/O queue is full. A path
    /// too long for the descriptor completes the handle at once.
    pub fn submit_read(&self, path: &str, heap: &SharedHeap, flags: WorkFlags) -> WorkHandle {
        let (work, handle) = Work::new(
            WorkOp::Read,
            path,
            flags,
            Arc::clone(heap),
            WorkBuffer::Empty,
            Arc::clone(&self.stats),
        );

        if let Ok(work) = work {
            self.enqueue(&self.io_queue, work);
        }
        handle
    }

    /// Submits a write of `data` to `path`, replacing any existing file.
    ///
    /// The dispatcher keeps a reference to `data` until the write completes
    /// and never modifies it. With `use_compression`, the file is written as
    /// a compressed frame that must be read back with
    /// [`WorkFlags::compressed`].
    pub fn submit_write(
        &self,
        path: &str,
        data: impl Into<Arc<[u8]>>,
        use_compression: bool,
    ) -> WorkHandle {
        let (work, handle) = Work::new(
            WorkOp::Write,
            path,
            WorkFlags::NONE.compressed(use_compression),
            Arc::clone(&self.heap),
            WorkBuffer::Caller(data.into()),
            Arc::clone(&self.stats),
        );

        if let Ok(work) = work {
            let queue = if use_compression {
                &self.compression_queue
            } else {
                &self.io_queue
            };
            self.enqueue(queue, work);
        }
        handle
    }

    /// Snapshot of the dispatcher's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The dispatcher's own heap.
    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }

    /// The configuration the dispatcher was started with.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Stops the workers after all submitted work has completed.
    ///
    /// Fails if a worker thread panicked; its unfinished work completes as
    /// abandoned.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn enqueue(&self, queue: &WorkQueue, work: Box<Work>) {
        let id = work.id;
        tracing::debug!(work_id = %id, op = ?work.op, path = %work.path, "Work submitted");

        // The rejected descriptor is dropped here and completes as abandoned.
        if queue.push(QueueItem::Work(work)).is_err() {
            tracing::warn!(work_id = %id, "Dispatcher queue is closed");
        }
    }

    fn stop(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }

        // The pill travels I/O -> compression -> I/O behind all queued work.
        // A closed queue means its worker is already gone.
        let _ = self.io_queue.push(QueueItem::Shutdown);

        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            let name = worker.name().to_string();
            if let Err(e) = worker.join() {
                tracing::error!(worker = %name, "{:#}", e);
                if result.is_ok() {
                    result = Err(e.context("Dispatcher worker failed"));
                }
            }
        }

        drop(self.io_queue.close());
        drop(self.compression_queue.close());

        let stats = self.stats.snapshot();
        tracing::info!(
            completed = stats.completed,
            failed = stats.failed,
            "Dispatcher stopped"
        );
        result
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Dispatcher shutdown failed: {:#}", e);
        }
    }
}

/// Closes a worker's queue when the worker exits.
///
/// On a panic it also hands the pill to the peer stage, so neither the peer
/// nor the dispatcher waits on a worker that is gone.
pub(crate) struct StageGuard<'a> {
    stage: &'static str,
    own: &'a WorkQueue,
    peer: &'a WorkQueue,
}

impl<'a> StageGuard<'a> {
    pub(crate) fn new(stage: &'static str, own: &'a WorkQueue, peer: &'a WorkQueue) -> Self {
        Self { stage, own, peer }
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self.own.close();

        if thread::panicking() {
            tracing::error!(
                stage = self.stage,
                abandoned = abandoned.len(),
                "Worker panicked"
            );
            let _ = self.peer.forward(QueueItem::Shutdown);
        }
    }
}
