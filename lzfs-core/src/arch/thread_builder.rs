//! Thread builder for creating and pinning worker threads
//!
//! The dispatcher spawns its I/O and compression workers through this
//! builder, which optionally pins each one to its own CPU core.

use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};

use crate::arch::CpuInfo;

/// Result of attempting to pin a thread to a specific core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningResult {
    /// Successfully pinned to the requested core
    Success,
    /// Successfully pinned, but to a different core than requested
    SuccessDifferentCore(usize),
    /// Pinning is not supported on this platform
    Unsupported,
    /// Pinning failed for some other reason
    Failed,
}

/// A named worker thread that may be pinned to a specific CPU core
#[derive(Debug)]
pub struct WorkerThread {
    /// The thread's name
    name: String,
    /// The thread's join handle
    handle: JoinHandle<()>,
    /// The CPU core this thread is pinned to, if any
    core_id: Option<usize>,
}

impl WorkerThread {
    /// Name the thread was spawned with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the CPU core this thread was assigned, if any
    pub fn core_id(&self) -> Option<usize> {
        self.core_id
    }

    /// Whether the thread has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit
    ///
    /// Fails if the thread panicked.
    pub fn join(self) -> Result<()> {
        let name = self.name;
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread `{}` panicked", name))
    }
}

/// Builder for creating worker threads
#[derive(Debug)]
pub struct ThreadBuilder {
    /// Whether spawned threads are pinned
    pin: bool,
    /// CPU information to use for core assignment
    cpu_info: CpuInfo,
    /// Current worker index (incremented for each thread created)
    worker_idx: usize,
}

impl ThreadBuilder {
    /// Create a new thread builder
    pub fn new(pin: bool, cpu_info: &CpuInfo) -> Self {
        Self {
            pin,
            cpu_info: cpu_info.clone(),
            worker_idx: 0,
        }
    }

    /// Spawn a named worker thread running `f`
    pub fn spawn<F>(&mut self, name: &str, f: F) -> Result<WorkerThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let core_id = self
            .pin
            .then(|| self.cpu_info.core_for_worker(self.worker_idx));
        self.worker_idx += 1;

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Some(core) = core_id {
                    match pin_thread_to_core(core) {
                        PinningResult::Success => {
                            tracing::debug!(core, "Worker thread pinned");
                        }
                        result => {
                            tracing::warn!(core, ?result, "Worker thread pinning");
                        }
                    }
                }

                f();
            })
            .with_context(|| format!("Failed to spawn worker thread `{}`", name))?;

        Ok(WorkerThread {
            name: name.to_string(),
            handle,
            core_id,
        })
    }
}

/// Attempt to pin the current thread to a specific CPU core
fn pin_thread_to_core(core_id: usize) -> PinningResult {
    match core_affinity::get_core_ids() {
        Some(core_ids) => {
            if let Some(core) = core_ids.iter().find(|core| core.id == core_id) {
                if core_affinity::set_for_current(*core) {
                    PinningResult::Success
                } else {
                    PinningResult::Failed
                }
            } else if !core_ids.is_empty() {
                // Requested core is outside our mask, use one that is inside
                let fallback = core_ids[core_id % core_ids.len()];

                if core_affinity::set_for_current(fallback) {
                    PinningResult::SuccessDifferentCore(fallback.id)
                } else {
                    PinningResult::Failed
                }
            } else {
                PinningResult::Failed
            }
        }
        None => PinningResult::Unsupported,
    }
}
