//! Dispatcher configuration.

use crate::heap::DEFAULT_ALIGNMENT;

/// Configuration for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Submitted items each queue holds before submitters block.
    pub queue_capacity: usize,

    /// Whether to pin the two worker threads to distinct CPU cores.
    pub pin_threads: bool,

    /// Name of the I/O worker thread.
    pub io_thread_name: String,

    /// Name of the compression worker thread.
    pub compression_thread_name: String,

    /// Alignment of every buffer the dispatcher allocates.
    pub buffer_alignment: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            pin_threads: false,
            io_thread_name: "lzfs-io".to_string(),
            compression_thread_name: "lzfs-compress".to_string(),
            buffer_alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl DispatcherConfig {
    /// Default configuration with the given queue capacity.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..Self::default()
        }
    }

    /// Checks the configuration for values the dispatcher cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue capacity must be at least 1");
        }
        if !self.buffer_alignment.is_power_of_two() {
            anyhow::bail!(
                "buffer alignment {} is not a power of two",
                self.buffer_alignment
            );
        }
        if self.io_thread_name.is_empty() || self.compression_thread_name.is_empty() {
            anyhow::bail!("worker thread names must not be empty");
        }
        Ok(())
    }
}
