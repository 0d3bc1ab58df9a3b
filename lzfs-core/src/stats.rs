//! Dispatcher counters.
//!
//! Submitters and both workers update the counters concurrently, so each one
//! sits on its own cache line.

use crate::error::WorkError;
use crate::work::WorkOp;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of a dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    reads_submitted: CachePadded<AtomicU64>,
    writes_submitted: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,
    failed: CachePadded<AtomicU64>,
    bytes_read: CachePadded<AtomicU64>,
    bytes_written: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Reads submitted.
    pub reads_submitted: u64,
    /// Writes submitted.
    pub writes_submitted: u64,
    /// Descriptors that reached a terminal state, failures included.
    pub completed: u64,
    /// Descriptors that completed with an error.
    pub failed: u64,
    /// Bytes delivered by successful reads.
    pub bytes_read: u64,
    /// Bytes handed to the platform by successful writes.
    pub bytes_written: u64,
}

impl StatsSnapshot {
    /// Descriptors submitted but not yet complete.
    pub fn in_flight(&self) -> u64 {
        (self.reads_submitted + self.writes_submitted).saturating_sub(self.completed)
    }
}

impl DispatcherStats {
    pub(crate) fn record_submitted(&self, op: WorkOp) {
        match op {
            WorkOp::Read => self.reads_submitted.fetch_add(1, Ordering::Relaxed),
            WorkOp::Write => self.writes_submitted.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_completed(&self, op: WorkOp, result: &Result<(), WorkError>, size: usize) {
        match (result, op) {
            (Ok(()), WorkOp::Read) => {
                self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
            }
            (Ok(()), WorkOp::Write) => {
                self.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
            }
            (Err(_), _) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Released last so a snapshot never sees completion before its bytes.
        self.completed.fetch_add(1, Ordering::Release);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let completed = self.completed.load(Ordering::Acquire);
        StatsSnapshot {
            reads_submitted: self.reads_submitted.load(Ordering::Relaxed),
            writes_submitted: self.writes_submitted.load(Ordering::Relaxed),
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
