//! CPU detection and worker thread management
//!
//! This module is responsible for:
//! - Detecting which cores the process may run on
//! - Building and optionally pinning the dispatcher's worker threads

pub mod cpu_info;
pub mod thread_builder;

pub use cpu_info::CpuInfo;
pub use thread_builder::{PinningResult, ThreadBuilder, WorkerThread};

/// Get information about the current system's CPU cores
pub fn detect_cpu_topology() -> CpuInfo {
    CpuInfo::detect()
}
