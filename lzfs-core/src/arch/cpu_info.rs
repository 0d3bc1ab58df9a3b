//! CPU information used to place worker threads.

use std::fmt;

/// The cores this process may run on.
#[derive(Clone)]
pub struct CpuInfo {
    /// Total number of logical CPU cores
    logical_cores: usize,
    /// Total number of physical CPU cores (if available)
    physical_cores: Option<usize>,
    /// Core IDs the process is allowed to run on
    cores: Vec<usize>,
}

impl fmt::Debug for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuInfo")
            .field("logical_cores", &self.logical_cores)
            .field("physical_cores", &self.physical_cores)
            .field("usable_cores", &self.cores.len())
            .finish()
    }
}

impl CpuInfo {
    /// Detect the cores of the current system
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get().max(1);

        let physical_cores = match num_cpus::get_physical() {
            count if count > 0 => Some(count),
            _ => None,
        };

        // The affinity mask may be narrower than the machine
        let cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|core| core.id).collect::<Vec<_>>())
            .filter(|ids| !ids.is_empty())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            cores,
        }
    }

    /// Get the total number of logical CPU cores
    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    /// Get the total number of physical CPU cores (if available)
    pub fn physical_cores(&self) -> Option<usize> {
        self.physical_cores
    }

    /// Core IDs available to this process
    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    /// Core for the `worker_idx`-th worker; workers wrap around the
    /// available cores.
    pub fn core_for_worker(&self, worker_idx: usize) -> usize {
        if self.cores.is_empty() {
            return worker_idx % self.logical_cores;
        }
        self.cores[worker_idx % self.cores.len()]
    }

    /// Create a mock CpuInfo for testing
    #[cfg(test)]
    pub fn mock(logical_cores: usize) -> Self {
        Self {
            logical_cores,
            physical_cores: Some((logical_cores / 2).max(1)),
            cores: (0..logical_cores).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_info_detect() {
        let info = CpuInfo::detect();
        println!("Detected CPU info: {:?}", info);

        assert!(info.logical_cores() > 0);
        assert!(!info.cores().is_empty());
    }

    #[test]
    fn test_core_for_worker() {
        let info = CpuInfo::mock(4);
        assert_eq!(info.core_for_worker(0), 0);
        assert_eq!(info.core_for_worker(1), 1);
        assert_eq!(info.core_for_worker(3), 3);

        // Additional workers wrap around
        assert_eq!(info.core_for_worker(4), 0);
        assert_eq!(info.core_for_worker(9), 1);
    }

    #[test]
    fn test_single_core() {
        let info = CpuInfo::mock(1);
        assert_eq!(info.core_for_worker(0), 0);
        assert_eq!(info.core_for_worker(1), 0);
    }
}
