//! Process table access (reads /proc on Linux)

pub mod linux;

pub use linux::LinuxProcessCollector;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    /// Cumulative user + system time in clock ticks.
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
    pub state: char,
}

/// Why a single process could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("process {0} does not exist")]
    Gone(u32),
    #[error("access to process {0} denied")]
    AccessDenied(u32),
    #[error("process {0}: {1}")]
    Malformed(u32, String),
}

impl ReadError {
    pub fn pid(&self) -> u32 {
        match self {
            ReadError::Gone(pid) | ReadError::AccessDenied(pid) | ReadError::Malformed(pid, _) => *pid,
        }
    }
}

pub trait ProcessCollector: Send + Sync {
    /// PIDs in process-table order. The order is whatever the OS hands out and
    /// is not stable between calls.
    fn pids(&self) -> Vec<u32>;

    fn get_process(&self, pid: u32) -> Result<ProcessInfo, ReadError>;

    /// Clock ticks per second used by `ProcessInfo::cpu_ticks`.
    fn clock_ticks(&self) -> u64;

    /// Logical CPUs online.
    fn num_cpus(&self) -> u64;

    fn list_processes(&self) -> Vec<ProcessInfo> {
        self.pids()
            .into_iter()
            .filter_map(|pid| self.get_process(pid).ok())
            .collect()
    }

    fn exists(&self, pid: u32) -> bool {
        !matches!(self.get_process(pid), Err(ReadError::Gone(_)))
    }
}
