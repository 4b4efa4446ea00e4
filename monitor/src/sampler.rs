//! Per-process CPU and memory readings

use crate::collector::{ReadError, ProcessCollector};
use crate::session::Sample;
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// First call for a PID. Only establishes the CPU accounting baseline.
    Baseline,
    Sample(Sample),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("process {0} is gone")]
    Gone(u32),
    #[error("transient sampling failure: {0}")]
    Transient(String),
}

pub trait ResourceSampler: Send {
    /// CPU is measured since the previous call for the same PID and normalised
    /// so that 100% means one core fully busy.
    fn sample(&mut self, pid: u32) -> Result<Reading, SampleError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Drops accounting state for `pid`; its next `sample` is a baseline again.
    fn release(&mut self, pid: u32);
}

#[derive(Clone, Copy)]
struct CpuSample {
    total_ticks: u64,
    timestamp: Instant,
}

/// Tick-delta sampler over any `ProcessCollector`.
pub struct ProcSampler<C> {
    collector: C,
    cpu_samples: HashMap<u32, CpuSample>,
}

impl<C: ProcessCollector> ProcSampler<C> {
    pub fn new(collector: C) -> Self {
        Self { collector, cpu_samples: HashMap::new() }
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub fn sample_at(&mut self, pid: u32, now: Instant) -> Result<Reading, SampleError> {
        let info = self.collector.get_process(pid).map_err(|e| match e {
            ReadError::Gone(pid) | ReadError::AccessDenied(pid) => SampleError::Gone(pid),
            ReadError::Malformed(_, msg) => SampleError::Transient(msg),
        })?;

        let current = CpuSample { total_ticks: info.cpu_ticks, timestamp: now };
        let Some(prev) = self.cpu_samples.insert(pid, current) else {
            return Ok(Reading::Baseline);
        };

        let tick_delta = info.cpu_ticks.saturating_sub(prev.total_ticks);
        let time_delta = now.duration_since(prev.timestamp).as_secs_f64();
        let cpu_percent = if time_delta > 0.0 {
            let cpu_seconds = tick_delta as f64 / self.collector.clock_ticks() as f64;
            (cpu_seconds / time_delta) * 100.0 / self.collector.num_cpus() as f64
        } else {
            0.0
        };

        Ok(Reading::Sample(Sample { cpu_percent, resident_bytes: info.rss_bytes }))
    }
}

impl<C: ProcessCollector> ResourceSampler for ProcSampler<C> {
    fn sample(&mut self, pid: u32) -> Result<Reading, SampleError> {
        self.sample_at(pid, Instant::now())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.collector.exists(pid)
    }

    fn release(&mut self, pid: u32) {
        self.cpu_samples.remove(&pid);
    }
}
