//! Flush interval schedule for buffered delivery

use crate::error::{MonitorError, Result};
use std::time::Duration;

/// Applies while elapsed time is at most `up_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub up_to: Duration,
    pub interval: Duration,
}

impl Bucket {
    pub const fn secs(up_to: u64, interval: u64) -> Self {
        Self { up_to: Duration::from_secs(up_to), interval: Duration::from_secs(interval) }
    }
}

/// Step function from elapsed monitoring time to flush interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalPolicy {
    buckets: Vec<Bucket>,
    fallback: Duration,
}

pub const DEFAULT_BUCKETS: [Bucket; 10] = [
    Bucket::secs(10, 10),
    Bucket::secs(20, 2),
    Bucket::secs(60, 5),
    Bucket::secs(300, 10),
    Bucket::secs(900, 20),
    Bucket::secs(3600, 30),
    Bucket::secs(10800, 60),
    Bucket::secs(21600, 120),
    Bucket::secs(43200, 300),
    Bucket::secs(86400, 600),
];

pub const DEFAULT_FALLBACK: Duration = Duration::from_secs(1800);

impl IntervalPolicy {
    /// Buckets must have strictly increasing bounds and non-zero intervals.
    pub fn new(buckets: Vec<Bucket>, fallback: Duration) -> Result<Self> {
        if fallback.is_zero() {
            return Err(MonitorError::ConfigInvalid("final flush interval must be positive".into()));
        }
        for (i, bucket) in buckets.iter().enumerate() {
            if bucket.interval.is_zero() {
                return Err(MonitorError::ConfigInvalid(format!(
                    "flush bucket {} has a zero interval",
                    i
                )));
            }
            if i > 0 && bucket.up_to <= buckets[i - 1].up_to {
                return Err(MonitorError::ConfigInvalid(format!(
                    "flush bucket bounds must increase ({}s after {}s)",
                    bucket.up_to.as_secs(),
                    buckets[i - 1].up_to.as_secs()
                )));
            }
        }
        Ok(Self { buckets, fallback })
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn fallback(&self) -> Duration {
        self.fallback
    }

    pub fn flush_interval(&self, elapsed: Duration) -> Duration {
        self.buckets
            .iter()
            .find(|bucket| elapsed <= bucket.up_to)
            .map(|bucket| bucket.interval)
            .unwrap_or(self.fallback)
    }
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self { buckets: DEFAULT_BUCKETS.to_vec(), fallback: DEFAULT_FALLBACK }
    }
}
