//! Configuration management (TOML)

use crate::error::{MonitorError, Result};
use crate::policy::{Bucket, IntervalPolicy, DEFAULT_BUCKETS, DEFAULT_FALLBACK};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MIN_RATE_SECONDS: f64 = 0.1;
pub const MAX_RATE_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub sampling: SamplingConfig,
    pub flush: FlushConfig,
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Start waiting for a target as soon as the controller runs.
    pub auto_detect: bool,
    /// After a session finishes, wait for the next target.
    pub rearm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub rate_seconds: f64,
    pub tick_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    Immediate,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushConfig {
    pub mode: FlushMode,
    pub warmup_seconds: u64,
    pub buckets: Vec<BucketConfig>,
    pub final_interval_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub up_to_seconds: u64,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub marker_path: PathBuf,
    /// When non-empty, a marker PID only counts if the process name contains this.
    #[serde(default)]
    pub marker_name_hint: String,
    pub interpreter_hint: String,
    pub script_marker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub directory: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig { directory: PathBuf::from(".") }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig {
                auto_detect: true,
                rearm: false,
            },
            sampling: SamplingConfig {
                rate_seconds: 1.0,
                tick_ms: 100,
                poll_interval_ms: 500,
            },
            flush: FlushConfig {
                mode: FlushMode::Adaptive,
                warmup_seconds: 10,
                buckets: DEFAULT_BUCKETS
                    .iter()
                    .map(|b| BucketConfig {
                        up_to_seconds: b.up_to.as_secs(),
                        interval_seconds: b.interval.as_secs(),
                    })
                    .collect(),
                final_interval_seconds: DEFAULT_FALLBACK.as_secs(),
            },
            discovery: DiscoveryConfig {
                marker_path: std::env::temp_dir().join("training_pid.txt"),
                marker_name_hint: String::new(),
                interpreter_hint: "python".to_string(),
                script_marker: ".py".to_string(),
            },
            export: ExportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "trainwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Rejects settings no session can run with.
    pub fn validate(&self) -> Result<()> {
        let rate = self.sampling.rate_seconds;
        if !(MIN_RATE_SECONDS..=MAX_RATE_SECONDS).contains(&rate) {
            return Err(MonitorError::ConfigInvalid(format!(
                "sampling rate {} s is outside [{}, {}]",
                rate, MIN_RATE_SECONDS, MAX_RATE_SECONDS
            )));
        }
        if self.sampling.tick_ms == 0 {
            return Err(MonitorError::ConfigInvalid("tick_ms must be positive".into()));
        }
        if self.sampling.poll_interval_ms == 0 {
            return Err(MonitorError::ConfigInvalid("poll_interval_ms must be positive".into()));
        }
        if self.discovery.interpreter_hint.trim().is_empty() {
            return Err(MonitorError::ConfigInvalid("interpreter_hint must not be empty".into()));
        }
        self.flush.policy()?;
        Ok(())
    }
}

impl FlushConfig {
    pub fn policy(&self) -> Result<IntervalPolicy> {
        let buckets = self
            .buckets
            .iter()
            .map(|b| Bucket::secs(b.up_to_seconds, b.interval_seconds))
            .collect();
        IntervalPolicy::new(buckets, std::time::Duration::from_secs(self.final_interval_seconds))
    }
}
