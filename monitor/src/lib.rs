pub mod collector;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod history;
pub mod locator;
pub mod policy;
pub mod protocol;
pub mod sampler;
pub mod session;
pub mod sink;
pub mod socket;

pub use controller::{Command, ControllerHandle, ControllerSettings, SamplingController};
pub use error::{MonitorError, Result};
pub use session::{Row, Sample, SessionSnapshot, SessionState, TargetDescriptor};
