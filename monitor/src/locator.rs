//! Target process discovery

use crate::collector::{ReadError, ProcessCollector, ProcessInfo};
use crate::config::DiscoveryConfig;
use crate::session::TargetDescriptor;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    Found(TargetDescriptor),
    /// `skipped` counts candidates that could not be read during the scan.
    NotFound { skipped: usize },
}

pub trait Locate: Send {
    fn acquire(&mut self) -> Discovery;
}

impl<L: Locate + ?Sized> Locate for Box<L> {
    fn acquire(&mut self) -> Discovery {
        (**self).acquire()
    }
}

/// Finds the target through the hand-off marker first, then by scanning the
/// process table.
///
/// The scan takes the first process whose name contains the interpreter hint
/// and whose command line contains the script marker. "First" follows the
/// process table's enumeration order, which the OS does not keep stable, and
/// nothing stops an unrelated process from matching. Both are known
/// limitations of the heuristic.
pub struct ProcessLocator<C> {
    collector: C,
    marker_path: PathBuf,
    marker_name_hint: String,
    interpreter_hint: String,
    script_marker: String,
    self_pid: u32,
}

impl<C: ProcessCollector> ProcessLocator<C> {
    pub fn new(collector: C, config: &DiscoveryConfig) -> Self {
        Self {
            collector,
            marker_path: config.marker_path.clone(),
            marker_name_hint: config.marker_name_hint.to_lowercase(),
            interpreter_hint: config.interpreter_hint.to_lowercase(),
            script_marker: config.script_marker.to_lowercase(),
            self_pid: std::process::id(),
        }
    }

    /// Treats `pid` as the locator's own process, which is never selected.
    pub fn with_self_pid(mut self, pid: u32) -> Self {
        self.self_pid = pid;
        self
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    fn from_marker(&self) -> Option<TargetDescriptor> {
        let pid = match read_marker(&self.marker_path) {
            Ok(Some(pid)) => pid,
            Ok(None) => return None,
            Err(e) => {
                debug!("Ignoring hand-off marker {:?}: {}", self.marker_path, e);
                return None;
            }
        };

        let info = match self.collector.get_process(pid) {
            Ok(info) => info,
            Err(e) => {
                debug!("Hand-off marker names unusable process: {}", e);
                return None;
            }
        };
        if !self.marker_name_hint.is_empty()
            && !info.name.to_lowercase().contains(&self.marker_name_hint)
        {
            debug!("Marker PID {} ({}) does not match name hint", pid, info.name);
            return None;
        }

        let label = format!("{} (PID: {}) CMD: {}", info.name, pid, info.cmdline);
        Some(TargetDescriptor::flag_file(pid, label, self.marker_path.clone()))
    }

    fn matches(&self, info: &ProcessInfo) -> bool {
        info.name.to_lowercase().contains(&self.interpreter_hint)
            && info.cmdline.to_lowercase().contains(&self.script_marker)
    }

    fn scan(&self) -> Discovery {
        let mut skipped = 0;
        for pid in self.collector.pids() {
            if pid == self.self_pid {
                continue;
            }
            match self.collector.get_process(pid) {
                Ok(info) if self.matches(&info) => {
                    let label = format!("{}: {}", info.name, info.cmdline);
                    return Discovery::Found(TargetDescriptor::heuristic(pid, label));
                }
                Ok(_) => {}
                Err(e) => {
                    skipped += 1;
                    log_skip(&e);
                }
            }
        }
        Discovery::NotFound { skipped }
    }
}

impl<C: ProcessCollector> Locate for ProcessLocator<C> {
    fn acquire(&mut self) -> Discovery {
        if let Some(target) = self.from_marker() {
            return Discovery::Found(target);
        }
        self.scan()
    }
}

fn log_skip(e: &ReadError) {
    match e {
        ReadError::Gone(pid) => debug!("Process {} exited during scan", pid),
        other => debug!("Skipping candidate {}: {}", other.pid(), other),
    }
}

/// Reads a PID from the marker. `Ok(None)` when there is no marker.
pub fn read_marker(path: &Path) -> io::Result<Option<u32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    content
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Attaches to an explicitly given PID.
pub struct ManualLocator<C> {
    collector: C,
    pid: u32,
}

impl<C: ProcessCollector> ManualLocator<C> {
    pub fn new(collector: C, pid: u32) -> Self {
        Self { collector, pid }
    }
}

impl<C: ProcessCollector> Locate for ManualLocator<C> {
    fn acquire(&mut self) -> Discovery {
        match self.collector.get_process(self.pid) {
            Ok(info) => {
                let label = format!("{} (PID: {}) CMD: {}", info.name, info.pid, info.cmdline);
                Discovery::Found(TargetDescriptor::manual(self.pid, label))
            }
            Err(e) => {
                debug!("Manual target unavailable: {}", e);
                Discovery::NotFound { skipped: usize::from(!matches!(e, ReadError::Gone(_))) }
            }
        }
    }
}
