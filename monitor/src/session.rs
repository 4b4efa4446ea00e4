//! Session data model: targets, samples, rows and the session state machine

use chrono::{DateTime, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::time::Instant;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    FlagFile,
    HeuristicMatch,
    Manual,
}

impl fmt::Display for OriginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OriginKind::FlagFile => "flag_file",
            OriginKind::HeuristicMatch => "heuristic_match",
            OriginKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// The process being observed. Built once by a locator and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub pid: u32,
    pub label: String,
    pub origin: OriginKind,
    /// Hand-off marker that published the PID, only for `OriginKind::FlagFile`.
    pub marker: Option<PathBuf>,
}

impl TargetDescriptor {
    pub fn flag_file(pid: u32, label: impl Into<String>, marker: impl Into<PathBuf>) -> Self {
        Self { pid, label: label.into(), origin: OriginKind::FlagFile, marker: Some(marker.into()) }
    }

    pub fn heuristic(pid: u32, label: impl Into<String>) -> Self {
        Self { pid, label: label.into(), origin: OriginKind::HeuristicMatch, marker: None }
    }

    pub fn manual(pid: u32, label: impl Into<String>) -> Self {
        Self { pid, label: label.into(), origin: OriginKind::Manual, marker: None }
    }
}

/// One instantaneous reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu_percent: f64,
    pub resident_bytes: u64,
}

impl Sample {
    pub fn ram_mb(&self) -> f64 {
        self.resident_bytes as f64 / BYTES_PER_MB
    }
}

/// Averaged result of one sampling-rate window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: DateTime<Local>,
    pub cpu_percent: f64,
    pub ram_mb: f64,
    pub source: String,
}

impl Row {
    pub fn time_label(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// Accumulates samples until the controller closes the window.
#[derive(Debug, Default)]
pub struct Window {
    cpu_sum: f64,
    ram_sum_mb: f64,
    count: u32,
}

impl Window {
    pub fn push(&mut self, sample: &Sample) {
        self.cpu_sum += sample.cpu_percent;
        self.ram_sum_mb += sample.ram_mb();
        self.count += 1;
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        *self = Window::default();
    }

    /// Averages and empties the window. An empty window yields no row.
    pub fn collapse(&mut self, timestamp: DateTime<Local>, source: &str) -> Option<Row> {
        if self.count == 0 {
            return None;
        }
        let n = f64::from(self.count);
        let row = Row {
            timestamp: truncate_to_seconds(timestamp),
            cpu_percent: self.cpu_sum / n,
            ram_mb: self.ram_sum_mb / n,
            source: source.to_string(),
        };
        self.clear();
        Some(row)
    }
}

pub fn truncate_to_seconds(timestamp: DateTime<Local>) -> DateTime<Local> {
    timestamp.with_nanosecond(0).unwrap_or(timestamp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Waiting,
    Monitoring,
    Finished,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Waiting => "waiting",
            SessionState::Monitoring => "monitoring",
            SessionState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Why a monitoring session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    MarkerRemoved,
    ProcessExited,
    SamplerGone,
    Stopped,
    Shutdown,
}

/// Delivered rows of one session.
///
/// The store is append-only and shared between the controller and every
/// snapshot taken from it. A `RowLog` only sees the first `len` rows, so a
/// clone is a stable view that costs one `Arc` bump no matter how long the
/// session has run.
#[derive(Clone, Default)]
pub struct RowLog {
    store: Arc<RwLock<Vec<Row>>>,
    len: usize,
}

impl RowLog {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Row>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&mut self, rows: &[Row]) {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.truncate(self.len);
        store.extend_from_slice(rows);
        self.len = store.len();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<Row> {
        if index >= self.len {
            return None;
        }
        self.read().get(index).cloned()
    }

    /// Copies the rows from `start` to the end of this view.
    pub fn slice_from(&self, start: usize) -> Vec<Row> {
        let store = self.read();
        let end = self.len.min(store.len());
        store[start.min(end)..end].to_vec()
    }

    pub fn to_vec(&self) -> Vec<Row> {
        self.slice_from(0)
    }

    /// True when both views read the same underlying store.
    pub fn shares_storage(&self, other: &RowLog) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

impl From<Vec<Row>> for RowLog {
    fn from(rows: Vec<Row>) -> Self {
        let len = rows.len();
        Self { store: Arc::new(RwLock::new(rows)), len }
    }
}

impl fmt::Debug for RowLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.read().iter().take(self.len)).finish()
    }
}

impl PartialEq for RowLog {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && (self.shares_storage(other) || self.to_vec() == other.to_vec())
    }
}

impl PartialEq<Vec<Row>> for RowLog {
    fn eq(&self, other: &Vec<Row>) -> bool {
        self.len == other.len() && self.to_vec() == *other
    }
}

/// Session state. Owned and mutated by the controller task only.
#[derive(Debug)]
pub struct Session {
    pub state: SessionState,
    pub target: Option<TargetDescriptor>,
    delivered: RowLog,
    pending: Vec<Row>,
    last_timestamp: Option<DateTime<Local>>,
    pub started_at: Option<Instant>,
    pub last_flush_at: Option<Instant>,
    pub warmed_up: bool,
    pub end_reason: Option<EndReason>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            target: None,
            delivered: RowLog::default(),
            pending: Vec::new(),
            last_timestamp: None,
            started_at: None,
            last_flush_at: None,
            warmed_up: false,
            end_reason: None,
        }
    }
}

impl Session {
    /// Starts a fresh session for `target`, dropping everything from the last one.
    pub fn begin(&mut self, target: TargetDescriptor, now: Instant) {
        *self = Session {
            state: SessionState::Monitoring,
            target: Some(target),
            started_at: Some(now),
            last_flush_at: Some(now),
            ..Session::default()
        };
    }

    /// Clears rows and target and leaves the session in `state`.
    pub fn clear(&mut self, state: SessionState) {
        *self = Session { state, ..Session::default() };
    }

    /// Every row of the session, delivered first, then pending.
    pub fn rows(&self) -> Vec<Row> {
        let mut rows = self.delivered.to_vec();
        rows.extend_from_slice(&self.pending);
        rows
    }

    pub fn row_count(&self) -> usize {
        self.delivered.len() + self.pending.len()
    }

    pub fn flushed_rows(&self) -> &RowLog {
        &self.delivered
    }

    pub fn pending_rows(&self) -> &[Row] {
        &self.pending
    }

    /// Appends a row, holding the timestamp at the previous row's if the wall
    /// clock stepped backwards.
    pub fn push_row(&mut self, mut row: Row) {
        if let Some(last) = self.last_timestamp {
            if row.timestamp < last {
                row.timestamp = last;
            }
        }
        self.last_timestamp = Some(row.timestamp);
        self.pending.push(row);
    }

    /// Marks every pending row as delivered and returns them.
    pub fn take_pending(&mut self, now: Instant) -> Vec<Row> {
        let batch = std::mem::take(&mut self.pending);
        self.delivered.append(&batch);
        self.last_flush_at = Some(now);
        batch
    }

    pub fn snapshot(&self, last_error: Option<String>) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            target: self.target.clone(),
            rows: self.delivered.clone(),
            pending: self.pending.len(),
            end_reason: self.end_reason,
            last_error,
        }
    }
}

/// Read-only copy of the session handed to presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub target: Option<TargetDescriptor>,
    /// Rows delivered so far, oldest first.
    pub rows: RowLog,
    pub pending: usize,
    pub end_reason: Option<EndReason>,
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Session::default().snapshot(None)
    }
}
