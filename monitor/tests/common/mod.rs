//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use trainwatch::collector::{ReadError, ProcessCollector, ProcessInfo};
use trainwatch::error::{MonitorError, Result};
use trainwatch::locator::{Discovery, Locate};
use trainwatch::sampler::{Reading, ResourceSampler, SampleError};
use trainwatch::session::{Row, Sample, TargetDescriptor};
use trainwatch::sink::Sink;

pub const MIB: u64 = 1024 * 1024;

pub fn process(pid: u32, name: &str, cmdline: &str) -> ProcessInfo {
    ProcessInfo {
        pid,
        name: name.to_string(),
        cmdline: cmdline.to_string(),
        cpu_ticks: 0,
        rss_bytes: 64 * MIB,
        state: 'S',
    }
}

/// In-memory process table. Clones share the same table.
#[derive(Clone)]
pub struct FakeTable {
    inner: Arc<Mutex<TableState>>,
}

struct TableState {
    order: Vec<u32>,
    entries: HashMap<u32, std::result::Result<ProcessInfo, ReadError>>,
    clock_ticks: u64,
    num_cpus: u64,
}

impl FakeTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableState {
                order: Vec::new(),
                entries: HashMap::new(),
                clock_ticks: 100,
                num_cpus: 1,
            })),
        }
    }

    pub fn with_cpus(self, clock_ticks: u64, num_cpus: u64) -> Self {
        {
            let mut state = self.inner.lock().unwrap();
            state.clock_ticks = clock_ticks;
            state.num_cpus = num_cpus;
        }
        self
    }

    pub fn add(&self, info: ProcessInfo) -> &Self {
        let mut state = self.inner.lock().unwrap();
        if !state.order.contains(&info.pid) {
            state.order.push(info.pid);
        }
        state.entries.insert(info.pid, Ok(info));
        self
    }

    pub fn add_error(&self, error: ReadError) -> &Self {
        let mut state = self.inner.lock().unwrap();
        let pid = error.pid();
        if !state.order.contains(&pid) {
            state.order.push(pid);
        }
        state.entries.insert(pid, Err(error));
        self
    }

    pub fn remove(&self, pid: u32) {
        let mut state = self.inner.lock().unwrap();
        state.order.retain(|p| *p != pid);
        state.entries.remove(&pid);
    }

    pub fn set_usage(&self, pid: u32, cpu_ticks: u64, rss_bytes: u64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(Ok(info)) = state.entries.get_mut(&pid) {
            info.cpu_ticks = cpu_ticks;
            info.rss_bytes = rss_bytes;
        }
    }
}

impl ProcessCollector for FakeTable {
    fn pids(&self) -> Vec<u32> {
        self.inner.lock().unwrap().order.clone()
    }

    fn get_process(&self, pid: u32) -> std::result::Result<ProcessInfo, ReadError> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&pid)
            .cloned()
            .unwrap_or(Err(ReadError::Gone(pid)))
    }

    fn clock_ticks(&self) -> u64 {
        self.inner.lock().unwrap().clock_ticks
    }

    fn num_cpus(&self) -> u64 {
        self.inner.lock().unwrap().num_cpus
    }
}

/// Returns scripted discovery results, then `NotFound` forever.
#[derive(Clone)]
pub struct ScriptedLocator {
    inner: Arc<Mutex<LocatorState>>,
}

struct LocatorState {
    script: VecDeque<Discovery>,
    calls: usize,
}

impl ScriptedLocator {
    pub fn new(script: Vec<Discovery>) -> Self {
        Self { inner: Arc::new(Mutex::new(LocatorState { script: script.into(), calls: 0 })) }
    }

    pub fn found(target: TargetDescriptor) -> Self {
        Self::new(vec![Discovery::Found(target)])
    }

    pub fn calls(&self) -> usize {
        self.inner.lock().unwrap().calls
    }
}

impl Locate for ScriptedLocator {
    fn acquire(&mut self) -> Discovery {
        let mut state = self.inner.lock().unwrap();
        state.calls += 1;
        state.script.pop_front().unwrap_or(Discovery::NotFound { skipped: 0 })
    }
}

/// Constant readings for PIDs that stay alive until a fixed instant.
#[derive(Clone)]
pub struct ScriptedSampler {
    inner: Arc<Mutex<SamplerState>>,
}

struct SamplerState {
    value: Sample,
    first: Option<Sample>,
    alive_until: HashMap<u32, Instant>,
    readable_until: HashMap<u32, Instant>,
    calls: HashMap<u32, usize>,
    released: Vec<u32>,
}

impl ScriptedSampler {
    pub fn new(value: Sample) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SamplerState {
                value,
                first: None,
                alive_until: HashMap::new(),
                readable_until: HashMap::new(),
                calls: HashMap::new(),
                released: Vec::new(),
            })),
        }
    }

    pub fn alive(self, pid: u32, until: Instant) -> Self {
        self.inner.lock().unwrap().alive_until.insert(pid, until);
        self
    }

    /// Sampling `pid` fails with `Gone` after `until` while it still looks alive.
    pub fn readable(self, pid: u32, until: Instant) -> Self {
        self.inner.lock().unwrap().readable_until.insert(pid, until);
        self
    }

    /// Returns `first` as a real sample on the first call instead of a baseline.
    pub fn first_reading(self, first: Sample) -> Self {
        self.inner.lock().unwrap().first = Some(first);
        self
    }

    pub fn released(&self) -> Vec<u32> {
        self.inner.lock().unwrap().released.clone()
    }

    fn alive_now(state: &SamplerState, pid: u32) -> bool {
        state.alive_until.get(&pid).is_some_and(|until| Instant::now() <= *until)
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self, pid: u32) -> std::result::Result<Reading, SampleError> {
        let mut state = self.inner.lock().unwrap();
        let unreadable = state.readable_until.get(&pid).is_some_and(|until| Instant::now() > *until);
        if unreadable || !Self::alive_now(&state, pid) {
            return Err(SampleError::Gone(pid));
        }
        let calls = state.calls.entry(pid).or_insert(0);
        *calls += 1;
        if *calls == 1 {
            return Ok(match state.first {
                Some(first) => Reading::Sample(first),
                None => Reading::Baseline,
            });
        }
        Ok(Reading::Sample(state.value))
    }

    fn is_alive(&self, pid: u32) -> bool {
        Self::alive_now(&self.inner.lock().unwrap(), pid)
    }

    fn release(&mut self, pid: u32) {
        let mut state = self.inner.lock().unwrap();
        state.calls.remove(&pid);
        state.released.push(pid);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub announcements: Vec<String>,
    pub batches: Vec<(Vec<Row>, bool)>,
}

impl Recorded {
    pub fn delivered_rows(&self) -> Vec<Row> {
        self.batches.iter().flat_map(|(rows, _)| rows.clone()).collect()
    }

    pub fn final_count(&self) -> usize {
        self.batches.iter().filter(|(_, is_final)| *is_final).count()
    }
}

/// Records everything it is handed. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn recorded(&self) -> Recorded {
        self.inner.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn announce_target(&mut self, label: &str) {
        self.inner.lock().unwrap().announcements.push(label.to_string());
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        self.inner.lock().unwrap().batches.push((rows.to_vec(), is_final));
        if self.fail {
            return Err(MonitorError::Export("disk full".into()));
        }
        Ok(())
    }
}

pub fn sample(cpu_percent: f64, ram_mib: u64) -> Sample {
    Sample { cpu_percent, resident_bytes: ram_mib * MIB }
}
