//! Sampling controller: discovery, sampling, aggregation and flushing
//!
//! One task owns the `Session`. Callers talk to it through a
//! [`ControllerHandle`]: commands go in over an mpsc channel and read-only
//! snapshots come out over a watch channel.

use crate::config::{Config, FlushMode};
use crate::error::{MonitorError, Result};
use crate::locator::{Discovery, Locate};
use crate::policy::IntervalPolicy;
use crate::sampler::{Reading, ResourceSampler, SampleError};
use crate::session::{EndReason, Session, SessionSnapshot, SessionState, TargetDescriptor, Window};
use crate::sink::Sink;
use chrono::Local;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Length of one aggregation window.
    pub rate: Duration,
    /// Cadence of samples inside a window. Never longer than `rate`.
    pub tick: Duration,
    pub poll_interval: Duration,
    pub mode: FlushMode,
    pub warmup: Duration,
    pub policy: IntervalPolicy,
    pub auto_detect: bool,
    pub rearm: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            rate: Duration::from_secs(1),
            tick: Duration::from_millis(100),
            poll_interval: Duration::from_millis(500),
            mode: FlushMode::Adaptive,
            warmup: Duration::from_secs(10),
            policy: IntervalPolicy::default(),
            auto_detect: true,
            rearm: false,
        }
    }
}

impl TryFrom<&Config> for ControllerSettings {
    type Error = MonitorError;

    fn try_from(config: &Config) -> Result<Self> {
        config.validate()?;
        let rate = Duration::from_secs_f64(config.sampling.rate_seconds);
        Ok(Self {
            rate,
            tick: Duration::from_millis(config.sampling.tick_ms).min(rate),
            poll_interval: Duration::from_millis(config.sampling.poll_interval_ms),
            mode: config.flush.mode,
            warmup: Duration::from_secs(config.flush.warmup_seconds),
            policy: config.flush.policy()?,
            auto_detect: config.general.auto_detect,
            rearm: config.general.rearm,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Idle/Finished -> Waiting. Rejected while a session is running.
    Start,
    /// Ends the running session (final flush) or stops waiting.
    Stop,
    /// Back to Idle, dropping the last session's rows. Rejected while monitoring.
    Reset,
    SetRearm(bool),
    /// Ends any running session and stops the controller.
    Shutdown,
}

/// Caller side of a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl ControllerHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| MonitorError::ControllerClosed)
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.send(Command::Reset).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Resolves with the first snapshot matching `pred`, including the current one.
    pub async fn wait_for<F>(&self, mut pred: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(|s| pred(s)).await.map_err(|_| MonitorError::ControllerClosed)?;
        Ok(snapshot.clone())
    }
}

pub struct SamplingController<L, S, K> {
    settings: ControllerSettings,
    locator: L,
    sampler: S,
    sink: K,
    session: Session,
    window: Window,
    window_started: Option<Instant>,
    primed: bool,
    last_error: Option<String>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl<L, S, K> SamplingController<L, S, K>
where
    L: Locate,
    S: ResourceSampler,
    K: Sink,
{
    pub fn new(settings: ControllerSettings, locator: L, sampler: S, sink: K) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let controller = Self {
            settings,
            locator,
            sampler,
            sink,
            session: Session::default(),
            window: Window::default(),
            window_started: None,
            primed: false,
            last_error: None,
            commands: command_rx,
            commands_open: true,
            snapshots: snapshot_tx,
        };
        let handle = ControllerHandle { commands: command_tx, snapshots: snapshot_rx };
        (controller, handle)
    }

    /// Runs until `Command::Shutdown`, or until every handle is dropped while
    /// no session is active. Returns the last session.
    pub async fn run(mut self) -> Session {
        if self.settings.auto_detect {
            self.begin_waiting();
        }

        loop {
            match self.session.state {
                SessionState::Waiting => self.poll_locator(Instant::now()),
                SessionState::Monitoring => self.tick(Instant::now()),
                SessionState::Idle | SessionState::Finished => {}
            }

            let command = match self.cadence() {
                Some(pause) => self.next_command(pause).await,
                None if self.commands_open => match self.commands.recv().await {
                    Some(command) => Some(command),
                    None => {
                        self.commands_open = false;
                        Some(Command::Shutdown)
                    }
                },
                None => Some(Command::Shutdown),
            };

            if let Some(command) = command {
                if self.handle(command).is_break() {
                    break;
                }
            }
        }

        info!("Controller stopped");
        self.session
    }

    fn cadence(&self) -> Option<Duration> {
        match self.session.state {
            SessionState::Waiting => Some(self.settings.poll_interval),
            SessionState::Monitoring => Some(self.settings.tick),
            SessionState::Idle | SessionState::Finished => None,
        }
    }

    async fn next_command(&mut self, pause: Duration) -> Option<Command> {
        if !self.commands_open {
            tokio::time::sleep(pause).await;
            return None;
        }
        tokio::select! {
            command = self.commands.recv() => {
                if command.is_none() {
                    self.commands_open = false;
                    tokio::time::sleep(pause).await;
                }
                command
            }
            _ = tokio::time::sleep(pause) => None,
        }
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        debug!("Command {:?} in state {}", command, self.session.state);
        match command {
            Command::Start => match self.session.state {
                SessionState::Idle | SessionState::Finished => self.begin_waiting(),
                state => warn!("Start rejected: controller is already {}", state),
            },
            Command::Stop => match self.session.state {
                SessionState::Monitoring => self.finish(Instant::now(), EndReason::Stopped, false),
                SessionState::Waiting => {
                    self.session.clear(SessionState::Idle);
                    info!("Stopped waiting for a target");
                    self.publish();
                }
                _ => {}
            },
            Command::Reset => match self.session.state {
                SessionState::Monitoring => warn!("Reset rejected while monitoring"),
                _ => {
                    self.session.clear(SessionState::Idle);
                    self.last_error = None;
                    info!("Session reset");
                    self.publish();
                }
            },
            Command::SetRearm(rearm) => {
                self.settings.rearm = rearm;
                if rearm && self.session.state == SessionState::Finished {
                    self.begin_waiting();
                }
            }
            Command::Shutdown => {
                if self.session.state == SessionState::Monitoring {
                    self.finish(Instant::now(), EndReason::Shutdown, false);
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.snapshot(self.last_error.clone()));
    }

    fn begin_waiting(&mut self) {
        self.session.clear(SessionState::Waiting);
        info!("Waiting for training process...");
        self.publish();
    }

    fn poll_locator(&mut self, now: Instant) {
        match self.locator.acquire() {
            Discovery::Found(target) => self.begin_monitoring(target, now),
            Discovery::NotFound { skipped } => {
                debug!("No target yet ({} candidates unreadable)", skipped);
            }
        }
    }

    fn begin_monitoring(&mut self, target: TargetDescriptor, now: Instant) {
        info!("Detected training from: {} (pid {}, {})", target.label, target.pid, target.origin);
        let pid = target.pid;
        self.sink.announce_target(&target.label);
        self.session.begin(target, now);
        self.window.clear();
        self.window_started = Some(now);
        self.primed = false;
        self.publish();

        // The first reading only sets the CPU baseline
        match self.sampler.sample(pid) {
            Ok(_) => self.primed = true,
            Err(SampleError::Gone(_)) => self.finish(now, EndReason::SamplerGone, true),
            Err(SampleError::Transient(e)) => debug!("Baseline read failed, retrying: {}", e),
        }
    }

    fn termination(&self, target: &TargetDescriptor) -> Option<EndReason> {
        if let Some(marker) = &target.marker {
            if !marker.exists() {
                return Some(EndReason::MarkerRemoved);
            }
        }
        if !self.sampler.is_alive(target.pid) {
            return Some(EndReason::ProcessExited);
        }
        None
    }

    fn tick(&mut self, now: Instant) {
        let Some(target) = self.session.target.as_ref() else {
            warn!("Monitoring without a target");
            self.session.clear(SessionState::Idle);
            self.publish();
            return;
        };
        let pid = target.pid;

        if let Some(reason) = self.termination(target) {
            self.finish(now, reason, true);
            return;
        }

        match self.sampler.sample(pid) {
            Ok(_) if !self.primed => {
                self.primed = true;
                self.window_started = Some(now);
            }
            Ok(Reading::Sample(sample)) => self.window.push(&sample),
            Ok(Reading::Baseline) => debug!("Sampler lost its baseline for pid {}", pid),
            Err(SampleError::Gone(_)) => {
                self.finish(now, EndReason::SamplerGone, true);
                return;
            }
            Err(SampleError::Transient(e)) => warn!("Sampling pid {} failed: {}", pid, e),
        }

        if !self.primed {
            return;
        }
        let Some(window_started) = self.window_started else {
            return;
        };
        if now.duration_since(window_started) < self.settings.rate {
            return;
        }

        // Step by whole windows; resync if the loop fell far behind
        let next = window_started + self.settings.rate;
        self.window_started = Some(if now.duration_since(next) >= self.settings.rate { now } else { next });

        let label = self.session.target.as_ref().map(|t| t.label.clone()).unwrap_or_default();
        if let Some(row) = self.window.collapse(Local::now(), &label) {
            self.session.push_row(row);
            self.apply_flush_mode(now);
        }
    }

    fn apply_flush_mode(&mut self, now: Instant) {
        match self.settings.mode {
            FlushMode::Immediate => self.flush(now, false),
            FlushMode::Adaptive => {
                let started = self.session.started_at.unwrap_or(now);
                let elapsed = now.duration_since(started);
                if !self.session.warmed_up {
                    if elapsed >= self.settings.warmup {
                        self.session.warmed_up = true;
                        self.flush(now, false);
                    }
                    return;
                }
                let last = self.session.last_flush_at.unwrap_or(started);
                if now.duration_since(last) >= self.settings.policy.flush_interval(elapsed) {
                    self.flush(now, false);
                }
            }
        }
    }

    fn flush(&mut self, now: Instant, is_final: bool) {
        let batch = self.session.take_pending(now);
        let count = batch.len();
        if let Err(e) = self.sink.deliver(&batch, is_final) {
            warn!("Sink failed to take {} rows: {}", count, e);
            self.last_error = Some(e.to_string());
        }
        debug!("Flushed {} rows (final: {})", count, is_final);
        self.publish();
    }

    fn finish(&mut self, now: Instant, reason: EndReason, allow_rearm: bool) {
        if let Some(target) = &self.session.target {
            self.sampler.release(target.pid);
        }
        if !self.window.is_empty() {
            debug!("Dropping partial window of {} samples", self.window.len());
            self.window.clear();
        }
        self.session.state = SessionState::Finished;
        self.session.end_reason = Some(reason);
        self.flush(now, true);
        info!(
            "Training stopped ({:?}), {} rows recorded",
            reason,
            self.session.row_count()
        );

        if allow_rearm && self.settings.rearm {
            self.begin_waiting();
        }
    }
}
