//! The bridge's main loop.
//!
//! One thread owns a [`PollCycle`] and drives it: a trigger check on every
//! tick while the server is started, plus a slower refresh of the settings
//! on its own timer. Other threads steer it only through [`ServerControl`],
//! which the loop looks at between ticks.

use crate::config::ScopeContext;
use crate::connector;
use crate::settings::{ScopeCalibration, SettingsSynchronizer, SyncError};
use crate::transport::TransportError;
use crate::trigger_monitor::{MonitorError, TriggerMonitor, TriggerOutcome};
use crate::value_store::{PublishMode, Value};
use crate::waveform::{AcquireError, WaveformAcquirer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Polling for triggers and publishing waveforms.
    Started,
    /// Connected, settings kept fresh, no acquisitions.
    Stopped,
    Exit,
}

impl RunState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Started => 0,
            Self::Stopped => 1,
            Self::Exit => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Started,
            1 => Self::Stopped,
            _ => Self::Exit,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "Started",
            Self::Stopped => "Stopped",
            Self::Exit => "Exit",
        })
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" | "started" => Ok(Self::Started),
            "stop" | "stopped" => Ok(Self::Stopped),
            "exit" => Ok(Self::Exit),
            other => Err(format!("unknown server state {other:?}")),
        }
    }
}

/// Run-state switch shared between the loop and whoever controls it.
#[derive(Debug)]
pub struct ServerControl {
    state: AtomicU8,
    resync: AtomicBool,
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Stopped.to_u8()),
            resync: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Change state. Once `Exit` is set it sticks.
    pub fn set_state(&self, state: RunState) {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != RunState::Exit.to_u8()).then_some(state.to_u8())
            });
        if let Ok(previous) = previous {
            let previous = RunState::from_u8(previous);
            if previous != state {
                log::info!("Server {previous} -> {state}");
            }
        }
    }

    pub fn request_exit(&self) {
        self.set_state(RunState::Exit);
    }

    /// Ask the loop to re-read every setting before its next tick.
    pub fn request_resync(&self) {
        self.resync.store(true, Ordering::Release);
    }

    pub fn take_resync(&self) -> bool {
        self.resync.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    TriggerQuery,
    Acquisition,
    Reconcile,
    Refresh,
    Calibration,
    Status,
}

impl Stage {
    pub const ALL: [Self; 6] = [
        Self::TriggerQuery,
        Self::Acquisition,
        Self::Reconcile,
        Self::Refresh,
        Self::Calibration,
        Self::Status,
    ];
}

/// Most recent duration of each stage. Overwritten, never summed.
#[derive(Debug, Clone, Default)]
pub struct ElapsedTimeLedger {
    stages: BTreeMap<Stage, Duration>,
}

impl ElapsedTimeLedger {
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        self.stages.insert(stage, elapsed);
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.stages.get(&stage).copied()
    }

    /// Seconds per stage in [`Stage::ALL`] order, zero for stages not run yet.
    pub fn seconds(&self) -> Vec<f64> {
        Stage::ALL
            .iter()
            .map(|stage| self.get(*stage).map_or(0.0, |d| d.as_secs_f64()))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Keep going after a transport hiccup, stop on anything that breaks alignment.
fn tolerate(result: Result<(), SyncError>, what: &str) -> Result<(), PollError> {
    match result {
        Err(e) if e.is_fatal() => {
            log::error!("{what} failed: {e}");
            Err(e.into())
        }
        Err(e) => {
            log::warn!("{what} failed: {e}");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

pub struct PollCycle {
    ctx: ScopeContext,
    settings: SettingsSynchronizer,
    monitor: TriggerMonitor,
    acquirer: WaveformAcquirer,
    calibration: ScopeCalibration,
    ledger: ElapsedTimeLedger,
    last_state: RunState,
    last_refresh: Option<Instant>,
    configure_failures: u32,
}

impl PollCycle {
    pub fn new(ctx: ScopeContext) -> Self {
        let config = &ctx.config;
        Self {
            monitor: TriggerMonitor::new(config.escalation_threshold),
            acquirer: WaveformAcquirer::new(config.byte_order, config.normalize),
            settings: SettingsSynchronizer::new(),
            calibration: ScopeCalibration::default(),
            ledger: ElapsedTimeLedger::default(),
            last_state: RunState::Stopped,
            last_refresh: None,
            configure_failures: 0,
            ctx,
        }
    }

    pub fn settings(&self) -> &SettingsSynchronizer {
        &self.settings
    }

    pub fn monitor(&self) -> &TriggerMonitor {
        &self.monitor
    }

    pub fn calibration(&self) -> &ScopeCalibration {
        &self.calibration
    }

    pub fn ledger(&self) -> &ElapsedTimeLedger {
        &self.ledger
    }

    /// Publish the initial values and read everything once.
    pub fn startup(&mut self) -> Result<(), PollError> {
        let store = &self.ctx.store;
        store.publish("setup", Value::Text("Setup".into()), PublishMode::Always, None);
        store.publish("trigger", Value::Text("Trigger".into()), PublishMode::Always, None);
        store.publish("acqCount", Value::Int(0), PublishMode::Always, None);
        store.publish("lostTrigs", Value::Int(0), PublishMode::Always, None);
        self.resync()?;
        self.periodic_update()?;
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Run until something asks for `Exit` or a fatal error occurs. A fatal
    /// error also sets `Exit` so other threads wind down.
    pub fn run(&mut self) -> Result<(), PollError> {
        let result = self.startup().and_then(|()| self.run_loop());
        if let Err(e) = &result {
            log::error!("Stopping the bridge: {e}");
            self.ctx.control.request_exit();
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), PollError> {
        let poll_interval = self.ctx.config.poll_interval;
        let refresh_interval = self.ctx.config.refresh_interval;
        loop {
            let state = self.ctx.control.state();
            if state == RunState::Exit {
                log::info!("Exit requested");
                return Ok(());
            }
            self.enter_state(state)?;
            if self.ctx.control.take_resync() {
                self.resync()?;
            }
            if self.last_state == RunState::Started {
                self.tick()?;
            }
            if self
                .last_refresh
                .map_or(true, |last| last.elapsed() >= refresh_interval)
            {
                self.periodic_update()?;
                self.last_refresh = Some(Instant::now());
            }
            thread::sleep(poll_interval);
        }
    }

    /// Follow a run-state change. Starting reconfigures the scope first; if
    /// that fails the transition is retried on the next loop until the
    /// escalation threshold is reached.
    fn enter_state(&mut self, state: RunState) -> Result<(), PollError> {
        if state == self.last_state {
            return Ok(());
        }
        if state == RunState::Started {
            if let Err(e) =
                connector::configure_scope(&self.ctx.transport, self.ctx.config.byte_order)
            {
                self.configure_failures += 1;
                let threshold = self.ctx.config.escalation_threshold;
                if self.configure_failures >= threshold {
                    log::error!(
                        "Giving up after {} failed attempts to prepare the scope: {e}",
                        self.configure_failures
                    );
                    return Err(e.into());
                }
                log::warn!(
                    "Preparing the scope failed ({}/{threshold}): {e}",
                    self.configure_failures
                );
                return Ok(());
            }
            self.configure_failures = 0;
            self.ctx.control.request_resync();
        }
        self.last_state = state;
        Ok(())
    }

    /// Re-read every setting from scratch.
    pub fn resync(&mut self) -> Result<(), PollError> {
        log::debug!("Resynchronizing settings");
        self.settings.invalidate();

        let started = Instant::now();
        let reconciled = self.settings.reconcile(&self.ctx).map(|_| ());
        self.ledger.record(Stage::Reconcile, started.elapsed());
        tolerate(reconciled, "Settings reconcile")?;

        let refreshed = self
            .settings
            .refresh(&self.ctx, &mut self.calibration)
            .map(|_| ());
        tolerate(refreshed, "Settings refresh")?;
        tolerate(
            self.settings
                .refresh_calibration(&self.ctx, &mut self.calibration),
            "Calibration refresh",
        )
    }

    /// One trigger check, followed by a waveform acquisition if it saw an event.
    #[tracing::instrument(skip_all)]
    pub fn tick(&mut self) -> Result<TriggerOutcome, PollError> {
        #[cfg(feature = "cpu-profiling")]
        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }

        let outcome = self.monitor.tick(&self.ctx, &mut self.ledger)?;
        if outcome.is_event() {
            let report = self.acquirer.acquire(
                &self.ctx,
                self.monitor.epoch(),
                &self.calibration,
                &mut self.ledger,
            )?;
            log::trace!("{report:?}");
        }
        Ok(outcome)
    }

    /// The slow cadence: horizontal parameters, calibration and status.
    #[tracing::instrument(skip_all)]
    pub fn periodic_update(&mut self) -> Result<(), PollError> {
        let started = Instant::now();
        let refreshed = self
            .settings
            .refresh(&self.ctx, &mut self.calibration)
            .map(|_| ());
        self.ledger.record(Stage::Refresh, started.elapsed());
        tolerate(refreshed, "Settings refresh")?;

        let started = Instant::now();
        let calibrated = self
            .settings
            .refresh_calibration(&self.ctx, &mut self.calibration);
        self.ledger.record(Stage::Calibration, started.elapsed());
        tolerate(calibrated, "Calibration refresh")?;

        let started = Instant::now();
        let status = self.settings.refresh_status(&self.ctx);
        self.ledger.record(Stage::Status, started.elapsed());
        tolerate(status, "Status refresh")?;

        let store = &self.ctx.store;
        let epoch = self.monitor.epoch();
        store.publish(
            "scopeAcqCount",
            Value::Int(i64::try_from(epoch.acquisition_counter).unwrap_or(i64::MAX)),
            PublishMode::IfChanged,
            None,
        );
        store.publish(
            "lostTrigs",
            Value::Int(i64::try_from(epoch.lost_count).unwrap_or(i64::MAX)),
            PublishMode::IfChanged,
            None,
        );
        if let Some(state) = store.current_value("trigState") {
            if state.as_str().is_some_and(|s| s.contains("STOP")) {
                log::error!("Scope acquisition is stopped (trigger state {state})");
            }
        }
        store.publish(
            "timing",
            Value::Array(self.ledger.seconds()),
            PublishMode::Always,
            None,
        );
        Ok(())
    }
}
