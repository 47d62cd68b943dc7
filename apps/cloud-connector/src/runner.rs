//! Periodic polling of every device, dispatching readings through the
//! [`DataSender`].
//!
//! State machine: `Idle -> Running -> Stopping -> Idle`. Cycles run strictly
//! one after another on a single task; a cycle that overruns its period
//! delays the next one instead of overlapping it. Stopping cancels pending
//! ticks only: an in-flight cycle finishes before devices are closed.

use crate::device::Device;
use crate::error::ConnectorError;
use crate::sender::DataSender;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug)]
pub struct RunnerStats {
    pub running: AtomicBool,
    pub cycles_started: AtomicU64,
    pub cycles_completed: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub device_read_errors: AtomicU64,
    pub readings_dispatched: AtomicU64,
    pub last_cycle_micros: AtomicU64,
    pub last_cycle_unix_ms: AtomicU64,
    pub last_error: StdMutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub running: bool,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub device_read_errors: u64,
    pub readings_dispatched: u64,
    pub last_cycle_micros: u64,
    pub last_cycle_unix_ms: u64,
    pub last_error: Option<String>,
}

impl RunnerStats {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            cycles_started: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            device_read_errors: AtomicU64::new(0),
            readings_dispatched: AtomicU64::new(0),
            last_cycle_micros: AtomicU64::new(0),
            last_cycle_unix_ms: AtomicU64::new(0),
            last_error: StdMutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            device_read_errors: self.device_read_errors.load(Ordering::Relaxed),
            readings_dispatched: self.readings_dispatched.load(Ordering::Relaxed),
            last_cycle_micros: self.last_cycle_micros.load(Ordering::Relaxed),
            last_cycle_unix_ms: self.last_cycle_unix_ms.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for RunnerStats {
    fn default() -> Self {
        Self::new()
    }
}

struct Control {
    state: RunnerState,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    devices_closed: bool,
}

pub struct Runner {
    devices: Arc<Vec<Box<dyn Device>>>,
    sender: Arc<DataSender>,
    read_interval: Duration,
    stats: Arc<RunnerStats>,
    control: Mutex<Control>,
}

impl Runner {
    pub fn new(
        devices: Vec<Box<dyn Device>>,
        sender: Arc<DataSender>,
        read_interval: Duration,
    ) -> Self {
        Self {
            devices: Arc::new(devices),
            sender,
            read_interval,
            stats: Arc::new(RunnerStats::new()),
            control: Mutex::new(Control {
                state: RunnerState::Idle,
                cancel: None,
                task: None,
                devices_closed: false,
            }),
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        self.stats.clone()
    }

    pub async fn state(&self) -> RunnerState {
        self.control.lock().await.state
    }

    /// Schedules the first cycle immediately and then one every
    /// `read_interval`. With no devices the runner stays idle.
    pub async fn start(&self) -> RunnerState {
        let mut control = self.control.lock().await;
        if control.state != RunnerState::Idle {
            tracing::debug!(state = ?control.state, "scheduler already started");
            return control.state;
        }
        if self.devices.is_empty() {
            tracing::info!("no devices configured, scheduler not executing");
            return control.state;
        }
        if control.devices_closed {
            tracing::warn!("devices already closed, scheduler not executing");
            return control.state;
        }
        if self.read_interval.is_zero() {
            tracing::error!("read interval is zero, scheduler not executing");
            return control.state;
        }

        tracing::info!(
            devices = self.devices.len(),
            interval_ms = self.read_interval.as_millis() as u64,
            "starting runner to read devices"
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_schedule(
            self.devices.clone(),
            self.sender.clone(),
            self.stats.clone(),
            self.read_interval,
            cancel.clone(),
        ));
        control.cancel = Some(cancel);
        control.task = Some(task);
        control.state = RunnerState::Running;
        self.stats.running.store(true, Ordering::Relaxed);
        control.state
    }

    /// Cancels pending cycles, waits for an in-flight one, then closes every
    /// device once. Safe to call in any state and more than once.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut control = self.control.lock().await;
            match control.state {
                RunnerState::Stopping => {
                    tracing::debug!("scheduler already stopping");
                    return;
                }
                RunnerState::Running => {
                    control.state = RunnerState::Stopping;
                    (control.cancel.take(), control.task.take())
                }
                RunnerState::Idle => (None, None),
            }
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "scheduler task ended abnormally");
            }
        }

        let mut control = self.control.lock().await;
        if !control.devices_closed {
            control.devices_closed = true;
            close_devices(&self.devices).await;
        }
        control.state = RunnerState::Idle;
        self.stats.running.store(false, Ordering::Relaxed);
        tracing::info!("scheduler closed");
    }

    /// Runs one cycle on the caller's task, outside the schedule.
    pub async fn run_once(&self) {
        run_guarded_cycle(&self.devices, &self.sender, &self.stats).await;
    }
}

async fn run_schedule(
    devices: Arc<Vec<Box<dyn Device>>>,
    sender: Arc<DataSender>,
    stats: Arc<RunnerStats>,
    read_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(read_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A tick can fire in the same instant stop() cancels; that tick is
        // dropped rather than run.
        if cancel.is_cancelled() {
            tracing::debug!("stop requested as tick fired; skipping cycle");
            break;
        }
        run_guarded_cycle(&devices, &sender, &stats).await;
    }
    tracing::debug!("scheduler loop exited");
}

/// One cycle with every failure contained: errors and panics are logged and
/// counted, never propagated.
async fn run_guarded_cycle(devices: &[Box<dyn Device>], sender: &DataSender, stats: &RunnerStats) {
    let started = Instant::now();
    stats.cycles_started.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("starting new run");

    let outcome = AssertUnwindSafe(run_cycle(devices, sender, stats))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ConnectorError::Cycle(panic_message(panic.as_ref()))));

    match outcome {
        Ok(()) => {
            stats.cycles_completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::error!(error = %err, "unexpected error during run");
        }
    }

    let micros = started.elapsed().as_micros() as u64;
    stats.last_cycle_micros.store(micros, Ordering::Relaxed);
    stats
        .last_cycle_unix_ms
        .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    tracing::info!(elapsed_ms = micros as f64 / 1000.0, "run complete, waiting for next run");
}

async fn run_cycle(
    devices: &[Box<dyn Device>],
    sender: &DataSender,
    stats: &RunnerStats,
) -> Result<(), ConnectorError> {
    for device in devices {
        tracing::debug!(device = device.name(), "connecting to device");
        let reading = match device.get_data().await {
            Ok(reading) => reading,
            Err(err) => {
                stats.device_read_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(device = device.name(), error = %err, "unable to read input data");
                continue;
            }
        };
        sender.send(reading, device.name()).await?;
        stats.readings_dispatched.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

async fn close_devices(devices: &[Box<dyn Device>]) {
    tracing::info!("closing device connections");
    for device in devices {
        match AssertUnwindSafe(device.close()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(device = device.name(), error = %err, "failed to close device");
            }
            Err(panic) => {
                tracing::error!(
                    device = device.name(),
                    error = %panic_message(panic.as_ref()),
                    "device close panicked"
                );
            }
        }
    }
    tracing::info!("device connections closed");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}
