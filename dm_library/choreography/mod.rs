//! Open-loop sine choreography
//!
//! Motor `i` of `n` follows `v(t) = A · sin(2π·f·t + φ(mode, i, n))` in
//! velocity mode. The preferred path hands each motor to a periodic transmit
//! task and re-computes the payloads at 20 Hz. If the backend cannot
//! schedule periodic sends the scheduler falls back to a single loop issuing
//! one-shot sends at the same cadence.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use dm_core::error::{DmError, DmResult};

use crate::drivers::{BusManager, PeriodicHandle};
use crate::protocol;

/// Setpoint recompute period
pub const RECOMPUTE_INTERVAL: Duration = Duration::from_millis(50);

/// Lowest periodic transmit rate
pub const MIN_PERIODIC_RATE_HZ: f64 = 20.0;

/// Phase relationship across the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Waveform {
    /// Phases spread evenly around the circle
    #[default]
    Sine,
    /// Odd motors run half a cycle behind
    Antiphase,
    /// Each motor a quarter cycle behind the previous one
    Figure8,
}

impl Waveform {
    /// Phase offset of motor `index` in a group of `count`
    pub fn phase_offset(self, index: usize, count: usize) -> f64 {
        if count <= 1 {
            return 0.0;
        }
        match self {
            Self::Sine => 2.0 * PI * index as f64 / count as f64,
            Self::Antiphase => {
                if index % 2 == 1 {
                    PI
                } else {
                    0.0
                }
            }
            Self::Figure8 => index as f64 * PI / 2.0,
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sine => write!(f, "sine"),
            Self::Antiphase => write!(f, "antiphase"),
            Self::Figure8 => write!(f, "figure8"),
        }
    }
}

impl FromStr for Waveform {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sine" => Ok(Self::Sine),
            "antiphase" => Ok(Self::Antiphase),
            "figure8" | "figure-8" => Ok(Self::Figure8),
            other => Err(DmError::invalid_input(format!(
                "unknown waveform '{}' (expected sine, antiphase or figure8)",
                other
            ))),
        }
    }
}

/// How the active run reaches the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPath {
    Periodic,
    Fallback,
}

/// Velocity of one motor at `elapsed` seconds
pub fn velocity_at(amplitude: f64, frequency_hz: f64, elapsed: f64, offset: f64) -> f64 {
    amplitude * (2.0 * PI * frequency_hz * elapsed + offset).sin()
}

/// Periodic transmit rate for a given waveform frequency
pub fn periodic_rate(frequency_hz: f64) -> f64 {
    (16.0 * frequency_hz).max(MIN_PERIODIC_RATE_HZ)
}

#[derive(Debug, Clone)]
struct Plan {
    motors: Vec<u8>,
    amplitude: f64,
    frequency_hz: f64,
    mode: Waveform,
}

impl Plan {
    fn velocities(&self, elapsed: f64) -> impl Iterator<Item = (u8, f64)> + '_ {
        let count = self.motors.len();
        self.motors.iter().enumerate().map(move |(i, &esc_id)| {
            let offset = self.mode.phase_offset(i, count);
            (
                esc_id,
                velocity_at(self.amplitude, self.frequency_hz, elapsed, offset),
            )
        })
    }
}

struct ActiveRun {
    plan: Plan,
    path: RunPath,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
    handles: Arc<Vec<PeriodicHandle>>,
    failed: Arc<AtomicBool>,
}

/// Drives one sine choreography at a time on a bus
pub struct Choreographer {
    bus: Arc<BusManager>,
    /// Serializes `start` and `stop` so runs never overlap
    lifecycle: Mutex<()>,
    active: Mutex<Option<ActiveRun>>,
}

impl Choreographer {
    pub fn new(bus: Arc<BusManager>) -> Self {
        Self {
            bus,
            lifecycle: Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    /// Start a run, stopping any current one without disabling
    pub fn start(
        &self,
        motors: &[u8],
        amplitude: f64,
        frequency_hz: f64,
        mode: Waveform,
    ) -> DmResult<RunPath> {
        if motors.is_empty() {
            return Err(DmError::invalid_input("choreography needs at least one motor"));
        }
        if !amplitude.is_finite() {
            return Err(DmError::invalid_input(format!(
                "amplitude must be finite, got {}",
                amplitude
            )));
        }
        if !frequency_hz.is_finite() || frequency_hz < 0.0 {
            return Err(DmError::invalid_input(format!(
                "frequency must be finite and non-negative, got {}",
                frequency_hz
            )));
        }

        let _lifecycle = self.lifecycle.lock();
        if let Err(e) = self.stop_active(false) {
            log::warn!("Error stopping previous choreography: {}", e);
        }

        let plan = Plan {
            motors: motors.to_vec(),
            amplitude,
            frequency_hz,
            mode,
        };

        let run = match self.start_periodic(&plan)? {
            Some(handles) => self.spawn_recompute(plan, handles)?,
            None => self.spawn_fallback(plan)?,
        };
        let path = run.path;
        log::info!(
            "Choreography '{}' started on {} motor(s) via {:?} path",
            run.plan.mode,
            run.plan.motors.len(),
            path
        );
        *self.active.lock() = Some(run);
        Ok(path)
    }

    /// One periodic task per motor, or `None` to fall back
    fn start_periodic(&self, plan: &Plan) -> DmResult<Option<Vec<PeriodicHandle>>> {
        let rate = periodic_rate(plan.frequency_hz);
        let mut handles = Vec::with_capacity(plan.motors.len());

        for (esc_id, velocity) in plan.velocities(0.0) {
            let (address, payload) = protocol::encode_velocity(esc_id, velocity)?;
            match self.bus.send_periodic(address, payload, rate) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    log::warn!(
                        "Periodic send unavailable for ESC 0x{:02X} ({}), using fallback loop",
                        esc_id,
                        e
                    );
                    for handle in &handles {
                        handle.stop();
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(handles))
    }

    fn spawn_recompute(&self, plan: Plan, handles: Vec<PeriodicHandle>) -> DmResult<ActiveRun> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handles = Arc::new(handles);
        let failed = Arc::new(AtomicBool::new(false));

        let worker_plan = plan.clone();
        let worker_handles = Arc::clone(&handles);
        let worker = thread::Builder::new()
            .name("dm-choreography".to_string())
            .spawn(move || recompute_loop(&worker_plan, &worker_handles, &stop_rx))
            .map_err(|e| {
                for handle in handles.iter() {
                    handle.stop();
                }
                DmError::Internal(format!("Failed to spawn choreography loop: {}", e))
            })?;

        Ok(ActiveRun {
            plan,
            path: RunPath::Periodic,
            stop_tx,
            worker: Some(worker),
            handles,
            failed,
        })
    }

    fn spawn_fallback(&self, plan: Plan) -> DmResult<ActiveRun> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let failed = Arc::new(AtomicBool::new(false));

        let bus = Arc::clone(&self.bus);
        let worker_plan = plan.clone();
        let worker_failed = Arc::clone(&failed);
        let worker = thread::Builder::new()
            .name("dm-choreography".to_string())
            .spawn(move || fallback_loop(&bus, &worker_plan, &stop_rx, &worker_failed))
            .map_err(|e| DmError::Internal(format!("Failed to spawn choreography loop: {}", e)))?;

        Ok(ActiveRun {
            plan,
            path: RunPath::Fallback,
            stop_tx,
            worker: Some(worker),
            handles: Arc::new(Vec::new()),
            failed,
        })
    }

    /// Stop the run, then disable every motor (`disable`) or command zero velocity
    ///
    /// Every motor is attempted; the first failure is returned.
    pub fn stop(&self, disable: bool) -> DmResult<()> {
        let _lifecycle = self.lifecycle.lock();
        self.stop_active(disable)
    }

    fn stop_active(&self, disable: bool) -> DmResult<()> {
        let Some(mut run) = self.active.lock().take() else {
            return Ok(());
        };

        let _ = run.stop_tx.try_send(());
        if let Some(worker) = run.worker.take() {
            if worker.join().is_err() {
                log::error!("Choreography loop panicked");
            }
        }
        for handle in run.handles.iter() {
            handle.stop();
        }

        let mut first_error = None;
        for &esc_id in &run.plan.motors {
            let result = if disable {
                let (address, payload) = protocol::encode_disable(esc_id);
                self.bus.send(address, &payload)
            } else {
                protocol::encode_velocity(esc_id, 0.0)
                    .and_then(|(address, payload)| self.bus.send(address, &payload))
            };
            if let Err(e) = result {
                log::warn!("Failed to stop ESC 0x{:02X}: {}", esc_id, e);
                first_error.get_or_insert(e);
            }
        }

        log::info!(
            "Choreography stopped ({})",
            if disable { "disabled" } else { "zero velocity" }
        );
        first_error.map_or(Ok(()), Err)
    }

    /// True while a run is active and its loop has not failed
    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map_or(false, |run| !run.failed.load(Ordering::SeqCst))
    }

    pub fn mode(&self) -> Option<Waveform> {
        self.active.lock().as_ref().map(|run| run.plan.mode)
    }

    pub fn run_path(&self) -> Option<RunPath> {
        self.active.lock().as_ref().map(|run| run.path)
    }

    pub fn motors(&self) -> Vec<u8> {
        self.active
            .lock()
            .as_ref()
            .map(|run| run.plan.motors.clone())
            .unwrap_or_default()
    }
}

impl Drop for Choreographer {
    fn drop(&mut self) {
        if let Err(e) = self.stop(true) {
            log::warn!("Error stopping choreography on drop: {}", e);
        }
    }
}

fn recompute_loop(plan: &Plan, handles: &[PeriodicHandle], stop_rx: &Receiver<()>) {
    let started = Instant::now();
    loop {
        match stop_rx.recv_timeout(RECOMPUTE_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let elapsed = started.elapsed().as_secs_f64();
        for ((esc_id, velocity), handle) in plan.velocities(elapsed).zip(handles) {
            let result = protocol::encode_velocity(esc_id, velocity)
                .and_then(|(_, payload)| handle.update(payload));
            if let Err(e) = result {
                log::warn!("Failed to update setpoint for ESC 0x{:02X}: {}", esc_id, e);
            }
        }
    }
}

fn fallback_loop(bus: &BusManager, plan: &Plan, stop_rx: &Receiver<()>, failed: &AtomicBool) {
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed().as_secs_f64();
        for (esc_id, velocity) in plan.velocities(elapsed) {
            let result = protocol::encode_velocity(esc_id, velocity)
                .and_then(|(address, payload)| bus.send(address, &payload));
            if let Err(e) = result {
                log::error!(
                    "Choreography send to ESC 0x{:02X} failed, disabling group: {}",
                    esc_id,
                    e
                );
                failed.store(true, Ordering::SeqCst);
                for &esc_id in &plan.motors {
                    let (address, payload) = protocol::encode_disable(esc_id);
                    if let Err(e) = bus.send(address, &payload) {
                        log::error!("Failed to disable ESC 0x{:02X}: {}", esc_id, e);
                    }
                }
                return;
            }
        }

        match stop_rx.recv_timeout(RECOMPUTE_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
