//! Telemetry watchdog
//!
//! On every tick each known motor is checked against its most recent sign of
//! life (the later of its liveness and telemetry timestamps). A motor whose
//! age reaches the threshold is tripped and sent a disable frame. While it
//! stays tripped the disable is repeated at most once per cooldown. A motor
//! that reports again is cleared.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use dm_core::config::WatchdogConfig;
use dm_core::error::{DmError, DmResult};

use crate::drivers::BusManager;
use crate::protocol;
use crate::telemetry::{LivenessTable, TelemetryStore};

/// Per-motor watchdog state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogState {
    pub tripped: bool,
    pub last_disable: Option<Instant>,
}

/// Something the watchdog did during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Disable frame sent to a stale motor
    Disabled { esc_id: u8 },
    /// Motor is stale but still inside the cooldown
    Suppressed { esc_id: u8 },
    /// Disable could not be sent; retried next tick
    DisableFailed { esc_id: u8, error: String },
    /// Motor reported again after being tripped
    Recovered { esc_id: u8 },
}

pub struct Watchdog {
    config: WatchdogConfig,
    liveness: Arc<LivenessTable>,
    telemetry: Arc<TelemetryStore>,
    states: RwLock<HashMap<u8, WatchdogState>>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        liveness: Arc<LivenessTable>,
        telemetry: Arc<TelemetryStore>,
    ) -> DmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            liveness,
            telemetry,
            states: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    fn last_seen(&self, esc_id: u8) -> Option<Instant> {
        match (
            self.liveness.last_seen(esc_id),
            self.telemetry.last_update(esc_id),
        ) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn known_motors(&self) -> BTreeSet<u8> {
        self.liveness
            .esc_ids()
            .into_iter()
            .chain(self.telemetry.esc_ids())
            .collect()
    }

    pub fn tick(&self, bus: &BusManager) -> Vec<WatchdogEvent> {
        self.tick_at(bus, Instant::now())
    }

    /// Evaluate every known motor as of `now`
    pub fn tick_at(&self, bus: &BusManager, now: Instant) -> Vec<WatchdogEvent> {
        let threshold = self.config.threshold();
        let cooldown = self.config.cooldown();
        let mut events = Vec::new();

        for esc_id in self.known_motors() {
            let Some(last_seen) = self.last_seen(esc_id) else {
                continue;
            };
            let age = now.saturating_duration_since(last_seen);
            let previous = self.states.read().get(&esc_id).copied().unwrap_or_default();

            if age < threshold {
                if previous.tripped {
                    log::info!("ESC 0x{:02X} telemetry recovered", esc_id);
                    self.states.write().insert(esc_id, WatchdogState::default());
                    events.push(WatchdogEvent::Recovered { esc_id });
                }
                continue;
            }

            let due = previous
                .last_disable
                .map_or(true, |t| now.saturating_duration_since(t) >= cooldown);

            let next = if !due {
                events.push(WatchdogEvent::Suppressed { esc_id });
                WatchdogState {
                    tripped: true,
                    ..previous
                }
            } else {
                let (address, payload) = protocol::encode_disable(esc_id);
                match bus.send(address, &payload) {
                    Ok(()) => {
                        log::warn!(
                            "ESC 0x{:02X} telemetry stale for {:?}, disabled",
                            esc_id,
                            age
                        );
                        events.push(WatchdogEvent::Disabled { esc_id });
                        WatchdogState {
                            tripped: true,
                            last_disable: Some(now),
                        }
                    }
                    Err(e) => {
                        log::error!("Watchdog failed to disable ESC 0x{:02X}: {}", esc_id, e);
                        events.push(WatchdogEvent::DisableFailed {
                            esc_id,
                            error: e.to_string(),
                        });
                        WatchdogState {
                            tripped: true,
                            ..previous
                        }
                    }
                }
            };
            self.states.write().insert(esc_id, next);
        }

        events
    }

    pub fn state(&self, esc_id: u8) -> WatchdogState {
        self.states.read().get(&esc_id).copied().unwrap_or_default()
    }

    /// States of every motor the watchdog has evaluated, by `esc_id`
    pub fn snapshot(&self) -> Vec<(u8, WatchdogState)> {
        let mut all: Vec<(u8, WatchdogState)> =
            self.states.read().iter().map(|(k, v)| (*k, *v)).collect();
        all.sort_by_key(|(esc_id, _)| *esc_id);
        all
    }

    pub fn tripped(&self) -> Vec<u8> {
        self.snapshot()
            .into_iter()
            .filter(|(_, s)| s.tripped)
            .map(|(esc_id, _)| esc_id)
            .collect()
    }
}

/// Background thread ticking a [`Watchdog`] at its configured interval
pub struct WatchdogRunner {
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WatchdogRunner {
    pub fn spawn(watchdog: Arc<Watchdog>, bus: Arc<BusManager>) -> DmResult<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let interval = watchdog.config().interval();

        let worker = thread::Builder::new()
            .name("dm-watchdog".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let result =
                            panic::catch_unwind(AssertUnwindSafe(|| watchdog.tick(&bus)));
                        if result.is_err() {
                            log::error!("Watchdog tick panicked");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| DmError::Internal(format!("Failed to spawn watchdog: {}", e)))?;

        log::debug!("Watchdog started with interval {:?}", interval);
        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop ticking and join the thread; safe to call repeatedly
    pub fn stop(&self) {
        drop(self.stop_tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rejects_invalid_config() {
        let config = WatchdogConfig {
            threshold_ms: 500,
            cooldown_ms: 100,
            interval_ms: 100,
        };
        let result = Watchdog::new(
            config,
            Arc::new(LivenessTable::new()),
            Arc::new(TelemetryStore::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_motors_are_ignored() {
        let bus = BusManager::simulation("vcan0");
        bus.open().unwrap();
        let watchdog = Watchdog::new(
            WatchdogConfig::default(),
            Arc::new(LivenessTable::new()),
            Arc::new(TelemetryStore::new()),
        )
        .unwrap();
        assert!(watchdog.tick_at(&bus, Instant::now() + Duration::from_secs(10)).is_empty());
        assert!(watchdog.snapshot().is_empty());
    }
}
