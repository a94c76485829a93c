//! Software periodic transmit tasks
//!
//! Each task owns one worker thread that re-sends the current payload at a
//! fixed rate. The payload can be swapped at any time without disturbing the
//! schedule.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use dm_core::error::{DmError, DmResult};

use super::{CanDriver, CanFrame};
use crate::protocol::Payload;

/// Snapshot of one periodic task for status display
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicTaskStatus {
    pub address: u32,
    pub payload: Payload,
    pub rate_hz: f64,
    pub updates: u64,
    pub stopped: bool,
}

pub(crate) struct PeriodicTask {
    address: u32,
    rate_hz: f64,
    payload: Mutex<Payload>,
    updates: AtomicU64,
    stopped: AtomicBool,
    wake: Mutex<()>,
    wake_cv: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Start a worker thread sending `payload` to `address` at `rate_hz`
    pub(crate) fn spawn(
        driver: Arc<CanDriver>,
        address: u32,
        payload: Payload,
        rate_hz: f64,
    ) -> DmResult<Arc<Self>> {
        let task = Arc::new(Self {
            address,
            rate_hz,
            payload: Mutex::new(payload),
            updates: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            worker: Mutex::new(None),
        });

        let worker_task = Arc::clone(&task);
        let handle = thread::Builder::new()
            .name(format!("dm-periodic-{:03x}", address))
            .spawn(move || worker_task.run(&driver))
            .map_err(|e| DmError::transport(format!("Failed to spawn periodic task: {}", e)))?;
        *task.worker.lock() = Some(handle);

        Ok(task)
    }

    fn run(&self, driver: &CanDriver) {
        let period = Duration::from_secs_f64(1.0 / self.rate_hz);
        let mut next = Instant::now();
        let mut failures: u64 = 0;

        loop {
            if self.is_stopped() {
                break;
            }

            let payload = *self.payload.lock();
            if let Err(e) = driver.write_frame(&CanFrame::new(self.address, &payload)) {
                failures += 1;
                if failures == 1 || failures % 100 == 0 {
                    log::warn!(
                        "Periodic send to 0x{:03X} failed ({} so far): {}",
                        self.address,
                        failures,
                        e
                    );
                }
            }

            next += period;
            let now = Instant::now();
            if next < now {
                next = now;
            }

            let mut guard = self.wake.lock();
            if self.is_stopped() {
                break;
            }
            self.wake_cv.wait_until(&mut guard, next);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn update(&self, payload: Payload) -> DmResult<()> {
        if self.is_stopped() {
            return Err(DmError::transport(format!(
                "Periodic task for 0x{:03X} is stopped",
                self.address
            )));
        }
        *self.payload.lock() = payload;
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the worker and join it; safe to call repeatedly
    pub(crate) fn stop(&self) {
        {
            let _guard = self.wake.lock();
            self.stopped.store(true, Ordering::SeqCst);
            self.wake_cv.notify_all();
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Periodic task for 0x{:03X} panicked", self.address);
            }
        }
    }

    pub(crate) fn status(&self) -> PeriodicTaskStatus {
        PeriodicTaskStatus {
            address: self.address,
            payload: *self.payload.lock(),
            rate_hz: self.rate_hz,
            updates: self.updates.load(Ordering::Relaxed),
            stopped: self.is_stopped(),
        }
    }
}

/// Owned handle to a periodic transmit task
///
/// Dropping the handle stops the task.
pub struct PeriodicHandle {
    task: Arc<PeriodicTask>,
}

impl PeriodicHandle {
    pub(crate) fn new(task: Arc<PeriodicTask>) -> Self {
        Self { task }
    }

    pub fn address(&self) -> u32 {
        self.task.address
    }

    pub fn rate_hz(&self) -> f64 {
        self.task.rate_hz
    }

    /// Replace the payload sent on the next tick
    pub fn update(&self, payload: Payload) -> DmResult<()> {
        self.task.update(payload)
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_stopped()
    }

    pub fn status(&self) -> PeriodicTaskStatus {
        self.task.status()
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.task.stop();
    }
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHandle")
            .field("address", &format_args!("0x{:03X}", self.task.address))
            .field("rate_hz", &self.task.rate_hz)
            .field("stopped", &self.task.is_stopped())
            .finish()
    }
}
