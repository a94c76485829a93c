//! Bus manager
//!
//! Owns one CAN driver and a reader thread. Every inbound frame that passes
//! the acceptance filters is queued for [`BusManager::get_message`] and fanned
//! out to registered listeners in arrival order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use dm_core::config::BusConfig;
use dm_core::driver::DriverStatus;
use dm_core::error::{DmError, DmResult};

use super::periodic::{PeriodicHandle, PeriodicTask, PeriodicTaskStatus};
use super::{CanDriver, CanDriverBackend, CanFrame};
use crate::protocol::{FilterRule, Payload};

const READ_POLL: Duration = Duration::from_millis(50);
const RX_QUEUE_CAPACITY: usize = 1024;

/// Callback invoked for every accepted inbound frame
pub type Listener = Arc<dyn Fn(&CanFrame) -> DmResult<()> + Send + Sync>;

/// Token returned by [`BusManager::register_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Arc<Mutex<Vec<(ListenerId, Listener)>>>;

/// Shared handle to one CAN channel
pub struct BusManager {
    channel: String,
    driver: Arc<CanDriver>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    rx_tx: Sender<CanFrame>,
    rx: Receiver<CanFrame>,
    listeners: ListenerList,
    next_listener: AtomicU64,
    filters: Arc<RwLock<Vec<FilterRule>>>,
    periodic: Mutex<Vec<Arc<PeriodicTask>>>,
}

impl BusManager {
    pub fn new(channel: impl Into<String>, driver: CanDriver) -> Self {
        let (rx_tx, rx) = channel::bounded(RX_QUEUE_CAPACITY);
        Self {
            channel: channel.into(),
            driver: Arc::new(driver),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            rx_tx,
            rx,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            filters: Arc::new(RwLock::new(Vec::new())),
            periodic: Mutex::new(Vec::new()),
        }
    }

    /// Manager over a fresh simulated bus
    pub fn simulation(channel: impl Into<String>) -> Self {
        Self::new(channel, CanDriver::simulation())
    }

    /// Manager for a configured bus; not opened yet
    pub fn from_config(config: &BusConfig) -> DmResult<Self> {
        let backend = CanDriverBackend::from_kind(config.backend)?;
        let driver = CanDriver::new(backend, &config.channel)?;
        Ok(Self::new(config.channel.clone(), driver))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn driver(&self) -> &CanDriver {
        &self.driver
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DriverStatus {
        self.driver.status()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the backend and start the reader; no-op when already open
    pub fn open(&self) -> DmResult<()> {
        let mut reader = self.reader.lock();
        if self.is_open() {
            return Ok(());
        }

        self.driver.open().map_err(|e| match e {
            DmError::Transport(_) => e,
            other => DmError::transport(format!("Failed to open {}: {}", self.channel, other)),
        })?;

        let filters = self.filters.read().clone();
        if !filters.is_empty() {
            if let Err(e) = self.driver.set_filters(&filters) {
                log::warn!("Backend rejected filters on {}: {}", self.channel, e);
            }
        }

        self.running.store(true, Ordering::SeqCst);

        let driver = Arc::clone(&self.driver);
        let running = Arc::clone(&self.running);
        let listeners = Arc::clone(&self.listeners);
        let filters = Arc::clone(&self.filters);
        let queue_tx = self.rx_tx.clone();
        let queue_rx = self.rx.clone();
        let channel_name = self.channel.clone();

        let spawned = thread::Builder::new()
            .name(format!("dm-bus-{}", self.channel))
            .spawn(move || {
                reader_loop(
                    &channel_name,
                    &driver,
                    &running,
                    &listeners,
                    &filters,
                    &queue_tx,
                    &queue_rx,
                )
            });

        match spawned {
            Ok(handle) => {
                *reader = Some(handle);
                log::info!("Opened CAN bus {}", self.channel);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = self.driver.close();
                Err(DmError::transport(format!(
                    "Failed to spawn reader for {}: {}",
                    self.channel, e
                )))
            }
        }
    }

    /// Stop periodic tasks and the reader, drop listeners and release the backend
    pub fn close(&self) -> DmResult<()> {
        let mut reader = self.reader.lock();
        if !self.is_open() && reader.is_none() {
            return Ok(());
        }

        let tasks: Vec<Arc<PeriodicTask>> = self.periodic.lock().drain(..).collect();
        for task in &tasks {
            task.stop();
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = reader.take() {
            if handle.join().is_err() {
                log::error!("Reader thread for {} panicked", self.channel);
            }
        }

        self.listeners.lock().clear();
        while self.rx.try_recv().is_ok() {}

        self.driver.close()?;
        log::info!("Closed CAN bus {}", self.channel);
        Ok(())
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Send one frame
    pub fn send(&self, address: u32, payload: &[u8]) -> DmResult<()> {
        if !self.is_open() {
            return Err(DmError::transport(format!("Bus {} is not open", self.channel)));
        }
        self.driver.write_frame(&CanFrame::new(address, payload))
    }

    /// Start re-sending `payload` to `address` at `rate_hz`
    pub fn send_periodic(
        &self,
        address: u32,
        payload: Payload,
        rate_hz: f64,
    ) -> DmResult<PeriodicHandle> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(DmError::invalid_input(format!(
                "Periodic rate must be a positive finite number, got {}",
                rate_hz
            )));
        }
        if !self.is_open() {
            return Err(DmError::transport(format!("Bus {} is not open", self.channel)));
        }
        if !self.driver.supports_periodic() {
            return Err(DmError::transport(format!(
                "Backend for {} does not support periodic sends",
                self.channel
            )));
        }

        let task = PeriodicTask::spawn(Arc::clone(&self.driver), address, payload, rate_hz)?;
        {
            let mut tasks = self.periodic.lock();
            tasks.retain(|t| !t.is_stopped());
            tasks.push(Arc::clone(&task));
        }
        log::debug!(
            "Started periodic send to 0x{:03X} at {:.1} Hz on {}",
            address,
            rate_hz,
            self.channel
        );
        Ok(PeriodicHandle::new(task))
    }

    /// Snapshot of periodic tasks created through this manager
    pub fn periodic_tasks(&self) -> Vec<PeriodicTaskStatus> {
        self.periodic.lock().iter().map(|t| t.status()).collect()
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Wait up to `timeout` for the next accepted frame
    pub fn get_message(&self, timeout: Duration) -> Option<CanFrame> {
        if !self.is_open() {
            return None;
        }
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn register_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&CanFrame) -> DmResult<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not registered
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Replace the acceptance filters; an empty set accepts everything
    ///
    /// On an open bus the backend has to accept the rules first. A rejected
    /// set leaves the previous filters in force.
    pub fn set_filters(&self, rules: Vec<FilterRule>) -> DmResult<()> {
        if self.is_open() {
            self.driver.set_filters(&rules)?;
        }
        *self.filters.write() = rules;
        Ok(())
    }

    pub fn filters(&self) -> Vec<FilterRule> {
        self.filters.read().clone()
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Error closing {} on drop: {}", self.channel, e);
        }
    }
}

fn accepted(filters: &[FilterRule], frame: &CanFrame) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(frame.id, frame.extended))
}

#[allow(clippy::too_many_arguments)]
fn reader_loop(
    channel: &str,
    driver: &CanDriver,
    running: &AtomicBool,
    listeners: &Mutex<Vec<(ListenerId, Listener)>>,
    filters: &RwLock<Vec<FilterRule>>,
    queue_tx: &Sender<CanFrame>,
    queue_rx: &Receiver<CanFrame>,
) {
    log::debug!("Reader thread for {} started", channel);

    while running.load(Ordering::SeqCst) {
        let frame = match driver.read_frame(READ_POLL) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("Read error on {}: {}", channel, e);
                thread::sleep(READ_POLL);
                continue;
            }
        };

        if !accepted(&filters.read(), &frame) {
            continue;
        }

        // Drop the oldest frame when nobody is draining the queue
        if let Err(TrySendError::Full(frame)) = queue_tx.try_send(frame.clone()) {
            let _ = queue_rx.try_recv();
            let _ = queue_tx.try_send(frame);
        }

        let snapshot: Vec<(ListenerId, Listener)> = listeners.lock().clone();
        for (id, callback) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Listener {:?} on {} failed: {}", id, channel, e),
                Err(_) => log::error!("Listener {:?} on {} panicked", id, channel),
            }
        }
    }

    log::debug!("Reader thread for {} stopped", channel);
}
