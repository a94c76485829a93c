//! Telemetry ingest
//!
//! [`TelemetryIngest`] is a bus listener. Each feedback frame is decoded,
//! scaled into engineering units with the motor's limits and published to
//! the liveness table, the telemetry store and any attached sinks.
//!
//! The feedback payload only carries the low nibble of the `esc_id`, so a
//! frame is attributed through its arbitration id (the motor's `mst_id`)
//! first. The nibble is the fallback for feedback ids nobody registered.
//!
//! Both stores replace whole records under a short write lock, so readers on
//! other threads always see a complete value.

pub mod csv;

pub use self::csv::{CsvTelemetrySink, TelemetryCsvWriter, TelemetryRow, CSV_HEADERS};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use dm_core::config::{AppConfig, ScaleLimits};
use dm_core::error::DmResult;

use crate::drivers::{BusManager, CanFrame, ListenerId};
use crate::protocol::{self, FeedbackEngineering, MANAGEMENT_ADDRESS};

/// Last observation of one motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorLiveness {
    pub esc_id: u8,
    pub mst_id: u16,
    pub last_seen: Instant,
}

/// One decoded feedback frame in engineering units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub engineering: FeedbackEngineering,
    pub mst_id: u16,
    /// Monotonic receive time
    pub timestamp: Instant,
    /// Wall-clock receive time in seconds since the Unix epoch
    pub unix_time: f64,
}

/// Consumer of telemetry samples (CSV logger, UI models)
pub trait TelemetrySink: Send + Sync {
    fn record(&self, sample: &TelemetrySample) -> DmResult<()>;
}

/// Seconds since the Unix epoch
pub fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Latest liveness record per `esc_id`
#[derive(Debug, Default)]
pub struct LivenessTable {
    entries: RwLock<HashMap<u8, MotorLiveness>>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, liveness: MotorLiveness) {
        self.entries.write().insert(liveness.esc_id, liveness);
    }

    pub fn get(&self, esc_id: u8) -> Option<MotorLiveness> {
        self.entries.read().get(&esc_id).copied()
    }

    pub fn last_seen(&self, esc_id: u8) -> Option<Instant> {
        self.get(esc_id).map(|l| l.last_seen)
    }

    pub fn esc_ids(&self) -> Vec<u8> {
        self.entries.read().keys().copied().collect()
    }

    /// All records ordered by `esc_id`
    pub fn snapshot(&self) -> Vec<MotorLiveness> {
        let mut all: Vec<MotorLiveness> = self.entries.read().values().copied().collect();
        all.sort_by_key(|l| l.esc_id);
        all
    }

    pub fn remove(&self, esc_id: u8) -> Option<MotorLiveness> {
        self.entries.write().remove(&esc_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Latest telemetry sample per `esc_id`
#[derive(Debug, Default)]
pub struct TelemetryStore {
    samples: RwLock<HashMap<u8, TelemetrySample>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: TelemetrySample) {
        self.samples
            .write()
            .insert(sample.engineering.esc_id, sample);
    }

    pub fn latest(&self, esc_id: u8) -> Option<TelemetrySample> {
        self.samples.read().get(&esc_id).copied()
    }

    pub fn last_update(&self, esc_id: u8) -> Option<Instant> {
        self.latest(esc_id).map(|s| s.timestamp)
    }

    pub fn esc_ids(&self) -> Vec<u8> {
        self.samples.read().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        let mut all: Vec<TelemetrySample> = self.samples.read().values().copied().collect();
        all.sort_by_key(|s| s.engineering.esc_id);
        all
    }
}

/// Decodes feedback frames and fans them out to stores and sinks
pub struct TelemetryIngest {
    liveness: Arc<LivenessTable>,
    telemetry: Arc<TelemetryStore>,
    limits: RwLock<HashMap<u8, ScaleLimits>>,
    /// `mst_id` -> `esc_id`
    routes: RwLock<HashMap<u16, u8>>,
    sinks: RwLock<Vec<Arc<dyn TelemetrySink>>>,
}

impl TelemetryIngest {
    pub fn new(liveness: Arc<LivenessTable>, telemetry: Arc<TelemetryStore>) -> Self {
        Self {
            liveness,
            telemetry,
            limits: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Ingest with fresh stores and scale limits taken from `config`
    pub fn from_config(config: &AppConfig) -> Self {
        let ingest = Self::new(
            Arc::new(LivenessTable::new()),
            Arc::new(TelemetryStore::new()),
        );
        for motor in &config.motors {
            ingest.register_motor(motor.esc_id, motor.mst_id);
            ingest.set_scale_limits(motor.esc_id, motor.scale_limits());
        }
        ingest
    }

    pub fn liveness(&self) -> &Arc<LivenessTable> {
        &self.liveness
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    /// Attribute feedback arriving on `mst_id` to `esc_id`
    pub fn register_motor(&self, esc_id: u8, mst_id: u16) {
        if let Some(previous) = self.routes.write().insert(mst_id, esc_id) {
            if previous != esc_id {
                log::warn!(
                    "Feedback id 0x{:03X} moved from ESC 0x{:02X} to 0x{:02X}",
                    mst_id,
                    previous,
                    esc_id
                );
            }
        }
    }

    /// The `esc_id` a frame on `mst_id` belongs to, if registered
    pub fn route(&self, mst_id: u16) -> Option<u8> {
        self.routes.read().get(&mst_id).copied()
    }

    pub fn set_scale_limits(&self, esc_id: u8, limits: ScaleLimits) {
        self.limits.write().insert(esc_id, limits);
    }

    pub fn scale_limits(&self, esc_id: u8) -> ScaleLimits {
        self.limits.read().get(&esc_id).copied().unwrap_or_default()
    }

    pub fn add_sink(&self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.write().push(sink);
    }

    /// Process one inbound frame received at `now`
    pub fn ingest_at(&self, frame: &CanFrame, now: Instant) -> DmResult<Option<TelemetrySample>> {
        if frame.id == MANAGEMENT_ADDRESS {
            return Ok(None);
        }
        let raw = match protocol::decode_feedback(&frame.data) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!("Skipping frame 0x{:03X}: {}", frame.id, e);
                return Ok(None);
            }
        };

        let mst_id = frame.id as u16;
        let esc_id = self.route(mst_id).unwrap_or(raw.esc_id);
        let mut engineering = raw.to_engineering(self.scale_limits(esc_id));
        engineering.esc_id = esc_id;
        let sample = TelemetrySample {
            engineering,
            mst_id,
            timestamp: now,
            unix_time: unix_time_now(),
        };

        self.liveness.observe(MotorLiveness {
            esc_id,
            mst_id,
            last_seen: now,
        });
        self.telemetry.record(sample);

        let sinks = self.sinks.read().clone();
        for sink in sinks {
            if let Err(e) = sink.record(&sample) {
                log::warn!("Telemetry sink failed for ESC 0x{:02X}: {}", esc_id, e);
            }
        }
        Ok(Some(sample))
    }

    pub fn ingest(&self, frame: &CanFrame) -> DmResult<Option<TelemetrySample>> {
        self.ingest_at(frame, Instant::now())
    }

    /// Register this ingest as a listener on `bus`
    pub fn attach(self: &Arc<Self>, bus: &BusManager) -> ListenerId {
        let ingest = Arc::clone(self);
        bus.register_listener(move |frame| ingest.ingest(frame).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_feedback, FeedbackRaw};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn feedback(esc_id: u8, velocity_raw: i16) -> Vec<u8> {
        encode_feedback(&FeedbackRaw {
            esc_id,
            status: 1,
            position_raw: 0,
            velocity_raw,
            torque_raw: 0,
            temp_mos: 40,
            temp_rotor: 41,
        })
        .to_vec()
    }

    struct Collect(Mutex<Vec<TelemetrySample>>);

    impl TelemetrySink for Collect {
        fn record(&self, sample: &TelemetrySample) -> DmResult<()> {
            self.0.lock().push(*sample);
            Ok(())
        }
    }

    #[test]
    fn test_ingest_updates_stores_and_sinks() {
        let ingest = TelemetryIngest::new(
            Arc::new(LivenessTable::new()),
            Arc::new(TelemetryStore::new()),
        );
        ingest.set_scale_limits(
            2,
            ScaleLimits {
                p_max: 12.5,
                v_max: 45.0,
                t_max: 18.0,
            },
        );
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        ingest.add_sink(sink.clone());

        let now = Instant::now();
        let frame = CanFrame::new(0x12, &feedback(2, 2047));
        let sample = ingest.ingest_at(&frame, now).unwrap().unwrap();

        assert_eq!(sample.mst_id, 0x12);
        assert!((sample.engineering.velocity_rad_s - 45.0).abs() < 1e-9);
        assert_eq!(ingest.liveness().last_seen(2), Some(now));
        assert_eq!(ingest.liveness().get(2).unwrap().mst_id, 0x12);
        assert_eq!(ingest.telemetry().last_update(2), Some(now));
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn test_feedback_is_attributed_by_mst_id() {
        let mut config = AppConfig::default();
        config.upsert_motor(0x11, 0x21).set_scale_limits(ScaleLimits {
            p_max: 12.5,
            v_max: 45.0,
            t_max: 18.0,
        });
        config.upsert_motor(0x01, 0x22);
        let ingest = TelemetryIngest::from_config(&config);

        // ESC 0x11 reports the nibble 0x1 on its own feedback id
        let now = Instant::now();
        let frame = CanFrame::new(0x21, &feedback(0x11, 2047));
        let sample = ingest.ingest_at(&frame, now).unwrap().unwrap();

        assert_eq!(sample.engineering.esc_id, 0x11);
        assert!((sample.engineering.velocity_rad_s - 45.0).abs() < 1e-9);
        assert_eq!(ingest.liveness().get(0x11).unwrap().mst_id, 0x21);
        assert_eq!(ingest.telemetry().last_update(0x11), Some(now));
        assert!(ingest.liveness().get(0x01).is_none());

        // Unregistered feedback ids fall back to the payload nibble
        ingest.ingest_at(&CanFrame::new(0x35, &feedback(5, 0)), now).unwrap();
        assert_eq!(ingest.liveness().get(5).unwrap().mst_id, 0x35);
    }

    #[test]
    fn test_ingest_skips_malformed_and_management_frames() {
        let ingest = TelemetryIngest::new(
            Arc::new(LivenessTable::new()),
            Arc::new(TelemetryStore::new()),
        );
        assert!(ingest.ingest(&CanFrame::new(0x12, &[1, 2, 3])).unwrap().is_none());
        assert!(ingest
            .ingest(&CanFrame::new(MANAGEMENT_ADDRESS, &[0; 8]))
            .unwrap()
            .is_none());
        assert!(ingest.liveness().is_empty());
    }

    #[test]
    fn test_liveness_keeps_latest_record() {
        let table = LivenessTable::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        table.observe(MotorLiveness { esc_id: 1, mst_id: 0x11, last_seen: t0 });
        table.observe(MotorLiveness { esc_id: 1, mst_id: 0x11, last_seen: t1 });
        table.observe(MotorLiveness { esc_id: 3, mst_id: 0x13, last_seen: t0 });

        assert_eq!(table.len(), 2);
        assert_eq!(table.last_seen(1), Some(t1));
        let ids: Vec<u8> = table.snapshot().iter().map(|l| l.esc_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(table.remove(3).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_scale_limits_fall_back_to_defaults() {
        let mut config = AppConfig::default();
        config.upsert_motor(1, 0x11);
        let ingest = TelemetryIngest::from_config(&config);
        assert_eq!(ingest.scale_limits(1), ScaleLimits::default());
        assert_eq!(ingest.scale_limits(9), ScaleLimits::default());
    }
}
