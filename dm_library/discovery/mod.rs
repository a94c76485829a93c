//! Motor discovery
//!
//! Two workflows find motors on a bus:
//!
//! - [`passive_sniff`] listens for feedback that motors already emit
//! - [`active_probe`] asks each candidate `esc_id` for feedback with a
//!   disable plus zero-velocity pair, which never produces motion
//!
//! Sweeps run one at a time per service; [`SweepGuard`] enforces that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dm_core::error::{DmError, DmResult};

use crate::drivers::BusManager;
use crate::protocol;
use crate::telemetry::MotorLiveness;

const POLL_SLICE: Duration = Duration::from_millis(50);

/// Upper bound on the drain that follows the per-candidate probes
pub const PROBE_DRAIN_WINDOW: Duration = Duration::from_millis(200);

pub const DEFAULT_SNIFF_DURATION: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_DURATION: Duration = Duration::from_millis(100);

/// Dedupe key: the same `esc_id` may answer on more than one `mst_id`
fn record(seen: &mut HashMap<(u8, u16), MotorLiveness>, observation: MotorLiveness) {
    seen.entry((observation.esc_id, observation.mst_id))
        .and_modify(|kept| {
            if observation.last_seen > kept.last_seen {
                *kept = observation;
            }
        })
        .or_insert(observation);
}

fn observed(esc_id: u8, address: u32) -> MotorLiveness {
    MotorLiveness {
        esc_id,
        mst_id: address as u16,
        last_seen: Instant::now(),
    }
}

fn into_sorted(seen: HashMap<(u8, u16), MotorLiveness>) -> Vec<MotorLiveness> {
    let mut motors: Vec<MotorLiveness> = seen.into_values().collect();
    motors.sort_by_key(|m| (m.esc_id, m.mst_id));
    motors
}

/// One entry per `(esc_id, mst_id)` holding its most recent `last_seen`,
/// sorted by `esc_id` then `mst_id`
pub fn latest_per_motor<I>(observations: I) -> Vec<MotorLiveness>
where
    I: IntoIterator<Item = MotorLiveness>,
{
    let mut seen = HashMap::new();
    for observation in observations {
        record(&mut seen, observation);
    }
    into_sorted(seen)
}

/// Drain the bus for `duration`, returning one entry per `(esc_id, mst_id)`
pub fn passive_sniff(bus: &BusManager, duration: Duration) -> Vec<MotorLiveness> {
    let mut seen = HashMap::new();
    let deadline = Instant::now() + duration;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(frame) = bus.get_message(remaining.min(POLL_SLICE)) else {
            continue;
        };
        if frame.id == protocol::MANAGEMENT_ADDRESS {
            continue;
        }
        match protocol::decode_feedback(&frame.data) {
            Ok(feedback) => record(&mut seen, observed(feedback.esc_id, frame.id)),
            Err(e) => log::debug!("Ignoring frame 0x{:03X} during sniff: {}", frame.id, e),
        }
    }

    let motors = into_sorted(seen);
    log::info!(
        "Passive sniff on {} found {} motor(s)",
        bus.channel(),
        motors.len()
    );
    motors
}

fn probe_candidate(bus: &BusManager, esc_id: u8) -> DmResult<()> {
    let (address, payload) = protocol::encode_disable(esc_id);
    bus.send(address, &payload)?;
    let (address, payload) = protocol::encode_velocity(esc_id, 0.0)?;
    bus.send(address, &payload)
}

/// Probe `candidates` one after another
///
/// Frames from other motors that arrive while waiting are kept, so the
/// result can include motors that were not probed directly.
pub fn active_probe(
    bus: &BusManager,
    candidates: &[u8],
    probe_duration: Duration,
) -> DmResult<Vec<MotorLiveness>> {
    if !bus.is_open() {
        return Err(DmError::transport(format!(
            "Bus {} is not open",
            bus.channel()
        )));
    }

    let mut seen = HashMap::new();

    for &esc_id in candidates {
        if let Err(e) = probe_candidate(bus, esc_id) {
            log::warn!("Probe of ESC 0x{:02X} failed: {}", esc_id, e);
            continue;
        }

        let deadline = Instant::now() + probe_duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::debug!("No answer from ESC 0x{:02X}", esc_id);
                break;
            }
            let Some(frame) = bus.get_message(remaining.min(POLL_SLICE)) else {
                continue;
            };
            if frame.id == protocol::MANAGEMENT_ADDRESS {
                continue;
            }
            let Ok(feedback) = protocol::decode_feedback(&frame.data) else {
                continue;
            };
            // The payload only carries the low nibble of the candidate
            if feedback.esc_id == esc_id & 0x0F {
                record(&mut seen, observed(esc_id, frame.id));
                break;
            }
            record(&mut seen, observed(feedback.esc_id, frame.id));
        }
    }

    // Pick up late answers
    let drain_deadline = Instant::now() + PROBE_DRAIN_WINDOW.min(probe_duration);
    loop {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(frame) = bus.get_message(remaining.min(POLL_SLICE)) else {
            continue;
        };
        if frame.id == protocol::MANAGEMENT_ADDRESS {
            continue;
        }
        if let Ok(feedback) = protocol::decode_feedback(&frame.data) {
            record(&mut seen, observed(feedback.esc_id, frame.id));
        }
    }

    let motors = into_sorted(seen);
    log::info!(
        "Active probe of {} candidate(s) on {} found {} motor(s)",
        candidates.len(),
        bus.channel(),
        motors.len()
    );
    Ok(motors)
}

/// RAII claim on a single-flight flag
///
/// The flag is cleared when the guard drops, including during unwinding.
pub struct SweepGuard {
    flag: Arc<AtomicBool>,
}

impl SweepGuard {
    /// Claim `flag`, or `None` if another sweep holds it
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Run `work` only if no other holder of `flag` is active
pub fn single_flight<T, F>(flag: &Arc<AtomicBool>, work: F) -> Option<T>
where
    F: FnOnce() -> T,
{
    let _guard = SweepGuard::try_acquire(flag)?;
    Some(work())
}

/// Which discovery workflow a sweep runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepKind {
    Passive { duration: Duration },
    Active { candidates: Vec<u8>, probe_duration: Duration },
}

/// Runs discovery sweeps on worker threads, at most one at a time
pub struct DiscoveryService {
    bus: Arc<BusManager>,
    in_flight: Arc<AtomicBool>,
}

impl DiscoveryService {
    pub fn new(bus: Arc<BusManager>) -> Self {
        Self {
            bus,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start a sweep; `None` when one is already running
    pub fn spawn_sweep(&self, kind: SweepKind) -> Option<JoinHandle<DmResult<Vec<MotorLiveness>>>> {
        let guard = SweepGuard::try_acquire(&self.in_flight)?;
        let bus = Arc::clone(&self.bus);

        let spawned = thread::Builder::new()
            .name("dm-discovery".to_string())
            .spawn(move || {
                let _guard = guard;
                match kind {
                    SweepKind::Passive { duration } => Ok(passive_sniff(&bus, duration)),
                    SweepKind::Active {
                        candidates,
                        probe_duration,
                    } => active_probe(&bus, &candidates, probe_duration),
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to spawn discovery sweep: {}", e);
                None
            }
        }
    }
}
