// Watchdog state machine and runner
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dm_core::config::{AppConfig, WatchdogConfig};
use dm_library::protocol::{self, FeedbackEngineering};
use dm_library::telemetry::{
    LivenessTable, MotorLiveness, TelemetryIngest, TelemetrySample, TelemetryStore,
};
use dm_library::watchdog::{Watchdog, WatchdogEvent, WatchdogRunner, WatchdogState};
use dm_library::BusManager;

struct Fixture {
    bus: Arc<BusManager>,
    liveness: Arc<LivenessTable>,
    telemetry: Arc<TelemetryStore>,
    watchdog: Arc<Watchdog>,
}

fn fixture(threshold_ms: u64, cooldown_ms: u64, interval_ms: u64) -> Fixture {
    let bus = Arc::new(BusManager::simulation("vcan0"));
    bus.open().unwrap();
    let liveness = Arc::new(LivenessTable::new());
    let telemetry = Arc::new(TelemetryStore::new());
    let config = WatchdogConfig::new(
        Duration::from_millis(threshold_ms),
        Duration::from_millis(cooldown_ms),
        Duration::from_millis(interval_ms),
    )
    .unwrap();
    let watchdog = Arc::new(
        Watchdog::new(config, Arc::clone(&liveness), Arc::clone(&telemetry)).unwrap(),
    );
    Fixture {
        bus,
        liveness,
        telemetry,
        watchdog,
    }
}

fn seen(liveness: &LivenessTable, esc_id: u8, at: Instant) {
    liveness.observe(MotorLiveness {
        esc_id,
        mst_id: 0x10 + esc_id as u16,
        last_seen: at,
    });
}

fn sample(esc_id: u8, at: Instant) -> TelemetrySample {
    TelemetrySample {
        engineering: FeedbackEngineering {
            esc_id,
            status: 1,
            position_rad: 0.0,
            velocity_rad_s: 0.0,
            torque_nm: 0.0,
            temp_mos_c: 40.0,
            temp_rotor_c: 41.0,
        },
        mst_id: 0x10 + esc_id as u16,
        timestamp: at,
        unix_time: 0.0,
    }
}

fn disables_to(bus: &BusManager, esc_id: u8) -> usize {
    bus.driver()
        .as_simulation()
        .unwrap()
        .sent_frames()
        .iter()
        .filter(|f| f.id == esc_id as u32 && protocol::is_disable_payload(&f.data))
        .count()
}

#[test]
fn test_trip_cooldown_and_recovery() {
    let f = fixture(100, 1000, 100);
    let t0 = Instant::now();
    let ms = |n: u64| t0 + Duration::from_millis(n);
    seen(&f.liveness, 1, t0);

    assert!(f.watchdog.tick_at(&f.bus, ms(50)).is_empty());
    assert_eq!(disables_to(&f.bus, 1), 0);

    assert_eq!(
        f.watchdog.tick_at(&f.bus, ms(150)),
        vec![WatchdogEvent::Disabled { esc_id: 1 }]
    );
    assert_eq!(disables_to(&f.bus, 1), 1);
    assert_eq!(
        f.watchdog.state(1),
        WatchdogState {
            tripped: true,
            last_disable: Some(ms(150)),
        }
    );

    assert_eq!(
        f.watchdog.tick_at(&f.bus, ms(500)),
        vec![WatchdogEvent::Suppressed { esc_id: 1 }]
    );
    assert_eq!(disables_to(&f.bus, 1), 1);
    assert!(f.watchdog.state(1).tripped);

    assert_eq!(
        f.watchdog.tick_at(&f.bus, ms(1200)),
        vec![WatchdogEvent::Disabled { esc_id: 1 }]
    );
    assert_eq!(disables_to(&f.bus, 1), 2);

    f.telemetry.record(sample(1, ms(1300)));
    assert_eq!(
        f.watchdog.tick_at(&f.bus, ms(1350)),
        vec![WatchdogEvent::Recovered { esc_id: 1 }]
    );
    assert_eq!(f.watchdog.state(1), WatchdogState::default());
    assert!(f.watchdog.tripped().is_empty());

    // Tripping again after recovery is not held back by the old cooldown
    assert_eq!(
        f.watchdog.tick_at(&f.bus, ms(1450)),
        vec![WatchdogEvent::Disabled { esc_id: 1 }]
    );
    assert_eq!(disables_to(&f.bus, 1), 3);
}

#[test]
fn test_latest_of_liveness_and_telemetry_counts() {
    let f = fixture(100, 1000, 100);
    let t0 = Instant::now();
    seen(&f.liveness, 2, t0);
    f.telemetry.record(sample(2, t0 + Duration::from_millis(400)));

    assert!(f
        .watchdog
        .tick_at(&f.bus, t0 + Duration::from_millis(450))
        .is_empty());
    assert!(!f.watchdog.state(2).tripped);
}

#[test]
fn test_failed_disable_is_retried_next_tick() {
    let f = fixture(100, 1000, 100);
    let sim = f.bus.driver().as_simulation().unwrap();
    let t0 = Instant::now();
    seen(&f.liveness, 1, t0);
    seen(&f.liveness, 2, t0 + Duration::from_millis(500));

    sim.set_fail_writes(true);
    let events = f.watchdog.tick_at(&f.bus, t0 + Duration::from_millis(200));
    assert!(matches!(
        events.as_slice(),
        [WatchdogEvent::DisableFailed { esc_id: 1, .. }]
    ));
    assert_eq!(
        f.watchdog.state(1),
        WatchdogState {
            tripped: true,
            last_disable: None,
        }
    );

    sim.set_fail_writes(false);
    let events = f.watchdog.tick_at(&f.bus, t0 + Duration::from_millis(250));
    assert_eq!(events, vec![WatchdogEvent::Disabled { esc_id: 1 }]);
    assert_eq!(disables_to(&f.bus, 1), 1);
}

#[test]
fn test_every_stale_motor_is_attempted() {
    let f = fixture(100, 1000, 100);
    let t0 = Instant::now();
    for esc_id in [1, 2, 3] {
        seen(&f.liveness, esc_id, t0);
    }
    f.bus
        .driver()
        .as_simulation()
        .unwrap()
        .set_fail_writes(true);

    let events = f.watchdog.tick_at(&f.bus, t0 + Duration::from_millis(200));
    assert_eq!(events.len(), 3);
    assert_eq!(f.watchdog.tripped(), vec![1, 2, 3]);
}

#[test]
fn test_runner_disables_stale_motor() {
    let f = fixture(50, 1000, 20);
    seen(&f.liveness, 3, Instant::now());

    let runner = WatchdogRunner::spawn(Arc::clone(&f.watchdog), Arc::clone(&f.bus)).unwrap();
    assert!(runner.is_running());
    thread::sleep(Duration::from_millis(250));
    runner.stop();
    runner.stop();
    assert!(!runner.is_running());

    assert_eq!(disables_to(&f.bus, 3), 1);
    assert!(f.watchdog.state(3).tripped);
}

#[test]
fn test_disable_reaches_motor_with_wide_esc_id() {
    let bus = Arc::new(BusManager::simulation("vcan0"));
    bus.driver().as_simulation().unwrap().add_motor(0x11, 0x21);
    bus.open().unwrap();

    let mut config = AppConfig::default();
    config.upsert_motor(0x11, 0x21);
    let ingest = Arc::new(TelemetryIngest::from_config(&config));
    ingest.attach(&bus);

    // Any command addressed to the motor makes it report on 0x21
    let (address, payload) = protocol::encode_disable(0x11);
    bus.send(address, &payload).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while ingest.liveness().get(0x11).is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(ingest.liveness().get(0x11).unwrap().mst_id, 0x21);
    assert!(ingest.liveness().get(0x01).is_none());

    let watchdog = Watchdog::new(
        WatchdogConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            Duration::from_millis(100),
        )
        .unwrap(),
        Arc::clone(ingest.liveness()),
        Arc::clone(ingest.telemetry()),
    )
    .unwrap();
    let before = disables_to(&bus, 0x11);
    assert_eq!(
        watchdog.tick_at(&bus, Instant::now() + Duration::from_secs(10)),
        vec![WatchdogEvent::Disabled { esc_id: 0x11 }]
    );
    assert_eq!(disables_to(&bus, 0x11), before + 1);
    assert_eq!(disables_to(&bus, 0x01), 0);
}
