// Discovery against the simulated bus
use std::sync::Arc;
use std::time::{Duration, Instant};

use dm_library::discovery::{
    active_probe, latest_per_motor, passive_sniff, DiscoveryService, SweepKind,
};
use dm_library::MotorLiveness;
use dm_library::protocol::{self, FeedbackRaw};
use dm_library::BusManager;

fn open_sim() -> BusManager {
    let bus = BusManager::simulation("vcan0");
    bus.open().unwrap();
    bus
}

fn feedback_frame(esc_id: u8, status: u8) -> [u8; 8] {
    protocol::encode_feedback(&FeedbackRaw {
        esc_id,
        status,
        position_raw: 0,
        velocity_raw: 0,
        torque_raw: 0,
        temp_mos: 40,
        temp_rotor: 41,
    })
}

#[test]
fn test_passive_sniff_dedupes_by_esc_and_address() {
    let bus = open_sim();
    let sim = bus.driver().as_simulation().unwrap();

    let before = Instant::now();
    sim.inject_frame(0x11, &feedback_frame(1, 0));
    sim.inject_frame(0x12, &feedback_frame(2, 1));
    sim.inject_frame(0x11, &feedback_frame(1, 1));
    sim.inject_frame(0x13, &[0x03, 0x00]);
    sim.inject_frame(protocol::MANAGEMENT_ADDRESS, &[0; 8]);

    let motors = passive_sniff(&bus, Duration::from_millis(200));
    assert_eq!(motors.len(), 2);
    assert_eq!((motors[0].esc_id, motors[0].mst_id), (1, 0x11));
    assert_eq!((motors[1].esc_id, motors[1].mst_id), (2, 0x12));
    assert!(motors.iter().all(|m| m.last_seen >= before));
    // The repeat on 0x11 was read after the 0x12 frame and replaces the first one
    assert!(motors[0].last_seen >= motors[1].last_seen);
}

#[test]
fn test_latest_per_motor_keeps_newest_observation() {
    let t0 = Instant::now();
    let at = |esc_id: u8, mst_id: u16, ms: u64| MotorLiveness {
        esc_id,
        mst_id,
        last_seen: t0 + Duration::from_millis(ms),
    };

    let motors = latest_per_motor([
        at(2, 0x12, 5),
        at(1, 0x11, 30),
        at(1, 0x11, 10),
        at(1, 0x21, 20),
        at(2, 0x12, 40),
    ]);

    assert_eq!(motors, vec![at(1, 0x11, 30), at(1, 0x21, 20), at(2, 0x12, 40)]);
}

#[test]
fn test_passive_sniff_same_esc_on_two_addresses() {
    let bus = open_sim();
    let sim = bus.driver().as_simulation().unwrap();
    sim.inject_frame(0x11, &feedback_frame(1, 0));
    sim.inject_frame(0x21, &feedback_frame(1, 0));

    let motors = passive_sniff(&bus, Duration::from_millis(150));
    let addresses: Vec<u16> = motors.iter().map(|m| m.mst_id).collect();
    assert_eq!(addresses, vec![0x11, 0x21]);
}

#[test]
fn test_active_probe_identifies_motor() {
    let bus = open_sim();
    let sim = bus.driver().as_simulation().unwrap();
    sim.inject_frame(0x12, &[0x12, 0, 0, 0, 0, 0, 40, 41]);

    let motors = active_probe(&bus, &[2], Duration::from_millis(50)).unwrap();
    assert_eq!(motors.len(), 1);
    assert_eq!(motors[0].esc_id, 2);
    assert_eq!(motors[0].mst_id, 0x12);

    let sent = sim.sent_frames();
    assert_eq!(sent[0].id, 2);
    assert!(protocol::is_disable_payload(&sent[0].data));
}

#[test]
fn test_active_probe_sends_disable_and_zero_in_order() {
    let bus = open_sim();
    let sim = bus.driver().as_simulation().unwrap();
    sim.add_motor(2, 0x12);

    let motors = active_probe(&bus, &[1, 2, 3], Duration::from_millis(50)).unwrap();
    assert_eq!(motors.len(), 1);
    assert_eq!((motors[0].esc_id, motors[0].mst_id), (2, 0x12));

    let sent = sim.sent_frames();
    let addresses: Vec<u32> = sent.iter().map(|f| f.id).collect();
    assert_eq!(addresses, vec![1, 0x201, 2, 0x202, 3, 0x203]);
    for pair in sent.chunks(2) {
        assert!(protocol::is_disable_payload(&pair[0].data));
        assert_eq!(protocol::decode_velocity_payload(&pair[1].data).unwrap(), 0.0);
    }

    // Probing never enables a motor
    assert!(!sim.motor(2).unwrap().enabled);
}

#[test]
fn test_active_probe_continues_after_send_failure() {
    let bus = open_sim();
    let sim = bus.driver().as_simulation().unwrap();
    sim.set_fail_writes(true);

    let motors = active_probe(&bus, &[1, 2], Duration::from_millis(20)).unwrap();
    assert!(motors.is_empty());
}

#[test]
fn test_discovery_service_single_flight() {
    let bus = Arc::new(open_sim());
    bus.driver().as_simulation().unwrap().add_motor(1, 0x11);
    let service = DiscoveryService::new(Arc::clone(&bus));

    let first = service
        .spawn_sweep(SweepKind::Active {
            candidates: vec![1, 2],
            probe_duration: Duration::from_millis(100),
        })
        .unwrap();
    assert!(service.is_sweeping());
    assert!(service
        .spawn_sweep(SweepKind::Passive {
            duration: Duration::from_millis(10)
        })
        .is_none());

    let motors = first.join().unwrap().unwrap();
    assert_eq!(motors.len(), 1);
    assert_eq!(motors[0].esc_id, 1);
    assert!(!service.is_sweeping());

    let second = service
        .spawn_sweep(SweepKind::Passive {
            duration: Duration::from_millis(10),
        })
        .unwrap();
    assert!(second.join().unwrap().unwrap().is_empty());
}
