// Choreography on the simulated bus, periodic and fallback paths
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use approx::assert_abs_diff_eq;

use dm_library::choreography::{Choreographer, RunPath, Waveform};
use dm_library::protocol;
use dm_library::{BusManager, CanFrame};

fn open_sim() -> Arc<BusManager> {
    let bus = Arc::new(BusManager::simulation("vcan0"));
    bus.open().unwrap();
    bus
}

fn sent(bus: &BusManager) -> Vec<CanFrame> {
    bus.driver().as_simulation().unwrap().sent_frames()
}

#[test]
fn test_periodic_path_updates_and_stops() {
    let bus = open_sim();
    let choreographer = Choreographer::new(Arc::clone(&bus));

    let path = choreographer
        .start(&[3, 4], 1.0, 1.0, Waveform::Sine)
        .unwrap();
    assert_eq!(path, RunPath::Periodic);
    assert!(choreographer.is_running());
    assert_eq!(choreographer.run_path(), Some(RunPath::Periodic));
    assert_eq!(choreographer.mode(), Some(Waveform::Sine));

    thread::sleep(Duration::from_millis(150));

    let tasks = bus.periodic_tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].address, 0x203);
    assert_eq!(tasks[1].address, 0x204);
    assert!(tasks.iter().all(|t| t.updates >= 1));
    assert!(tasks.iter().all(|t| t.rate_hz == 20.0));
    assert_ne!(tasks[0].payload, tasks[1].payload);

    // Two sine motors sit half a cycle apart: equal magnitude, opposite sign
    let v3 = protocol::decode_velocity_payload(&tasks[0].payload).unwrap();
    let v4 = protocol::decode_velocity_payload(&tasks[1].payload).unwrap();
    assert_abs_diff_eq!(v3, -v4, epsilon = 0.2);

    choreographer.stop(true).unwrap();
    assert!(!choreographer.is_running());
    assert_eq!(choreographer.run_path(), None);
    assert!(bus.periodic_tasks().iter().all(|t| t.stopped));

    let frames = sent(&bus);
    let tail: Vec<u32> = frames[frames.len() - 2..].iter().map(|f| f.id).collect();
    assert_eq!(tail, vec![3, 4]);
    assert!(frames[frames.len() - 2..]
        .iter()
        .all(|f| protocol::is_disable_payload(&f.data)));

    let count = frames.len();
    thread::sleep(Duration::from_millis(120));
    assert_eq!(sent(&bus).len(), count);
}

#[test]
fn test_fallback_path_when_periodic_unsupported() {
    let bus = open_sim();
    bus.driver()
        .as_simulation()
        .unwrap()
        .set_periodic_supported(false);
    let choreographer = Choreographer::new(Arc::clone(&bus));

    let path = choreographer
        .start(&[3, 4], 2.0, 0.5, Waveform::Figure8)
        .unwrap();
    assert_eq!(path, RunPath::Fallback);
    thread::sleep(Duration::from_millis(150));
    assert!(choreographer.is_running());

    let frames = sent(&bus);
    assert!(frames.iter().any(|f| f.id == 0x203));
    assert!(frames.iter().any(|f| f.id == 0x204));
    assert!(bus.periodic_tasks().is_empty());

    choreographer.stop(false).unwrap();
    let frames = sent(&bus);
    let tail = &frames[frames.len() - 2..];
    assert_eq!(tail[0].id, 0x203);
    assert_eq!(tail[1].id, 0x204);
    for frame in tail {
        assert_eq!(protocol::decode_velocity_payload(&frame.data).unwrap(), 0.0);
    }
}

#[test]
fn test_fallback_send_failure_ends_run() {
    let bus = open_sim();
    let sim = bus.driver().as_simulation().unwrap();
    sim.set_periodic_supported(false);
    let choreographer = Choreographer::new(Arc::clone(&bus));

    choreographer
        .start(&[1, 2], 1.0, 1.0, Waveform::Antiphase)
        .unwrap();
    thread::sleep(Duration::from_millis(60));
    sim.set_fail_writes(true);
    thread::sleep(Duration::from_millis(150));
    assert!(!choreographer.is_running());

    sim.set_fail_writes(false);
    choreographer.stop(true).unwrap();
    assert_eq!(choreographer.mode(), None);
}

#[test]
fn test_restart_replaces_previous_run() {
    let bus = open_sim();
    let choreographer = Choreographer::new(Arc::clone(&bus));

    choreographer.start(&[1], 1.0, 1.0, Waveform::Sine).unwrap();
    choreographer
        .start(&[2], 1.0, 1.0, Waveform::Antiphase)
        .unwrap();
    assert_eq!(choreographer.motors(), vec![2]);
    assert_eq!(choreographer.mode(), Some(Waveform::Antiphase));

    // The first run was stopped with a zero-velocity command
    assert!(sent(&bus).iter().any(|f| {
        f.id == 0x201 && protocol::decode_velocity_payload(&f.data).unwrap() == 0.0
    }));

    let live: Vec<u32> = bus
        .periodic_tasks()
        .iter()
        .filter(|t| !t.stopped)
        .map(|t| t.address)
        .collect();
    assert_eq!(live, vec![0x202]);

    choreographer.stop(true).unwrap();
}

#[test]
fn test_concurrent_starts_leave_one_run() {
    let bus = open_sim();
    let choreographer = Arc::new(Choreographer::new(Arc::clone(&bus)));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = [1u8, 2]
        .into_iter()
        .map(|esc_id| {
            let choreographer = Arc::clone(&choreographer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                choreographer
                    .start(&[esc_id], 1.0, 1.0, Waveform::Sine)
                    .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let live: Vec<u32> = bus
        .periodic_tasks()
        .iter()
        .filter(|t| !t.stopped)
        .map(|t| t.address)
        .collect();
    assert_eq!(live.len(), 1);

    let winner = choreographer.motors();
    assert_eq!(winner.len(), 1);
    assert_eq!(live[0], 0x200 + winner[0] as u32);

    // The replaced run was brought to zero velocity
    let loser = if winner[0] == 1 { 2 } else { 1 };
    assert!(sent(&bus).iter().any(|f| {
        f.id == 0x200 + loser as u32
            && protocol::decode_velocity_payload(&f.data).unwrap() == 0.0
    }));

    choreographer.stop(true).unwrap();
    assert!(bus.periodic_tasks().iter().all(|t| t.stopped));
}
