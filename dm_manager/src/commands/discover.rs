//! Motor discovery commands (`sniff`, `probe`)

use std::time::Duration;

use colored::*;
use dm_core::DmResult;
use dm_library::discovery;
use dm_library::MotorLiveness;

use crate::Session;

/// Listen without transmitting and report every motor heard
pub fn run_sniff(session: &mut Session, duration: Duration, save: bool) -> DmResult<()> {
    println!(
        "{} Listening on {} for {:.1}s...",
        "→".cyan(),
        session.bus.channel().white().bold(),
        duration.as_secs_f64()
    );
    let motors = attribute(session, discovery::passive_sniff(&session.bus, duration));
    report(&motors);
    if save {
        remember(session, &motors)?;
    }
    Ok(())
}

/// Poke each candidate with disable + zero velocity and report who answers
pub fn run_probe(
    session: &mut Session,
    candidates: &[u8],
    probe_duration: Duration,
    save: bool,
) -> DmResult<()> {
    println!(
        "{} Probing {} candidate(s) on {}...",
        "→".cyan(),
        candidates.len(),
        session.bus.channel().white().bold()
    );
    let motors = attribute(
        session,
        discovery::active_probe(&session.bus, candidates, probe_duration)?,
    );
    report(&motors);
    if save {
        remember(session, &motors)?;
    }
    Ok(())
}

/// Restore full `esc_id`s for feedback ids the config already knows
///
/// Feedback only carries the low nibble, so ESC 0x11 on MST 0x21 is heard
/// as ESC 0x01.
pub fn attribute(session: &Session, motors: Vec<MotorLiveness>) -> Vec<MotorLiveness> {
    let mut motors: Vec<MotorLiveness> = motors
        .into_iter()
        .map(|mut motor| {
            if let Some(known) = session.config.motor_by_mst(motor.mst_id) {
                if known.esc_id & 0x0F == motor.esc_id & 0x0F {
                    motor.esc_id = known.esc_id;
                }
            }
            motor
        })
        .collect();
    motors.sort_by_key(|m| (m.esc_id, m.mst_id));
    motors.dedup_by_key(|m| (m.esc_id, m.mst_id));
    motors
}

fn report(motors: &[MotorLiveness]) {
    if motors.is_empty() {
        println!("{}", "No motors found.".yellow());
        println!(
            "  {} Check wiring, bitrate and termination, or try 'dmctl probe'",
            "Tip:".dimmed()
        );
        return;
    }

    println!();
    println!("  {:<8} {:<8}", "ESC".dimmed(), "MST".dimmed());
    println!("  {}", "-".repeat(16).dimmed());
    for motor in motors {
        println!(
            "  {:<8} {:<8}",
            format!("0x{:02X}", motor.esc_id),
            format!("0x{:03X}", motor.mst_id)
        );
    }
    println!();
    println!("  {} {} motor(s)", "Total:".dimmed(), motors.len());
}

fn remember(session: &mut Session, motors: &[MotorLiveness]) -> DmResult<()> {
    for motor in motors {
        session.config.upsert_motor(motor.esc_id, motor.mst_id);
    }
    let channel = session.bus.channel().to_string();
    session.config.ensure_bus(&channel, dm_core::BusConfig::default().bitrate);
    session.save_config()?;
    println!("{} Saved {} motor(s) to config", "✓".green(), motors.len());
    Ok(())
}
