//! One-shot motor commands

use std::time::Duration;

use colored::*;
use dm_core::{DmError, DmResult};
use dm_library::controllers;
use dm_library::protocol::{MitLimits, MitTarget};
use dm_library::TelemetryIngest;

use crate::Session;

/// Lifecycle command applied to a set of motors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorAction {
    Enable,
    Disable,
    Zero,
    Brake,
}

impl MotorAction {
    fn verb(self) -> &'static str {
        match self {
            Self::Enable => "Enabled",
            Self::Disable => "Disabled",
            Self::Zero => "Zeroed",
            Self::Brake => "Braked",
        }
    }
}

/// Apply `action` to `ids`, or to every configured motor when `ids` is empty
pub fn run_action(session: &Session, action: MotorAction, ids: &[u8]) -> DmResult<()> {
    let ids = session.ids_or_configured(ids);
    if ids.is_empty() {
        return Err(DmError::invalid_input(
            "no motors given and none configured; pass ESC ids or run 'dmctl sniff --save'",
        ));
    }

    let bus = &session.bus;
    let result = match action {
        MotorAction::Enable => controllers::enable_all(bus, &ids),
        MotorAction::Disable => controllers::disable_all(bus, &ids),
        MotorAction::Zero => ids
            .iter()
            .map(|&esc_id| controllers::zero(bus, esc_id))
            .fold(Ok(()), |acc, r| acc.and(r)),
        MotorAction::Brake => controllers::brake_to_zero(bus, &ids),
    };
    result?;

    println!("{} {} {}", "✓".green(), action.verb(), format_ids(&ids).as_str().white().bold());
    Ok(())
}

/// Velocity setpoint, optionally with a position target (position-velocity mode)
pub fn run_velocity(
    session: &Session,
    esc_id: u8,
    velocity_rad_s: f64,
    position_rad: Option<f64>,
    feedback_wait: Duration,
) -> DmResult<()> {
    let ingest = session.attach_ingest();
    match position_rad {
        Some(position) => {
            controllers::command_position_velocity(&session.bus, esc_id, position, velocity_rad_s)?;
            println!(
                "{} ESC 0x{:02X} -> {:.3} rad at {:.3} rad/s",
                "✓".green(),
                esc_id,
                position,
                velocity_rad_s
            );
        }
        None => {
            controllers::command_velocity(&session.bus, esc_id, velocity_rad_s)?;
            println!(
                "{} ESC 0x{:02X} -> {:.3} rad/s",
                "✓".green(),
                esc_id,
                velocity_rad_s
            );
        }
    }
    print_feedback(&ingest, esc_id, feedback_wait);
    Ok(())
}

/// MIT impedance setpoint
pub fn run_mit(
    session: &Session,
    esc_id: u8,
    target: MitTarget,
    feedback_wait: Duration,
) -> DmResult<()> {
    let limits = session.config.scale_limits(esc_id);
    let target = target.with_limits(MitLimits {
        position: limits.p_max,
        velocity: limits.v_max,
        torque: limits.t_max,
        ..MitLimits::default()
    });

    let ingest = session.attach_ingest();
    controllers::command_mit(&session.bus, esc_id, &target)?;
    println!(
        "{} ESC 0x{:02X} MIT p={:.3} v={:.3} t={:.3} kp={:.1} kd={:.2}",
        "✓".green(),
        esc_id,
        target.position_rad,
        target.velocity_rad_s,
        target.torque_nm,
        target.kp,
        target.kd
    );
    print_feedback(&ingest, esc_id, feedback_wait);
    Ok(())
}

fn print_feedback(ingest: &TelemetryIngest, esc_id: u8, wait: Duration) {
    if wait.is_zero() {
        return;
    }
    std::thread::sleep(wait);
    match ingest.telemetry().latest(esc_id) {
        Some(sample) => {
            let fb = sample.engineering;
            println!(
                "  {} pos {:.3} rad  vel {:.3} rad/s  torque {:.3} Nm  mos {:.0}°C  rotor {:.0}°C  status {}",
                "Feedback:".dimmed(),
                fb.position_rad,
                fb.velocity_rad_s,
                fb.torque_nm,
                fb.temp_mos_c,
                fb.temp_rotor_c,
                fb.status
            );
        }
        None => println!("  {} none received", "Feedback:".dimmed()),
    }
}

/// `0x01, 0x02, ...`
pub fn format_ids(ids: &[u8]) -> String {
    ids.iter()
        .map(|id| format!("0x{:02X}", id))
        .collect::<Vec<_>>()
        .join(", ")
}
