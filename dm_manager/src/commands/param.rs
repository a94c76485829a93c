//! Register access commands (`read-param`, `limits`, `assign-ids`)

use std::time::Duration;

use colored::*;
use dm_core::DmResult;
use dm_library::controllers;
use dm_library::protocol::params::{self, ControlMode};

use crate::Session;

/// Read one register and print it as raw value and float
pub fn run_read_param(session: &Session, esc_id: u8, rid: u8, timeout: Duration) -> DmResult<()> {
    let response = controllers::read_param(&session.bus, esc_id as u16, rid, timeout)?;
    println!(
        "  {:<10} {} (0x{:02X})",
        "Register:".cyan(),
        params::rid_name(rid).white().bold(),
        rid
    );
    println!("  {:<10} 0x{:08X} ({})", "Raw:".dimmed(), response.value, response.value);
    println!("  {:<10} {}", "Float:".dimmed(), response.value_f32());
    Ok(())
}

/// Fetch the feedback scale limits, optionally writing them to the config
pub fn run_limits(session: &mut Session, esc_id: u8, timeout: Duration, save: bool) -> DmResult<()> {
    let limits = controllers::fetch_scale_limits(&session.bus, esc_id as u16, timeout)?;
    println!("{} ESC 0x{:02X} scale limits", "✓".green(), esc_id);
    println!("  {:<8} {:.3} rad", "P_MAX:".dimmed(), limits.p_max);
    println!("  {:<8} {:.3} rad/s", "V_MAX:".dimmed(), limits.v_max);
    println!("  {:<8} {:.3} Nm", "T_MAX:".dimmed(), limits.t_max);

    if save {
        session.config.set_scale_limits(esc_id, limits)?;
        session.save_config()?;
        println!("{} Saved limits to config", "✓".green());
    }
    Ok(())
}

/// Re-address a motor and record the new ids in the config
pub fn run_assign_ids(
    session: &mut Session,
    current_esc: u8,
    new_esc: u8,
    new_mst: u16,
    mode: ControlMode,
) -> DmResult<()> {
    controllers::assign_motor_ids(&session.bus, current_esc, new_esc, new_mst, mode)?;
    println!(
        "{} ESC 0x{:02X} is now ESC 0x{:02X} / MST 0x{:03X} ({:?})",
        "✓".green(),
        current_esc,
        new_esc,
        new_mst,
        mode
    );

    if let Some(index) = session
        .config
        .motors
        .iter()
        .position(|m| m.esc_id == current_esc)
    {
        let mut record = session.config.motors.remove(index);
        record.esc_id = new_esc;
        record.mst_id = new_mst;
        session.config.motors.retain(|m| m.esc_id != new_esc);
        session.config.motors.insert(index.min(session.config.motors.len()), record);
    } else {
        session.config.upsert_motor(new_esc, new_mst);
    }
    session.save_config()?;
    println!(
        "  {} Power-cycle the motor if it does not answer on the new ids",
        "Tip:".dimmed()
    );
    Ok(())
}
