//! High-level motor commands
//!
//! Thin helpers that encode an intent and send it on a [`BusManager`].
//! Group helpers attempt every motor and report the first failure.

use std::time::{Duration, Instant};

use dm_core::config::ScaleLimits;
use dm_core::error::{DmError, DmResult};

use crate::drivers::BusManager;
use crate::protocol::params::{self, ControlMode};
use crate::protocol::{self, ManagementResponse, MitTarget};

/// Default deadline for parameter reads
pub const DEFAULT_PARAM_TIMEOUT: Duration = Duration::from_millis(500);

const POLL_SLICE: Duration = Duration::from_millis(50);

fn for_each_motor<F>(esc_ids: &[u8], mut action: F) -> DmResult<()>
where
    F: FnMut(u8) -> DmResult<()>,
{
    let mut first_error = None;
    for &esc_id in esc_ids {
        if let Err(e) = action(esc_id) {
            log::warn!("Command to ESC 0x{:02X} failed: {}", esc_id, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn send(bus: &BusManager, (address, payload): (u32, protocol::Payload)) -> DmResult<()> {
    bus.send(address, &payload)
}

pub fn enable(bus: &BusManager, esc_id: u8) -> DmResult<()> {
    send(bus, protocol::encode_enable(esc_id))
}

pub fn disable(bus: &BusManager, esc_id: u8) -> DmResult<()> {
    send(bus, protocol::encode_disable(esc_id))
}

/// Set the current position as mechanical zero
pub fn zero(bus: &BusManager, esc_id: u8) -> DmResult<()> {
    send(bus, protocol::encode_zero(esc_id))
}

pub fn enable_all(bus: &BusManager, esc_ids: &[u8]) -> DmResult<()> {
    for_each_motor(esc_ids, |esc_id| enable(bus, esc_id))
}

pub fn disable_all(bus: &BusManager, esc_ids: &[u8]) -> DmResult<()> {
    for_each_motor(esc_ids, |esc_id| disable(bus, esc_id))
}

pub fn command_velocity(bus: &BusManager, esc_id: u8, velocity_rad_s: f64) -> DmResult<()> {
    send(bus, protocol::encode_velocity(esc_id, velocity_rad_s)?)
}

pub fn command_velocities(bus: &BusManager, targets: &[(u8, f64)]) -> DmResult<()> {
    let mut first_error = None;
    for &(esc_id, velocity) in targets {
        if let Err(e) = command_velocity(bus, esc_id, velocity) {
            log::warn!("Velocity command to ESC 0x{:02X} failed: {}", esc_id, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

pub fn command_position_velocity(
    bus: &BusManager,
    esc_id: u8,
    position_rad: f64,
    velocity_rad_s: f64,
) -> DmResult<()> {
    send(
        bus,
        protocol::encode_position_velocity(esc_id, position_rad, velocity_rad_s)?,
    )
}

pub fn command_mit(bus: &BusManager, esc_id: u8, target: &MitTarget) -> DmResult<()> {
    send(bus, protocol::encode_mit(esc_id, target)?)
}

pub fn command_mit_targets(bus: &BusManager, targets: &[(u8, MitTarget)]) -> DmResult<()> {
    let mut first_error = None;
    for (esc_id, target) in targets {
        if let Err(e) = command_mit(bus, *esc_id, target) {
            log::warn!("MIT command to ESC 0x{:02X} failed: {}", esc_id, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Command zero velocity to every motor
pub fn brake_to_zero(bus: &BusManager, esc_ids: &[u8]) -> DmResult<()> {
    for_each_motor(esc_ids, |esc_id| command_velocity(bus, esc_id, 0.0))
}

// ============================================================================
// Parameters
// ============================================================================

/// Read register `rid`, waiting up to `timeout` for the matching response
///
/// Unrelated frames received while waiting are consumed.
pub fn read_param(
    bus: &BusManager,
    esc_id: u16,
    rid: u8,
    timeout: Duration,
) -> DmResult<ManagementResponse> {
    send(bus, protocol::encode_param_read(esc_id, rid))?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(frame) = bus.get_message(remaining.min(POLL_SLICE)) else {
            continue;
        };
        if frame.id != protocol::MANAGEMENT_ADDRESS {
            continue;
        }
        let Ok(response) = protocol::decode_management_response(&frame.data) else {
            continue;
        };
        if response.command == params::MANAGEMENT_READ
            && response.esc_id == esc_id
            && response.rid == rid
        {
            log::debug!(
                "ESC 0x{:02X} {} = 0x{:08X}",
                esc_id,
                params::rid_name(rid),
                response.value
            );
            return Ok(response);
        }
    }

    Err(DmError::timeout(format!(
        "no response for {} (RID 0x{:02X}) from ESC 0x{:02X} within {:?}",
        params::rid_name(rid),
        rid,
        esc_id,
        timeout
    )))
}

/// Read register `rid` as a little-endian float
pub fn read_param_f32(bus: &BusManager, esc_id: u16, rid: u8, timeout: Duration) -> DmResult<f32> {
    Ok(read_param(bus, esc_id, rid, timeout)?.value_f32())
}

pub fn write_param(bus: &BusManager, esc_id: u16, rid: u8, value: u32) -> DmResult<()> {
    send(bus, protocol::encode_param_write(esc_id, rid, value))
}

/// Persist written parameters to flash
pub fn save_params(bus: &BusManager, esc_id: u16) -> DmResult<()> {
    send(bus, protocol::encode_param_save(esc_id))
}

pub fn refresh_params(bus: &BusManager, esc_id: u16) -> DmResult<()> {
    send(bus, protocol::encode_param_refresh(esc_id))
}

/// Read P_MAX, V_MAX and T_MAX
pub fn fetch_scale_limits(bus: &BusManager, esc_id: u16, timeout: Duration) -> DmResult<ScaleLimits> {
    let read = |rid| -> DmResult<f64> {
        let value = read_param_f32(bus, esc_id, rid, timeout)? as f64;
        if !value.is_finite() || value <= 0.0 {
            return Err(DmError::malformed(format!(
                "ESC 0x{:02X} reported invalid {} = {}",
                esc_id,
                params::rid_name(rid),
                value
            )));
        }
        Ok(value)
    };

    Ok(ScaleLimits {
        p_max: read(params::RID_P_MAX)?,
        v_max: read(params::RID_V_MAX)?,
        t_max: read(params::RID_T_MAX)?,
    })
}

/// Re-address a motor: disable, write ids and control mode, then save
pub fn assign_motor_ids(
    bus: &BusManager,
    current_esc: u8,
    new_esc: u8,
    new_mst: u16,
    mode: ControlMode,
) -> DmResult<()> {
    if new_esc == 0 || new_esc > 0x7F {
        return Err(DmError::invalid_input(format!(
            "ESC id must be in 1..=127, got {}",
            new_esc
        )));
    }
    if new_mst == 0 || new_mst as u32 >= protocol::MANAGEMENT_ADDRESS {
        return Err(DmError::invalid_input(format!(
            "MST id must be in 1..=2046, got {}",
            new_mst
        )));
    }

    let esc = current_esc as u16;
    disable(bus, current_esc)?;
    write_param(bus, esc, params::RID_ESC_ID, new_esc as u32)?;
    write_param(bus, esc, params::RID_MST_ID, new_mst as u32)?;
    write_param(bus, esc, params::RID_CTRL_MODE, mode.as_u32())?;
    save_params(bus, esc)?;

    log::info!(
        "Assigned ESC 0x{:02X} -> ESC 0x{:02X} / MST 0x{:03X} ({:?})",
        current_esc,
        new_esc,
        new_mst,
        mode
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SimulationCanDriver;

    fn open_sim() -> BusManager {
        let bus = BusManager::simulation("vcan0");
        bus.open().unwrap();
        bus
    }

    fn sim(bus: &BusManager) -> &SimulationCanDriver {
        bus.driver().as_simulation().unwrap()
    }

    #[test]
    fn test_brake_to_zero_sends_zero_velocity() {
        let bus = open_sim();
        brake_to_zero(&bus, &[3, 4]).unwrap();

        let sent = sim(&bus).sent_frames();
        let addresses: Vec<u32> = sent.iter().map(|f| f.id).collect();
        assert_eq!(addresses, vec![0x203, 0x204]);
        for frame in &sent {
            assert_eq!(protocol::decode_velocity_payload(&frame.data).unwrap(), 0.0);
        }
    }

    #[test]
    fn test_group_commands_attempt_every_motor() {
        let bus = open_sim();
        sim(&bus).set_fail_writes(true);
        assert!(disable_all(&bus, &[1, 2, 3]).unwrap_err().is_transport());
        sim(&bus).set_fail_writes(false);

        enable_all(&bus, &[1, 2]).unwrap();
        let sent = sim(&bus).sent_frames();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| protocol::is_enable_payload(&f.data)));
    }

    #[test]
    fn test_read_param_times_out() {
        let bus = open_sim();
        let started = Instant::now();
        let err = read_param(&bus, 1, params::RID_P_MAX, Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_transport());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_read_param_ignores_unrelated_responses() {
        let bus = open_sim();
        let other = ManagementResponse {
            esc_id: 2,
            command: params::MANAGEMENT_READ,
            rid: params::RID_P_MAX,
            value: 9,
        };
        let wanted = ManagementResponse { esc_id: 1, ..other };
        sim(&bus).inject_frame(0x11, &[0; 8]);
        sim(&bus).inject_frame(
            protocol::MANAGEMENT_ADDRESS,
            &protocol::encode_management_response(&other),
        );
        sim(&bus).inject_frame(
            protocol::MANAGEMENT_ADDRESS,
            &protocol::encode_management_response(&wanted),
        );

        let response = read_param(&bus, 1, params::RID_P_MAX, DEFAULT_PARAM_TIMEOUT).unwrap();
        assert_eq!(response, wanted);
    }

    #[test]
    fn test_fetch_scale_limits_from_motor() {
        let bus = open_sim();
        let mut motor = crate::drivers::SimulatedMotor::new(1, 0x11);
        motor.limits = ScaleLimits {
            p_max: 12.5,
            v_max: 45.0,
            t_max: 18.0,
        };
        sim(&bus).add_simulated_motor(motor);

        let limits = fetch_scale_limits(&bus, 1, DEFAULT_PARAM_TIMEOUT).unwrap();
        assert_eq!(limits.p_max, 12.5);
        assert_eq!(limits.v_max, 45.0);
        assert_eq!(limits.t_max, 18.0);
    }

    #[test]
    fn test_assign_motor_ids_sequence() {
        let bus = open_sim();
        assign_motor_ids(&bus, 1, 2, 0x12, ControlMode::Velocity).unwrap();

        let sent = sim(&bus).sent_frames();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].id, 1);
        assert!(protocol::is_disable_payload(&sent[0].data));

        let management: Vec<ManagementResponse> = sent[1..]
            .iter()
            .map(|f| {
                assert_eq!(f.id, protocol::MANAGEMENT_ADDRESS);
                protocol::decode_management_response(&f.data).unwrap()
            })
            .collect();
        assert_eq!(
            management
                .iter()
                .map(|m| (m.command, m.rid, m.value))
                .collect::<Vec<_>>(),
            vec![
                (params::MANAGEMENT_WRITE, params::RID_ESC_ID, 2),
                (params::MANAGEMENT_WRITE, params::RID_MST_ID, 0x12),
                (params::MANAGEMENT_WRITE, params::RID_CTRL_MODE, 3),
                (params::MANAGEMENT_SAVE, 0, 0),
            ]
        );
        assert!(management.iter().all(|m| m.esc_id == 1));
    }

    #[test]
    fn test_assign_motor_ids_rejects_bad_ids() {
        let bus = open_sim();
        assert!(assign_motor_ids(&bus, 1, 0, 0x12, ControlMode::Mit).is_err());
        assert!(assign_motor_ids(&bus, 1, 2, 0x7FF, ControlMode::Mit).is_err());
        assert!(sim(&bus).sent_frames().is_empty());
    }
}
