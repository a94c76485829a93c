//! Wire protocol for Damiao DM-J series motor controllers
//!
//! Every function here is pure: it maps an intent to an `(address, payload)`
//! pair, or an inbound payload to a structured value. Nothing touches the bus.
//!
//! # Address scheme
//!
//! | frame                  | arbitration id     |
//! |------------------------|--------------------|
//! | enable / disable / zero| `esc_id`           |
//! | position + velocity    | `0x100 + esc_id`   |
//! | velocity               | `0x200 + esc_id`   |
//! | MIT                    | `0x300 + esc_id`   |
//! | parameter management   | `0x7FF`            |
//!
//! Feedback frames come back on the motor's `mst_id`.

pub mod mit;
pub mod params;

pub use mit::{decode_mit, pack_mit_payload, MitLimits, MitTarget, MitValues};

use std::collections::HashSet;

use dm_core::config::ScaleLimits;
use dm_core::error::{DmError, DmResult};

/// 8-byte frame payload
pub type Payload = [u8; 8];

pub const ENABLE_FRAME: Payload = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC];
pub const DISABLE_FRAME: Payload = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFD];
pub const ZERO_FRAME: Payload = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE];

/// Shared arbitration id of the parameter-management channel
pub const MANAGEMENT_ADDRESS: u32 = 0x7FF;

pub const POSITION_VELOCITY_BASE: u32 = 0x100;
pub const VELOCITY_BASE: u32 = 0x200;
pub const MIT_BASE: u32 = 0x300;

/// Mask for an exact match on a standard 11-bit identifier
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// Raw feedback as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackRaw {
    pub esc_id: u8,
    pub status: u8,
    pub position_raw: i16,
    pub velocity_raw: i16,
    pub torque_raw: i16,
    pub temp_mos: u8,
    pub temp_rotor: u8,
}

/// Feedback converted into engineering units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackEngineering {
    pub esc_id: u8,
    pub status: u8,
    pub position_rad: f64,
    pub velocity_rad_s: f64,
    pub torque_nm: f64,
    pub temp_mos_c: f64,
    pub temp_rotor_c: f64,
}

impl FeedbackRaw {
    /// Scale the raw counts with the motor's limits
    pub fn to_engineering(&self, limits: ScaleLimits) -> FeedbackEngineering {
        FeedbackEngineering {
            esc_id: self.esc_id,
            status: self.status,
            position_rad: self.position_raw as f64 / 32767.0 * limits.p_max,
            velocity_rad_s: self.velocity_raw as f64 / 2047.0 * limits.v_max,
            torque_nm: self.torque_raw as f64 / 2047.0 * limits.t_max,
            temp_mos_c: self.temp_mos as f64,
            temp_rotor_c: self.temp_rotor as f64,
        }
    }
}

/// Free-function form of [`FeedbackRaw::to_engineering`]
pub fn scale_to_engineering(raw: &FeedbackRaw, p_max: f64, v_max: f64, t_max: f64) -> FeedbackEngineering {
    raw.to_engineering(ScaleLimits { p_max, v_max, t_max })
}

/// Parsed payload from the management channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementResponse {
    pub esc_id: u16,
    pub command: u8,
    pub rid: u8,
    pub value: u32,
}

impl ManagementResponse {
    /// Reinterpret `value` as a little-endian IEEE-754 float
    pub fn value_f32(&self) -> f32 {
        f32::from_le_bytes(self.value.to_le_bytes())
    }
}

/// Kernel-style acceptance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterRule {
    pub can_id: u32,
    pub can_mask: u32,
    pub extended: bool,
}

impl FilterRule {
    /// Exact match on a standard identifier
    pub fn exact(can_id: u32) -> Self {
        Self {
            can_id,
            can_mask: STANDARD_ID_MASK,
            extended: false,
        }
    }

    pub fn matches(&self, frame_id: u32, frame_extended: bool) -> bool {
        if self.extended != frame_extended {
            return false;
        }
        (frame_id & self.can_mask) == (self.can_id & self.can_mask)
    }
}

// ============================================================================
// Command frames
// ============================================================================

pub fn encode_enable(esc_id: u8) -> (u32, Payload) {
    (esc_id as u32, ENABLE_FRAME)
}

pub fn encode_disable(esc_id: u8) -> (u32, Payload) {
    (esc_id as u32, DISABLE_FRAME)
}

pub fn encode_zero(esc_id: u8) -> (u32, Payload) {
    (esc_id as u32, ZERO_FRAME)
}

fn finite_f32(name: &str, value: f64) -> DmResult<f32> {
    let narrowed = value as f32;
    if !value.is_finite() || !narrowed.is_finite() {
        return Err(DmError::invalid_input(format!(
            "{} must be finite, got {}",
            name, value
        )));
    }
    Ok(narrowed)
}

/// Velocity-mode setpoint: LE f32 velocity then 4 zero bytes
pub fn encode_velocity(esc_id: u8, velocity_rad_s: f64) -> DmResult<(u32, Payload)> {
    let velocity = finite_f32("velocity", velocity_rad_s)?;
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&velocity.to_le_bytes());
    Ok((VELOCITY_BASE + esc_id as u32, payload))
}

/// Position-velocity setpoint: two LE f32
pub fn encode_position_velocity(
    esc_id: u8,
    position_rad: f64,
    velocity_rad_s: f64,
) -> DmResult<(u32, Payload)> {
    let position = finite_f32("position", position_rad)?;
    let velocity = finite_f32("velocity", velocity_rad_s)?;
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&position.to_le_bytes());
    payload[4..].copy_from_slice(&velocity.to_le_bytes());
    Ok((POSITION_VELOCITY_BASE + esc_id as u32, payload))
}

/// MIT-mode setpoint, clamped and fixed-point packed
pub fn encode_mit(esc_id: u8, target: &MitTarget) -> DmResult<(u32, Payload)> {
    Ok((MIT_BASE + esc_id as u32, pack_mit_payload(target)?))
}

pub fn is_enable_payload(payload: &[u8]) -> bool {
    payload == ENABLE_FRAME
}

pub fn is_disable_payload(payload: &[u8]) -> bool {
    payload == DISABLE_FRAME
}

pub fn is_zero_payload(payload: &[u8]) -> bool {
    payload == ZERO_FRAME
}

fn expect_len<'a>(payload: &'a [u8], what: &str) -> DmResult<&'a [u8; 8]> {
    payload.try_into().map_err(|_| {
        DmError::malformed(format!(
            "{} must be 8 bytes, got {}",
            what,
            payload.len()
        ))
    })
}

/// Velocity carried by a velocity-mode payload
pub fn decode_velocity_payload(payload: &[u8]) -> DmResult<f32> {
    let p = expect_len(payload, "Velocity command payload")?;
    Ok(f32::from_le_bytes([p[0], p[1], p[2], p[3]]))
}

/// `(position, velocity)` carried by a position-velocity payload
pub fn decode_position_velocity_payload(payload: &[u8]) -> DmResult<(f32, f32)> {
    let p = expect_len(payload, "Position-velocity payload")?;
    Ok((
        f32::from_le_bytes([p[0], p[1], p[2], p[3]]),
        f32::from_le_bytes([p[4], p[5], p[6], p[7]]),
    ))
}

// ============================================================================
// Feedback
// ============================================================================

fn sign_extend(value: u16, bits: u32) -> i16 {
    let shift = 16 - bits;
    ((value << shift) as i16) >> shift
}

/// Decode an inbound feedback frame
pub fn decode_feedback(payload: &[u8]) -> DmResult<FeedbackRaw> {
    let d = expect_len(payload, "Feedback frame")?;
    let position = (d[1] as u16) << 8 | d[2] as u16;
    let velocity = ((d[3] as u16) << 4) | (d[4] as u16 >> 4);
    let torque = ((d[4] as u16 & 0x0F) << 8) | d[5] as u16;

    Ok(FeedbackRaw {
        esc_id: d[0] & 0x0F,
        status: d[0] >> 4,
        position_raw: position as i16,
        velocity_raw: sign_extend(velocity, 12),
        torque_raw: sign_extend(torque, 12),
        temp_mos: d[6],
        temp_rotor: d[7],
    })
}

/// Reference encoder for feedback frames (used by the simulated motors)
pub fn encode_feedback(raw: &FeedbackRaw) -> Payload {
    let pos = raw.position_raw as u16;
    let vel = raw.velocity_raw as u16 & 0x0FFF;
    let torque = raw.torque_raw as u16 & 0x0FFF;
    [
        ((raw.status & 0x0F) << 4) | (raw.esc_id & 0x0F),
        (pos >> 8) as u8,
        pos as u8,
        (vel >> 4) as u8,
        (((vel & 0x0F) << 4) | (torque >> 8)) as u8,
        torque as u8,
        raw.temp_mos,
        raw.temp_rotor,
    ]
}

// ============================================================================
// Parameter management
// ============================================================================

fn management_payload(esc_id: u16, command: u8, rid: u8, value: u32) -> Payload {
    let id = esc_id.to_le_bytes();
    let v = value.to_le_bytes();
    [id[0], id[1], command, rid, v[0], v[1], v[2], v[3]]
}

pub fn encode_param_read(esc_id: u16, rid: u8) -> (u32, Payload) {
    (
        MANAGEMENT_ADDRESS,
        management_payload(esc_id, params::MANAGEMENT_READ, rid, 0),
    )
}

pub fn encode_param_write(esc_id: u16, rid: u8, value: u32) -> (u32, Payload) {
    (
        MANAGEMENT_ADDRESS,
        management_payload(esc_id, params::MANAGEMENT_WRITE, rid, value),
    )
}

pub fn encode_param_save(esc_id: u16) -> (u32, Payload) {
    (
        MANAGEMENT_ADDRESS,
        management_payload(esc_id, params::MANAGEMENT_SAVE, 0, 0),
    )
}

pub fn encode_param_refresh(esc_id: u16) -> (u32, Payload) {
    (
        MANAGEMENT_ADDRESS,
        management_payload(esc_id, params::MANAGEMENT_REFRESH, 0, 0),
    )
}

/// Build a management response payload (used by the simulated motors)
pub fn encode_management_response(response: &ManagementResponse) -> Payload {
    management_payload(response.esc_id, response.command, response.rid, response.value)
}

pub fn decode_management_response(payload: &[u8]) -> DmResult<ManagementResponse> {
    let d = expect_len(payload, "Management response")?;
    Ok(ManagementResponse {
        esc_id: u16::from_le_bytes([d[0], d[1]]),
        command: d[2],
        rid: d[3],
        value: u32::from_le_bytes([d[4], d[5], d[6], d[7]]),
    })
}

// ============================================================================
// Filters
// ============================================================================

/// One exact-match filter per unique `mst_id`, plus the management channel once
pub fn build_filters<I>(mst_ids: I) -> Vec<FilterRule>
where
    I: IntoIterator<Item = u32>,
{
    let mut seen = HashSet::new();
    let mut filters: Vec<FilterRule> = mst_ids
        .into_iter()
        .filter(|&id| id != MANAGEMENT_ADDRESS && seen.insert(id))
        .map(FilterRule::exact)
        .collect();
    filters.push(FilterRule::exact(MANAGEMENT_ADDRESS));
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback_bytes(status: u8, esc_id: u8, pos: u16, vel: u16, torque: u16, mos: u8, rotor: u8) -> Payload {
        let vel = vel & 0xFFF;
        let torque = torque & 0xFFF;
        [
            ((status & 0x0F) << 4) | (esc_id & 0x0F),
            (pos >> 8) as u8,
            pos as u8,
            (vel >> 4) as u8,
            (((vel & 0x0F) << 4) | (torque >> 8)) as u8,
            torque as u8,
            mos,
            rotor,
        ]
    }

    #[test]
    fn test_sentinel_frames() {
        assert_eq!(encode_enable(1), (1, ENABLE_FRAME));
        assert_eq!(encode_disable(1).1[7], 0xFD);
        assert_eq!(encode_zero(1).1[7], 0xFE);
        assert!(encode_enable(5).1[..7].iter().all(|&b| b == 0xFF));
        assert!(is_disable_payload(&DISABLE_FRAME));
        assert!(!is_enable_payload(&ZERO_FRAME));
        assert!(is_zero_payload(&ZERO_FRAME));
    }

    #[test]
    fn test_velocity_frame() {
        let (address, payload) = encode_velocity(3, 1.25).unwrap();
        assert_eq!(address, 0x203);
        assert_eq!(&payload[4..], &[0, 0, 0, 0]);
        assert_eq!(decode_velocity_payload(&payload).unwrap(), 1.25);
        assert!(encode_velocity(3, f64::NAN).is_err());
        assert!(encode_velocity(3, 1e300).is_err());
    }

    #[test]
    fn test_position_velocity_frame() {
        let (address, payload) = encode_position_velocity(2, 1.0, -2.0).unwrap();
        assert_eq!(address, 0x102);
        assert_eq!(decode_position_velocity_payload(&payload).unwrap(), (1.0, -2.0));
    }

    #[test]
    fn test_mit_address() {
        let target = MitTarget::new(0.5, -0.2, 0.8, 60.0, 2.0);
        let (address, payload) = encode_mit(3, &target).unwrap();
        assert_eq!(address, 0x303);
        assert_eq!(payload.len(), 8);
    }

    #[test]
    fn test_decode_feedback_fields() {
        let frame = feedback_bytes(1, 2, 0x1234, 0x07F, 0x801, 45, 50);
        let feedback = decode_feedback(&frame).unwrap();
        assert_eq!(feedback.esc_id, 2);
        assert_eq!(feedback.status, 1);
        assert_eq!(feedback.position_raw, 0x1234);
        assert_eq!(feedback.velocity_raw, 0x07F);
        assert_eq!(feedback.torque_raw, -0x7FF);
        assert_eq!(feedback.temp_mos, 45);
        assert_eq!(feedback.temp_rotor, 50);

        let engineering = feedback.to_engineering(ScaleLimits::default());
        assert_eq!(engineering.temp_mos_c, 45.0);
        assert!((engineering.velocity_rad_s - 0x07F as f64 / 2047.0 * 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_feedback_sign_boundaries() {
        // (wire value, expected signed value) for the 16-bit and 12-bit fields
        let pos_cases = [(0x0000u16, 0i16), (0x7FFF, 32767), (0x8000, -32768), (0xFFFF, -1)];
        let s12_cases = [(0x000u16, 0i16), (0x7FF, 2047), (0x800, -2048), (0xFFF, -1)];

        for &(pos_wire, pos) in &pos_cases {
            for &(vel_wire, vel) in &s12_cases {
                for &(tq_wire, tq) in &s12_cases {
                    let frame = feedback_bytes(0xF, 0xF, pos_wire, vel_wire, tq_wire, 0, 255);
                    let decoded = decode_feedback(&frame).unwrap();
                    assert_eq!(decoded.position_raw, pos);
                    assert_eq!(decoded.velocity_raw, vel);
                    assert_eq!(decoded.torque_raw, tq);
                    assert_eq!(decoded.status, 0xF);
                    assert_eq!(decoded.esc_id, 0xF);
                    assert_eq!(encode_feedback(&decoded), frame);
                }
            }
        }
    }

    #[test]
    fn test_decode_feedback_rejects_wrong_length() {
        assert!(decode_feedback(&[0u8; 7]).unwrap_err().is_malformed());
        assert!(decode_feedback(&[0u8; 9]).unwrap_err().is_malformed());
        assert!(decode_feedback(&[]).is_err());
    }

    #[test]
    fn test_engineering_scaling() {
        let raw = FeedbackRaw {
            esc_id: 1,
            status: 1,
            position_raw: 32767,
            velocity_raw: -2047,
            torque_raw: 2047,
            temp_mos: 30,
            temp_rotor: 31,
        };
        let eng = scale_to_engineering(&raw, 12.5, 45.0, 18.0);
        assert!((eng.position_rad - 12.5).abs() < 1e-12);
        assert!((eng.velocity_rad_s + 45.0).abs() < 1e-12);
        assert!((eng.torque_nm - 18.0).abs() < 1e-12);
    }

    #[test]
    fn test_management_frames() {
        let (address, payload) = encode_param_write(1, params::RID_ESC_ID, 2);
        assert_eq!(address, MANAGEMENT_ADDRESS);
        assert_eq!(payload, [0x01, 0x00, 0x55, 0x08, 0x02, 0x00, 0x00, 0x00]);

        assert_eq!(encode_param_read(0x102, params::RID_P_MAX).1[..4], [0x02, 0x01, 0x33, 0x15]);
        assert_eq!(encode_param_save(1).1[2], params::MANAGEMENT_SAVE);
        assert_eq!(encode_param_refresh(1).1[2], params::MANAGEMENT_REFRESH);

        let response = decode_management_response(&payload).unwrap();
        assert_eq!(response.esc_id, 1);
        assert_eq!(response.command, params::MANAGEMENT_WRITE);
        assert_eq!(response.rid, params::RID_ESC_ID);
        assert_eq!(response.value, 2);
        assert!(decode_management_response(&payload[..4]).is_err());
    }

    #[test]
    fn test_management_value_as_float() {
        let response = ManagementResponse {
            esc_id: 1,
            command: params::MANAGEMENT_READ,
            rid: params::RID_P_MAX,
            value: u32::from_le_bytes(12.5f32.to_le_bytes()),
        };
        assert_eq!(response.value_f32(), 12.5);
        let payload = encode_management_response(&response);
        assert_eq!(decode_management_response(&payload).unwrap(), response);
    }

    #[test]
    fn test_build_filters_dedup() {
        let filters = build_filters([0x101, 0x101, 0x7FF]);
        assert_eq!(
            filters,
            vec![FilterRule::exact(0x101), FilterRule::exact(MANAGEMENT_ADDRESS)]
        );
    }

    #[test]
    fn test_build_filters_appends_management() {
        let filters = build_filters([0x12, 0x11]);
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0].can_id, 0x12);
        assert_eq!(filters[2].can_id, MANAGEMENT_ADDRESS);
        assert_eq!(build_filters(Vec::new()).len(), 1);
    }

    #[test]
    fn test_filter_rule_matching() {
        let rule = FilterRule::exact(0x11);
        assert!(rule.matches(0x11, false));
        assert!(!rule.matches(0x12, false));
        assert!(!rule.matches(0x11, true));
    }
}
