//! MIT-mode fixed-point packing
//!
//! Five fields share one 8-byte frame, most significant bit first:
//!
//! ```text
//! byte   0        1        2        3        4        5        6        7
//!      [ position 16   ][ velocity 12 ][ kp 12        ][ kd 12       ][ torque 12 ]
//! ```

use dm_core::error::{DmError, DmResult};

pub const MIT_DEFAULT_POSITION_LIMIT: f64 = 12.0;
pub const MIT_DEFAULT_VELOCITY_LIMIT: f64 = 30.0;
pub const MIT_DEFAULT_TORQUE_LIMIT: f64 = 20.0;
pub const MIT_DEFAULT_KP_LIMIT: f64 = 400.0;
pub const MIT_DEFAULT_KD_LIMIT: f64 = 10.0;

const POSITION_BITS: u32 = 16;
const VELOCITY_BITS: u32 = 12;
const GAIN_BITS: u32 = 12;
const TORQUE_BITS: u32 = 12;

/// Symmetric limits for position/velocity/torque, upper limits for the gains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MitLimits {
    pub position: f64,
    pub velocity: f64,
    pub torque: f64,
    pub kp: f64,
    pub kd: f64,
}

impl Default for MitLimits {
    fn default() -> Self {
        Self {
            position: MIT_DEFAULT_POSITION_LIMIT,
            velocity: MIT_DEFAULT_VELOCITY_LIMIT,
            torque: MIT_DEFAULT_TORQUE_LIMIT,
            kp: MIT_DEFAULT_KP_LIMIT,
            kd: MIT_DEFAULT_KD_LIMIT,
        }
    }
}

impl MitLimits {
    fn ranges(&self) -> [(f64, f64); 5] {
        let sym = |l: f64| (-l.abs(), l.abs());
        [
            sym(self.position),
            sym(self.velocity),
            (0.0, self.kp.abs()),
            (0.0, self.kd.abs()),
            sym(self.torque),
        ]
    }
}

/// One MIT-mode setpoint together with the limits used to encode it
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MitTarget {
    pub position_rad: f64,
    pub velocity_rad_s: f64,
    pub torque_nm: f64,
    pub kp: f64,
    pub kd: f64,
    pub limits: MitLimits,
}

impl MitTarget {
    pub fn new(position_rad: f64, velocity_rad_s: f64, torque_nm: f64, kp: f64, kd: f64) -> Self {
        Self {
            position_rad,
            velocity_rad_s,
            torque_nm,
            kp,
            kd,
            limits: MitLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: MitLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Values recovered from an MIT payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MitValues {
    pub position_rad: f64,
    pub velocity_rad_s: f64,
    pub torque_nm: f64,
    pub kp: f64,
    pub kd: f64,
}

fn check_range(minimum: f64, maximum: f64) -> DmResult<()> {
    if !minimum.is_finite() || !maximum.is_finite() || maximum <= minimum {
        return Err(DmError::invalid_input(format!(
            "invalid range [{}, {}]: maximum must be greater than minimum",
            minimum, maximum
        )));
    }
    Ok(())
}

/// Clamp `value` into `[minimum, maximum]` and quantize to `bits`
pub fn float_to_uint(value: f64, minimum: f64, maximum: f64, bits: u32) -> DmResult<u32> {
    check_range(minimum, maximum)?;
    if !value.is_finite() {
        return Err(DmError::invalid_input(format!("value must be finite, got {}", value)));
    }
    let scale = ((1u32 << bits) - 1) as f64;
    let clamped = value.clamp(minimum, maximum);
    let normalized = (clamped - minimum) / (maximum - minimum);
    Ok((normalized * scale).round() as u32)
}

/// Inverse of [`float_to_uint`]
pub fn uint_to_float(value: u32, minimum: f64, maximum: f64, bits: u32) -> DmResult<f64> {
    check_range(minimum, maximum)?;
    let scale = (1u32 << bits) - 1;
    let value = value & scale;
    Ok(value as f64 / scale as f64 * (maximum - minimum) + minimum)
}

/// Pack an MIT setpoint into its 8-byte payload
pub fn pack_mit_payload(target: &MitTarget) -> DmResult<[u8; 8]> {
    let [p, v, kp, kd, t] = target.limits.ranges();

    let p_int = float_to_uint(target.position_rad, p.0, p.1, POSITION_BITS)?;
    let v_int = float_to_uint(target.velocity_rad_s, v.0, v.1, VELOCITY_BITS)?;
    let kp_int = float_to_uint(target.kp, kp.0, kp.1, GAIN_BITS)?;
    let kd_int = float_to_uint(target.kd, kd.0, kd.1, GAIN_BITS)?;
    let t_int = float_to_uint(target.torque_nm, t.0, t.1, TORQUE_BITS)?;

    Ok([
        (p_int >> 8) as u8,
        p_int as u8,
        (v_int >> 4) as u8,
        (((v_int & 0x0F) << 4) | ((kp_int >> 8) & 0x0F)) as u8,
        kp_int as u8,
        (kd_int >> 4) as u8,
        (((kd_int & 0x0F) << 4) | ((t_int >> 8) & 0x0F)) as u8,
        t_int as u8,
    ])
}

/// Unpack an MIT payload using `limits`
pub fn decode_mit(payload: &[u8], limits: &MitLimits) -> DmResult<MitValues> {
    if payload.len() != 8 {
        return Err(DmError::malformed(format!(
            "MIT command payload must be 8 bytes, got {}",
            payload.len()
        )));
    }
    let d: Vec<u32> = payload.iter().map(|&b| b as u32).collect();

    let p_int = (d[0] << 8) | d[1];
    let v_int = (d[2] << 4) | (d[3] >> 4);
    let kp_int = ((d[3] & 0x0F) << 8) | d[4];
    let kd_int = (d[5] << 4) | (d[6] >> 4);
    let t_int = ((d[6] & 0x0F) << 8) | d[7];

    let [p, v, kp, kd, t] = limits.ranges();
    Ok(MitValues {
        position_rad: uint_to_float(p_int, p.0, p.1, POSITION_BITS)?,
        velocity_rad_s: uint_to_float(v_int, v.0, v.1, VELOCITY_BITS)?,
        kp: uint_to_float(kp_int, kp.0, kp.1, GAIN_BITS)?,
        kd: uint_to_float(kd_int, kd.0, kd.1, GAIN_BITS)?,
        torque_nm: uint_to_float(t_int, t.0, t.1, TORQUE_BITS)?,
    })
}
