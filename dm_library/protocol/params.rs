//! Register ids and management opcodes

pub const RID_MST_ID: u8 = 0x07;
pub const RID_ESC_ID: u8 = 0x08;
pub const RID_CTRL_MODE: u8 = 0x0A;
pub const RID_P_MAX: u8 = 0x15;
pub const RID_V_MAX: u8 = 0x16;
pub const RID_T_MAX: u8 = 0x17;

pub const MANAGEMENT_WRITE: u8 = 0x55;
pub const MANAGEMENT_SAVE: u8 = 0xAA;
pub const MANAGEMENT_READ: u8 = 0x33;
pub const MANAGEMENT_REFRESH: u8 = 0xCC;

/// Value written to `RID_CTRL_MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Mit = 1,
    PositionVelocity = 2,
    Velocity = 3,
}

impl ControlMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::str::FromStr for ControlMode {
    type Err = dm_core::DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mit" | "1" => Ok(Self::Mit),
            "pos-vel" | "position-velocity" | "2" => Ok(Self::PositionVelocity),
            "vel" | "velocity" | "3" => Ok(Self::Velocity),
            other => Err(dm_core::DmError::invalid_input(format!(
                "unknown control mode '{}'",
                other
            ))),
        }
    }
}

/// Human-readable register name for logs
pub fn rid_name(rid: u8) -> &'static str {
    match rid {
        RID_MST_ID => "MST_ID",
        RID_ESC_ID => "ESC_ID",
        RID_CTRL_MODE => "CTRL_MODE",
        RID_P_MAX => "P_MAX",
        RID_V_MAX => "V_MAX",
        RID_T_MAX => "T_MAX",
        _ => "UNKNOWN",
    }
}
