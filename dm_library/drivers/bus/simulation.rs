//! Simulation CAN driver
//!
//! An in-process bus with frame injection and capture. Motors can be attached
//! with [`SimulationCanDriver::add_motor`]; they answer command frames with
//! feedback on their `mst_id` and answer management requests on `0x7FF`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use dm_core::config::ScaleLimits;
use dm_core::driver::DriverStatus;
use dm_core::error::{DmError, DmResult};

use super::CanFrame;
use crate::protocol::{
    self, params, FeedbackRaw, FilterRule, ManagementResponse, MANAGEMENT_ADDRESS, MIT_BASE,
    POSITION_VELOCITY_BASE, VELOCITY_BASE,
};

const SIM_TEMP_MOS: u8 = 32;
const SIM_TEMP_ROTOR: u8 = 30;

/// State of one simulated motor
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedMotor {
    pub esc_id: u8,
    pub mst_id: u16,
    pub enabled: bool,
    pub position_rad: f64,
    pub velocity_rad_s: f64,
    pub torque_nm: f64,
    pub control_mode: u32,
    pub limits: ScaleLimits,
    /// Silent motors accept frames but never answer
    pub silent: bool,
    /// Id writes take effect on save
    pending_esc_id: Option<u8>,
    pending_mst_id: Option<u16>,
}

impl SimulatedMotor {
    pub fn new(esc_id: u8, mst_id: u16) -> Self {
        Self {
            esc_id,
            mst_id,
            enabled: false,
            position_rad: 0.0,
            velocity_rad_s: 0.0,
            torque_nm: 0.0,
            control_mode: params::ControlMode::Velocity.as_u32(),
            limits: ScaleLimits::default(),
            silent: false,
            pending_esc_id: None,
            pending_mst_id: None,
        }
    }

    fn raw_feedback(&self) -> FeedbackRaw {
        let quantize = |value: f64, max: f64, full: f64| -> i16 {
            ((value / max).clamp(-1.0, 1.0) * full).round() as i16
        };
        FeedbackRaw {
            esc_id: self.esc_id & 0x0F,
            status: u8::from(self.enabled),
            position_raw: quantize(self.position_rad, self.limits.p_max, 32767.0),
            velocity_raw: quantize(self.velocity_rad_s, self.limits.v_max, 2047.0),
            torque_raw: quantize(self.torque_nm, self.limits.t_max, 2047.0),
            temp_mos: SIM_TEMP_MOS,
            temp_rotor: SIM_TEMP_ROTOR,
        }
    }

    fn feedback_frame(&self) -> CanFrame {
        CanFrame::new(self.mst_id as u32, &protocol::encode_feedback(&self.raw_feedback()))
    }

    fn read_register(&self, rid: u8) -> Option<u32> {
        let f = |v: f64| u32::from_le_bytes((v as f32).to_le_bytes());
        match rid {
            params::RID_ESC_ID => Some(self.esc_id as u32),
            params::RID_MST_ID => Some(self.mst_id as u32),
            params::RID_CTRL_MODE => Some(self.control_mode),
            params::RID_P_MAX => Some(f(self.limits.p_max)),
            params::RID_V_MAX => Some(f(self.limits.v_max)),
            params::RID_T_MAX => Some(f(self.limits.t_max)),
            _ => None,
        }
    }

    /// Apply one command frame, returning the reply if any
    fn handle(&mut self, frame: &CanFrame) -> Option<CanFrame> {
        let esc = self.esc_id as u32;
        let data = frame.data.as_slice();

        if frame.id == MANAGEMENT_ADDRESS {
            let request = protocol::decode_management_response(data).ok()?;
            if request.esc_id != self.esc_id as u16 {
                return None;
            }
            let value = match request.command {
                params::MANAGEMENT_READ => self.read_register(request.rid)?,
                params::MANAGEMENT_WRITE => {
                    match request.rid {
                        params::RID_ESC_ID => self.pending_esc_id = Some(request.value as u8),
                        params::RID_MST_ID => self.pending_mst_id = Some(request.value as u16),
                        params::RID_CTRL_MODE => self.control_mode = request.value,
                        _ => {}
                    }
                    request.value
                }
                params::MANAGEMENT_SAVE => {
                    if let Some(esc_id) = self.pending_esc_id.take() {
                        self.esc_id = esc_id;
                    }
                    if let Some(mst_id) = self.pending_mst_id.take() {
                        self.mst_id = mst_id;
                    }
                    0
                }
                params::MANAGEMENT_REFRESH => 0,
                _ => return None,
            };
            let response = ManagementResponse {
                esc_id: request.esc_id,
                command: request.command,
                rid: request.rid,
                value,
            };
            return Some(CanFrame::new(
                MANAGEMENT_ADDRESS,
                &protocol::encode_management_response(&response),
            ));
        }

        if frame.id == esc {
            if protocol::is_enable_payload(data) {
                self.enabled = true;
            } else if protocol::is_disable_payload(data) {
                self.enabled = false;
                self.velocity_rad_s = 0.0;
            } else if protocol::is_zero_payload(data) {
                self.position_rad = 0.0;
            } else {
                return None;
            }
        } else if frame.id == VELOCITY_BASE + esc {
            let velocity = protocol::decode_velocity_payload(data).ok()?;
            if self.enabled {
                self.velocity_rad_s = velocity as f64;
            }
        } else if frame.id == POSITION_VELOCITY_BASE + esc {
            let (position, velocity) = protocol::decode_position_velocity_payload(data).ok()?;
            if self.enabled {
                self.position_rad = position as f64;
                self.velocity_rad_s = velocity as f64;
            }
        } else if frame.id == MIT_BASE + esc {
            let values = protocol::decode_mit(data, &protocol::MitLimits::default()).ok()?;
            if self.enabled {
                self.position_rad = values.position_rad;
                self.velocity_rad_s = values.velocity_rad_s;
                self.torque_nm = values.torque_nm;
            }
        } else {
            return None;
        }

        Some(self.feedback_frame())
    }
}

struct SimState {
    status: DriverStatus,
    rx_queue: VecDeque<CanFrame>,
    tx_history: Vec<CanFrame>,
    motors: Vec<SimulatedMotor>,
    filters: Vec<FilterRule>,
    fail_writes: bool,
    fail_filters: bool,
    open_fails: bool,
    periodic_supported: bool,
}

/// Simulation CAN bus driver
pub struct SimulationCanDriver {
    state: Mutex<SimState>,
    rx_ready: Condvar,
}

impl SimulationCanDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                status: DriverStatus::Uninitialized,
                rx_queue: VecDeque::new(),
                tx_history: Vec::new(),
                motors: Vec::new(),
                filters: Vec::new(),
                fail_writes: false,
                fail_filters: false,
                open_fails: false,
                periodic_supported: true,
            }),
            rx_ready: Condvar::new(),
        }
    }

    /// Inject a CAN frame to be received on a later read
    pub fn inject_frame(&self, id: u32, data: &[u8]) {
        self.state.lock().rx_queue.push_back(CanFrame::new(id, data));
        self.rx_ready.notify_all();
    }

    /// Attach a simulated motor to the bus
    pub fn add_motor(&self, esc_id: u8, mst_id: u16) {
        self.add_simulated_motor(SimulatedMotor::new(esc_id, mst_id));
    }

    pub fn add_simulated_motor(&self, motor: SimulatedMotor) {
        let mut state = self.state.lock();
        state.motors.retain(|m| m.esc_id != motor.esc_id);
        state.motors.push(motor);
    }

    /// Snapshot of one simulated motor
    pub fn motor(&self, esc_id: u8) -> Option<SimulatedMotor> {
        self.state.lock().motors.iter().find(|m| m.esc_id == esc_id).cloned()
    }

    /// Frames written so far, oldest first
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state.lock().tx_history.clone()
    }

    pub fn clear_history(&self) {
        self.state.lock().tx_history.clear();
    }

    /// Make every write fail with a transport error
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make `set_filters` fail with a transport error
    pub fn set_fail_filters(&self, fail: bool) {
        self.state.lock().fail_filters = fail;
    }

    /// Make the next `open` fail with a transport error
    pub fn set_open_fails(&self, fail: bool) {
        self.state.lock().open_fails = fail;
    }

    /// Toggle support for periodic transmit tasks
    pub fn set_periodic_supported(&self, supported: bool) {
        self.state.lock().periodic_supported = supported;
    }

    pub fn supports_periodic(&self) -> bool {
        self.state.lock().periodic_supported
    }

    /// Filters most recently pushed down by the bus manager
    pub fn filters(&self) -> Vec<FilterRule> {
        self.state.lock().filters.clone()
    }

    pub fn open(&self) -> DmResult<()> {
        let mut state = self.state.lock();
        if state.open_fails {
            state.status = DriverStatus::Error("open failed".to_string());
            return Err(DmError::transport("Simulated CAN bus refused to open"));
        }
        state.status = DriverStatus::Ready;
        Ok(())
    }

    pub fn close(&self) -> DmResult<()> {
        self.state.lock().status = DriverStatus::Shutdown;
        self.rx_ready.notify_all();
        Ok(())
    }

    pub fn status(&self) -> DriverStatus {
        self.state.lock().status.clone()
    }

    pub fn write_frame(&self, frame: &CanFrame) -> DmResult<()> {
        let mut state = self.state.lock();
        if !state.status.is_operational() {
            return Err(DmError::transport("Simulated CAN bus not open"));
        }
        if state.fail_writes {
            return Err(DmError::transport(format!(
                "Simulated write failure for frame 0x{:03X}",
                frame.id
            )));
        }
        state.status = DriverStatus::Running;
        state.tx_history.push(frame.clone());

        let replies: Vec<CanFrame> = state
            .motors
            .iter_mut()
            .filter(|m| !m.silent)
            .filter_map(|m| m.handle(frame))
            .collect();
        if !replies.is_empty() {
            state.rx_queue.extend(replies);
            drop(state);
            self.rx_ready.notify_all();
        }
        Ok(())
    }

    pub fn read_frame(&self, timeout: Duration) -> DmResult<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if !state.status.is_operational() {
                return Ok(None);
            }
            if let Some(frame) = state.rx_queue.pop_front() {
                return Ok(Some(frame));
            }
            if self.rx_ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.rx_queue.pop_front());
            }
        }
    }

    pub fn set_filters(&self, filters: &[FilterRule]) -> DmResult<()> {
        let mut state = self.state.lock();
        if state.fail_filters {
            return Err(DmError::transport("Simulated CAN bus rejected the filter set"));
        }
        state.filters = filters.to_vec();
        Ok(())
    }
}

impl Default for SimulationCanDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_open() {
        let driver = SimulationCanDriver::new();
        let frame = CanFrame::new(1, &protocol::ENABLE_FRAME);
        assert!(driver.write_frame(&frame).unwrap_err().is_transport());

        driver.open().unwrap();
        driver.write_frame(&frame).unwrap();
        assert_eq!(driver.sent_frames(), vec![frame]);
        assert_eq!(driver.status(), DriverStatus::Running);
    }

    #[test]
    fn test_injected_frames_are_read_in_order() {
        let driver = SimulationCanDriver::new();
        driver.open().unwrap();
        driver.inject_frame(0x11, &[1; 8]);
        driver.inject_frame(0x12, &[2; 8]);

        let timeout = Duration::from_millis(10);
        assert_eq!(driver.read_frame(timeout).unwrap().unwrap().id, 0x11);
        assert_eq!(driver.read_frame(timeout).unwrap().unwrap().id, 0x12);
        assert!(driver.read_frame(timeout).unwrap().is_none());
    }

    #[test]
    fn test_motor_answers_disable_with_feedback() {
        let driver = SimulationCanDriver::new();
        driver.open().unwrap();
        driver.add_motor(2, 0x12);

        let (address, payload) = protocol::encode_disable(2);
        driver.write_frame(&CanFrame::new(address, &payload)).unwrap();

        let reply = driver.read_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(reply.id, 0x12);
        let feedback = protocol::decode_feedback(&reply.data).unwrap();
        assert_eq!(feedback.esc_id, 2);
        assert_eq!(feedback.status, 0);
    }

    #[test]
    fn test_motor_answers_parameter_read() {
        let driver = SimulationCanDriver::new();
        driver.open().unwrap();
        driver.add_motor(1, 0x11);

        let (address, payload) = protocol::encode_param_read(1, params::RID_V_MAX);
        driver.write_frame(&CanFrame::new(address, &payload)).unwrap();

        let reply = driver.read_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(reply.id, MANAGEMENT_ADDRESS);
        let response = protocol::decode_management_response(&reply.data).unwrap();
        assert_eq!(response.command, params::MANAGEMENT_READ);
        assert_eq!(response.rid, params::RID_V_MAX);
        assert_eq!(response.value_f32(), 30.0);
    }

    #[test]
    fn test_toggles() {
        let driver = SimulationCanDriver::new();
        driver.set_open_fails(true);
        assert!(driver.open().is_err());
        driver.set_open_fails(false);
        driver.open().unwrap();

        driver.set_fail_writes(true);
        assert!(driver.write_frame(&CanFrame::new(1, &[0; 8])).is_err());
        assert!(driver.sent_frames().is_empty());

        driver.set_fail_filters(true);
        assert!(driver.set_filters(&[FilterRule::exact(0x11)]).is_err());
        assert!(driver.filters().is_empty());

        driver.set_periodic_supported(false);
        assert!(!driver.supports_periodic());
    }
}
