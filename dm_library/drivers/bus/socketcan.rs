//! SocketCAN driver
//!
//! CAN bus driver using Linux SocketCAN interface.
//! Requires the `can-hardware` feature.

use std::io::ErrorKind;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socketcan::{
    CanFilter, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, SocketOptions, StandardId,
};

use dm_core::driver::DriverStatus;
use dm_core::error::{DmError, DmResult};

use super::CanFrame;
use crate::protocol::FilterRule;

const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// SocketCAN driver
pub struct SocketCanDriver {
    interface: String,
    status: Mutex<DriverStatus>,
    socket: RwLock<Option<CanSocket>>,
}

impl SocketCanDriver {
    /// Create a driver for `interface` (e.g. "can0", "vcan0")
    pub fn new(interface: &str) -> DmResult<Self> {
        if interface.is_empty() {
            return Err(DmError::invalid_input("CAN interface name must not be empty"));
        }
        Ok(Self {
            interface: interface.to_string(),
            status: Mutex::new(DriverStatus::Uninitialized),
            socket: RwLock::new(None),
        })
    }

    pub fn open(&self) -> DmResult<()> {
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            *self.status.lock() = DriverStatus::Error(e.to_string());
            DmError::transport(format!(
                "Failed to open CAN socket {}: {}",
                self.interface, e
            ))
        })?;

        *self.socket.write() = Some(socket);
        *self.status.lock() = DriverStatus::Ready;
        log::info!("Opened SocketCAN interface {}", self.interface);
        Ok(())
    }

    pub fn close(&self) -> DmResult<()> {
        *self.socket.write() = None;
        *self.status.lock() = DriverStatus::Shutdown;
        Ok(())
    }

    pub fn status(&self) -> DriverStatus {
        self.status.lock().clone()
    }

    pub fn write_frame(&self, frame: &CanFrame) -> DmResult<()> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| DmError::transport("CAN socket not initialized"))?;

        let can_frame = if frame.extended {
            ExtendedId::new(frame.id).and_then(|id| socketcan::CanFrame::new(id, &frame.data))
        } else {
            u16::try_from(frame.id)
                .ok()
                .and_then(StandardId::new)
                .and_then(|id| socketcan::CanFrame::new(id, &frame.data))
        }
        .ok_or_else(|| {
            DmError::transport(format!("Failed to create CAN frame 0x{:X}", frame.id))
        })?;

        socket
            .write_frame(&can_frame)
            .map_err(|e| DmError::transport(format!("Failed to send CAN frame: {}", e)))?;

        *self.status.lock() = DriverStatus::Running;
        Ok(())
    }

    pub fn read_frame(&self, timeout: Duration) -> DmResult<Option<CanFrame>> {
        let guard = self.socket.read();
        let socket = match guard.as_ref() {
            Some(socket) => socket,
            None => return Ok(None),
        };

        socket
            .set_read_timeout(timeout)
            .map_err(|e| DmError::transport(format!("Failed to set read timeout: {}", e)))?;

        match socket.read_frame() {
            Ok(frame) => Ok(Some(CanFrame {
                id: frame.raw_id() & !CAN_EFF_FLAG,
                extended: frame.is_extended(),
                rtr: frame.is_remote_frame(),
                data: frame.data().to_vec(),
            })),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(DmError::transport(format!(
                "Failed to receive CAN frame: {}",
                e
            ))),
        }
    }

    /// Push acceptance filters into the kernel
    pub fn set_filters(&self, filters: &[FilterRule]) -> DmResult<()> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| DmError::transport("CAN socket not initialized"))?;

        if filters.is_empty() {
            return socket
                .set_filter_accept_all()
                .map_err(|e| DmError::transport(format!("Failed to clear CAN filters: {}", e)));
        }

        let kernel_filters: Vec<CanFilter> = filters
            .iter()
            .map(|rule| {
                let flag = if rule.extended { CAN_EFF_FLAG } else { 0 };
                CanFilter::new(rule.can_id | flag, rule.can_mask | CAN_EFF_FLAG)
            })
            .collect();

        socket
            .set_filters(&kernel_filters)
            .map_err(|e| DmError::transport(format!("Failed to set CAN filters: {}", e)))
    }
}
