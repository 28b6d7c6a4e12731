//! [`FrameIo`] backed by a real Linux SocketCAN socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::IoError;
use crate::frame::{BusState, CanFrame, FrameIo};

/// Opens a raw CAN socket on `interface` and implements [`FrameIo`] over it.
///
/// Bus-off is detected the way the kernel reports it on a raw socket: `read_frame` returning an
/// error frame with the error class bit set. Once observed, `state()` reports [`BusState::BusOff`]
/// until the caller re-opens the interface (the monitor's reconnect loop does this by dropping
/// and recreating this type).
pub struct SocketCanFrameIo {
    socket: socketcan::CANSocket,
    bus_off: AtomicBool,
}

impl SocketCanFrameIo {
    /// Opens `interface` (e.g. `"can0"`), accepting every frame on the bus.
    pub fn open(interface: &str) -> Result<Self, IoError> {
        let socket = socketcan::CANSocket::open(interface).map_err(|e| {
            IoError::Os(std::io::Error::other(e.to_string()))
        })?;
        socket.filter_accept_all().map_err(IoError::Os)?;
        socket.set_nonblocking(false).map_err(IoError::Os)?;
        Ok(Self {
            socket,
            bus_off: AtomicBool::new(false),
        })
    }
}

impl FrameIo for SocketCanFrameIo {
    fn send(&mut self, frame: &CanFrame) -> Result<(), IoError> {
        if self.bus_off.load(Ordering::Relaxed) {
            return Err(IoError::BusOff);
        }
        let cf = socketcan::CANFrame::new(frame.id(), frame.data(), false, false)
            .map_err(|_| IoError::Os(std::io::Error::other("invalid CAN frame")))?;
        self.socket.write_frame(&cf).map_err(IoError::Os)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, IoError> {
        if self.bus_off.load(Ordering::Relaxed) {
            return Err(IoError::BusOff);
        }
        self.socket
            .set_read_timeout(timeout)
            .map_err(IoError::Os)?;
        match self.socket.read_frame() {
            Ok(frame) => {
                if frame.is_error() {
                    self.bus_off.store(true, Ordering::Relaxed);
                    return Err(IoError::BusOff);
                }
                Ok(Some(CanFrame::new(frame.id(), frame.data(), frame.is_extended())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(IoError::Os(e)),
        }
    }

    fn state(&self) -> BusState {
        if self.bus_off.load(Ordering::Relaxed) {
            BusState::BusOff
        } else {
            BusState::Active
        }
    }
}
