//! Raw CAN frame representation and the [`FrameIo`] transport abstraction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::IoError;

/// A single raw CAN frame, as read from or written to the bus.
///
/// Immutable once constructed; the arrival timestamp is stamped by the I/O layer, not the
/// caller, so it always reflects when the frame was actually observed.
#[derive(Debug, Clone)]
pub struct CanFrame {
    id: u32,
    is_extended: bool,
    data: Vec<u8>,
    arrived_at: Instant,
}

impl CanFrame {
    /// Builds a frame with `arrived_at` stamped to now. Used by producers (senders, test
    /// doubles); frames read off a live bus should prefer [`CanFrame::with_timestamp`].
    pub fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        Self::with_timestamp(id, data, is_extended, Instant::now())
    }

    /// Builds a frame with an explicit arrival timestamp.
    pub fn with_timestamp(id: u32, data: &[u8], is_extended: bool, arrived_at: Instant) -> Self {
        assert!(data.len() <= 8, "CAN 2.0 frames carry at most 8 bytes");
        Self {
            id,
            is_extended,
            data: data.to_vec(),
            arrived_at,
        }
    }

    /// Arbitration ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether `id` is a 29-bit extended identifier (as opposed to an 11-bit standard one).
    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    /// Frame payload, 0 to 8 bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Monotonic instant this frame was observed on the bus.
    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }
}

/// Observed state of the CAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// The controller is transmitting and receiving normally.
    Active,
    /// The controller has entered the bus-off state and needs to be reset.
    BusOff,
}

/// Uniform frame send/receive interface. Every other component in this crate takes its CAN
/// access through this trait rather than a concrete hardware type.
pub trait FrameIo {
    /// Transmits a single frame.
    fn send(&mut self, frame: &CanFrame) -> Result<(), IoError>;

    /// Waits up to `timeout` for the next frame. Returns `Ok(None)` on timeout, never on a
    /// closed channel (callers distinguish a closed bus via [`FrameIo::state`]).
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, IoError>;

    /// Current controller state.
    fn state(&self) -> BusState;
}

/// In-memory loopback [`FrameIo`], usable both as a test double and for `--listen-only`
/// smoke-testing of the monitor pipeline without real hardware.
///
/// Frames pushed with [`LoopbackFrameIo::inject`] are what `recv` returns; frames passed to
/// `send` are recorded and can be inspected with [`LoopbackFrameIo::sent`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackFrameIo {
    inbound: Arc<Mutex<VecDeque<CanFrame>>>,
    outbound: Arc<Mutex<Vec<CanFrame>>>,
    bus_off: Arc<Mutex<bool>>,
}

impl LoopbackFrameIo {
    /// Creates an empty loopback device in the `Active` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame to be returned by a future `recv` call.
    pub fn inject(&self, frame: CanFrame) {
        self.inbound.lock().unwrap().push_back(frame);
    }

    /// Returns every frame previously passed to `send`, in send order.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.outbound.lock().unwrap().clone()
    }

    /// Forces the device into the `BusOff` state, as observed by [`FrameIo::state`].
    pub fn set_bus_off(&self, off: bool) {
        *self.bus_off.lock().unwrap() = off;
    }
}

impl FrameIo for LoopbackFrameIo {
    fn send(&mut self, frame: &CanFrame) -> Result<(), IoError> {
        if *self.bus_off.lock().unwrap() {
            return Err(IoError::BusOff);
        }
        self.outbound.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<CanFrame>, IoError> {
        if *self.bus_off.lock().unwrap() {
            return Err(IoError::BusOff);
        }
        Ok(self.inbound.lock().unwrap().pop_front())
    }

    fn state(&self) -> BusState {
        if *self.bus_off.lock().unwrap() {
            BusState::BusOff
        } else {
            BusState::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_recv_returns_injected_frame() {
        let mut io = LoopbackFrameIo::new();
        io.inject(CanFrame::new(0x7E8, &[0x02, 0x10, 0x03], false));
        let frame = io.recv(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(frame.id(), 0x7E8);
        assert_eq!(frame.data(), &[0x02, 0x10, 0x03]);
    }

    #[test]
    fn loopback_recv_times_out_to_none() {
        let mut io = LoopbackFrameIo::new();
        assert!(io.recv(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn loopback_records_sent_frames() {
        let mut io = LoopbackFrameIo::new();
        io.send(&CanFrame::new(0x7E0, &[0x01, 0x3E], false)).unwrap();
        assert_eq!(io.sent().len(), 1);
        assert_eq!(io.sent()[0].id(), 0x7E0);
    }

    #[test]
    fn loopback_bus_off_rejects_send_and_recv() {
        let mut io = LoopbackFrameIo::new();
        io.set_bus_off(true);
        assert!(matches!(io.state(), BusState::BusOff));
        assert!(matches!(
            io.send(&CanFrame::new(0x100, &[], false)),
            Err(IoError::BusOff)
        ));
        assert!(matches!(
            io.recv(Duration::from_millis(1)),
            Err(IoError::BusOff)
        ));
    }
}
