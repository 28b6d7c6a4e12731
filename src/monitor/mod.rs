//! The frame monitor pipeline: receive loop, signal decode, passive UDS reassembly, transport
//! fan-out, and the reconnect/backoff state machine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dtc::Severity;
use crate::error::IoError;
use crate::frame::{BusState, CanFrame, FrameIo};
use crate::metrics::Metrics;
use crate::reassembler::{PassiveReassembler, ReassemblyEvent};
use crate::signal_db::{DecodedSignals, SignalDatabase};
use crate::transport::TransportHandle;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_millis(100);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of the monitor's reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No bus connection; the reconnect loop will attempt to (re-)establish one.
    Disconnected,
    /// Bringing the interface up / constructing a fresh pipeline.
    Connecting,
    /// Steady-state frame processing.
    Running,
    /// An error occurred in `Running`; waiting out the backoff delay before reconnecting.
    Restarting,
}

/// Outcome of one pass through the inner (steady-state) receive loop, replacing the source's
/// exception-driven loop exit with an explicit value.
#[derive(Debug)]
pub enum FrameLoopOutcome {
    /// The caller requested a clean stop (e.g. user interrupt).
    Stopped,
    /// An error occurred; the reconnect loop should back off and try again.
    Restart(String),
}

/// Drives one CAN bus connection: decodes frames against a chain of signal databases, routes
/// overheard UDS responses to a passive reassembler, and forwards serialized records to a
/// transport queue. Owns no reconnect policy itself — see [`run_with_reconnect`].
pub struct MonitorPipeline<IO: FrameIo> {
    io: IO,
    databases: Vec<Box<dyn SignalDatabase>>,
    reassembler: Option<PassiveReassembler>,
    transport: Option<TransportHandle>,
    metrics: Arc<Metrics>,
    print_raw: bool,
    missing_ids: HashSet<u32>,
}

impl<IO: FrameIo> MonitorPipeline<IO> {
    /// Builds a pipeline over an already-open frame transport.
    pub fn new(io: IO, databases: Vec<Box<dyn SignalDatabase>>, metrics: Arc<Metrics>) -> Self {
        Self {
            io,
            databases,
            reassembler: None,
            transport: None,
            metrics,
            print_raw: false,
            missing_ids: HashSet::new(),
        }
    }

    /// Enables passive UDS reassembly of overheard ECU responses.
    pub fn with_reassembler(mut self, reassembler: PassiveReassembler) -> Self {
        self.reassembler = Some(reassembler);
        self
    }

    /// Enables forwarding decoded frames to an outbound transport queue.
    pub fn with_transport(mut self, transport: TransportHandle) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Enables `id=0x... raw=... decoded=...`-style stdout logging of every frame.
    pub fn with_print_raw(mut self, print_raw: bool) -> Self {
        self.print_raw = print_raw;
        self
    }

    fn decode(&mut self, id: u32, bytes: &[u8]) -> Option<DecodedSignals> {
        for db in &self.databases {
            match db.decode(id, bytes) {
                Ok(signals) => return Some(signals),
                Err(crate::error::DecodeError::NotFound(_)) => continue,
                Err(e) => {
                    self.metrics.record_decoding_failure();
                    log::warn!("decode error for id 0x{id:X}: {e}");
                    return None;
                }
            }
        }
        if self.missing_ids.insert(id) {
            log::info!("no signal definition for CAN id 0x{id:X}");
        } else {
            log::debug!("no signal definition for CAN id 0x{id:X} (repeat)");
        }
        None
    }

    fn log_dtc_events(&self, payload_dtcs: &[crate::dtc::DtcEntry]) {
        for dtc in payload_dtcs {
            if matches!(dtc.info.severity, Severity::Critical) && dtc.info.alert {
                log::warn!(
                    "*** ALERT: Critical DTC {} detected - {} ***",
                    dtc.code,
                    dtc.info.description
                );
            } else {
                log::info!("DTC {} observed (status 0x{:02X})", dtc.code, dtc.status_byte);
            }
        }
    }

    fn process_frame(&mut self, frame: CanFrame) {
        if let Some(reassembler) = self.reassembler.as_mut() {
            if frame.id() == reassembler.response_id() {
                if let Some(event) = reassembler.on_frame(&frame, &mut self.io) {
                    match event {
                        ReassemblyEvent::Complete { dtcs: Some(dtcs), .. } => {
                            self.log_dtc_events(&dtcs)
                        }
                        ReassemblyEvent::Complete { .. } | ReassemblyEvent::StartOfMessage => {}
                        ReassemblyEvent::Error(e) => {
                            self.metrics.record_decoding_failure();
                            log::warn!("UDS reassembly error: {e}");
                        }
                    }
                }
                return;
            }
        }

        let decoded = self.decode(frame.id(), frame.data());
        let raw_hex: String = frame.data().iter().map(|b| format!("{b:02X}")).collect();
        if self.print_raw {
            let id = if frame.is_extended() {
                format!("{:08X}", frame.id())
            } else {
                format!("{:03X}", frame.id())
            };
            match &decoded {
                Some(d) => log::info!("id=0x{id} raw={raw_hex} decoded={d:?}"),
                None => log::info!("id=0x{id} raw={raw_hex}"),
            }
        }

        if let Some(handle) = &self.transport {
            let record = serde_json::json!({
                "id": frame.id(),
                "raw": raw_hex,
                "decoded": decoded,
            });
            if !handle.try_enqueue(record.to_string()) {
                log::warn!("transport queue full; dropping frame 0x{:X}", frame.id());
            }
        }
    }

    /// Runs the steady-state receive loop until `stop` is set or an error forces a reconnect.
    pub fn run_inner(&mut self, stop: &AtomicBool) -> FrameLoopOutcome {
        loop {
            if stop.load(Ordering::Relaxed) {
                return FrameLoopOutcome::Stopped;
            }
            match self.io.recv(RECV_TIMEOUT) {
                Ok(Some(frame)) => self.process_frame(frame),
                Ok(None) => {
                    if self.io.state() == BusState::BusOff {
                        self.metrics.record_bus_error();
                        return FrameLoopOutcome::Restart("bus went off".to_string());
                    }
                    std::thread::sleep(IDLE_SLEEP);
                }
                Err(e) => {
                    self.metrics.record_bus_error();
                    return FrameLoopOutcome::Restart(e.to_string());
                }
            }
        }
    }
}

/// Drives the full `DISCONNECTED -> CONNECTING -> RUNNING -> RESTARTING -> ...` reconnect loop.
///
/// `factory` (re-)establishes the bus connection and builds a fresh [`MonitorPipeline`]; it is
/// invoked once per `CONNECTING` entry, mirroring the source's habit of re-running interface
/// setup on every reconnect attempt. Returns the process exit code: `0` for a clean stop via
/// `stop`, `1` if `factory` itself fails (an unrecoverable startup error).
pub fn run_with_reconnect<IO: FrameIo>(
    mut factory: impl FnMut() -> Result<MonitorPipeline<IO>, IoError>,
    stop: &AtomicBool,
    metrics: Arc<Metrics>,
) -> i32 {
    let mut state = MonitorState::Disconnected;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if stop.load(Ordering::Relaxed) {
            return 0;
        }
        state = MonitorState::Connecting;
        log::debug!("monitor state -> {state:?}");
        let mut pipeline = match factory() {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to establish CAN connection: {e}");
                return 1;
            }
        };

        state = MonitorState::Running;
        backoff = BACKOFF_INITIAL;
        log::info!("monitor state -> {state:?}");
        match pipeline.run_inner(stop) {
            FrameLoopOutcome::Stopped => return 0,
            FrameLoopOutcome::Restart(cause) => {
                state = MonitorState::Restarting;
                metrics.record_restart();
                log::warn!("monitor restarting ({cause}), sleeping {backoff:?}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_CAP);
                state = MonitorState::Disconnected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::LoopbackFrameIo;
    use crate::signal_db::DecodedSignals as DS;
    use std::sync::atomic::AtomicBool;

    struct AlwaysFound;
    impl SignalDatabase for AlwaysFound {
        fn decode(&self, _id: u32, _bytes: &[u8]) -> Result<DS, crate::error::DecodeError> {
            Ok(DS::new())
        }
    }

    #[test]
    fn restart_on_bus_off_and_clean_stop_on_flag() {
        let io = LoopbackFrameIo::new();
        let metrics = Arc::new(Metrics::new());
        let mut pipeline = MonitorPipeline::new(io.clone(), vec![Box::new(AlwaysFound)], metrics);
        io.set_bus_off(true);
        let stop = AtomicBool::new(false);
        let outcome = pipeline.run_inner(&stop);
        assert!(matches!(outcome, FrameLoopOutcome::Restart(_)));
    }

    #[test]
    fn clean_stop_returns_stopped() {
        let io = LoopbackFrameIo::new();
        let metrics = Arc::new(Metrics::new());
        let mut pipeline = MonitorPipeline::new(io, vec![Box::new(AlwaysFound)], metrics);
        let stop = AtomicBool::new(true);
        assert!(matches!(pipeline.run_inner(&stop), FrameLoopOutcome::Stopped));
    }

    #[test]
    fn reconnect_loop_doubles_backoff_and_caps_at_30s_is_observable_via_restarts() {
        let metrics = Arc::new(Metrics::new());
        let stop = AtomicBool::new(false);
        let mut attempts = 0;
        let result = run_with_reconnect(
            || {
                attempts += 1;
                if attempts >= 3 {
                    stop.store(true, Ordering::Relaxed);
                }
                let io = LoopbackFrameIo::new();
                io.set_bus_off(true);
                Ok::<_, IoError>(MonitorPipeline::new(io, vec![Box::new(AlwaysFound)], metrics.clone()))
            },
            &stop,
            metrics.clone(),
        );
        assert_eq!(result, 0);
        assert!(metrics.get_snapshot().restarts >= 2);
    }
}
