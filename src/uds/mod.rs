//! UDS (ISO 14229) diagnostic client, layered on an [`IsoTpSession`].

pub mod hooks;
pub mod security_access;

use std::time::{Duration, Instant};

use crate::error::DiagError;
use crate::frame::FrameIo;
use crate::isotp::IsoTpConfig;
use crate::isotp::IsoTpSession;

pub use hooks::TDataHooks;

/// UDS service identifiers this client knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Service {
    /// `0x10` DiagnosticSessionControl.
    DiagnosticSessionControl = 0x10,
    /// `0x19` ReadDTCInformation.
    ReadDtcInformation = 0x19,
    /// `0x27` SecurityAccess.
    SecurityAccess = 0x27,
}

/// Diagnostic session type byte for `DiagnosticSessionControl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiagnosticSession {
    /// `0x01` default session.
    Default = 0x01,
    /// `0x02` programming session.
    Programming = 0x02,
    /// `0x03` extended diagnostic session.
    Extended = 0x03,
}

/// An active UDS diagnostic client. Owns the frame transport and the ISO-TP session state for
/// the duration of each request; no background tester-present thread runs (no active session
/// keep-alive is implemented — a caller wanting to hold a non-default session open must keep
/// re-issuing `DiagnosticSessionControl` itself).
pub struct UdsClient<IO: FrameIo> {
    io: IO,
    session: IsoTpSession,
    hooks: TDataHooks,
    key_algo: Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>,
    timeout: Duration,
}

impl<IO: FrameIo> UdsClient<IO> {
    /// Builds a client over `io` addressed per `config`, with the default (bitwise-complement)
    /// security-access key algorithm and no T_Data hooks registered.
    pub fn new(io: IO, config: IsoTpConfig, timeout: Duration) -> Self {
        Self {
            io,
            session: IsoTpSession::new(config),
            hooks: TDataHooks::default(),
            key_algo: Box::new(security_access::default_key_algo),
            timeout,
        }
    }

    /// Registers T_Data observer hooks.
    pub fn with_hooks(mut self, hooks: TDataHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Overrides the security-access key derivation algorithm (the default is a deterministic
    /// bitwise complement; real vehicles use manufacturer-specific algorithms not implemented
    /// here — this is the injection point for one).
    pub fn with_key_algo(
        mut self,
        algo: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.key_algo = Box::new(algo);
        self
    }

    /// Sends `service` with `data` appended and blocks for the response, validating that the
    /// response's first byte is `service + 0x40` and is not a negative-response (`0x7F`).
    pub fn request(&mut self, service: u8, data: &[u8]) -> Result<Vec<u8>, DiagError> {
        let mut req = Vec::with_capacity(data.len() + 1);
        req.push(service);
        req.extend_from_slice(data);

        self.hooks.fire_req(service, data);

        let deadline = Instant::now() + self.timeout;
        let hooks = &self.hooks;
        let on_con = |ok: bool, err: Option<&crate::error::IsoTpError>| {
            hooks.fire_con(ok, err.map(|e| e.to_string()).as_deref());
        };
        if let Err(e) = self
            .session
            .send_payload(&mut self.io, &req, deadline, Some(&on_con))
        {
            return Err(DiagError::IsoTp(e));
        }

        let hooks = &self.hooks;
        let on_som = || hooks.fire_som_ind();
        let response = self
            .session
            .receive_payload(&mut self.io, deadline, Some(&on_som))
            .map_err(DiagError::IsoTp)?;

        if response.is_empty() {
            return Err(DiagError::EmptyResponse);
        }
        if response[0] == 0x7F {
            let code = *response.get(2).unwrap_or(&0);
            return Err(DiagError::EcuError { code, def: None });
        }
        if response[0] != service + 0x40 {
            return Err(DiagError::WrongMessage);
        }
        self.hooks.fire_ind(&response);
        Ok(response)
    }

    /// `DiagnosticSessionControl` (`0x10`).
    pub fn diagnostic_session_control(
        &mut self,
        session: DiagnosticSession,
    ) -> Result<(), DiagError> {
        let resp = self.request(Service::DiagnosticSessionControl as u8, &[session as u8])?;
        if resp.len() < 2 || resp[1] != session as u8 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(())
    }

    /// `SecurityAccess` (`0x27`): requests a seed at `level`, derives (or is given) a key, and
    /// sends it back. Returns `Ok(())` once the ECU accepts the key.
    pub fn security_access(&mut self, level: u8, key: Option<Vec<u8>>) -> Result<(), DiagError> {
        let seed_resp = self.request(
            Service::SecurityAccess as u8,
            &[security_access::seed_subfunction(level)],
        )?;
        if seed_resp.len() < 2 {
            return Err(DiagError::InvalidResponseLength);
        }
        let seed = &seed_resp[2..];
        let key = key.unwrap_or_else(|| (self.key_algo)(seed));

        let mut payload = vec![security_access::key_subfunction(level)];
        payload.extend_from_slice(&key);
        let key_resp = self.request(Service::SecurityAccess as u8, &payload)?;
        if key_resp.len() < 2 || key_resp[1] != security_access::key_subfunction(level) {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(())
    }

    /// `ReadDTCByStatusMask` (`ReadDTCInformation`, sub-function `0x02`). Returns the raw
    /// positive response bytes (`0x59 0x02 <count> ...`); parse with
    /// [`crate::dtc::parse_read_dtc_response`].
    pub fn read_dtc_by_status_mask(&mut self, mask: u8) -> Result<Vec<u8>, DiagError> {
        self.request(Service::ReadDtcInformation as u8, &[0x02, mask])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CanFrame, LoopbackFrameIo};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn client(io: LoopbackFrameIo) -> UdsClient<LoopbackFrameIo> {
        UdsClient::new(
            io,
            IsoTpConfig::normal(0x7E0, 0x7E8),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn diagnostic_session_control_happy_path() {
        let io = LoopbackFrameIo::new();
        io.inject(CanFrame::new(0x7E8, &[0x02, 0x50, 0x03, 0, 0, 0, 0, 0], false));
        let mut c = client(io);
        c.diagnostic_session_control(DiagnosticSession::Extended)
            .unwrap();
    }

    #[test]
    fn negative_response_surfaces_ecu_error() {
        let io = LoopbackFrameIo::new();
        io.inject(CanFrame::new(0x7E8, &[0x03, 0x7F, 0x10, 0x12, 0, 0, 0, 0], false));
        let mut c = client(io);
        let err = c
            .diagnostic_session_control(DiagnosticSession::Extended)
            .unwrap_err();
        assert!(matches!(err, DiagError::EcuError { code: 0x12, .. }));
    }

    #[test]
    fn security_access_uses_default_key_algorithm() {
        let io = LoopbackFrameIo::new();
        // Seed response: 0x67 0x01 0xAA 0xBB
        io.inject(CanFrame::new(0x7E8, &[0x04, 0x67, 0x01, 0xAA, 0xBB, 0, 0, 0], false));
        // Key-accept response: 0x67 0x02
        io.inject(CanFrame::new(0x7E8, &[0x02, 0x67, 0x02, 0, 0, 0, 0, 0], false));
        let mut c = client(io);
        c.security_access(1, None).unwrap();
    }

    #[test]
    fn hooks_fire_req_and_con() {
        let io = LoopbackFrameIo::new();
        io.inject(CanFrame::new(0x7E8, &[0x02, 0x50, 0x01, 0, 0, 0, 0, 0], false));
        let req_seen = Arc::new(Mutex::new(None));
        let con_seen = Arc::new(Mutex::new(None));
        let req_clone = req_seen.clone();
        let con_clone = con_seen.clone();
        let hooks = TDataHooks {
            req: Some(Box::new(move |sid, _data| *req_clone.lock().unwrap() = Some(sid))),
            con: Some(Box::new(move |ok, _err| *con_clone.lock().unwrap() = Some(ok))),
            som_ind: None,
            ind: None,
        };
        let mut c = client(io).with_hooks(hooks);
        c.diagnostic_session_control(DiagnosticSession::Default)
            .unwrap();
        assert_eq!(*req_seen.lock().unwrap(), Some(0x10));
        assert_eq!(*con_seen.lock().unwrap(), Some(true));
    }
}
