//! Passive ISO-TP reassembly for overheard UDS responses, driven frame-by-frame by the monitor
//! loop rather than by a blocking call.

use std::time::Duration;

use crate::dtc::{parse_read_dtc_response, DtcEntry, DtcTable};
use crate::error::IsoTpError;
use crate::frame::{CanFrame, FrameIo};
use crate::isotp::{stmin_encode, AddressingMode, IsoTpConfig};

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Result of feeding one frame to [`PassiveReassembler::on_frame`].
#[derive(Debug)]
pub enum ReassemblyEvent {
    /// The first frame of a multi-frame response was observed (T_Data `som_ind`).
    StartOfMessage,
    /// A full payload was reassembled. If it was a ReadDTCByStatusMask response, the decoded
    /// DTCs are included.
    Complete {
        /// The complete reassembled payload.
        payload: Vec<u8>,
        /// Decoded DTCs, present only when the payload was a service-0x19 response.
        dtcs: Option<Vec<DtcEntry>>,
    },
    /// Reassembly failed (sequence mismatch, overflow, ...). The buffer has been discarded.
    Error(IsoTpError),
}

#[derive(Debug, Default)]
struct RxState {
    expected: usize,
    buffer: Vec<u8>,
    next_seq: u8,
    bs: u8,
}

/// Frame-by-frame ISO-TP reassembler for one configured response ID.
///
/// Unlike [`crate::isotp::IsoTpSession`], this type does not block: it is fed frames already
/// read by the monitor's receive loop and returns immediately with `None` when a frame does not
/// advance or complete an assembly.
pub struct PassiveReassembler {
    config: IsoTpConfig,
    dtc_table: DtcTable,
    state: Option<RxState>,
}

impl PassiveReassembler {
    /// Creates a reassembler listening for responses on `config.rx_id` and replying with flow
    /// control on `config.tx_id`.
    pub fn new(config: IsoTpConfig, dtc_table: DtcTable) -> Self {
        Self {
            config,
            dtc_table,
            state: None,
        }
    }

    /// The arbitration ID this reassembler listens for.
    pub fn response_id(&self) -> u32 {
        self.config.rx_id
    }

    fn ae_byte(&self) -> Option<u8> {
        match self.config.addressing {
            AddressingMode::Extended { address_extension } => Some(address_extension),
            _ => None,
        }
    }

    fn pci_offset(&self) -> usize {
        if self.ae_byte().is_some() { 1 } else { 0 }
    }

    fn build_fc_frame(&self, status_nibble: u8, bs: u8, st_min: Duration) -> CanFrame {
        let mut body = vec![PCI_FLOW_CONTROL | status_nibble, bs, stmin_encode(st_min)];
        if let Some(ae) = self.ae_byte() {
            body.insert(0, ae);
        }
        if let Some(pad) = self.config.padding {
            if body.len() < 8 {
                body.resize(8, pad);
            }
        }
        CanFrame::new(self.config.tx_id, &body, self.config.extended_can_id)
    }

    fn decode_dtcs(&self, payload: &[u8]) -> Option<Vec<DtcEntry>> {
        if payload.len() >= 2 && payload[0] == 0x59 && payload[1] == 0x02 {
            parse_read_dtc_response(payload, &self.dtc_table).ok()
        } else {
            None
        }
    }

    /// Feeds one frame to the reassembler. Returns `None` if the frame is not addressed to this
    /// reassembler, or is a non-terminal step (e.g. an ordinary consecutive frame that did not
    /// complete the payload).
    pub fn on_frame(&mut self, frame: &CanFrame, io: &mut dyn FrameIo) -> Option<ReassemblyEvent> {
        if frame.id() != self.config.rx_id {
            return None;
        }
        let off = self.pci_offset();
        let data = frame.data();
        if data.len() <= off {
            return None;
        }
        if let Some(ae) = self.ae_byte() {
            if data.first() != Some(&ae) {
                return None;
            }
        }

        match data[off] & 0xF0 {
            PCI_SINGLE => {
                let len = (data[off] & 0x0F) as usize;
                if data.len() < off + 1 + len {
                    return Some(ReassemblyEvent::Error(IsoTpError::Timeout));
                }
                let payload = data[off + 1..off + 1 + len].to_vec();
                let dtcs = self.decode_dtcs(&payload);
                self.state = None;
                Some(ReassemblyEvent::Complete { payload, dtcs })
            }
            PCI_FIRST => {
                let total = (((data[off] & 0x0F) as usize) << 8) | data[off + 1] as usize;
                self.state = Some(RxState {
                    expected: total,
                    buffer: data[off + 2..].to_vec(),
                    next_seq: 1,
                    bs: 0,
                });
                let fc = self.build_fc_frame(0, self.config.rx_block_size, self.config.rx_st_min);
                if let Err(e) = io.send(&fc) {
                    self.state = None;
                    return Some(ReassemblyEvent::Error(IsoTpError::Io(e)));
                }
                Some(ReassemblyEvent::StartOfMessage)
            }
            PCI_CONSECUTIVE => {
                let Some(state) = self.state.as_mut() else {
                    return None;
                };
                let seq = data[off] & 0x0F;
                if seq != state.next_seq {
                    let expected = state.next_seq;
                    self.state = None;
                    return Some(ReassemblyEvent::Error(IsoTpError::SequenceMismatch {
                        expected,
                        got: seq,
                    }));
                }
                let remaining = state.expected.saturating_sub(state.buffer.len());
                let take = remaining.min(data.len() - off - 1);
                state.buffer.extend_from_slice(&data[off + 1..off + 1 + take]);
                state.next_seq = if state.next_seq == 0x0F { 0 } else { state.next_seq + 1 };
                state.bs += 1;

                if state.buffer.len() >= state.expected {
                    let payload = std::mem::take(&mut state.buffer);
                    self.state = None;
                    let dtcs = self.decode_dtcs(&payload);
                    return Some(ReassemblyEvent::Complete { payload, dtcs });
                }

                if self.config.rx_block_size != 0 && state.bs >= self.config.rx_block_size {
                    state.bs = 0;
                    let fc =
                        self.build_fc_frame(0, self.config.rx_block_size, self.config.rx_st_min);
                    if let Err(e) = io.send(&fc) {
                        self.state = None;
                        return Some(ReassemblyEvent::Error(IsoTpError::Io(e)));
                    }
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::LoopbackFrameIo;

    #[test]
    fn single_frame_completes_immediately() {
        let cfg = IsoTpConfig::normal(0x7E0, 0x7E8);
        let mut r = PassiveReassembler::new(cfg, DtcTable::default());
        let mut io = LoopbackFrameIo::new();
        let frame = CanFrame::new(0x7E8, &[0x02, 0x10, 0x03], false);
        match r.on_frame(&frame, &mut io).unwrap() {
            ReassemblyEvent::Complete { payload, .. } => assert_eq!(payload, vec![0x10, 0x03]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multi_frame_emits_som_then_complete_and_dtcs() {
        let cfg = IsoTpConfig::normal(0x7E0, 0x7E8);
        let mut entries = std::collections::HashMap::new();
        entries.insert(
            "P20F9".to_string(),
            crate::dtc::DtcInfo {
                description: "misfire".to_string(),
                severity: crate::dtc::Severity::Critical,
                component: "engine".to_string(),
                alert: true,
            },
        );
        let mut r = PassiveReassembler::new(cfg, DtcTable::new(entries));
        let mut io = LoopbackFrameIo::new();

        let ff = CanFrame::new(0x7E8, &[0x10, 0x07, 0x59, 0x02, 0x01, 0x20, 0xF9, 0x00], false);
        match r.on_frame(&ff, &mut io).unwrap() {
            ReassemblyEvent::StartOfMessage => {}
            other => panic!("expected StartOfMessage, got {other:?}"),
        }
        assert_eq!(io.sent().len(), 1, "FF should trigger one FC");

        let cf = CanFrame::new(0x7E8, &[0x21, 0x40, 0, 0, 0, 0, 0, 0], false);
        match r.on_frame(&cf, &mut io).unwrap() {
            ReassemblyEvent::Complete { payload, dtcs } => {
                assert_eq!(payload, vec![0x59, 0x02, 0x01, 0x20, 0xF9, 0x00, 0x40]);
                let dtcs = dtcs.unwrap();
                assert_eq!(dtcs.len(), 1);
                assert_eq!(dtcs[0].code, "P20F9");
                assert!(dtcs[0].info.alert);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn ignores_frames_for_other_ids() {
        let cfg = IsoTpConfig::normal(0x7E0, 0x7E8);
        let mut r = PassiveReassembler::new(cfg, DtcTable::default());
        let mut io = LoopbackFrameIo::new();
        let frame = CanFrame::new(0x123, &[0x01, 0x02], false);
        assert!(r.on_frame(&frame, &mut io).is_none());
    }
}
