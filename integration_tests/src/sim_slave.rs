//! A scripted CiA 301 slave node
//!
//! Serves SDO requests from a map-backed object dictionary, reacts to NMT
//! commands with boot-up emission, answers guarding RTRs with an
//! alternating toggle, produces heartbeats when told to, and records the
//! RPDO frames the master sends it. Fault injection knobs let tests mute
//! the node or corrupt its segmented-upload toggle.

use std::collections::BTreeMap;

use canherd_common::messages::{
    CanFrame, ErrorControl, FunctionCode, NmtCommand, NmtCommandSpecifier, NmtState,
};
use canherd_common::sdo::{AbortCode, SdoRequest, SdoResponse};

struct UploadTransfer {
    data: Vec<u8>,
    pos: usize,
}

struct DownloadTransfer {
    index: u16,
    sub: u8,
    expected: usize,
    collected: Vec<u8>,
    toggle: bool,
}

/// A simulated slave node
pub struct SimSlave {
    /// This node's id
    pub node_id: u8,
    /// Stop responding to anything; simulates a dead or disconnected node
    pub muted: bool,
    /// Stick the segmented-upload toggle at 1 from the second segment on,
    /// so a three-segment upload repeats the toggle on its third segment
    pub corrupt_upload_toggle: bool,
    od: BTreeMap<(u16, u8), Vec<u8>>,
    nmt_state: NmtState,
    guard_toggle: bool,
    upload: Option<UploadTransfer>,
    download: Option<DownloadTransfer>,
    last_heartbeat: u32,
    /// RPDO frames received from the master, as (pdo number, payload)
    pub received_rpdos: Vec<(usize, Vec<u8>)>,
}

impl SimSlave {
    /// Create a slave with a default dictionary
    ///
    /// Object 0x1000 holds device type 0x0002_0192 (a CiA 402 servo
    /// drive); the liveness objects exist with zero values.
    pub fn new(node_id: u8) -> Self {
        let mut od = BTreeMap::new();
        od.insert((0x1000, 0), 0x0002_0192u32.to_le_bytes().to_vec());
        od.insert((0x100C, 0), vec![0, 0]);
        od.insert((0x100D, 0), vec![0]);
        od.insert((0x1016, 1), vec![0, 0, 0, 0]);
        od.insert((0x1017, 0), vec![0, 0]);
        Self {
            node_id,
            muted: false,
            corrupt_upload_toggle: false,
            od,
            nmt_state: NmtState::PreOperational,
            guard_toggle: false,
            upload: None,
            download: None,
            last_heartbeat: 0,
            received_rpdos: Vec::new(),
        }
    }

    /// Put a value into the slave's dictionary
    pub fn set_object(&mut self, index: u16, sub: u8, data: Vec<u8>) {
        self.od.insert((index, sub), data);
    }

    /// Read a value from the slave's dictionary
    pub fn object(&self, index: u16, sub: u8) -> Option<&Vec<u8>> {
        self.od.get(&(index, sub))
    }

    /// Read a dictionary value as a little-endian integer
    pub fn object_u32(&self, index: u16, sub: u8) -> Option<u32> {
        self.object(index, sub).map(|data| {
            let mut bytes = [0u8; 4];
            bytes[0..data.len().min(4)].copy_from_slice(&data[0..data.len().min(4)]);
            u32::from_le_bytes(bytes)
        })
    }

    /// The slave's current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    /// Build a TPDO frame as this node would transmit it
    pub fn tpdo_frame(&self, pdo: u8, data: &[u8]) -> CanFrame {
        CanFrame::new(FunctionCode::Tpdo(pdo).cob_id(self.node_id), data)
    }

    /// Build an EMCY frame from this node
    pub fn emcy_frame(&self, code: u16, error_register: u8, vendor_error: u16) -> CanFrame {
        canherd_common::messages::EmcyMessage {
            node: self.node_id,
            code,
            error_register,
            vendor_error,
        }
        .into()
    }

    /// Produce time-driven traffic (the heartbeat) due at `now`
    pub fn tick(&mut self, now: u32) -> Vec<CanFrame> {
        if self.muted {
            return Vec::new();
        }
        let period = self.object_u32(0x1017, 0).unwrap_or(0);
        if period > 0 && now.wrapping_sub(self.last_heartbeat) >= period {
            self.last_heartbeat = now;
            return vec![ErrorControl {
                node: self.node_id,
                toggle: false,
                state: self.nmt_state,
            }
            .into()];
        }
        Vec::new()
    }

    /// React to one frame from the bus, returning any responses
    pub fn handle_frame(&mut self, frame: &CanFrame, now: u32) -> Vec<CanFrame> {
        if self.muted {
            return Vec::new();
        }
        let function = match FunctionCode::classify(frame.id()) {
            Some(f) => f,
            None => return Vec::new(),
        };
        match function {
            FunctionCode::Nmt => self.handle_nmt(frame, now),
            FunctionCode::ErrorControl if frame.id().node_id() == self.node_id && frame.rtr => {
                self.handle_guard_request()
            }
            FunctionCode::SdoRequest if frame.id().node_id() == self.node_id => {
                self.handle_sdo(frame)
            }
            FunctionCode::Rpdo(n) if frame.id().node_id() == self.node_id => {
                self.received_rpdos.push((n as usize, frame.data().to_vec()));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_nmt(&mut self, frame: &CanFrame, now: u32) -> Vec<CanFrame> {
        let cmd = match NmtCommand::try_from(frame) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        if cmd.node != 0 && cmd.node != self.node_id {
            return Vec::new();
        }
        match cmd.cs {
            NmtCommandSpecifier::Start => {
                self.nmt_state = NmtState::Operational;
                Vec::new()
            }
            NmtCommandSpecifier::Stop => {
                self.nmt_state = NmtState::Stopped;
                Vec::new()
            }
            NmtCommandSpecifier::EnterPreOp => {
                self.nmt_state = NmtState::PreOperational;
                Vec::new()
            }
            NmtCommandSpecifier::ResetNode | NmtCommandSpecifier::ResetComm => {
                // Reboot: communication parameters fall back to defaults
                // and the boot-up message goes out
                self.nmt_state = NmtState::PreOperational;
                self.guard_toggle = false;
                self.upload = None;
                self.download = None;
                self.last_heartbeat = now;
                self.set_object(0x1017, 0, vec![0, 0]);
                self.set_object(0x100C, 0, vec![0, 0]);
                self.set_object(0x100D, 0, vec![0]);
                vec![ErrorControl::bootup(self.node_id).into()]
            }
        }
    }

    fn handle_guard_request(&mut self) -> Vec<CanFrame> {
        let response = ErrorControl {
            node: self.node_id,
            toggle: self.guard_toggle,
            state: self.nmt_state,
        };
        self.guard_toggle = !self.guard_toggle;
        vec![response.into()]
    }

    fn resp_cob_id(&self) -> canherd_common::CanId {
        FunctionCode::SdoResponse.cob_id(self.node_id)
    }

    fn handle_sdo(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let request = match SdoRequest::try_from(frame.data()) {
            Ok(r) => r,
            Err(code) => {
                return vec![SdoResponse::abort(0, 0, code).to_frame(self.resp_cob_id())];
            }
        };
        let response = match request {
            SdoRequest::InitiateUpload { index, sub } => match self.od.get(&(index, sub)) {
                Some(data) => {
                    if data.len() <= 4 && !data.is_empty() {
                        SdoResponse::expedited_upload(index, sub, data)
                    } else {
                        self.upload = Some(UploadTransfer {
                            data: data.clone(),
                            pos: 0,
                        });
                        SdoResponse::upload_acknowledge(index, sub, data.len() as u32)
                    }
                }
                None => SdoResponse::abort(index, sub, AbortCode::NoSuchObject),
            },
            SdoRequest::UploadSegment { t } => match self.upload.as_mut() {
                Some(transfer) => {
                    let remaining = transfer.data.len() - transfer.pos;
                    let chunk = remaining.min(7);
                    let last = remaining <= 7;
                    let start = transfer.pos;
                    transfer.pos += chunk;
                    // Corruption mode: the toggle sticks at 1 from the
                    // second segment on, so the third segment repeats it
                    let toggle = if self.corrupt_upload_toggle && start > 0 {
                        true
                    } else {
                        t
                    };
                    let segment =
                        SdoResponse::upload_segment(toggle, last, &transfer.data[start..start + chunk]);
                    if last {
                        self.upload = None;
                    }
                    segment
                }
                None => SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier),
            },
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    self.store(index, sub, data[0..len].to_vec());
                    SdoResponse::download_acknowledge(index, sub)
                } else {
                    let expected = u32::from_le_bytes(data) as usize;
                    self.download = Some(DownloadTransfer {
                        index,
                        sub,
                        expected,
                        collected: Vec::new(),
                        toggle: false,
                    });
                    SdoResponse::download_acknowledge(index, sub)
                }
            }
            SdoRequest::DownloadSegment { t, n, c, data } => match self.download.as_mut() {
                Some(transfer) => {
                    if t != transfer.toggle {
                        let (index, sub) = (transfer.index, transfer.sub);
                        self.download = None;
                        SdoResponse::abort(index, sub, AbortCode::ToggleNotAlternated)
                    } else {
                        transfer.toggle = !transfer.toggle;
                        let len = 7 - (n as usize).min(7);
                        transfer.collected.extend_from_slice(&data[0..len]);
                        let ack = SdoResponse::download_segment_acknowledge(t);
                        if c {
                            let transfer = self.download.take().unwrap();
                            debug_assert_eq!(transfer.collected.len(), transfer.expected);
                            self.store(transfer.index, transfer.sub, transfer.collected);
                        }
                        ack
                    }
                }
                None => SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier),
            },
            SdoRequest::Abort { .. } => {
                self.upload = None;
                self.download = None;
                return Vec::new();
            }
        };
        vec![response.to_frame(self.resp_cob_id())]
    }

    fn store(&mut self, index: u16, sub: u8, data: Vec<u8>) {
        // Writing the guard time restarts guarding; the toggle of the
        // first response after that is 0 again
        if index == 0x100C {
            self.guard_toggle = false;
        }
        self.od.insert((index, sub), data);
    }
}
