//! The per-node SDO client state machine
//!
//! Handles read and write access to the object dictionary of one remote
//! node, expedited for values up to 4 bytes and segmented beyond that. All
//! operations are re-entrant step drivers: the caller invokes them once per
//! poll until a terminal [`CommState`] comes back. `Done` is latched and
//! must be cleared with [`SdoClient::reset`] before the next transaction.

use canherd_common::messages::{CanFrame, CanId, FunctionCode};
use canherd_common::objects::OdEntry;
use canherd_common::sdo::{AbortCode, SdoRequest, SdoResponse};
use canherd_common::traits::FrameSender;
use canherd_common::NodeId;
use defmt_or_log::{debug, warn};

use crate::comm::CommState;

/// Size of the internal transfer buffer, bounding segmented transfers
pub const SDO_BUFFER_SIZE: usize = 1024;

/// Response timeout in ms, from request transmission to response arrival
pub const SDO_RESP_TIMEOUT: u32 = 20;

const SEGMENT_LEN: usize = 7;

/// The request currently in flight
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Service {
    None,
    UploadInit,
    UploadSegment,
    DownloadInit,
    DownloadSegment,
}

/// SDO client for a single remote node
///
/// At most one transaction is in flight at any time; starting a new request
/// while one is active is rejected by the `Idle` gate (the call simply
/// keeps driving the transaction already in progress).
pub struct SdoClient {
    node_id: NodeId,
    state: CommState,
    service: Service,
    req_index: u16,
    req_sub: u8,
    toggle: bool,
    buffer: [u8; SDO_BUFFER_SIZE],
    expected_len: usize,
    transferred: usize,
    max_len: usize,
    request: CanFrame,
    request_sent_at: u32,
    timer_active: bool,
    now: u32,
    to_retries: u8,
    to_retry_max: u8,
    busy_retries: u8,
    busy_retry_max: u8,
    bulk_step: usize,
}

impl SdoClient {
    /// Create a client for the node with the given id
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: CommState::Idle,
            service: Service::None,
            req_index: 0,
            req_sub: 0,
            toggle: false,
            buffer: [0; SDO_BUFFER_SIZE],
            expected_len: 0,
            transferred: 0,
            max_len: 0,
            request: CanFrame::default(),
            request_sent_at: 0,
            timer_active: false,
            now: 0,
            to_retries: 0,
            to_retry_max: 1,
            busy_retries: 0,
            busy_retry_max: 5,
            bulk_step: 0,
        }
    }

    /// The current transaction state
    pub fn state(&self) -> CommState {
        self.state
    }

    /// Bytes moved by the completed (or aborted) transaction
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// Clear the latched terminal state, readying the client for a new request
    pub fn reset(&mut self) {
        self.state = CommState::Idle;
        self.service = Service::None;
        self.timer_active = false;
        self.to_retries = 0;
        self.busy_retries = 0;
    }

    /// Set the number of response-timeout retries before a transfer fails
    pub fn set_timeout_retry_max(&mut self, value: u8) {
        self.to_retry_max = value;
    }

    /// Set the number of transmit-busy retries before a request fails
    pub fn set_busy_retry_max(&mut self, value: u8) {
        self.busy_retry_max = value;
    }

    /// Advance the soft timer; expires the pending response window
    pub fn tick(&mut self, now: u32) {
        self.now = now;
        if self.timer_active && now.wrapping_sub(self.request_sent_at) > SDO_RESP_TIMEOUT {
            self.timer_active = false;
            self.on_timeout();
        }
    }

    fn req_cob_id(&self) -> CanId {
        FunctionCode::SdoRequest.cob_id(self.node_id.raw())
    }

    /// Read object `index.sub` into `buf`
    ///
    /// Call repeatedly until a terminal state returns. On `Done`, the
    /// received bytes are in `buf` and their count is available from
    /// [`SdoClient::transferred`].
    pub fn read(
        &mut self,
        index: u16,
        sub: u8,
        buf: &mut [u8],
        sender: &mut dyn FrameSender,
    ) -> CommState {
        match self.state {
            CommState::Idle => {
                self.begin_upload(index, sub, buf.len());
                self.try_send(sender);
            }
            CommState::Retry => self.try_send(sender),
            CommState::Done => {
                let n = self.transferred.min(buf.len());
                buf[0..n].copy_from_slice(&self.buffer[0..n]);
            }
            _ => {}
        }
        self.state
    }

    /// Write `data` to object `index.sub`
    ///
    /// Call repeatedly until a terminal state returns.
    pub fn write(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        sender: &mut dyn FrameSender,
    ) -> CommState {
        match self.state {
            CommState::Idle => {
                if data.len() > SDO_BUFFER_SIZE {
                    warn!("SDO write of {} bytes exceeds the transfer buffer", data.len());
                    self.state = CommState::Error;
                } else {
                    self.begin_download(index, sub, data);
                    self.try_send(sender);
                }
            }
            CommState::Retry => self.try_send(sender),
            _ => {}
        }
        self.state
    }

    /// Read an entry, storing the received value into its cell
    ///
    /// Unlike [`SdoClient::read`], the latched `Done` is cleared before
    /// returning, so the next invocation starts a fresh transaction. A
    /// received length that does not fit the cell surfaces as `Error`.
    pub fn read_entry(&mut self, entry: &OdEntry<'_>, sender: &mut dyn FrameSender) -> CommState {
        match self.state {
            CommState::Idle => {
                self.begin_upload(entry.index, entry.sub, SDO_BUFFER_SIZE);
                self.try_send(sender);
            }
            CommState::Retry => self.try_send(sender),
            CommState::Done => {
                let received = &self.buffer[0..self.transferred];
                if entry.cell.write_le(received).is_err() {
                    warn!(
                        "SDO read of {:04x}.{:02x} returned {} bytes, entry takes {}",
                        entry.index,
                        entry.sub,
                        self.transferred,
                        entry.byte_len()
                    );
                    self.state = CommState::Error;
                    return self.state;
                }
                self.reset();
                return CommState::Done;
            }
            _ => {}
        }
        self.state
    }

    /// Write the current value of an entry's cell to the remote object
    ///
    /// The latched `Done` is cleared before returning, like
    /// [`SdoClient::read_entry`].
    pub fn write_entry(&mut self, entry: &OdEntry<'_>, sender: &mut dyn FrameSender) -> CommState {
        match self.state {
            CommState::Idle => {
                let mut tmp = [0u8; canherd_common::objects::MAX_STR_LEN];
                let n = entry.cell.read_le(&mut tmp);
                self.begin_download(entry.index, entry.sub, &tmp[0..n]);
                self.try_send(sender);
            }
            CommState::Retry => self.try_send(sender),
            CommState::Done => {
                self.reset();
                return CommState::Done;
            }
            _ => {}
        }
        self.state
    }

    /// Drive a read over a whole set of entries, one transaction at a time
    ///
    /// Advances to the next entry only after the previous one completed.
    /// Returns `Busy` while in progress and `Done` after the last entry; a
    /// terminal failure on any step aborts the bulk and surfaces it.
    pub fn read_entries(
        &mut self,
        entries: &[&OdEntry<'_>],
        sender: &mut dyn FrameSender,
    ) -> CommState {
        if entries.is_empty() {
            return CommState::Done;
        }
        match self.read_entry(entries[self.bulk_step], sender) {
            CommState::Done => {
                self.bulk_step += 1;
                if self.bulk_step == entries.len() {
                    self.bulk_step = 0;
                    CommState::Done
                } else {
                    CommState::Busy
                }
            }
            CommState::Error => {
                self.bulk_step = 0;
                CommState::Error
            }
            CommState::Timeout => {
                self.bulk_step = 0;
                CommState::Timeout
            }
            _ => CommState::Busy,
        }
    }

    /// Drive a write over a whole set of entries, one transaction at a time
    ///
    /// The write-side counterpart of [`SdoClient::read_entries`].
    pub fn write_entries(
        &mut self,
        entries: &[&OdEntry<'_>],
        sender: &mut dyn FrameSender,
    ) -> CommState {
        if entries.is_empty() {
            return CommState::Done;
        }
        match self.write_entry(entries[self.bulk_step], sender) {
            CommState::Done => {
                self.bulk_step += 1;
                if self.bulk_step == entries.len() {
                    self.bulk_step = 0;
                    CommState::Done
                } else {
                    CommState::Busy
                }
            }
            CommState::Error => {
                self.bulk_step = 0;
                CommState::Error
            }
            CommState::Timeout => {
                self.bulk_step = 0;
                CommState::Timeout
            }
            _ => CommState::Busy,
        }
    }

    /// Feed a received SDO response frame into the state machine
    ///
    /// May transmit the next segment of the transaction through `sender`.
    pub fn handle_response(&mut self, frame: &CanFrame, sender: &mut dyn FrameSender) {
        if self.service == Service::None || self.state.is_terminal() {
            return;
        }
        let resp = match SdoResponse::try_from(frame) {
            Ok(r) => r,
            Err(_) => {
                warn!("malformed SDO response from node {}", self.node_id.raw());
                self.fail();
                return;
            }
        };

        if let SdoResponse::Abort { abort_code, .. } = resp {
            warn!(
                "node {} aborted SDO {:04x}.{:02x}: {:08x}",
                self.node_id.raw(),
                self.req_index,
                self.req_sub,
                abort_code
            );
            self.fail();
            return;
        }

        match (self.service, resp) {
            (
                Service::UploadInit,
                SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                },
            ) => {
                if index != self.req_index || sub != self.req_sub {
                    warn!("SDO upload response for wrong object");
                    self.fail();
                    return;
                }
                if e && s {
                    let len = 4 - (n as usize).min(4);
                    self.buffer[0..len].copy_from_slice(&data[0..len]);
                    self.transferred = len;
                    self.finish();
                } else if !e && s {
                    let total = u32::from_le_bytes(data) as usize;
                    if total == 0 {
                        // A zero-length value completes without segments
                        self.transferred = 0;
                        self.finish();
                        return;
                    }
                    if total > SDO_BUFFER_SIZE || total > self.max_len.max(SEGMENT_LEN) {
                        self.send_abort(AbortCode::OutOfMemory, sender);
                        self.fail();
                        return;
                    }
                    self.expected_len = total;
                    self.transferred = 0;
                    self.service = Service::UploadSegment;
                    self.request = SdoRequest::upload_segment(self.toggle).to_frame(self.req_cob_id());
                    self.send_followup(sender);
                } else {
                    warn!("SDO upload response without size indication");
                    self.fail();
                }
            }
            (Service::UploadSegment, SdoResponse::UploadSegment { t, n, c, data }) => {
                if t != self.toggle {
                    warn!("SDO upload segment with wrong toggle");
                    self.send_abort(AbortCode::ToggleNotAlternated, sender);
                    self.fail();
                    return;
                }
                let len = SEGMENT_LEN - (n as usize).min(SEGMENT_LEN);
                let end = (self.transferred + len).min(SDO_BUFFER_SIZE);
                let take = end - self.transferred;
                self.buffer[self.transferred..end].copy_from_slice(&data[0..take]);
                self.transferred = end;
                if c {
                    self.finish();
                } else {
                    self.toggle = !self.toggle;
                    self.request =
                        SdoRequest::upload_segment(self.toggle).to_frame(self.req_cob_id());
                    self.send_followup(sender);
                }
            }
            (Service::DownloadInit, SdoResponse::ConfirmDownload { index, sub }) => {
                if index != self.req_index || sub != self.req_sub {
                    warn!("SDO download response for wrong object");
                    self.fail();
                    return;
                }
                if self.expected_len <= 4 {
                    self.transferred = self.expected_len;
                    self.finish();
                } else {
                    self.toggle = false;
                    self.service = Service::DownloadSegment;
                    self.compose_download_segment();
                    self.send_followup(sender);
                }
            }
            (Service::DownloadSegment, SdoResponse::ConfirmDownloadSegment { t }) => {
                if t != self.toggle {
                    warn!("SDO download segment acknowledged with wrong toggle");
                    self.send_abort(AbortCode::ToggleNotAlternated, sender);
                    self.fail();
                    return;
                }
                if self.transferred >= self.expected_len {
                    self.finish();
                } else {
                    self.toggle = !self.toggle;
                    self.compose_download_segment();
                    self.send_followup(sender);
                }
            }
            _ => {
                warn!("unexpected SDO response for the request in flight");
                self.fail();
            }
        }
    }

    fn begin_upload(&mut self, index: u16, sub: u8, max_len: usize) {
        self.req_index = index;
        self.req_sub = sub;
        self.max_len = max_len;
        self.expected_len = 0;
        self.transferred = 0;
        self.toggle = false;
        self.service = Service::UploadInit;
        self.request = SdoRequest::initiate_upload(index, sub).to_frame(self.req_cob_id());
        debug!("SDO upload {:04x}.{:02x} from node {}", index, sub, self.node_id.raw());
    }

    fn begin_download(&mut self, index: u16, sub: u8, data: &[u8]) {
        self.req_index = index;
        self.req_sub = sub;
        self.expected_len = data.len();
        self.transferred = 0;
        self.toggle = false;
        self.service = Service::DownloadInit;
        if data.len() <= 4 {
            self.request = SdoRequest::expedited_download(index, sub, data).to_frame(self.req_cob_id());
        } else {
            self.buffer[0..data.len()].copy_from_slice(data);
            self.request =
                SdoRequest::initiate_download(index, sub, data.len() as u32).to_frame(self.req_cob_id());
        }
        debug!(
            "SDO download {:04x}.{:02x} to node {}, {} bytes",
            index,
            sub,
            self.node_id.raw(),
            data.len()
        );
    }

    /// Pack the next download segment into the request frame
    fn compose_download_segment(&mut self) {
        let remaining = self.expected_len - self.transferred;
        let len = remaining.min(SEGMENT_LEN);
        let last = remaining <= SEGMENT_LEN;
        let start = self.transferred;
        self.request = SdoRequest::download_segment(
            self.toggle,
            last,
            &self.buffer[start..start + len],
        )
        .to_frame(self.req_cob_id());
        self.transferred += len;
    }

    /// Transmit the cached request from a caller-driven state
    fn try_send(&mut self, sender: &mut dyn FrameSender) {
        if sender.send_frame(&self.request) {
            self.state = CommState::Waiting;
            self.busy_retries = 0;
            self.request_sent_at = self.now;
            self.timer_active = true;
        } else {
            self.busy_retries += 1;
            if self.busy_retries > self.busy_retry_max {
                warn!("SDO request to node {} stuck on busy transmit", self.node_id.raw());
                self.state = CommState::Error;
                self.timer_active = false;
            } else {
                self.state = CommState::Retry;
                self.timer_active = false;
            }
        }
    }

    /// Transmit the next frame of a running transaction from the RX path
    ///
    /// A blocked send parks the transaction in `Retry`; the next caller
    /// invocation re-sends without counting against the busy budget.
    fn send_followup(&mut self, sender: &mut dyn FrameSender) {
        if sender.send_frame(&self.request) {
            self.state = CommState::Waiting;
            self.busy_retries = 0;
            self.request_sent_at = self.now;
            self.timer_active = true;
        } else {
            self.state = CommState::Retry;
            self.timer_active = false;
        }
    }

    fn send_abort(&mut self, code: AbortCode, sender: &mut dyn FrameSender) {
        let frame = SdoRequest::abort(self.req_index, self.req_sub, code).to_frame(self.req_cob_id());
        // Best effort; the transaction is failing either way.
        sender.send_frame(&frame);
    }

    fn finish(&mut self) {
        self.state = CommState::Done;
        self.timer_active = false;
    }

    fn fail(&mut self) {
        self.state = CommState::Error;
        self.timer_active = false;
    }

    fn on_timeout(&mut self) {
        if self.to_retries < self.to_retry_max {
            self.to_retries += 1;
            debug!("SDO response timeout, retrying");
            self.state = CommState::Retry;
        } else {
            warn!("SDO transaction with node {} timed out", self.node_id.raw());
            self.state = CommState::Timeout;
            self.to_retries = 0;
        }
    }
}
