//! The remote-node supervisor
//!
//! A [`RemoteNode`] is the master's record of one slave on the bus: its
//! modeled NMT state, the liveness supervision (guarding or heartbeat),
//! emergency intake, and the embedded SDO client and PDO engine. The
//! application drives it by calling [`RemoteNode::update`] every tick
//! after [`Router::poll`](crate::Router::poll).
//!
//! Lifecycle: while `Offline`, the node is probed by reading its device
//! type object until it answers; it is then reset and watched for its
//! boot-up message; after boot the chosen liveness mechanism is configured
//! over SDO, leaving the node in `PreOp` ready for PDO configuration and
//! the start command.

use canherd_common::constants::object_ids;
use canherd_common::messages::{
    CanFrame, EmcyMessage, FunctionCode, NmtCommand, NmtCommandSpecifier,
};
use canherd_common::traits::{CanInterface, FrameSender};
use canherd_common::NodeId;
use defmt_or_log::{debug, info, warn};

use crate::comm::CommState;
use crate::mbox::NodeMbox;
use crate::pdo::{PdoEngine, PDO_COUNT};
use crate::router::{NodeHandle, RegisterError, Router};
use crate::sdo_client::SdoClient;
use crate::sync::SyncState;

/// Period of the discovery probe while a node is offline, in ms
pub const SDO_REQUEST_INTERVAL: u32 = 200;

/// The master's model of a remote node's lifecycle state
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeState {
    /// Not seen on the bus; discovery probes are running
    Offline,
    /// Reset was commanded; awaiting the boot-up message
    WaitForBoot,
    /// The boot-up message arrived
    BootMsgReceived,
    /// One cycle of boot handling, observable by the application
    Booting,
    /// Booted but unconfigured; liveness configuration runs here
    Reset,
    /// Pre-operational
    PreOp,
    /// Operational
    Operational,
    /// Stopped
    Stopped,
}

/// State of the guarding/heartbeat supervision of one node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GuardState {
    /// No supervision configured
    Off,
    /// Parameters written; starts once the node reaches pre-operational
    Configured,
    /// A guarding request is due
    Expected,
    /// Request sent, awaiting the response
    Waiting,
    /// Response arrived within the guard window
    ReceivedInTime,
    /// The guard window elapsed without a response
    TimedOut,
    /// Supervision failed; the node was taken offline
    Failed,
}

/// The master-side record of one remote node
pub struct RemoteNode<'a> {
    id: NodeId,
    mbox: &'a NodeMbox,
    /// SDO client for this node's object dictionary
    pub sdo: SdoClient,
    /// PDO engine for this node's process data
    pub pdo: PdoEngine<'a>,
    state: NodeState,
    /// Last state the node itself reported over error control frames
    reported_state: NodeState,
    is_live: bool,
    device_type: u32,
    guard_time: u16,
    live_time_factor: u8,
    hb_producer_time: u16,
    hb_consumer_value: u32,
    hb_missed_time: u32,
    guarding_active: bool,
    heartbeat_active: bool,
    guard_state: GuardState,
    guard_sent_at: u32,
    open_guard_timeouts: u8,
    expected_toggle: bool,
    hb_received_at: u32,
    config_step: u8,
    config_state: CommState,
    request_state: CommState,
    busy_retries: u8,
    busy_retry_max: u8,
    request_time: u32,
    last_emcy: Option<EmcyMessage>,
    now: u32,
}

impl<'a> RemoteNode<'a> {
    /// Create a record for the node with the given id
    ///
    /// The mailbox must also be registered with the router, see
    /// [`RemoteNode::attach`].
    pub fn new(id: NodeId, mbox: &'a NodeMbox) -> Self {
        Self {
            id,
            mbox,
            sdo: SdoClient::new(id),
            pdo: PdoEngine::new(id),
            state: NodeState::Offline,
            reported_state: NodeState::Reset,
            is_live: false,
            device_type: 0,
            guard_time: 0,
            live_time_factor: 0,
            hb_producer_time: 0,
            hb_consumer_value: 0,
            hb_missed_time: 0,
            guarding_active: false,
            heartbeat_active: false,
            guard_state: GuardState::Off,
            guard_sent_at: 0,
            open_guard_timeouts: 0,
            expected_toggle: false,
            hb_received_at: 0,
            config_step: 0,
            config_state: CommState::Idle,
            request_state: CommState::Idle,
            busy_retries: 0,
            busy_retry_max: 1,
            request_time: 0,
            last_emcy: None,
            now: 0,
        }
    }

    /// Register this node's mailbox with the router
    pub fn attach<I: CanInterface>(
        &self,
        router: &mut Router<'a, I>,
    ) -> Result<NodeHandle, RegisterError> {
        router.register_node(self.id, self.mbox)
    }

    /// The node id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// This node's mailbox
    pub fn mbox(&self) -> &'a NodeMbox {
        self.mbox
    }

    /// The master's current model of the node state
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// True once the node's boot-up message has been seen
    ///
    /// Note that in setups where nodes never reboot no boot-up message is
    /// ever sent; discovery then relies on the SDO probe alone.
    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// The device type value (object 0x1000) read during discovery
    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    /// The guarding supervision state
    pub fn guard_state(&self) -> GuardState {
        self.guard_state
    }

    /// State of the liveness configuration sequence
    pub fn config_state(&self) -> CommState {
        self.config_state
    }

    /// The most recent emergency received from this node
    pub fn last_emcy(&self) -> Option<EmcyMessage> {
        self.last_emcy
    }

    /// Set the number of transmit-busy retries for NMT commands
    pub fn set_busy_retry_max(&mut self, value: u8) {
        self.busy_retry_max = value;
    }

    /// Supervise this node by guarding with the given window and factor
    ///
    /// Guarding and heartbeat are mutually exclusive; this disables any
    /// heartbeat configuration. If the node is already configured and
    /// running, it is returned to the `Reset` state so the update loop
    /// rewrites the liveness objects.
    pub fn configure_guarding(&mut self, guard_time: u16, live_time_factor: u8) {
        self.guard_time = guard_time;
        self.live_time_factor = live_time_factor;
        self.hb_producer_time = 0;
        self.hb_consumer_value = 0;
        self.hb_missed_time = 0;
        self.reconfigure_if_running();
    }

    /// Supervise this node by consuming its producer heartbeat
    ///
    /// The node will be told to produce a heartbeat every `time` ms; the
    /// master fails it after silence of 1.25 times that, unless overridden
    /// with [`RemoteNode::set_hb_missed_time`]. Disables guarding.
    pub fn configure_heartbeat_producer(&mut self, time: u16) {
        self.hb_producer_time = time;
        self.hb_missed_time = time as u32 + time as u32 / 4;
        self.guard_time = 0;
        self.live_time_factor = 0;
        self.reconfigure_if_running();
    }

    /// Configure the node's own heartbeat consumer (object 0x1016.01)
    ///
    /// Lets the remote node monitor the master's heartbeat: `producer` is
    /// the monitored node id, `threshold` the consumer time in ms.
    pub fn configure_heartbeat_consumer(&mut self, producer: u8, threshold: u16) {
        self.hb_consumer_value = ((producer as u32) << 16) | threshold as u32;
        self.guard_time = 0;
        self.live_time_factor = 0;
        self.reconfigure_if_running();
    }

    /// Override the heartbeat-missed threshold in ms
    pub fn set_hb_missed_time(&mut self, value: u32) {
        self.hb_missed_time = value;
    }

    fn reconfigure_if_running(&mut self) {
        if matches!(self.state, NodeState::PreOp | NodeState::Operational) {
            debug!("node {}: liveness change, reconfiguring", self.id.raw());
            self.guarding_active = false;
            self.heartbeat_active = false;
            self.config_step = 0;
            self.config_state = CommState::Idle;
            self.state = NodeState::Reset;
        }
    }

    /// Force the modeled node state without sending anything
    pub fn force_state(&mut self, state: NodeState) {
        self.state = state;
    }

    /// Return the record to `Offline` and clear all communication state
    pub fn restart(&mut self) {
        self.state = NodeState::Offline;
        self.reset_com_state();
    }

    /// Clear latched request/configuration failures and the SDO client
    ///
    /// The only way to recover from a terminal `Error`.
    pub fn reset_com_state(&mut self) {
        self.request_state = CommState::Idle;
        self.config_state = CommState::Idle;
        self.config_step = 0;
        self.busy_retries = 0;
        self.sdo.reset();
    }

    /// Reset only the embedded SDO client
    pub fn reset_sdo_state(&mut self) {
        self.sdo.reset();
    }

    /// Download the preset PDO configuration, see
    /// [`PdoEngine::configure_preset_pdos`]
    pub fn configure_preset_pdos(
        &mut self,
        now: u32,
        sender: &mut dyn FrameSender,
    ) -> CommState {
        let Self { sdo, pdo, .. } = self;
        pdo.configure_preset_pdos(now, sdo, sender)
    }

    /// Trigger event-driven RPDOs mapping `entry`, see
    /// [`PdoEngine::tx_rpdos_async`]
    pub fn tx_rpdos_async(&mut self, entry: &canherd_common::OdEntry<'_>) -> bool {
        self.pdo.tx_rpdos_async(entry)
    }

    /// Advance the node by one tick
    ///
    /// Call once per poll cycle, after the router delivered frames and
    /// with the [`SyncState`] of this tick's sync-producer update. Returns
    /// the current modeled node state.
    pub fn update(
        &mut self,
        now: u32,
        sync_state: SyncState,
        sender: &mut dyn FrameSender,
    ) -> NodeState {
        self.now = now;
        self.sdo.tick(now);

        if self.mbox.take_fault() {
            warn!("node {}: bus fault, dropping to offline", self.id.raw());
            self.go_offline();
            return self.state;
        }

        if let Some(frame) = self.mbox.take_error_control() {
            self.on_error_control(&frame);
        }
        if let Some(frame) = self.mbox.take_emcy() {
            self.on_emcy(&frame);
        }
        if let Some(frame) = self.mbox.take_sdo_response() {
            self.sdo.handle_response(&frame, sender);
        }
        for k in 0..PDO_COUNT {
            if let Some(frame) = self.mbox.take_tpdo(k) {
                self.pdo.store_tpdo(k, &frame);
            }
        }

        match self.state {
            NodeState::Offline => self.drive_discovery(sender),
            NodeState::WaitForBoot | NodeState::BootMsgReceived => {
                if self.is_live {
                    debug!("node {}: boot message received", self.id.raw());
                    self.state = NodeState::Booting;
                }
            }
            // One extra cycle so the application can observe the boot
            NodeState::Booting => self.state = NodeState::Reset,
            NodeState::Reset => self.drive_liveness_config(sender),
            NodeState::PreOp | NodeState::Operational => {
                self.drive_guarding(sender);
                self.check_heartbeat();
                if self.state == NodeState::Operational {
                    let Self { pdo, .. } = self;
                    pdo.update(now, sync_state, sender);
                }
            }
            NodeState::Stopped => {}
        }
        self.state
    }

    /// Probe for the node with a device-type upload every request interval
    fn drive_discovery(&mut self, sender: &mut dyn FrameSender) {
        if self.now.wrapping_sub(self.request_time) <= SDO_REQUEST_INTERVAL {
            return;
        }
        let mut buf = [0u8; 4];
        match self.sdo.read(object_ids::DEVICE_TYPE, 0, &mut buf, sender) {
            CommState::Done => {
                self.device_type = u32::from_le_bytes(buf);
                self.sdo.reset();
                info!(
                    "node {}: discovered, device type {:08x}",
                    self.id.raw(),
                    self.device_type
                );
                match self.send_reset_node(sender) {
                    CommState::Done => self.request_time = self.now,
                    CommState::Error => {
                        // Recover the request machinery; discovery runs again
                        warn!("node {}: reset command failed", self.id.raw());
                        self.request_state = CommState::Idle;
                        self.busy_retries = 0;
                    }
                    _ => {}
                }
            }
            CommState::Error | CommState::Timeout => {
                self.sdo.reset();
                self.request_time = self.now;
            }
            _ => {}
        }
    }

    /// Configure the chosen liveness supervision while in `Reset`
    fn drive_liveness_config(&mut self, sender: &mut dyn FrameSender) {
        let result = if self.guard_time > 0 {
            self.activate_guarding(sender)
        } else if self.hb_producer_time > 0 {
            self.activate_heartbeat(sender)
        } else {
            CommState::Done
        };

        if result == CommState::Done {
            // A booting node lands in pre-operational on its own; no
            // command needs to be sent.
            self.state = NodeState::PreOp;
            self.config_state = CommState::Idle;
            self.config_step = 0;
            if self.guard_state == GuardState::Configured {
                self.guard_state = GuardState::Expected;
            }
            info!("node {}: configured, pre-operational", self.id.raw());
        }
    }

    /// One SDO write of a configuration sequence
    fn drive_config_write(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        sender: &mut dyn FrameSender,
    ) -> CommState {
        match self.sdo.write(index, sub, data, sender) {
            CommState::Done => {
                self.sdo.reset();
                CommState::Done
            }
            CommState::Error | CommState::Timeout => CommState::Error,
            _ => CommState::Busy,
        }
    }

    /// Write the guarding parameters, disabling heartbeat first
    fn activate_guarding(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.config_state = CommState::Busy;
        match self.config_step {
            0 => {
                self.heartbeat_active = false;
                match self.drive_config_write(
                    object_ids::PRODUCER_HEARTBEAT_TIME,
                    0,
                    &0u16.to_le_bytes(),
                    sender,
                ) {
                    CommState::Done => self.config_step = 1,
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            1 => {
                match self.drive_config_write(
                    object_ids::CONSUMER_HEARTBEAT_TIME,
                    1,
                    &0u32.to_le_bytes(),
                    sender,
                ) {
                    CommState::Done => self.config_step = 2,
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            2 => {
                let value = self.guard_time;
                match self.drive_config_write(
                    object_ids::GUARD_TIME,
                    0,
                    &value.to_le_bytes(),
                    sender,
                ) {
                    CommState::Done => self.config_step = 3,
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            3 => {
                let value = self.live_time_factor;
                match self.drive_config_write(object_ids::LIFE_TIME_FACTOR, 0, &[value], sender) {
                    CommState::Done => {
                        self.guarding_active = true;
                        self.open_guard_timeouts = 0;
                        self.expected_toggle = false;
                        self.guard_state = GuardState::Configured;
                        self.config_state = CommState::Done;
                        self.config_step = 0;
                        debug!("node {}: guarding configured", self.id.raw());
                    }
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            _ => {}
        }
        self.config_state
    }

    /// Write the heartbeat parameters, disabling guarding first
    fn activate_heartbeat(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.config_state = CommState::Busy;
        match self.config_step {
            0 => {
                self.guarding_active = false;
                match self.drive_config_write(
                    object_ids::GUARD_TIME,
                    0,
                    &0u16.to_le_bytes(),
                    sender,
                ) {
                    CommState::Done => self.config_step = 1,
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            1 => {
                match self.drive_config_write(object_ids::LIFE_TIME_FACTOR, 0, &[0], sender) {
                    CommState::Done => self.config_step = 2,
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            2 => {
                let value = self.hb_producer_time;
                match self.drive_config_write(
                    object_ids::PRODUCER_HEARTBEAT_TIME,
                    0,
                    &value.to_le_bytes(),
                    sender,
                ) {
                    CommState::Done => self.config_step = 3,
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            3 => {
                let value = self.hb_consumer_value;
                match self.drive_config_write(
                    object_ids::CONSUMER_HEARTBEAT_TIME,
                    1,
                    &value.to_le_bytes(),
                    sender,
                ) {
                    CommState::Done => {
                        self.heartbeat_active = true;
                        self.guard_state = GuardState::Configured;
                        self.hb_received_at = self.now;
                        self.config_state = CommState::Done;
                        self.config_step = 0;
                        debug!("node {}: heartbeat configured", self.id.raw());
                    }
                    CommState::Error => self.config_state = CommState::Error,
                    _ => {}
                }
            }
            _ => {}
        }
        self.config_state
    }

    /// One round of the guarding poll cycle
    fn drive_guarding(&mut self, sender: &mut dyn FrameSender) {
        if !self.guarding_active {
            return;
        }
        match self.guard_state {
            GuardState::Expected => {
                let frame = CanFrame::new_rtr(FunctionCode::ErrorControl.cob_id(self.id.raw()), 0);
                if sender.send_frame(&frame) {
                    self.guard_sent_at = self.now;
                    self.guard_state = GuardState::Waiting;
                }
            }
            GuardState::Waiting => {
                if self.now.wrapping_sub(self.guard_sent_at) > self.guard_time as u32 {
                    self.open_guard_timeouts += 1;
                    self.guard_state = GuardState::TimedOut;
                    debug!(
                        "node {}: guard timeout {}",
                        self.id.raw(),
                        self.open_guard_timeouts
                    );
                }
            }
            GuardState::ReceivedInTime => {
                if self.now.wrapping_sub(self.guard_sent_at) > self.guard_time as u32 {
                    self.guard_state = GuardState::Expected;
                    self.open_guard_timeouts = 0;
                    self.state = self.reported_state;
                }
            }
            GuardState::TimedOut => {
                if self.open_guard_timeouts <= self.live_time_factor {
                    self.guard_state = GuardState::Expected;
                } else {
                    warn!("node {}: guarding failed", self.id.raw());
                    self.go_offline();
                }
            }
            _ => {}
        }
    }

    /// Fail the node when its heartbeat has been silent too long
    fn check_heartbeat(&mut self) {
        if self.heartbeat_active
            && self.now.wrapping_sub(self.hb_received_at) > self.hb_missed_time
        {
            warn!(
                "node {}: heartbeat missed beyond {} ms",
                self.id.raw(),
                self.hb_missed_time
            );
            self.go_offline();
        }
    }

    /// Drop the node to offline: supervision off, PDOs invalid, rediscovery
    fn go_offline(&mut self) {
        self.state = NodeState::Offline;
        self.is_live = false;
        self.guarding_active = false;
        self.heartbeat_active = false;
        self.guard_state = GuardState::Failed;
        self.pdo.invalidate_all();
        self.sdo.reset();
        self.config_step = 0;
        self.config_state = CommState::Idle;
        self.request_time = self.now;
    }

    /// Handle a boot-up, guarding response, or heartbeat frame
    fn on_error_control(&mut self, frame: &CanFrame) {
        if frame.rtr || frame.dlc != 1 {
            return;
        }
        let status = frame.data[0];

        if status == 0 {
            // Boot-up: the node is back, but unconfigured
            debug!("node {}: boot-up", self.id.raw());
            self.state = NodeState::BootMsgReceived;
            self.is_live = true;
            self.guarding_active = false;
            self.heartbeat_active = false;
            self.config_step = 0;
            self.pdo.invalidate_all();
            return;
        }

        if self.guarding_active && self.guard_state != GuardState::Failed {
            let toggle = (status & 0x80) != 0;
            if toggle == self.expected_toggle {
                self.reported_state = reported_state_from(status & 0x7F);
                self.guard_state = GuardState::ReceivedInTime;
                self.expected_toggle = !self.expected_toggle;
            } else {
                debug!("node {}: guarding response with wrong toggle", self.id.raw());
            }
        } else if self.heartbeat_active {
            self.state = reported_state_from(status & 0x7F);
            self.hb_received_at = self.now;
        }
    }

    /// Decode and record an emergency message
    fn on_emcy(&mut self, frame: &CanFrame) {
        match EmcyMessage::try_from(frame) {
            Ok(emcy) => {
                if emcy.code > 0 {
                    warn!(
                        "node {}: EMCY {:04x}, register {:02x}, vendor {:04x}",
                        self.id.raw(),
                        emcy.code,
                        emcy.error_register,
                        emcy.vendor_error
                    );
                } else {
                    info!("node {}: error cleared", self.id.raw());
                }
                self.last_emcy = Some(emcy);
            }
            Err(_) => {
                debug!("node {}: malformed EMCY frame", self.id.raw());
            }
        }
    }

    /// Command a full reset of this node
    pub fn send_reset_node(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_nmt_command(NmtCommandSpecifier::ResetNode, sender)
    }

    /// Command a communication reset of this node
    pub fn send_reset_com(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_nmt_command(NmtCommandSpecifier::ResetComm, sender)
    }

    /// Command this node to operational
    pub fn send_start_node(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_nmt_command(NmtCommandSpecifier::Start, sender)
    }

    /// Command this node to stopped
    pub fn send_stop_node(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_nmt_command(NmtCommandSpecifier::Stop, sender)
    }

    /// Command this node to pre-operational
    pub fn send_preop_node(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_nmt_command(NmtCommandSpecifier::EnterPreOp, sender)
    }

    /// Compose and send one NMT command with the busy-retry pattern
    ///
    /// The modeled node state is updated optimistically on a successful
    /// transmit, to be confirmed by subsequent liveness traffic.
    fn send_nmt_command(
        &mut self,
        cs: NmtCommandSpecifier,
        sender: &mut dyn FrameSender,
    ) -> CommState {
        match self.request_state {
            CommState::Idle | CommState::Retry => {
                let frame: CanFrame = NmtCommand {
                    cs,
                    node: self.id.raw(),
                }
                .into();
                if sender.send_frame(&frame) {
                    self.request_state = CommState::Idle;
                    self.busy_retries = 0;
                    self.apply_commanded_state(cs);
                    CommState::Done
                } else {
                    self.busy_retries += 1;
                    if self.busy_retries > self.busy_retry_max {
                        warn!("node {}: NMT command stuck on busy transmit", self.id.raw());
                        self.request_state = CommState::Error;
                        CommState::Error
                    } else {
                        self.request_state = CommState::Retry;
                        CommState::Retry
                    }
                }
            }
            state => state,
        }
    }

    fn apply_commanded_state(&mut self, cs: NmtCommandSpecifier) {
        match cs {
            NmtCommandSpecifier::ResetNode | NmtCommandSpecifier::ResetComm => {
                self.is_live = false;
                self.state = NodeState::WaitForBoot;
                self.reported_state = NodeState::WaitForBoot;
                debug!("node {}: reset commanded, waiting for boot", self.id.raw());
            }
            NmtCommandSpecifier::Start => {
                self.state = NodeState::Operational;
                self.reported_state = NodeState::Operational;
                // Heartbeat silence is only judged from here on
                self.hb_received_at = self.now;
            }
            NmtCommandSpecifier::Stop => {
                self.state = NodeState::Stopped;
                self.reported_state = NodeState::Stopped;
            }
            NmtCommandSpecifier::EnterPreOp => {
                self.state = NodeState::PreOp;
                self.reported_state = NodeState::PreOp;
                self.hb_received_at = self.now;
            }
        }
    }
}

/// Map a reported NMT state byte onto the supervisor's state model
fn reported_state_from(value: u8) -> NodeState {
    match value {
        4 => NodeState::Stopped,
        5 => NodeState::Operational,
        127 => NodeState::PreOp,
        _ => NodeState::Reset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canherd_common::messages::{CanId, ErrorControl, NmtState};
    use canherd_common::sdo::{SdoRequest, SdoResponse};

    #[derive(Default)]
    struct MockSender {
        sent: Vec<CanFrame>,
        refuse: usize,
    }

    impl FrameSender for MockSender {
        fn send_frame(&mut self, frame: &CanFrame) -> bool {
            if self.refuse > 0 {
                self.refuse -= 1;
                return false;
            }
            self.sent.push(*frame);
            true
        }
    }

    const NODE: u8 = 3;

    fn node_id() -> NodeId {
        NodeId::new(NODE).unwrap()
    }

    /// Build the SDO response acknowledging the given request frame
    fn ack_for(frame: &CanFrame) -> Option<CanFrame> {
        match SdoRequest::try_from(frame.data()).ok()? {
            SdoRequest::InitiateDownload { index, sub, .. } => Some(
                SdoResponse::download_acknowledge(index, sub)
                    .to_frame(CanId::new(0x580 | NODE as u16)),
            ),
            SdoRequest::InitiateUpload { index, sub } => Some(
                SdoResponse::expedited_upload(index, sub, &0x0002_0192u32.to_le_bytes())
                    .to_frame(CanId::new(0x580 | NODE as u16)),
            ),
            _ => None,
        }
    }

    /// Drive the node to PreOp, acknowledging all of its SDO traffic
    fn bring_to_preop(node: &mut RemoteNode<'_>, sender: &mut MockSender, start: u32) -> u32 {
        let mut now = start;
        for _ in 0..500 {
            now += 1;
            if let Some(frame) = sender.sent.pop() {
                if frame.id().raw() == (0x600 | NODE as u16) {
                    if let Some(ack) = ack_for(&frame) {
                        node.mbox().put_sdo_response(ack);
                    }
                } else if frame.id() == canherd_common::messages::NMT_CMD_ID
                    && frame.data()[0] == 0x81
                {
                    // The node reboots and emits its boot-up message
                    node.mbox()
                        .put_error_control(ErrorControl::bootup(NODE).into());
                }
            }
            node.update(now, SyncState::Idle, sender);
            if node.state() == NodeState::PreOp {
                return now;
            }
        }
        panic!("node did not reach PreOp, stuck in {:?}", node.state());
    }

    #[test]
    fn discovery_probes_every_interval() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        let mut sender = MockSender::default();

        // Nothing during the first interval
        node.update(100, SyncState::Idle, &mut sender);
        assert!(sender.sent.is_empty());

        node.update(201, SyncState::Idle, &mut sender);
        assert_eq!(sender.sent.len(), 1);
        assert_eq!(
            sender.sent[0].data,
            [0x40, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(sender.sent[0].id().raw(), 0x603);

        // No answer: one timeout retry of the same probe...
        node.update(230, SyncState::Idle, &mut sender);
        assert_eq!(sender.sent.len(), 2);
        assert_eq!(sender.sent[0].data, sender.sent[1].data);

        // ...then the transaction times out terminally
        node.update(260, SyncState::Idle, &mut sender);
        assert_eq!(sender.sent.len(), 2);

        // A fresh probe starts one request interval after the failure
        node.update(400, SyncState::Idle, &mut sender);
        assert_eq!(sender.sent.len(), 2);
        node.update(461, SyncState::Idle, &mut sender);
        assert_eq!(sender.sent.len(), 3);
    }

    #[test]
    fn discovery_answer_triggers_reset_and_boot_path() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        let mut sender = MockSender::default();

        node.update(201, SyncState::Idle, &mut sender);
        let probe = sender.sent.pop().unwrap();
        mbox.put_sdo_response(ack_for(&probe).unwrap());

        node.update(202, SyncState::Idle, &mut sender);
        assert_eq!(node.state(), NodeState::WaitForBoot);
        assert_eq!(node.device_type(), 0x0002_0192);
        // The NMT reset went out: [0x81, node]
        let reset = sender.sent.pop().unwrap();
        assert_eq!(reset.data(), &[0x81, NODE]);

        // Boot-up arrives
        mbox.put_error_control(ErrorControl::bootup(NODE).into());
        node.update(210, SyncState::Idle, &mut sender);
        assert_eq!(node.state(), NodeState::Booting);
        assert!(node.is_live());
        node.update(211, SyncState::Idle, &mut sender);
        assert_eq!(node.state(), NodeState::Reset);

        // No liveness configured: straight to PreOp
        node.update(212, SyncState::Idle, &mut sender);
        assert_eq!(node.state(), NodeState::PreOp);
    }

    #[test]
    fn guarding_configuration_writes_liveness_objects() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        node.configure_guarding(50, 3);
        let mut sender = MockSender::default();

        node.force_state(NodeState::Reset);
        let mut writes = Vec::new();
        let mut now = 0;
        while node.state() == NodeState::Reset {
            now += 1;
            if let Some(frame) = sender.sent.pop() {
                if let Ok(SdoRequest::InitiateDownload { index, sub, data, .. }) =
                    SdoRequest::try_from(frame.data())
                {
                    writes.push((index, sub, u32::from_le_bytes(data)));
                    mbox.put_sdo_response(ack_for(&frame).unwrap());
                }
            }
            node.update(now, SyncState::Idle, &mut sender);
            assert!(now < 100, "liveness configuration did not converge");
        }

        assert_eq!(
            writes,
            vec![
                (0x1017, 0, 0),
                (0x1016, 1, 0),
                (0x100C, 0, 50),
                (0x100D, 0, 3),
            ]
        );
        assert_eq!(node.state(), NodeState::PreOp);
        assert_eq!(node.guard_state(), GuardState::Expected);
    }

    #[test]
    fn guarding_round_trip_checks_toggle() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        node.configure_guarding(50, 3);
        let mut sender = MockSender::default();
        let mut now = bring_to_preop(&mut node, &mut sender, 0);

        // The guard request goes out as an RTR frame on 0x700 | id
        now += 1;
        node.update(now, SyncState::Idle, &mut sender);
        let rtr = sender.sent.pop().unwrap();
        assert!(rtr.rtr);
        assert_eq!(rtr.id().raw(), 0x703);
        assert_eq!(node.guard_state(), GuardState::Waiting);

        // Response with toggle 0 and state pre-operational
        mbox.put_error_control(
            ErrorControl {
                node: NODE,
                toggle: false,
                state: NmtState::PreOperational,
            }
            .into(),
        );
        now += 1;
        node.update(now, SyncState::Idle, &mut sender);
        assert_eq!(node.guard_state(), GuardState::ReceivedInTime);

        // After the guard window, the next request expects toggle 1
        now += 51;
        node.update(now, SyncState::Idle, &mut sender);
        assert_eq!(node.guard_state(), GuardState::Expected);
        now += 1;
        node.update(now, SyncState::Idle, &mut sender);
        assert_eq!(node.guard_state(), GuardState::Waiting);
        mbox.put_error_control(
            ErrorControl {
                node: NODE,
                toggle: true,
                state: NmtState::PreOperational,
            }
            .into(),
        );
        now += 1;
        node.update(now, SyncState::Idle, &mut sender);
        assert_eq!(node.guard_state(), GuardState::ReceivedInTime);
    }

    #[test]
    fn guarding_timeouts_exhaust_live_time_factor() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        node.configure_guarding(50, 3);
        let mut sender = MockSender::default();
        let mut now = bring_to_preop(&mut node, &mut sender, 0);

        // Four unanswered guard windows take the node down
        let mut rtr_count = 0;
        for _ in 0..300 {
            now += 1;
            node.update(now, SyncState::Idle, &mut sender);
            rtr_count += sender.sent.drain(..).filter(|f| f.rtr).count();
            if node.state() == NodeState::Offline {
                break;
            }
        }
        assert_eq!(node.state(), NodeState::Offline);
        assert_eq!(rtr_count, 4);
        assert_eq!(node.guard_state(), GuardState::Failed);
    }

    #[test]
    fn zero_live_time_factor_fails_on_first_timeout() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        node.configure_guarding(50, 0);
        let mut sender = MockSender::default();
        let mut now = bring_to_preop(&mut node, &mut sender, 0);

        now += 1;
        node.update(now, SyncState::Idle, &mut sender); // RTR out
        now += 51;
        node.update(now, SyncState::Idle, &mut sender); // TimedOut
        now += 1;
        node.update(now, SyncState::Idle, &mut sender); // Failed
        assert_eq!(node.state(), NodeState::Offline);
    }

    #[test]
    fn heartbeat_silence_fails_node() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        node.configure_heartbeat_producer(400);
        let mut sender = MockSender::default();
        let mut now = bring_to_preop(&mut node, &mut sender, 0);

        // Heartbeats keep it alive
        for _ in 0..3 {
            now += 400;
            mbox.put_error_control(
                ErrorControl {
                    node: NODE,
                    toggle: false,
                    state: NmtState::PreOperational,
                }
                .into(),
            );
            node.update(now, SyncState::Idle, &mut sender);
            assert_eq!(node.state(), NodeState::PreOp);
        }

        // Silence past 1.25x the producer time does not
        now += 501;
        node.update(now, SyncState::Idle, &mut sender);
        assert_eq!(node.state(), NodeState::Offline);
    }

    #[test]
    fn nmt_commands_update_modeled_state() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        let mut sender = MockSender::default();
        node.force_state(NodeState::PreOp);

        assert_eq!(node.send_start_node(&mut sender), CommState::Done);
        assert_eq!(node.state(), NodeState::Operational);
        assert_eq!(sender.sent.pop().unwrap().data(), &[0x01, NODE]);

        assert_eq!(node.send_stop_node(&mut sender), CommState::Done);
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(sender.sent.pop().unwrap().data(), &[0x02, NODE]);

        assert_eq!(node.send_preop_node(&mut sender), CommState::Done);
        assert_eq!(node.state(), NodeState::PreOp);
        assert_eq!(sender.sent.pop().unwrap().data(), &[0x80, NODE]);

        assert_eq!(node.send_reset_com(&mut sender), CommState::Done);
        assert_eq!(node.state(), NodeState::WaitForBoot);
        assert_eq!(sender.sent.pop().unwrap().data(), &[0x82, NODE]);
    }

    #[test]
    fn nmt_command_busy_retry() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        let mut sender = MockSender::default();
        node.force_state(NodeState::PreOp);

        sender.refuse = 1;
        assert_eq!(node.send_start_node(&mut sender), CommState::Retry);
        assert_eq!(node.state(), NodeState::PreOp);
        assert_eq!(node.send_start_node(&mut sender), CommState::Done);
        assert_eq!(node.state(), NodeState::Operational);
    }

    #[test]
    fn emcy_frames_are_recorded() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        let mut sender = MockSender::default();

        mbox.put_emcy(CanFrame::new(
            CanId::new(0x080 | NODE as u16),
            &[0x01, 0x43, 0x81, 0x34, 0x12, 0, 0, 0],
        ));
        node.update(1, SyncState::Idle, &mut sender);
        let emcy = node.last_emcy().unwrap();
        assert_eq!(emcy.code, 0x4301);
        assert_eq!(emcy.error_register, 0x81);
        assert_eq!(emcy.vendor_error, 0x1234);

        // A zero code clears the error
        mbox.put_emcy(CanFrame::new(
            CanId::new(0x080 | NODE as u16),
            &[0, 0, 0, 0, 0, 0, 0, 0],
        ));
        node.update(2, SyncState::Idle, &mut sender);
        assert_eq!(node.last_emcy().unwrap().code, 0);
    }

    #[test]
    fn bus_fault_forces_offline() {
        let mbox = NodeMbox::new();
        let mut node = RemoteNode::new(node_id(), &mbox);
        let mut sender = MockSender::default();
        node.force_state(NodeState::Operational);

        mbox.set_fault();
        node.update(1, SyncState::Idle, &mut sender);
        assert_eq!(node.state(), NodeState::Offline);
    }
}
