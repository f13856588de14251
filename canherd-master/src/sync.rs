//! SYNC and heartbeat production for the master device
//!
//! The master broadcasts two unconfirmed services on behalf of itself: the
//! periodic SYNC frame that triggers synchronous PDO traffic, and its own
//! producer heartbeat. It also issues the global NMT commands addressed to
//! all nodes at once.

use canherd_common::messages::{sync_frame, CanFrame, FunctionCode, NmtCommand, NmtCommandSpecifier};
use canherd_common::traits::FrameSender;
use canherd_common::NodeId;
use defmt_or_log::{debug, warn};

use crate::comm::CommState;

/// Whether a SYNC frame was produced on the current tick
///
/// Passed into each node's update so cyclic-sync PDOs trigger on the same
/// tick the SYNC went out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncState {
    /// No SYNC was sent this tick
    Idle,
    /// A SYNC frame was just transmitted
    SyncSent,
}

/// The master's own operating state, governing what it broadcasts
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MasterState {
    /// Nothing is produced
    Offline,
    /// Heartbeat only
    PreOp,
    /// Heartbeat and SYNC
    Operational,
}

impl MasterState {
    /// The NMT state byte reported in the master heartbeat
    fn heartbeat_byte(&self) -> u8 {
        match self {
            MasterState::Offline => 0,
            MasterState::PreOp => 127,
            MasterState::Operational => 5,
        }
    }
}

/// Producer of SYNC, master heartbeat, and global NMT commands
pub struct SyncProducer {
    node_id: NodeId,
    state: MasterState,
    sync_interval: u32,
    heartbeat_time: u32,
    last_sync: u32,
    last_heartbeat: u32,
    request_state: CommState,
    busy_retries: u8,
    busy_retry_max: u8,
}

impl SyncProducer {
    /// Create a producer using `node_id` as the master's own id
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: MasterState::Offline,
            sync_interval: 0,
            heartbeat_time: 0,
            last_sync: 0,
            last_heartbeat: 0,
            request_state: CommState::Idle,
            busy_retries: 0,
            busy_retry_max: 1,
        }
    }

    /// Force the master state, controlling SYNC and heartbeat production
    pub fn set_state(&mut self, state: MasterState) {
        self.state = state;
    }

    /// The current master state
    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Set the SYNC period in ms; zero disables SYNC production
    pub fn set_sync_interval(&mut self, interval: u32) {
        self.sync_interval = interval;
    }

    /// Set the heartbeat period in ms; zero disables heartbeat production
    pub fn set_heartbeat_time(&mut self, time: u32) {
        self.heartbeat_time = time;
    }

    /// Produce the periodic broadcasts that are due at `now`
    ///
    /// Returns [`SyncState::SyncSent`] on the tick a SYNC frame went out;
    /// feed that into every node update of the same tick.
    pub fn update(&mut self, now: u32, sender: &mut dyn FrameSender) -> SyncState {
        let mut result = SyncState::Idle;

        if self.state == MasterState::PreOp || self.state == MasterState::Operational {
            self.produce_heartbeat(now, sender);
        }

        if self.state == MasterState::Operational
            && self.sync_interval > 0
            && now.wrapping_sub(self.last_sync) >= self.sync_interval
        {
            // Unconfirmed; a busy transmit just shifts it to a later tick.
            if sender.send_frame(&sync_frame()) {
                self.last_sync = now;
                result = SyncState::SyncSent;
            }
        }
        result
    }

    fn produce_heartbeat(&mut self, now: u32, sender: &mut dyn FrameSender) {
        if self.heartbeat_time == 0 {
            return;
        }
        if now.wrapping_sub(self.last_heartbeat) >= self.heartbeat_time {
            let frame = CanFrame::new(
                FunctionCode::ErrorControl.cob_id(self.node_id.raw()),
                &[self.state.heartbeat_byte()],
            );
            if sender.send_frame(&frame) {
                self.last_heartbeat = now;
            }
        }
    }

    /// Broadcast an NMT reset to all nodes; the master drops to PreOp
    pub fn send_reset_nodes(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_global_command(NmtCommandSpecifier::ResetNode, MasterState::PreOp, sender)
    }

    /// Broadcast an NMT start to all nodes; the master goes Operational
    pub fn send_start_nodes(&mut self, sender: &mut dyn FrameSender) -> CommState {
        self.send_global_command(NmtCommandSpecifier::Start, MasterState::Operational, sender)
    }

    fn send_global_command(
        &mut self,
        cs: NmtCommandSpecifier,
        next_state: MasterState,
        sender: &mut dyn FrameSender,
    ) -> CommState {
        match self.request_state {
            CommState::Idle | CommState::Retry => {
                let frame: CanFrame = NmtCommand { cs, node: 0 }.into();
                if sender.send_frame(&frame) {
                    self.request_state = CommState::Idle;
                    self.busy_retries = 0;
                    self.state = next_state;
                    debug!("global NMT command {:?} sent", cs);
                    CommState::Done
                } else {
                    self.busy_retries += 1;
                    if self.busy_retries > self.busy_retry_max {
                        warn!("global NMT command stuck on busy transmit");
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

    /// Clear a failed global command request
    pub fn reset_request(&mut self) {
        self.request_state = CommState::Idle;
        self.busy_retries = 0;
    }
}
