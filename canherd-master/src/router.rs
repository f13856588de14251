//! The bus router: owns the CAN endpoint, serializes outbound frames, and
//! dispatches inbound frames to per-node mailboxes by function code and
//! node id.

use canherd_common::messages::{CanFrame, FunctionCode};
use canherd_common::traits::{CanBitrate, CanInterface, FrameSender};
use canherd_common::NodeId;
use defmt_or_log::{debug, warn};
use snafu::Snafu;

use crate::mbox::{BusMbox, NodeMbox, TxStatus};

/// Maximum number of nodes a router can serve
pub const MAX_NODES: usize = 16;

/// Opaque handle to a registered node slot
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeHandle(u8);

struct Slot<'a> {
    node_id: NodeId,
    mbox: &'a NodeMbox,
}

/// Errors raised by node registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum RegisterError {
    /// A node with this id is already registered
    #[snafu(display("node {node} is already registered"))]
    DuplicateNode {
        /// The offending node id
        node: u8,
    },
    /// All node slots are in use
    TableFull,
}

/// The single owner of the CAN endpoint
///
/// All transmissions funnel through [`Router::send`], which enforces that
/// exactly one frame is in flight at a time. [`Router::poll`] drains the
/// receive ring and delivers each frame into the mailbox of the node its
/// COB-ID addresses.
pub struct Router<'a, I> {
    iface: I,
    mbox: &'a BusMbox,
    slots: [Option<Slot<'a>>; MAX_NODES],
}

impl<'a, I: CanInterface> Router<'a, I> {
    /// Create a new router over a CAN interface
    ///
    /// `mbox` is the bus inbox the driver context feeds; on interrupt-driven
    /// targets, share it with the controller IRQ handler.
    pub fn new(iface: I, mbox: &'a BusMbox) -> Self {
        Self {
            iface,
            mbox,
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Configure the bitrate and bring the transmit resource online
    pub fn open(&mut self, bitrate: CanBitrate) {
        self.iface.set_bitrate(bitrate);
        self.mbox.set_tx_status(TxStatus::Idle);
    }

    /// Reserve a slot for a node and attach its mailbox
    pub fn register_node(
        &mut self,
        node_id: NodeId,
        mbox: &'a NodeMbox,
    ) -> Result<NodeHandle, RegisterError> {
        if self
            .slots
            .iter()
            .flatten()
            .any(|slot| slot.node_id == node_id)
        {
            return DuplicateNodeSnafu {
                node: node_id.raw(),
            }
            .fail();
        }
        let free = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(RegisterError::TableFull)?;
        self.slots[free] = Some(Slot { node_id, mbox });
        debug!("registered node {} at slot {}", node_id.raw(), free);
        Ok(NodeHandle(free as u8))
    }

    /// Release a slot, clearing everything pending in its mailbox
    pub fn unregister_node(&mut self, handle: NodeHandle) {
        if let Some(slot) = self.slots[handle.0 as usize].take() {
            slot.mbox.clear();
        }
    }

    /// The node id registered at `handle`, if the slot is in use
    pub fn node_id(&self, handle: NodeHandle) -> Option<NodeId> {
        self.slots[handle.0 as usize]
            .as_ref()
            .map(|slot| slot.node_id)
    }

    /// Drain controller events and dispatch all received frames
    ///
    /// Called once per tick from the main loop, before the node updates.
    pub fn poll(&mut self, _now: u32) {
        while let Some(event) = self.iface.poll_event() {
            self.mbox.handle_event(event);
        }
        if self.mbox.take_fault() {
            warn!("bus fault reported; marking all nodes");
            for slot in self.slots.iter().flatten() {
                slot.mbox.set_fault();
            }
        }
        while let Some(frame) = self.mbox.pop_frame() {
            self.dispatch(&frame);
        }
    }

    fn dispatch(&self, frame: &CanFrame) {
        let function = match FunctionCode::classify(frame.id()) {
            Some(f) => f,
            None => {
                debug!("dropping frame with unknown COB-ID {}", frame.id().raw());
                return;
            }
        };

        // Services the master itself produces are never dispatched inbound.
        match function {
            FunctionCode::Nmt | FunctionCode::SdoRequest | FunctionCode::Rpdo(_) => return,
            FunctionCode::SyncOrEmcy if frame.id().node_id() == 0 => return,
            _ => {}
        }

        let node_id = frame.id().node_id();
        let slot = match self
            .slots
            .iter()
            .flatten()
            .find(|slot| slot.node_id.raw() == node_id)
        {
            Some(slot) => slot,
            // Frames from unregistered nodes are dropped without error.
            None => return,
        };

        match function {
            FunctionCode::SyncOrEmcy => slot.mbox.put_emcy(*frame),
            FunctionCode::Tpdo(n) => slot.mbox.put_tpdo(n as usize, *frame),
            FunctionCode::SdoResponse => slot.mbox.put_sdo_response(*frame),
            FunctionCode::ErrorControl => slot.mbox.put_error_control(*frame),
            FunctionCode::Nmt | FunctionCode::SdoRequest | FunctionCode::Rpdo(_) => {}
        }
    }

    /// Post a frame if the transmit resource is idle
    ///
    /// A successful post marks the resource busy until the driver reports
    /// TxComplete. Callers seeing `false` retry on a later poll.
    pub fn send(&mut self, frame: &CanFrame) -> bool {
        if self.mbox.tx_status() != TxStatus::Idle {
            return false;
        }
        if self.iface.send(frame) {
            self.mbox.set_tx_status(TxStatus::Busy);
            true
        } else {
            false
        }
    }

    /// Access the bus inbox
    pub fn bus_mbox(&self) -> &'a BusMbox {
        self.mbox
    }
}

impl<I: CanInterface> FrameSender for Router<'_, I> {
    fn send_frame(&mut self, frame: &CanFrame) -> bool {
        self.send(frame)
    }
}
