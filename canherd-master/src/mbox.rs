//! Mailboxes between the receive context and the polling context
//!
//! On bare-metal targets the CAN controller interrupt delivers events while
//! the protocol state machines run in the main polling loop. Two mailbox
//! types carry everything that crosses that boundary:
//!
//! - [`BusMbox`]: the bus-wide inbox. The driver (or its interrupt handler)
//!   stores every received frame into a fixed ring and flags TX completion
//!   and bus faults; [`Router::poll`](crate::Router::poll) drains it.
//! - [`NodeMbox`]: per-node service slots the router dispatches into, read
//!   by that node's state machines on its next update.

use canherd_common::messages::CanFrame;
use canherd_common::traits::CanEvent;
use canherd_common::AtomicCell;
use defmt_or_log::warn;

/// Capacity of the bus receive ring
///
/// One slot is kept free to distinguish full from empty, leaving room for
/// 31 undrained frames between polls.
pub const RX_RING_CAPACITY: usize = 32;

/// Number of TPDO slots per node
pub const TPDO_SLOTS: usize = 4;

/// State of the single outbound transmit resource
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// The interface has not been opened yet
    #[default]
    Offline,
    /// No frame is in flight; a send will be accepted
    Idle,
    /// A frame is in flight; sends are refused until TxComplete
    Busy,
}

/// The bus-wide inbox shared between the driver context and the router
pub struct BusMbox {
    ring: [AtomicCell<Option<CanFrame>>; RX_RING_CAPACITY],
    head: AtomicCell<usize>,
    tail: AtomicCell<usize>,
    tx_status: AtomicCell<TxStatus>,
    fault: AtomicCell<bool>,
    lost_frames: AtomicCell<u32>,
}

impl BusMbox {
    /// Create a new BusMbox
    pub const fn new() -> Self {
        Self {
            ring: [const { AtomicCell::new(None) }; RX_RING_CAPACITY],
            head: AtomicCell::new(0),
            tail: AtomicCell::new(0),
            tx_status: AtomicCell::new(TxStatus::Offline),
            fault: AtomicCell::new(false),
            lost_frames: AtomicCell::new(0),
        }
    }

    /// Feed one controller event into the mailbox
    ///
    /// Safe to call from interrupt context; it only touches atomic cells.
    pub fn handle_event(&self, event: CanEvent) {
        match event {
            CanEvent::TxComplete => self.tx_status.store(TxStatus::Idle),
            CanEvent::RxComplete(frame) => {
                if self.store_frame(frame).is_err() {
                    self.lost_frames.fetch_add(1);
                }
            }
            CanEvent::BusWarning | CanEvent::BusOff | CanEvent::ChannelError => {
                self.fault.store(true);
            }
            CanEvent::BusRecovery => {
                // The stack performs no automatic recovery; nodes re-enter
                // discovery once the application clears their state.
            }
            CanEvent::MailboxLost => {
                self.lost_frames.fetch_add(1);
            }
            CanEvent::Aborted => {
                // The in-flight frame is gone; free the transmit resource.
                self.tx_status.store(TxStatus::Idle);
            }
        }
    }

    /// Store a received frame, failing when the ring is full
    pub fn store_frame(&self, frame: CanFrame) -> Result<(), CanFrame> {
        let head = self.head.load();
        let next = (head + 1) % RX_RING_CAPACITY;
        if next == self.tail.load() {
            return Err(frame);
        }
        self.ring[head].store(Some(frame));
        self.head.store(next);
        Ok(())
    }

    /// Pop the oldest received frame
    pub fn pop_frame(&self) -> Option<CanFrame> {
        let tail = self.tail.load();
        if tail == self.head.load() {
            return None;
        }
        let frame = self.ring[tail].take();
        self.tail.store((tail + 1) % RX_RING_CAPACITY);
        if frame.is_none() {
            warn!("RX ring slot was empty despite head/tail mismatch");
        }
        frame
    }

    /// Current state of the transmit resource
    pub fn tx_status(&self) -> TxStatus {
        self.tx_status.load()
    }

    pub(crate) fn set_tx_status(&self, status: TxStatus) {
        self.tx_status.store(status);
    }

    /// Consume the latched bus fault flag
    pub fn take_fault(&self) -> bool {
        self.fault.take()
    }

    /// Number of frames dropped because the ring was full or the controller
    /// reported an overrun
    pub fn lost_frames(&self) -> u32 {
        self.lost_frames.load()
    }
}

impl Default for BusMbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node service slots filled by the router
///
/// Each slot holds the most recent undelivered frame of its service. That
/// is sufficient for every service the master consumes: SDO allows a single
/// transaction in flight, error-control frames supersede each other, and
/// PDOs are last-is-best process data.
pub struct NodeMbox {
    sdo_response: AtomicCell<Option<CanFrame>>,
    error_control: AtomicCell<Option<CanFrame>>,
    emcy: AtomicCell<Option<CanFrame>>,
    tpdo: [AtomicCell<Option<CanFrame>>; TPDO_SLOTS],
    fault: AtomicCell<bool>,
}

impl NodeMbox {
    /// Create a new NodeMbox
    pub const fn new() -> Self {
        Self {
            sdo_response: AtomicCell::new(None),
            error_control: AtomicCell::new(None),
            emcy: AtomicCell::new(None),
            tpdo: [const { AtomicCell::new(None) }; TPDO_SLOTS],
            fault: AtomicCell::new(false),
        }
    }

    pub(crate) fn put_sdo_response(&self, frame: CanFrame) {
        self.sdo_response.store(Some(frame));
    }

    pub(crate) fn put_error_control(&self, frame: CanFrame) {
        self.error_control.store(Some(frame));
    }

    pub(crate) fn put_emcy(&self, frame: CanFrame) {
        self.emcy.store(Some(frame));
    }

    pub(crate) fn put_tpdo(&self, pdo: usize, frame: CanFrame) {
        self.tpdo[pdo].store(Some(frame));
    }

    pub(crate) fn set_fault(&self) {
        self.fault.store(true);
    }

    /// Take the pending SDO response frame, if any
    pub fn take_sdo_response(&self) -> Option<CanFrame> {
        self.sdo_response.take()
    }

    /// Take the pending NMT error control frame, if any
    pub fn take_error_control(&self) -> Option<CanFrame> {
        self.error_control.take()
    }

    /// Take the pending EMCY frame, if any
    pub fn take_emcy(&self) -> Option<CanFrame> {
        self.emcy.take()
    }

    /// Take the pending frame of TPDO `pdo` (0..4), if any
    pub fn take_tpdo(&self, pdo: usize) -> Option<CanFrame> {
        self.tpdo[pdo].take()
    }

    /// Consume the bus fault mark for this node
    pub fn take_fault(&self) -> bool {
        self.fault.take()
    }

    /// Drop everything pending; used when the slot is released
    pub fn clear(&self) {
        self.sdo_response.store(None);
        self.error_control.store(None);
        self.emcy.store(None);
        for slot in &self.tpdo {
            slot.store(None);
        }
        self.fault.store(false);
    }
}

impl Default for NodeMbox {
    fn default() -> Self {
        Self::new()
    }
}
