//! Traits at the seam between the protocol stack and the CAN hardware

use crate::messages::CanFrame;

/// CAN bitrates the stack can request from the controller
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanBitrate {
    /// 125 kbit/s
    Br125k,
    /// 250 kbit/s
    Br250k,
    /// 500 kbit/s
    Br500k,
    /// 1 Mbit/s
    Br1000k,
}

impl CanBitrate {
    /// The rate in bits per second
    pub const fn bits_per_sec(&self) -> u32 {
        match self {
            CanBitrate::Br125k => 125_000,
            CanBitrate::Br250k => 250_000,
            CanBitrate::Br500k => 500_000,
            CanBitrate::Br1000k => 1_000_000,
        }
    }
}

/// Events a CAN controller delivers to the stack
///
/// On bare-metal targets these originate in the controller interrupt and
/// should be fed to the router's mailbox from that context; drivers without
/// an interrupt path report them through [`CanInterface::poll_event`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanEvent {
    /// The previously posted frame left the controller
    TxComplete,
    /// A frame was received
    RxComplete(CanFrame),
    /// The controller entered the error-warning state
    BusWarning,
    /// The controller went bus-off
    BusOff,
    /// The controller recovered from bus-off
    BusRecovery,
    /// A received frame was overwritten before it could be read
    MailboxLost,
    /// A pending transmission was aborted
    Aborted,
    /// A channel-level controller error
    ChannelError,
}

/// A frame-level CAN controller
///
/// The contract mirrors a single-mailbox classic CAN peripheral: at most
/// one outbound frame is accepted at a time, and completion is signalled by
/// a [`CanEvent::TxComplete`] event.
pub trait CanInterface {
    /// Post a frame for transmission
    ///
    /// Returns false if the controller cannot accept the frame right now.
    fn send(&mut self, frame: &CanFrame) -> bool;

    /// Configure the bus bitrate
    fn set_bitrate(&mut self, rate: CanBitrate);

    /// Drain one pending controller event
    ///
    /// Polled drivers (socketcan, simulations) deliver their events here;
    /// interrupt-driven drivers feed the mailbox directly and leave this
    /// returning `None`.
    fn poll_event(&mut self) -> Option<CanEvent> {
        None
    }
}

/// The transmit seam handed to the protocol state machines
///
/// Implemented by the router, which gates it on the single-frame-in-flight
/// TX status. State machines observing a `false` return enter their retry
/// path and try again on the next poll.
pub trait FrameSender {
    /// Attempt to send a frame, returning false if the transmit resource is busy
    fn send_frame(&mut self, frame: &CanFrame) -> bool;
}
