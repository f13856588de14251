//! A [`CanInterface`] over Linux socketcan, for running the master on a
//! host against `can0`/`vcan0` style devices.

use std::collections::VecDeque;
use std::io::ErrorKind;

use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket, StandardId};

use crate::messages::{CanFrame, CanId};
use crate::traits::{CanBitrate, CanEvent, CanInterface};

/// A synchronous socketcan-backed CAN interface
///
/// The kernel accepts frames immediately, so a `TxComplete` event is
/// synthesized after every successful send; received frames surface as
/// `RxComplete` events from [`CanInterface::poll_event`]. Extended-id
/// frames are ignored, as the stack speaks CAN 2.0A only.
#[derive(Debug)]
pub struct SocketCanInterface {
    socket: CanSocket,
    pending: VecDeque<CanEvent>,
}

impl SocketCanInterface {
    /// Open a socketcan device, e.g. "vcan0" or "can0"
    pub fn open(device: &str) -> Result<Self, socketcan::IoError> {
        let socket = CanSocket::open(device)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            pending: VecDeque::new(),
        })
    }

    fn convert_incoming(frame: socketcan::CanFrame) -> Option<CanFrame> {
        let id = match frame.can_id() {
            socketcan::CanId::Standard(id) => CanId::new(id.as_raw()),
            socketcan::CanId::Extended(_) => return None,
        };
        match frame {
            socketcan::CanFrame::Data(data) => Some(CanFrame::new(id, data.data())),
            socketcan::CanFrame::Remote(remote) => Some(CanFrame::new_rtr(id, remote.dlc() as u8)),
            socketcan::CanFrame::Error(_) => None,
        }
    }
}

impl CanInterface for SocketCanInterface {
    fn send(&mut self, frame: &CanFrame) -> bool {
        let id = match StandardId::new(frame.id.raw()) {
            Some(id) => id,
            None => return false,
        };
        let out = if frame.rtr {
            socketcan::CanFrame::new_remote(id, frame.dlc as usize)
        } else {
            socketcan::CanFrame::new(id, frame.data())
        };
        let out = match out {
            Some(f) => f,
            None => return false,
        };
        match self.socket.write_frame(&out) {
            Ok(()) => {
                self.pending.push_back(CanEvent::TxComplete);
                true
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(_) => {
                self.pending.push_back(CanEvent::ChannelError);
                false
            }
        }
    }

    fn set_bitrate(&mut self, _rate: CanBitrate) {
        // The bitrate of a socketcan device is configured via the netlink
        // interface (`ip link set`), outside the scope of this socket.
    }

    fn poll_event(&mut self) -> Option<CanEvent> {
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        match self.socket.read_frame() {
            Ok(frame) => Self::convert_incoming(frame).map(CanEvent::RxComplete),
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(_) => Some(CanEvent::ChannelError),
        }
    }
}
