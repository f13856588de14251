//! A simulated CAN bus
//!
//! [`SimWorld`] owns the slaves and a wire log of every frame that crossed
//! the bus; [`SimCan`] is the [`CanInterface`] handed to the router. Sends
//! are delivered to all slaves synchronously, slave responses come back as
//! receive events on the next poll, and tests can script transmit-busy
//! windows to exercise the retry paths.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use canherd_common::messages::CanFrame;
use canherd_common::traits::{CanBitrate, CanEvent, CanInterface};

use crate::sim_slave::SimSlave;

/// Everything on the simulated bus
pub struct SimWorld {
    slaves: Vec<SimSlave>,
    events: VecDeque<CanEvent>,
    /// Every frame observed on the wire, master and slave alike, with the
    /// tick it was sent on
    pub wire_log: Vec<(u32, CanFrame)>,
    /// Number of upcoming sends to refuse, simulating a busy controller
    pub refuse_sends: usize,
    now: u32,
}

impl SimWorld {
    /// Create an empty world behind the shared handle the tests keep
    pub fn new() -> Rc<RefCell<SimWorld>> {
        Rc::new(RefCell::new(SimWorld {
            slaves: Vec::new(),
            events: VecDeque::new(),
            wire_log: Vec::new(),
            refuse_sends: 0,
            now: 0,
        }))
    }

    /// Put a slave on the bus
    pub fn add_slave(&mut self, slave: SimSlave) {
        self.slaves.push(slave);
    }

    /// Access a slave by node id
    pub fn slave_mut(&mut self, node_id: u8) -> &mut SimSlave {
        self.slaves
            .iter_mut()
            .find(|s| s.node_id == node_id)
            .expect("no such slave")
    }

    /// Advance simulated time, producing the slaves' periodic traffic
    pub fn tick(&mut self, now: u32) {
        self.now = now;
        let mut produced = Vec::new();
        for slave in self.slaves.iter_mut() {
            produced.extend(slave.tick(now));
        }
        for frame in produced {
            self.wire_log.push((now, frame));
            self.events.push_back(CanEvent::RxComplete(frame));
        }
    }

    /// Inject a frame as if a node had transmitted it
    pub fn inject(&mut self, frame: CanFrame) {
        self.wire_log.push((self.now, frame));
        self.events.push_back(CanEvent::RxComplete(frame));
    }

    /// Inject a controller event (bus-off and friends)
    pub fn inject_event(&mut self, event: CanEvent) {
        self.events.push_back(event);
    }

    /// Wire log entries from tick `from` onward
    pub fn wire_since(&self, from: u32) -> Vec<(u32, CanFrame)> {
        self.wire_log
            .iter()
            .filter(|(t, _)| *t >= from)
            .cloned()
            .collect()
    }
}

/// The master's CAN interface into a [`SimWorld`]
pub struct SimCan {
    world: Rc<RefCell<SimWorld>>,
}

impl SimCan {
    /// Create an interface attached to the world
    pub fn new(world: Rc<RefCell<SimWorld>>) -> Self {
        Self { world }
    }
}

impl CanInterface for SimCan {
    fn send(&mut self, frame: &CanFrame) -> bool {
        let mut world = self.world.borrow_mut();
        if world.refuse_sends > 0 {
            world.refuse_sends -= 1;
            return false;
        }
        let now = world.now;
        world.wire_log.push((now, *frame));
        world.events.push_back(CanEvent::TxComplete);

        let mut responses = Vec::new();
        for slave in world.slaves.iter_mut() {
            responses.extend(slave.handle_frame(frame, now));
        }
        for response in responses {
            world.wire_log.push((now, response));
            world.events.push_back(CanEvent::RxComplete(response));
        }
        true
    }

    fn set_bitrate(&mut self, _rate: CanBitrate) {}

    fn poll_event(&mut self) -> Option<CanEvent> {
        self.world.borrow_mut().events.pop_front()
    }
}
