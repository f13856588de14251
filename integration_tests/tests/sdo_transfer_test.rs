//! SDO transfers between the master's client and a simulated server

use canherd_common::traits::CanBitrate;
use canherd_common::NodeId;
use canherd_master::{BusMbox, CommState, NodeMbox, NodeState, RemoteNode, Router, SyncProducer};
use integration_tests::sim_bus::{SimCan, SimWorld};
use integration_tests::sim_slave::SimSlave;

mod utils;
use utils::{init_logging, step};

const NODE: u8 = 4;

struct Rig {
    world: std::rc::Rc<std::cell::RefCell<SimWorld>>,
    bus_mbox: BusMbox,
    mbox: NodeMbox,
}

impl Rig {
    fn new() -> Self {
        init_logging();
        let world = SimWorld::new();
        world.borrow_mut().add_slave(SimSlave::new(NODE));
        Self {
            world,
            bus_mbox: BusMbox::new(),
            mbox: NodeMbox::new(),
        }
    }
}

/// Drive a closure of the node's SDO client until it returns a terminal state
fn drive<'a>(
    rig: &'a Rig,
    router: &mut Router<'a, SimCan>,
    sync: &mut SyncProducer,
    node: &mut RemoteNode<'a>,
    t: &mut u32,
    mut op: impl FnMut(&mut RemoteNode<'a>, &mut Router<'a, SimCan>) -> CommState,
) -> CommState {
    loop {
        *t += 1;
        step(&rig.world, router, sync, &mut [&mut *node], *t);
        let state = op(node, router);
        if state.is_terminal() {
            return state;
        }
        assert!(*t < 100_000, "SDO operation did not converge");
    }
}

fn setup<'a>(rig: &'a Rig) -> (Router<'a, SimCan>, SyncProducer, RemoteNode<'a>) {
    let mut router = Router::new(SimCan::new(rig.world.clone()), &rig.bus_mbox);
    router.open(CanBitrate::Br250k);
    let sync = SyncProducer::new(NodeId::new(127).unwrap());
    let mut node = RemoteNode::new(NodeId::new(NODE).unwrap(), &rig.mbox);
    node.attach(&mut router).unwrap();
    // Keep the supervisor quiet; only the SDO client is under test
    node.force_state(NodeState::Stopped);
    (router, sync, node)
}

#[test]
fn write_read_round_trip_across_lengths() {
    let rig = Rig::new();
    let (mut router, mut sync, mut node) = setup(&rig);
    let mut t = 0;

    for len in [1usize, 2, 3, 4, 5, 7, 8, 14, 15, 100, 1024] {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();

        let start = rig.world.borrow().wire_log.len();
        let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
            n.sdo.write(0x2000, 0, &data, r)
        });
        assert_eq!(state, CommState::Done, "write of {len} bytes failed");
        node.sdo.reset();

        // Expedited for up to 4 bytes, segmented beyond; segment count is
        // ceil(len / 7)
        let requests: Vec<Vec<u8>> = rig.world.borrow().wire_log[start..]
            .iter()
            .filter(|(_, f)| f.id().raw() == 0x600 | NODE as u16)
            .map(|(_, f)| f.data().to_vec())
            .collect();
        let segments = requests.iter().filter(|d| d[0] >> 5 == 0).count();
        if len <= 4 {
            assert_eq!(segments, 0);
            assert_eq!(requests[0][0] & 0x02, 0x02, "expedited bit expected");
        } else {
            assert_eq!(segments, len.div_ceil(7));
            assert_eq!(requests[0][0] & 0x02, 0x00, "segmented transfer expected");
        }

        assert_eq!(
            rig.world.borrow_mut().slave_mut(NODE).object(0x2000, 0),
            Some(&data)
        );

        let mut buf = vec![0u8; 1024];
        let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
            n.sdo.read(0x2000, 0, &mut buf, r)
        });
        assert_eq!(state, CommState::Done, "read of {len} bytes failed");
        assert_eq!(node.sdo.transferred(), len);
        assert_eq!(&buf[0..len], &data[..]);
        node.sdo.reset();
    }
}

#[test]
fn segmented_download_exact_wire_dialogue() {
    let rig = Rig::new();
    let (mut router, mut sync, mut node) = setup(&rig);
    let mut t = 0;

    let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
        n.sdo.write(0x2000, 0, &data, r)
    });
    assert_eq!(state, CommState::Done);

    let dialogue: Vec<(u16, [u8; 8])> = rig
        .world
        .borrow()
        .wire_log
        .iter()
        .filter(|(_, f)| matches!(f.id().raw(), 0x604 | 0x584))
        .map(|(_, f)| (f.id().raw(), f.data))
        .collect();
    assert_eq!(
        dialogue,
        vec![
            (0x604, [0x21, 0x00, 0x20, 0x00, 0x0A, 0x00, 0x00, 0x00]),
            (0x584, [0x60, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]),
            (0x604, [0x00, 1, 2, 3, 4, 5, 6, 7]),
            (0x584, [0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
            (0x604, [0x19, 8, 9, 10, 0x00, 0x00, 0x00, 0x00]),
            (0x584, [0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
        ]
    );
}

#[test]
fn repeated_upload_toggle_aborts_the_transfer() {
    let rig = Rig::new();
    {
        let mut w = rig.world.borrow_mut();
        let slave = w.slave_mut(NODE);
        slave.set_object(0x2000, 0, (0u8..20).collect());
        slave.corrupt_upload_toggle = true;
    }
    let (mut router, mut sync, mut node) = setup(&rig);
    let mut t = 0;

    let mut buf = [0u8; 32];
    let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
        n.sdo.read(0x2000, 0, &mut buf, r)
    });
    assert_eq!(state, CommState::Error);

    // The master aborted with ToggleNotAlternated...
    let aborts: Vec<[u8; 8]> = rig
        .world
        .borrow()
        .wire_log
        .iter()
        .filter(|(_, f)| f.id().raw() == 0x604 && f.data[0] >> 5 == 4)
        .map(|(_, f)| f.data)
        .collect();
    assert_eq!(aborts.len(), 1);
    assert_eq!(&aborts[0][4..8], &0x0503_0000u32.to_le_bytes());

    // ...and goes quiet until the application clears the error
    let frames_at_error = rig.world.borrow().wire_log.len();
    for _ in 0..50 {
        t += 1;
        step(&rig.world, &mut router, &mut sync, &mut [&mut node], t);
        let state = node.sdo.read(0x2000, 0, &mut buf, &mut router);
        assert_eq!(state, CommState::Error);
    }
    assert_eq!(rig.world.borrow().wire_log.len(), frames_at_error);

    node.reset_com_state();
    assert_eq!(node.sdo.state(), CommState::Idle);
}

#[test]
fn silent_server_times_out_after_retry() {
    let rig = Rig::new();
    rig.world.borrow_mut().slave_mut(NODE).muted = true;
    let (mut router, mut sync, mut node) = setup(&rig);
    let mut t = 0;

    let mut buf = [0u8; 4];
    let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
        n.sdo.read(0x1000, 0, &mut buf, r)
    });
    assert_eq!(state, CommState::Timeout);

    // The original request and one retry went to the wire
    let requests: Vec<[u8; 8]> = rig
        .world
        .borrow()
        .wire_log
        .iter()
        .filter(|(_, f)| f.id().raw() == 0x604)
        .map(|(_, f)| f.data)
        .collect();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
}

#[test]
fn bulk_entry_transfers_drive_whole_sets() {
    use canherd_common::objects::{OdCell, OdEntry};

    let rig = Rig::new();
    {
        let mut w = rig.world.borrow_mut();
        let slave = w.slave_mut(NODE);
        slave.set_object(0x6040, 0, vec![0x0F, 0x00]);
        slave.set_object(0x6060, 0, vec![0x01]);
    }
    let (mut router, mut sync, mut node) = setup(&rig);
    let mut t = 0;

    let control_word = OdCell::u16(0);
    let op_mode = OdCell::u8(0);
    let cw_entry = OdEntry::new(0x6040, 0, &control_word);
    let mode_entry = OdEntry::new(0x6060, 0, &op_mode);
    let entries = [&cw_entry, &mode_entry];

    let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
        n.sdo.read_entries(&entries, r)
    });
    assert_eq!(state, CommState::Done);
    assert_eq!(control_word.load_u16(), Some(0x000F));
    assert_eq!(op_mode.load_u8(), Some(1));

    // Write them back with changed values
    control_word.write_le(&0x001Fu16.to_le_bytes()).unwrap();
    op_mode.write_le(&[3]).unwrap();
    let state = drive(&rig, &mut router, &mut sync, &mut node, &mut t, |n, r| {
        n.sdo.write_entries(&entries, r)
    });
    assert_eq!(state, CommState::Done);

    let mut w = rig.world.borrow_mut();
    let slave = w.slave_mut(NODE);
    assert_eq!(slave.object(0x6040, 0), Some(&vec![0x1F, 0x00]));
    assert_eq!(slave.object(0x6060, 0), Some(&vec![3]));
}
