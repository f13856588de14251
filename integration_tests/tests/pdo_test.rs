//! PDO configuration and process data exchange

use canherd_common::objects::{OdCell, OdEntry};
use canherd_common::traits::CanBitrate;
use canherd_common::NodeId;
use canherd_master::{
    BusMbox, CommState, NodeMbox, NodeState, PdoDir, RemoteNode, Router, SyncProducer,
};
use integration_tests::sim_bus::{SimCan, SimWorld};
use integration_tests::sim_slave::SimSlave;

mod utils;
use utils::{init_logging, step};

const NODE: u8 = 5;
const PDO_INVALID: u32 = 0x8000_0000;

fn run_pdo_config(
    world: &std::rc::Rc<std::cell::RefCell<SimWorld>>,
    router: &mut Router<'_, SimCan>,
    sync: &mut SyncProducer,
    node: &mut RemoteNode<'_>,
    t: &mut u32,
) {
    loop {
        *t += 1;
        step(world, router, sync, &mut [&mut *node], *t);
        match node.configure_preset_pdos(*t, router) {
            CommState::Done => break,
            CommState::Error => panic!("PDO configuration failed"),
            _ => {}
        }
        assert!(*t < 10_000, "PDO configuration did not converge");
    }
}

#[test]
fn configuration_lands_in_the_slave_dictionary() {
    init_logging();
    let world = SimWorld::new();
    world.borrow_mut().add_slave(SimSlave::new(NODE));

    let bus_mbox = BusMbox::new();
    let mut router = Router::new(SimCan::new(world.clone()), &bus_mbox);
    router.open(CanBitrate::Br250k);
    let mut sync = SyncProducer::new(NodeId::new(127).unwrap());

    let control_word = OdCell::u16(0);
    let status_word = OdCell::u16(0);
    let cw_entry = OdEntry::new(0x6040, 0, &control_word);
    let sw_entry = OdEntry::new(0x6041, 0, &status_word);

    let mbox = NodeMbox::new();
    let mut node = RemoteNode::new(NodeId::new(NODE).unwrap(), &mbox);
    node.pdo.preset_rx_transmission(0, 255);
    node.pdo.preset_rx_mapping(0, &[&cw_entry]).unwrap();
    node.pdo.preset_rx_valid(0, true);
    node.pdo.preset_tx_transmission(0, 255, 30, 100);
    node.pdo.preset_tx_mapping(0, &[&sw_entry]).unwrap();
    node.pdo.preset_tx_valid(0, true);
    node.attach(&mut router).unwrap();
    node.force_state(NodeState::PreOp);

    let mut t = 0;
    run_pdo_config(&world, &mut router, &mut sync, &mut node, &mut t);

    let mut w = world.borrow_mut();
    let slave = w.slave_mut(NODE);
    // RPDO1: enabled COB-ID, async transmission type, one mapping entry
    assert_eq!(slave.object_u32(0x1400, 1), Some(0x205));
    assert_eq!(slave.object_u32(0x1400, 2), Some(255));
    assert_eq!(slave.object_u32(0x1600, 0), Some(1));
    assert_eq!(slave.object_u32(0x1600, 1), Some(0x6040_0010));
    // TPDO1: enabled, with inhibit time and event timer
    assert_eq!(slave.object_u32(0x1800, 1), Some(0x185));
    assert_eq!(slave.object_u32(0x1800, 2), Some(255));
    assert_eq!(slave.object_u32(0x1800, 3), Some(30));
    assert_eq!(slave.object_u32(0x1800, 5), Some(100));
    assert_eq!(slave.object_u32(0x1A00, 1), Some(0x6041_0010));
    // Unconfigured PDOs carry the invalid flag on the wire
    assert_eq!(slave.object_u32(0x1401, 1), Some(0x305 | PDO_INVALID));
    assert_eq!(slave.object_u32(0x1801, 1), Some(0x285 | PDO_INVALID));

    assert!(node.pdo.is_active(PdoDir::Rx, 0));
    assert!(node.pdo.is_active(PdoDir::Tx, 0));
    assert!(!node.pdo.is_active(PdoDir::Rx, 1));
}

#[test]
fn application_write_triggers_async_rpdo() {
    init_logging();
    let world = SimWorld::new();
    world.borrow_mut().add_slave(SimSlave::new(NODE));

    let bus_mbox = BusMbox::new();
    let mut router = Router::new(SimCan::new(world.clone()), &bus_mbox);
    router.open(CanBitrate::Br250k);
    let mut sync = SyncProducer::new(NodeId::new(127).unwrap());

    let control_word = OdCell::u16(0);
    let cw_entry = OdEntry::new(0x6040, 0, &control_word);

    let mbox = NodeMbox::new();
    let mut node = RemoteNode::new(NodeId::new(NODE).unwrap(), &mbox);
    node.pdo.preset_rx_transmission(0, 255);
    node.pdo.preset_rx_mapping(0, &[&cw_entry]).unwrap();
    node.pdo.preset_rx_valid(0, true);
    node.attach(&mut router).unwrap();
    node.force_state(NodeState::PreOp);

    let mut t = 0;
    run_pdo_config(&world, &mut router, &mut sync, &mut node, &mut t);
    node.force_state(NodeState::Operational);

    // The application updates the control word and triggers the PDO
    // instead of an SDO write
    control_word.write_le(&0x000Fu16.to_le_bytes()).unwrap();
    assert!(node.tx_rpdos_async(&cw_entry));

    t += 1;
    step(&world, &mut router, &mut sync, &mut [&mut node], t);

    let mut w = world.borrow_mut();
    let slave = w.slave_mut(NODE);
    assert_eq!(slave.received_rpdos, vec![(0, vec![0x0F, 0x00])]);
}

#[test]
fn sync_triggers_cyclic_rpdos_of_all_nodes_in_order() {
    init_logging();
    let world = SimWorld::new();
    world.borrow_mut().add_slave(SimSlave::new(3));
    world.borrow_mut().add_slave(SimSlave::new(5));

    let bus_mbox = BusMbox::new();
    let mut router = Router::new(SimCan::new(world.clone()), &bus_mbox);
    router.open(CanBitrate::Br250k);
    let mut sync = SyncProducer::new(NodeId::new(127).unwrap());
    sync.set_sync_interval(10);

    let target_a = OdCell::u16(0x1111);
    let target_b = OdCell::u16(0x2222);
    let entry_a = OdEntry::new(0x607A, 0, &target_a);
    let entry_b = OdEntry::new(0x607A, 0, &target_b);

    let mbox_a = NodeMbox::new();
    let mut node_a = RemoteNode::new(NodeId::new(3).unwrap(), &mbox_a);
    node_a.pdo.preset_rx_transmission(0, 1);
    node_a.pdo.preset_rx_mapping(0, &[&entry_a]).unwrap();
    node_a.pdo.preset_rx_valid(0, true);
    node_a.attach(&mut router).unwrap();
    node_a.force_state(NodeState::PreOp);

    let mbox_b = NodeMbox::new();
    let mut node_b = RemoteNode::new(NodeId::new(5).unwrap(), &mbox_b);
    node_b.pdo.preset_rx_transmission(0, 1);
    node_b.pdo.preset_rx_mapping(0, &[&entry_b]).unwrap();
    node_b.pdo.preset_rx_valid(0, true);
    node_b.attach(&mut router).unwrap();
    node_b.force_state(NodeState::PreOp);

    let mut t = 0;
    run_pdo_config(&world, &mut router, &mut sync, &mut node_a, &mut t);
    run_pdo_config(&world, &mut router, &mut sync, &mut node_b, &mut t);
    node_a.force_state(NodeState::Operational);
    node_b.force_state(NodeState::Operational);
    sync.set_state(canherd_master::MasterState::Operational);

    let config_end = t + 1;
    for _ in 0..40 {
        t += 1;
        step(
            &world,
            &mut router,
            &mut sync,
            &mut [&mut node_a, &mut node_b],
            t,
        );
    }

    // Find each SYNC tick and check both PDOs followed on the same tick,
    // node 3 before node 5
    let log = world.borrow().wire_since(config_end);
    let sync_ticks: Vec<u32> = log
        .iter()
        .filter(|(_, f)| f.id().raw() == 0x080)
        .map(|(t, _)| *t)
        .collect();
    assert!(sync_ticks.len() >= 3);
    for sync_t in &sync_ticks {
        let same_tick: Vec<u16> = log
            .iter()
            .filter(|(t, f)| t == sync_t && matches!(f.id().raw(), 0x203 | 0x205))
            .map(|(_, f)| f.id().raw())
            .collect();
        assert_eq!(same_tick, vec![0x203, 0x205]);
    }

    // Both slaves keep receiving their process data
    let mut w = world.borrow_mut();
    assert!(w.slave_mut(3).received_rpdos.len() >= 3);
    assert_eq!(w.slave_mut(3).received_rpdos[0], (0, vec![0x11, 0x11]));
    assert_eq!(w.slave_mut(5).received_rpdos[0], (0, vec![0x22, 0x22]));
}

#[test]
fn received_tpdo_updates_the_od_image() {
    init_logging();
    let world = SimWorld::new();
    world.borrow_mut().add_slave(SimSlave::new(NODE));

    let bus_mbox = BusMbox::new();
    let mut router = Router::new(SimCan::new(world.clone()), &bus_mbox);
    router.open(CanBitrate::Br250k);
    let mut sync = SyncProducer::new(NodeId::new(127).unwrap());

    let status_word = OdCell::u16(0);
    let position = OdCell::u32(0);
    let sw_entry = OdEntry::new(0x6041, 0, &status_word);
    let pos_entry = OdEntry::new(0x6064, 0, &position);

    let mbox = NodeMbox::new();
    let mut node = RemoteNode::new(NodeId::new(NODE).unwrap(), &mbox);
    node.pdo.preset_tx_transmission(0, 255, 0, 0);
    node.pdo.preset_tx_mapping(0, &[&sw_entry, &pos_entry]).unwrap();
    node.pdo.preset_tx_valid(0, true);
    node.attach(&mut router).unwrap();
    node.force_state(NodeState::Operational);

    let frame = world
        .borrow_mut()
        .slave_mut(NODE)
        .tpdo_frame(0, &[0x27, 0x06, 0x40, 0x42, 0x0F, 0x00]);
    world.borrow_mut().inject(frame);

    let mut t = 0;
    t += 1;
    step(&world, &mut router, &mut sync, &mut [&mut node], t);

    assert_eq!(status_word.load_u16(), Some(0x0627));
    assert_eq!(position.load_u32(), Some(1_000_000));
}

#[test]
fn full_mapping_fills_eight_payload_bytes() {
    init_logging();
    let world = SimWorld::new();
    world.borrow_mut().add_slave(SimSlave::new(NODE));

    let bus_mbox = BusMbox::new();
    let mut router = Router::new(SimCan::new(world.clone()), &bus_mbox);
    router.open(CanBitrate::Br250k);
    let mut sync = SyncProducer::new(NodeId::new(127).unwrap());

    let cells = [
        OdCell::u16(0x0101),
        OdCell::u16(0x0202),
        OdCell::u16(0x0303),
        OdCell::u16(0x0404),
    ];
    let entries: Vec<OdEntry> = cells
        .iter()
        .enumerate()
        .map(|(i, c)| OdEntry::new(0x2000, i as u8 + 1, c))
        .collect();
    let refs: Vec<&OdEntry> = entries.iter().collect();

    let mbox = NodeMbox::new();
    let mut node = RemoteNode::new(NodeId::new(NODE).unwrap(), &mbox);
    node.pdo.preset_rx_transmission(0, 255);
    node.pdo.preset_rx_mapping(0, &refs).unwrap();
    node.pdo.preset_rx_valid(0, true);
    node.attach(&mut router).unwrap();
    node.force_state(NodeState::PreOp);

    let mut t = 0;
    run_pdo_config(&world, &mut router, &mut sync, &mut node, &mut t);
    node.force_state(NodeState::Operational);
    node.tx_rpdos_async(&entries[0]);

    t += 1;
    step(&world, &mut router, &mut sync, &mut [&mut node], t);

    let mut w = world.borrow_mut();
    let received = &w.slave_mut(NODE).received_rpdos;
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].1,
        vec![0x01, 0x01, 0x02, 0x02, 0x03, 0x03, 0x04, 0x04]
    );
}
