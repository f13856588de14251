//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use canherd_master::{RemoteNode, Router, SyncProducer};
use integration_tests::sim_bus::{SimCan, SimWorld};

/// Advance the whole system by one tick at time `t`
///
/// Mirrors the application main loop: slave traffic, router poll, sync
/// producer, then each node in order.
pub fn step(
    world: &Rc<RefCell<SimWorld>>,
    router: &mut Router<'_, SimCan>,
    sync: &mut SyncProducer,
    nodes: &mut [&mut RemoteNode<'_>],
    t: u32,
) {
    world.borrow_mut().tick(t);
    router.poll(t);
    let sync_state = sync.update(t, router);
    for node in nodes.iter_mut() {
        node.update(t, sync_state, router);
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
