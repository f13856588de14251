//! A CANopen master stack in Rust
//!
//! canherd-master implements the master side of the CiA 301 communication
//! services: it discovers, configures, supervises, and exchanges process
//! data with remote slave nodes (drives, I/O modules) on a CAN 2.0A bus.
//! It is intended for small embedded controllers, so it is no_std
//! compatible, performs no heap allocation, and never blocks: everything
//! advances inside synchronous calls from a single polling loop. It
//! provides the following features:
//!
//! * A [`Router`] owning the CAN endpoint, which serializes outbound
//!   frames and dispatches inbound ones to per-node mailboxes by COB-ID.
//! * A per-node *SDO client* for reading and writing remote object
//!   dictionary entries, expedited and segmented.
//! * A per-node *supervisor* handling discovery, NMT commands, boot
//!   detection, and liveness monitoring by node guarding or heartbeat.
//! * A per-node *PDO engine* which configures the node's PDOs over SDO,
//!   transmits RPDOs synchronously or on application events, and decodes
//!   received TPDOs into the local object dictionary image.
//! * A [`SyncProducer`] emitting the SYNC and master heartbeat broadcasts
//!   and the global NMT commands.
//!
//! # The polling loop
//!
//! The caller's loop is the scheduler. Each tick, with a monotonic
//! millisecond timestamp `now`:
//!
//! ```ignore
//! router.poll(now);
//! let sync_state = sync.update(now, &mut router);
//! for node in nodes.iter_mut() {
//!     node.update(now, sync_state, &mut router);
//! }
//! ```
//!
//! Received frames reach the router through its [`BusMbox`]: on bare-metal
//! targets the CAN receive interrupt calls [`BusMbox::handle_event`]
//! directly, while polled drivers (socketcan, simulations) deliver events
//! through [`CanInterface::poll_event`](canherd_common::traits::CanInterface::poll_event).
//!
//! # Setting up a node
//!
//! ```ignore
//! let bus_mbox = BusMbox::new();
//! let mut router = Router::new(can, &bus_mbox);
//! router.open(CanBitrate::Br250k);
//!
//! let mbox = NodeMbox::new();
//! let mut node = RemoteNode::new(NodeId::new(3)?, &mbox);
//! node.configure_guarding(50, 3);
//! node.pdo.preset_rx_mapping(0, &[&control_word_entry])?;
//! node.pdo.preset_rx_transmission(0, 255);
//! node.pdo.preset_rx_valid(0, true);
//! node.attach(&mut router)?;
//! ```
//!
//! Once the polling loop reports the node in
//! [`NodeState::PreOp`], download its PDO configuration with
//! [`RemoteNode::configure_preset_pdos`] and start it with
//! [`RemoteNode::send_start_node`].
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod comm;
mod mbox;
mod node;
mod pdo;
mod router;
mod sdo_client;
mod sync;

// Re-export the shared types crate
pub use canherd_common as common;

pub use comm::CommState;
pub use mbox::{BusMbox, NodeMbox, TxStatus, RX_RING_CAPACITY};
pub use node::{GuardState, NodeState, RemoteNode, SDO_REQUEST_INTERVAL};
pub use pdo::{MappingError, PdoDir, PdoEngine, MAX_MAPPING_ENTRIES, PDO_CONFIG_TIMEOUT, PDO_COUNT};
pub use router::{NodeHandle, RegisterError, Router, MAX_NODES};
pub use sdo_client::{SdoClient, SDO_BUFFER_SIZE, SDO_RESP_TIMEOUT};
pub use sync::{MasterState, SyncProducer, SyncState};
