//! Common functionality shared among the canherd crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `canherd-master`.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;

#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod bus_config;
pub mod constants;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::SocketCanInterface;

pub use messages::{CanFrame, CanId};
pub use node_id::NodeId;
pub use objects::{OdCell, OdEntry};
