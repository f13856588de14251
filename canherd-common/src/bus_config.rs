//! Bus config file
//!
//! A [`BusConfig`] is created from a TOML file and describes the remote
//! nodes a master supervises: their liveness mode, retry tuning, and PDO
//! presets. Applications load it at startup and apply it when constructing
//! their node records; nothing is persisted by the stack itself.
//!
//! # An example TOML file
//!
//! ```toml
//! bitrate = 250000
//! sync_interval = 10
//! master_heartbeat = 500
//!
//! [[nodes]]
//! id = 3
//! guard_time = 50
//! live_time_factor = 3
//!
//! # An RPDO carrying the control word, sent on every SYNC
//! [[nodes.rpdo]]
//! num = 1
//! transmission_type = 1
//! mapping = [{ index = 0x6040, sub = 0, size = 2 }]
//!
//! [[nodes]]
//! id = 5
//! heartbeat_time = 400
//!
//! [[nodes.tpdo]]
//! num = 1
//! transmission_type = 255
//! event_timer = 100
//! mapping = [{ index = 0x6041, sub = 0, size = 2 }]
//! ```

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

/// Maximum number of entries a PDO mapping may carry
const MAX_MAPPING_ENTRIES: usize = 4;
/// Maximum total payload of a mapped PDO in bytes
const MAX_PDO_BYTES: usize = 8;

/// Top-level description of a bus
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Bus bitrate in bits per second
    pub bitrate: Option<u32>,
    /// SYNC emission period in ms; absent disables SYNC production
    pub sync_interval: Option<u32>,
    /// Master heartbeat period in ms; absent disables heartbeat production
    pub master_heartbeat: Option<u32>,
    /// The remote nodes on the bus
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Description of one remote node
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node id, 1..=127
    pub id: u8,
    /// Guard time in ms; mutually exclusive with `heartbeat_time`
    pub guard_time: Option<u16>,
    /// Allowed consecutive guarding timeouts before the node is failed
    pub live_time_factor: Option<u8>,
    /// Producer heartbeat time in ms; mutually exclusive with `guard_time`
    pub heartbeat_time: Option<u16>,
    /// Override for the heartbeat-missed threshold in ms
    pub heartbeat_missed_time: Option<u32>,
    /// SDO response-timeout retries before a transfer fails
    pub sdo_timeout_retries: Option<u8>,
    /// Transmit-busy retries before a request fails
    pub sdo_busy_retries: Option<u8>,
    /// RPDO presets (master to node)
    #[serde(default)]
    pub rpdo: Vec<PdoConfig>,
    /// TPDO presets (node to master)
    #[serde(default)]
    pub tpdo: Vec<PdoConfig>,
}

/// Preset for one PDO
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoConfig {
    /// PDO number, 1..=4
    pub num: u8,
    /// Transmission type: 0 acyclic-sync, 1..=240 cyclic-sync, 254/255 event-driven
    pub transmission_type: u8,
    /// Inhibit time in multiples of 100 us (TPDO only)
    pub inhibit_time: Option<u16>,
    /// Event timer in ms (TPDO only)
    pub event_timer: Option<u16>,
    /// Mapped entries, at most 4 totalling at most 8 bytes
    #[serde(default)]
    pub mapping: Vec<MappingConfig>,
}

/// One mapped dictionary entry
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingConfig {
    /// Object index
    pub index: u16,
    /// Object sub-index
    pub sub: u8,
    /// Entry width in bytes: 1, 2, or 4
    pub size: u8,
}

impl BusConfig {
    /// Parse and validate a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self, BusConfigError> {
        let config: BusConfig = toml::from_str(text).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BusConfigError> {
        for node in &self.nodes {
            ensure!(
                node.id >= 1 && node.id <= 127,
                InvalidNodeIdSnafu { id: node.id }
            );
            ensure!(
                node.guard_time.unwrap_or(0) == 0 || node.heartbeat_time.unwrap_or(0) == 0,
                LivenessConflictSnafu { id: node.id }
            );
            for pdo in node.rpdo.iter().chain(node.tpdo.iter()) {
                ensure!(
                    pdo.num >= 1 && pdo.num <= 4,
                    InvalidPdoNumberSnafu {
                        id: node.id,
                        num: pdo.num
                    }
                );
                ensure!(
                    pdo.transmission_type <= 240
                        || pdo.transmission_type == 254
                        || pdo.transmission_type == 255,
                    InvalidTransmissionTypeSnafu {
                        id: node.id,
                        value: pdo.transmission_type
                    }
                );
                ensure!(
                    pdo.mapping.len() <= MAX_MAPPING_ENTRIES,
                    MappingTooLongSnafu {
                        id: node.id,
                        num: pdo.num
                    }
                );
                let total: usize = pdo.mapping.iter().map(|m| m.size as usize).sum();
                ensure!(
                    total <= MAX_PDO_BYTES,
                    MappingTooLongSnafu {
                        id: node.id,
                        num: pdo.num
                    }
                );
                for m in &pdo.mapping {
                    ensure!(
                        matches!(m.size, 1 | 2 | 4),
                        InvalidMappingSizeSnafu {
                            id: node.id,
                            size: m.size
                        }
                    );
                }
            }
        }
        Ok(())
    }
}

/// Errors raised while loading a bus config
#[derive(Debug, Snafu)]
pub enum BusConfigError {
    /// The TOML text failed to parse
    #[snafu(display("failed to parse bus config: {source}"))]
    Parse {
        /// The underlying TOML error
        source: toml::de::Error,
    },
    /// A node id is outside 1..=127
    #[snafu(display("node id {id} is out of range"))]
    InvalidNodeId {
        /// The offending id
        id: u8,
    },
    /// A node enables both guarding and heartbeat supervision
    #[snafu(display("node {id} configures both guarding and heartbeat"))]
    LivenessConflict {
        /// The offending node id
        id: u8,
    },
    /// A PDO number is outside 1..=4
    #[snafu(display("node {id}: PDO number {num} is out of range"))]
    InvalidPdoNumber {
        /// The offending node id
        id: u8,
        /// The offending PDO number
        num: u8,
    },
    /// A transmission type is not in 0..=240, 254, or 255
    #[snafu(display("node {id}: transmission type {value} is not supported"))]
    InvalidTransmissionType {
        /// The offending node id
        id: u8,
        /// The offending transmission type
        value: u8,
    },
    /// A mapping exceeds 4 entries or 8 bytes
    #[snafu(display("node {id}: PDO {num} mapping exceeds size limits"))]
    MappingTooLong {
        /// The offending node id
        id: u8,
        /// The offending PDO number
        num: u8,
    },
    /// A mapped entry size is not 1, 2, or 4 bytes
    #[snafu(display("node {id}: mapping size {size} is not 1, 2, or 4"))]
    InvalidMappingSize {
        /// The offending node id
        id: u8,
        /// The offending entry size
        size: u8,
    },
}
