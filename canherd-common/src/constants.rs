//! Standard object indices and sub-indices used by the master

/// Object indices for the standard communication objects the master touches
pub mod object_ids {
    /// Device type object index, uploaded during discovery
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Guard time object index (ms)
    pub const GUARD_TIME: u16 = 0x100C;
    /// Life time factor object index
    pub const LIFE_TIME_FACTOR: u16 = 0x100D;
    /// Consumer heartbeat time object index
    pub const CONSUMER_HEARTBEAT_TIME: u16 = 0x1016;
    /// Producer heartbeat time object index (ms)
    pub const PRODUCER_HEARTBEAT_TIME: u16 = 0x1017;
    /// First RPDO communication parameter object index
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object index
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object index
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object index
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
}

/// Sub-indices within the PDO communication parameter objects
pub mod pdo_comm_subs {
    /// COB-ID (u32, bit 31 = invalid flag)
    pub const COB_ID: u8 = 1;
    /// Transmission type (u8)
    pub const TRANSMISSION_TYPE: u8 = 2;
    /// Inhibit time in multiples of 100 us (u16)
    pub const INHIBIT_TIME: u8 = 3;
    /// Event timer in ms (u16)
    pub const EVENT_TIMER: u8 = 5;
}

/// Flag bit in a PDO COB-ID entry marking the PDO as invalid on the wire
pub const PDO_INVALID_FLAG: u32 = 0x8000_0000;

/// Transmission type for acyclic synchronous PDOs
pub const TRANSMISSION_ACYCLIC_SYNC: u8 = 0;
/// Highest cyclic synchronous transmission type (1..=240 = every Nth SYNC)
pub const TRANSMISSION_CYCLIC_SYNC_MAX: u8 = 240;
/// Event-driven (manufacturer specific) transmission type
pub const TRANSMISSION_ASYNC_MANUFACTURER: u8 = 254;
/// Event-driven (device profile specific) transmission type
pub const TRANSMISSION_ASYNC_PROFILE: u8 = 255;
