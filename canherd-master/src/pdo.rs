//! The per-node PDO engine
//!
//! Keeps four receive and four transmit PDO descriptors for one remote
//! node, configures them on the node over SDO, transmits RPDOs (master to
//! node) on SYNC or application events, and decodes received TPDOs back
//! into the local object dictionary image.
//!
//! Direction naming follows the remote node's perspective, as the
//! dictionary objects do: an "RPDO" is received by the node (sent by this
//! master on `0x200|id`..`0x500|id`), a "TPDO" is transmitted by the node
//! (received here on `0x180|id`..`0x480|id`).

use canherd_common::constants::{object_ids, pdo_comm_subs, PDO_INVALID_FLAG};
use canherd_common::constants::{TRANSMISSION_ASYNC_MANUFACTURER, TRANSMISSION_ASYNC_PROFILE};
use canherd_common::messages::{CanFrame, CanId, FunctionCode};
use canherd_common::objects::{OdCell, OdEntry};
use canherd_common::traits::FrameSender;
use canherd_common::NodeId;
use defmt_or_log::{debug, warn};
use snafu::Snafu;

use crate::comm::CommState;
use crate::sdo_client::SdoClient;
use crate::sync::SyncState;

/// Number of PDOs per direction
pub const PDO_COUNT: usize = 4;

/// Maximum number of entries one PDO can map
pub const MAX_MAPPING_ENTRIES: usize = 4;

/// Default per-step timeout for the configuration sequence, in ms
///
/// Some devices take a while to accept PDO reconfiguration; tune with
/// [`PdoEngine::set_config_timeout`].
pub const PDO_CONFIG_TIMEOUT: u32 = 500;

/// PDO direction, from the remote node's perspective
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoDir {
    /// Received by the node, transmitted by this master
    Rx,
    /// Transmitted by the node, decoded by this master
    Tx,
}

/// Errors raised while presetting a PDO mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MappingError {
    /// More than four entries offered
    TooManyEntries,
    /// The mapped entries exceed eight payload bytes
    PayloadTooLong,
    /// An entry's cell is not 1, 2, or 4 bytes wide
    UnsupportedWidth,
}

/// One PDO descriptor
struct PdoSlot<'a> {
    /// The on-wire COB-ID, without the invalid flag bit
    cob_id: u16,
    transmission_type: u8,
    inhibit_time: u16,
    has_inhibit_time: bool,
    event_timer: u16,
    has_event_timer: bool,
    /// Preset intent: whether the PDO should be enabled once configured
    is_valid: bool,
    /// True once configuration completed with the PDO enabled on the wire
    active: bool,
    /// Transmissions owed (RPDO only)
    pending: u8,
    sent_at: u32,
    entries: [Option<&'a OdEntry<'a>>; MAX_MAPPING_ENTRIES],
    count: u8,
}

impl<'a> PdoSlot<'a> {
    fn new(cob_id: u16) -> Self {
        Self {
            cob_id,
            transmission_type: 0,
            inhibit_time: 0,
            has_inhibit_time: false,
            event_timer: 0,
            has_event_timer: false,
            is_valid: false,
            active: false,
            pending: 0,
            sent_at: 0,
            entries: [None; MAX_MAPPING_ENTRIES],
            count: 0,
        }
    }

    fn mapped(&self) -> bool {
        self.count > 0
    }
}

fn entry_width(entry: &OdEntry<'_>) -> Result<usize, MappingError> {
    match entry.cell {
        OdCell::U8(_) => Ok(1),
        OdCell::U16(_) => Ok(2),
        OdCell::U32(_) => Ok(4),
        OdCell::Str(_) => Err(MappingError::UnsupportedWidth),
    }
}

/// The value written to a mapping sub-object: index, sub, and bit length
fn mapping_value(entry: &OdEntry<'_>, width: usize) -> u32 {
    ((entry.index as u32) << 16) | ((entry.sub as u32) << 8) | (width as u32 * 8)
}

/// PDO engine for a single remote node
pub struct PdoEngine<'a> {
    node_id: NodeId,
    rpdo: [PdoSlot<'a>; PDO_COUNT],
    tpdo: [PdoSlot<'a>; PDO_COUNT],
    next_tx: usize,
    pdos_configured: u8,
    config_step: u8,
    config_started: bool,
    config_timeout: u32,
    step_started_at: u32,
}

impl<'a> PdoEngine<'a> {
    /// Create an engine for the node with the given id
    pub fn new(node_id: NodeId) -> Self {
        let id = node_id.raw();
        let rpdo = core::array::from_fn(|k| PdoSlot::new(FunctionCode::Rpdo(k as u8).cob_id(id).raw()));
        let tpdo = core::array::from_fn(|k| PdoSlot::new(FunctionCode::Tpdo(k as u8).cob_id(id).raw()));
        Self {
            node_id,
            rpdo,
            tpdo,
            next_tx: 0,
            pdos_configured: 0,
            config_step: 0,
            config_started: false,
            config_timeout: PDO_CONFIG_TIMEOUT,
            step_started_at: 0,
        }
    }

    /// Tune the per-step configuration timeout
    pub fn set_config_timeout(&mut self, value: u32) {
        self.config_timeout = value;
    }

    /// Preset the transmission type of RPDO `pdo` (0..4)
    pub fn preset_rx_transmission(&mut self, pdo: usize, transmission_type: u8) {
        self.rpdo[pdo].transmission_type = transmission_type;
    }

    /// Preset transmission type, inhibit time, and event timer of TPDO `pdo`
    ///
    /// An inhibit time or event timer of zero leaves the corresponding
    /// sub-object unwritten during configuration.
    pub fn preset_tx_transmission(
        &mut self,
        pdo: usize,
        transmission_type: u8,
        inhibit_time: u16,
        event_timer: u16,
    ) {
        let slot = &mut self.tpdo[pdo];
        slot.transmission_type = transmission_type;
        slot.inhibit_time = inhibit_time;
        slot.has_inhibit_time = inhibit_time > 0;
        slot.event_timer = event_timer;
        slot.has_event_timer = event_timer > 0;
    }

    /// Preset the mapping of RPDO `pdo` (0..4)
    pub fn preset_rx_mapping(
        &mut self,
        pdo: usize,
        entries: &[&'a OdEntry<'a>],
    ) -> Result<(), MappingError> {
        Self::preset_mapping(&mut self.rpdo[pdo], entries)
    }

    /// Preset the mapping of TPDO `pdo` (0..4)
    pub fn preset_tx_mapping(
        &mut self,
        pdo: usize,
        entries: &[&'a OdEntry<'a>],
    ) -> Result<(), MappingError> {
        Self::preset_mapping(&mut self.tpdo[pdo], entries)
    }

    fn preset_mapping(
        slot: &mut PdoSlot<'a>,
        entries: &[&'a OdEntry<'a>],
    ) -> Result<(), MappingError> {
        if entries.len() > MAX_MAPPING_ENTRIES {
            return Err(MappingError::TooManyEntries);
        }
        let mut total = 0;
        for entry in entries {
            total += entry_width(entry)?;
        }
        if total > 8 {
            return Err(MappingError::PayloadTooLong);
        }
        slot.entries = [None; MAX_MAPPING_ENTRIES];
        for (i, entry) in entries.iter().enumerate() {
            slot.entries[i] = Some(entry);
        }
        slot.count = entries.len() as u8;
        Ok(())
    }

    /// Preset whether RPDO `pdo` should be enabled on the wire
    pub fn preset_rx_valid(&mut self, pdo: usize, valid: bool) {
        self.rpdo[pdo].is_valid = valid;
    }

    /// Preset whether TPDO `pdo` should be enabled on the wire
    pub fn preset_tx_valid(&mut self, pdo: usize, valid: bool) {
        self.tpdo[pdo].is_valid = valid;
    }

    /// True once `pdo` has been configured and enabled on the wire
    pub fn is_active(&self, dir: PdoDir, pdo: usize) -> bool {
        match dir {
            PdoDir::Rx => self.rpdo[pdo].active,
            PdoDir::Tx => self.tpdo[pdo].active,
        }
    }

    /// Transmissions currently owed by RPDO `pdo`
    pub fn rpdo_pending(&self, pdo: usize) -> u8 {
        self.rpdo[pdo].pending
    }

    /// Download all eight preset PDO configurations to the remote node
    ///
    /// A step driver: call once per poll after the node reached
    /// pre-operational. Returns `Busy` while configuration is in progress,
    /// `Done` once all PDOs are written, and `Error` when an SDO step
    /// failed or overran the configuration timeout.
    pub fn configure_preset_pdos(
        &mut self,
        now: u32,
        sdo: &mut SdoClient,
        sender: &mut dyn FrameSender,
    ) -> CommState {
        if self.pdos_configured as usize >= 2 * PDO_COUNT {
            return CommState::Done;
        }
        if !self.config_started {
            self.config_started = true;
            self.step_started_at = now;
        }
        if now.wrapping_sub(self.step_started_at) > self.config_timeout {
            warn!(
                "PDO configuration step timed out on node {}",
                self.node_id.raw()
            );
            return CommState::Error;
        }

        let index = self.pdos_configured as usize;
        let (dir, k) = if index < PDO_COUNT {
            (PdoDir::Rx, index)
        } else {
            (PdoDir::Tx, index - PDO_COUNT)
        };

        match self.configure_one(dir, k, now, sdo, sender) {
            CommState::Done => {
                self.pdos_configured += 1;
                self.config_step = 0;
                self.step_started_at = now;
                if self.pdos_configured as usize == 2 * PDO_COUNT {
                    debug!("all PDOs configured on node {}", self.node_id.raw());
                    CommState::Done
                } else {
                    CommState::Busy
                }
            }
            CommState::Error | CommState::Timeout => CommState::Error,
            _ => CommState::Busy,
        }
    }

    /// Drive the configuration steps of a single PDO
    fn configure_one(
        &mut self,
        dir: PdoDir,
        k: usize,
        now: u32,
        sdo: &mut SdoClient,
        sender: &mut dyn FrameSender,
    ) -> CommState {
        let (comm_base, map_base) = match dir {
            PdoDir::Rx => (object_ids::RPDO_COMM_BASE, object_ids::RPDO_MAPPING_BASE),
            PdoDir::Tx => (object_ids::TPDO_COMM_BASE, object_ids::TPDO_MAPPING_BASE),
        };
        let comm_index = comm_base + k as u16;
        let map_index = map_base + k as u16;

        let slot = match dir {
            PdoDir::Rx => &self.rpdo[k],
            PdoDir::Tx => &self.tpdo[k],
        };

        // Each step is one SDO write; steps without a value to write are
        // skipped by advancing immediately.
        let write: Option<(u16, u8, [u8; 4], usize)> = match self.config_step {
            // Disable before touching the mapping
            0 => {
                let value = slot.cob_id as u32 | PDO_INVALID_FLAG;
                Some((comm_index, pdo_comm_subs::COB_ID, value.to_le_bytes(), 4))
            }
            1 => Some((map_index, 0, [0; 4], 1)),
            2..=5 => {
                let j = self.config_step as usize - 2;
                match slot.entries[j] {
                    Some(entry) => {
                        let width = entry_width(entry).expect("validated at preset");
                        let value = mapping_value(entry, width);
                        Some((map_index, j as u8 + 1, value.to_le_bytes(), 4))
                    }
                    None => None,
                }
            }
            6 => {
                let mut data = [0; 4];
                data[0] = slot.count;
                Some((map_index, 0, data, 1))
            }
            7 => {
                let mut data = [0; 4];
                data[0] = slot.transmission_type;
                Some((comm_index, pdo_comm_subs::TRANSMISSION_TYPE, data, 1))
            }
            8 => {
                if dir == PdoDir::Tx && slot.has_inhibit_time {
                    let mut data = [0; 4];
                    data[0..2].copy_from_slice(&slot.inhibit_time.to_le_bytes());
                    Some((comm_index, pdo_comm_subs::INHIBIT_TIME, data, 2))
                } else {
                    None
                }
            }
            9 => {
                if dir == PdoDir::Tx && slot.has_event_timer {
                    let mut data = [0; 4];
                    data[0..2].copy_from_slice(&slot.event_timer.to_le_bytes());
                    Some((comm_index, pdo_comm_subs::EVENT_TIMER, data, 2))
                } else {
                    None
                }
            }
            // Re-enable only if the preset says so and something is mapped
            10 => {
                let mut value = slot.cob_id as u32;
                if !(slot.is_valid && slot.mapped()) {
                    value |= PDO_INVALID_FLAG;
                }
                Some((comm_index, pdo_comm_subs::COB_ID, value.to_le_bytes(), 4))
            }
            _ => {
                let enabled = slot.is_valid && slot.mapped();
                match dir {
                    PdoDir::Rx => self.rpdo[k].active = enabled,
                    PdoDir::Tx => self.tpdo[k].active = enabled,
                }
                debug!("PDO {:?} {} on node {} configured", dir, k, self.node_id.raw());
                return CommState::Done;
            }
        };

        match write {
            Some((index, sub, data, len)) => {
                match sdo.write(index, sub, &data[0..len], sender) {
                    CommState::Done => {
                        sdo.reset();
                        self.config_step += 1;
                        self.step_started_at = now;
                        CommState::Busy
                    }
                    CommState::Error | CommState::Timeout => {
                        warn!(
                            "PDO configuration write to {:04x}.{:02x} failed",
                            index, sub
                        );
                        CommState::Error
                    }
                    _ => CommState::Busy,
                }
            }
            None => {
                self.config_step += 1;
                CommState::Busy
            }
        }
    }

    /// Per-tick run-time dispatch
    ///
    /// On a tick that carried a SYNC, every cyclic-sync RPDO becomes
    /// pending. One pending RPDO is transmitted per tick, round robin.
    pub fn update(&mut self, now: u32, sync_state: SyncState, sender: &mut dyn FrameSender) {
        if sync_state == SyncState::SyncSent {
            for slot in self.rpdo.iter_mut() {
                if slot.transmission_type == 1 {
                    slot.pending = slot.pending.saturating_add(1);
                }
            }
        }

        let k = self.next_tx;
        if self.rpdo[k].pending == 0 {
            self.next_tx = (self.next_tx + 1) % PDO_COUNT;
            return;
        }
        if !self.rpdo[k].active {
            warn!("dropping pending transmissions of unconfigured RPDO {}", k);
            self.rpdo[k].pending = 0;
            self.next_tx = (self.next_tx + 1) % PDO_COUNT;
            return;
        }
        if self.transmit_rpdo(k, sender) {
            self.rpdo[k].sent_at = now;
            self.rpdo[k].pending -= 1;
            self.next_tx = (self.next_tx + 1) % PDO_COUNT;
        }
        // A busy transmit leaves the round-robin cursor in place; the same
        // PDO is retried on the next tick.
    }

    fn transmit_rpdo(&mut self, k: usize, sender: &mut dyn FrameSender) -> bool {
        let slot = &self.rpdo[k];
        let mut payload = [0u8; 8];
        let mut offset = 0;
        for entry in slot.entries.iter().flatten() {
            offset += entry.cell.read_le(&mut payload[offset..]);
        }
        let frame = CanFrame::new(CanId::new(slot.cob_id), &payload[0..offset]);
        sender.send_frame(&frame)
    }

    /// Trigger event-driven RPDOs mapping the given entry
    ///
    /// Called by the application after writing an OD value. Every RPDO
    /// whose mapping contains the entry and whose transmission type is
    /// event-driven (254/255) becomes pending. Returns true iff any RPDO
    /// maps the entry, letting the caller skip an equivalent SDO write.
    pub fn tx_rpdos_async(&mut self, entry: &OdEntry<'_>) -> bool {
        let mut matched = false;
        for slot in self.rpdo.iter_mut() {
            let maps_entry = slot
                .entries
                .iter()
                .flatten()
                .any(|e| e.addresses(entry.index, entry.sub));
            if maps_entry {
                matched = true;
                if slot.transmission_type == TRANSMISSION_ASYNC_MANUFACTURER
                    || slot.transmission_type == TRANSMISSION_ASYNC_PROFILE
                {
                    slot.pending = slot.pending.saturating_add(1);
                }
            }
        }
        matched
    }

    /// Decode a received TPDO frame into the mapped OD cells
    ///
    /// Payload bytes are consumed left to right in mapping order, each
    /// field little-endian. Decoding stops when the payload runs short.
    pub fn store_tpdo(&mut self, k: usize, frame: &CanFrame) {
        let slot = &self.tpdo[k];
        if !(slot.is_valid && slot.mapped()) {
            warn!("ignoring TPDO {} of node {}: not configured", k, self.node_id.raw());
            return;
        }
        let data = frame.data();
        let mut offset = 0;
        for entry in slot.entries.iter().flatten() {
            let width = entry.byte_len();
            if offset + width > data.len() {
                break;
            }
            // Width was validated when the mapping was preset.
            entry.cell.write_le(&data[offset..offset + width]).ok();
            offset += width;
        }
    }

    /// Restart the configuration sequencer from the first PDO
    pub fn reset_config(&mut self) {
        self.pdos_configured = 0;
        self.config_step = 0;
        self.config_started = false;
    }

    /// Drop all on-wire validity: called when the node is lost or rebooted
    ///
    /// Preset intent survives, so a later configuration pass restores the
    /// previous setup.
    pub fn invalidate_all(&mut self) {
        for slot in self.rpdo.iter_mut().chain(self.tpdo.iter_mut()) {
            slot.active = false;
            slot.pending = 0;
        }
        self.reset_config();
    }
}
