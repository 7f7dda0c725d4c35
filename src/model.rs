//! Core data model: `Frame` is transient and never stored, `Sample` is the
//! first-class decoded value, `Match` and `FaultEvent` are derived by the
//! correlator and the store respectively, and `RadioProfile` is the
//! EEPROM-resident radio configuration the control plane reads and writes.

use std::time::{Duration, Instant, SystemTime};

use crate::tables::{GasType, Protocol, SensorMode, SensorType};

/// Which physical radio network a link belongs to. There is exactly one
/// `Primary` per cluster; any number of `Direct` links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    Direct,
    Primary,
}

/// Stable identifier for one configured radio link (one serial port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u16);

/// A byte-range carved from the input stream by the demultiplexer.
/// Owned briefly, consumed immediately by C3 (Data) or C5 (CommandResp);
/// never stored.
#[derive(Debug, Clone)]
pub struct Frame {
    pub link: LinkId,
    pub arrived_at: SystemTime,
    pub kind: FrameKind,
}

#[derive(Debug, Clone)]
pub enum FrameKind {
    Data(DataFrame),
    CommandResp(Vec<u8>),
}

/// The parsed 0x81 API "receive" frame payload, prior to Gen2 decoding.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub rssi_raw: u8,
    pub repeater_mac: [u8; 3],
    pub channel: u16,
    pub protocol_byte: u8,
    pub is_repeated: bool,
    /// Gen2 body: everything after the protocol byte, including the trailing
    /// Gen2 checksum byte.
    pub body: Vec<u8>,
    pub sensor_mac: Option<[u8; 3]>,
    pub sensor_rssi: Option<u8>,
}

/// The decoded wireless reading: the core's output unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub link_id: LinkId,
    /// Arrival time at the gateway, monotonic.
    pub timestamp: Instant,
    /// Arrival time at the gateway, wall-clock (retained alongside the
    /// monotonic timestamp).
    pub wall_clock: SystemTime,
    /// Integer percentage 0-100 (always saturates into 5-95, see
    /// `demux::rssi_raw_to_percent`).
    pub rssi: u8,
    /// 3-byte repeater identity, present iff the frame was forwarded.
    pub source_mac: Option<[u8; 3]>,
    pub is_repeated: bool,
    pub protocol: Protocol,
    pub transmitter_address: u16,
    pub channel: u16,
    pub reading: f32,
    pub gas_type: GasType,
    pub sensor_type: SensorType,
    pub sensor_mode: SensorMode,
    pub battery_voltage: f32,
    pub fault_code: u8,
    pub precision: u8,
    pub text: Option<String>,
    /// Maintenance-only fields; `None` for FullReading and QuickAlert.
    pub days_since_null: Option<u16>,
    pub days_since_cal: Option<u16>,
}

impl Sample {
    pub fn has_fault(&self) -> bool {
        self.fault_code != crate::tables::FAULT_NONE
    }
}

/// A direct/primary Sample pair with a computed forwarding latency.
#[derive(Debug, Clone)]
pub struct Match {
    pub direct: Sample,
    pub repeated: Sample,
    pub latency: Duration,
}

/// One `(link_id, channel, fault_code)` coalesced over a window;
/// extended, not re-created, on repeat occurrences within the window.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub link_id: LinkId,
    pub channel: u16,
    pub fault_code: u8,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub occurrence_count: u64,
}

/// EEPROM-resident radio configuration: a small map from documented byte
/// offsets to byte values (channel, mode, API control, baud, RF power,
/// system ID). The set of offsets the gateway understands is open-ended —
/// operators may read/write any address — so this wraps a sparse map rather
/// than a fixed struct.
#[derive(Debug, Clone, Default)]
pub struct RadioProfile {
    pub bytes: std::collections::BTreeMap<u16, u8>,
}

impl RadioProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, addr: u16, value: u8) {
        self.bytes.insert(addr, value);
    }

    pub fn get(&self, addr: u16) -> Option<u8> {
        self.bytes.get(&addr).copied()
    }
}

/// Well-known EEPROM byte offsets referenced by `device_control`-style
/// operator tooling. Not exhaustive; the radio documents many more.
pub mod eeprom {
    pub const CHANNEL: u16 = 0x00;
    pub const API_MODE: u16 = 0x01;
    pub const BAUD_RATE: u16 = 0x02;
    pub const RF_POWER: u16 = 0x03;
    pub const SYSTEM_ID: u16 = 0x04;
    pub const TRANSMITTER_ADDRESS: u16 = 0x40;
}
