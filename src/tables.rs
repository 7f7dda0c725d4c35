//! Read-only data tables for the small enumerations the WireFree Gen2
//! protocol carries inline: gas type, sensor type, sensor mode and fault
//! code. Each is a fixed, never-extended-at-runtime set (≤ 16 entries),
//! matched against the decoded byte and rendered as `Unknown(n)` for values
//! the table doesn't name — unknown values are still valid Samples;
//! semantically-invalid fields are surfaced, not rejected.

/// Gas type, the low 7 bits of the gas/battery-scale byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasType {
    H2S,
    SO2,
    O2,
    CO,
    Cl2,
    CO2,
    Lel,
    Voc,
    Feet,
    HCl,
    NH3,
    Unknown(u8),
}

impl From<u8> for GasType {
    fn from(v: u8) -> Self {
        match v {
            0 => GasType::H2S,
            1 => GasType::SO2,
            2 => GasType::O2,
            3 => GasType::CO,
            4 => GasType::Cl2,
            5 => GasType::CO2,
            6 => GasType::Lel,
            7 => GasType::Voc,
            8 => GasType::Feet,
            9 => GasType::HCl,
            10 => GasType::NH3,
            n => GasType::Unknown(n),
        }
    }
}

impl GasType {
    pub fn raw(self) -> u8 {
        match self {
            GasType::H2S => 0,
            GasType::SO2 => 1,
            GasType::O2 => 2,
            GasType::CO => 3,
            GasType::Cl2 => 4,
            GasType::CO2 => 5,
            GasType::Lel => 6,
            GasType::Voc => 7,
            GasType::Feet => 8,
            GasType::HCl => 9,
            GasType::NH3 => 10,
            GasType::Unknown(n) => n,
        }
    }
}

/// Sensor element technology, the upper 5 bits of the mode/type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    Ec,
    Ir,
    Cb,
    Mos,
    Pid,
    TankLevel,
    Analog420,
    Switch,
    OiWf190,
    None,
    Unknown(u8),
}

impl From<u8> for SensorType {
    fn from(v: u8) -> Self {
        match v {
            0 => SensorType::Ec,
            1 => SensorType::Ir,
            2 => SensorType::Cb,
            3 => SensorType::Mos,
            4 => SensorType::Pid,
            5 => SensorType::TankLevel,
            6 => SensorType::Analog420,
            7 => SensorType::Switch,
            30 => SensorType::OiWf190,
            31 => SensorType::None,
            n => SensorType::Unknown(n),
        }
    }
}

/// Sensor operating mode, the low 3 bits of the mode/type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMode {
    Normal,
    Null,
    Calibration,
    Relay,
    RadioAddress,
    Diagnostic,
    AdvancedMenu,
    AdminMenu,
}

impl From<u8> for SensorMode {
    fn from(v: u8) -> Self {
        match v & 0x07 {
            0 => SensorMode::Normal,
            1 => SensorMode::Null,
            2 => SensorMode::Calibration,
            3 => SensorMode::Relay,
            4 => SensorMode::RadioAddress,
            5 => SensorMode::Diagnostic,
            6 => SensorMode::AdvancedMenu,
            _ => SensorMode::AdminMenu,
        }
    }
}

/// WireFree protocol variant carried by a Data frame's Gen2 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    FullReading,
    QuickAlert,
    /// The firmware disagrees with itself on whether maintenance timing is
    /// protocol 3 or 7; both are accepted and the raw byte is kept for
    /// telemetry.
    Maintenance { raw: u8 },
}

impl Protocol {
    pub fn from_byte(b: u8) -> Option<Protocol> {
        match b {
            1 => Some(Protocol::FullReading),
            2 => Some(Protocol::QuickAlert),
            3 | 7 => Some(Protocol::Maintenance { raw: b }),
            _ => None,
        }
    }
}

/// Fault code, 0-15. F8 and F14 are the two codes the gateway itself reasons
/// about (duplicate address detection and repeater-visibility loss); the
/// rest are carried through unexamined.
pub const FAULT_NONE: u8 = 0;
pub const FAULT_DUPLICATE_ADDRESS: u8 = 8;
pub const FAULT_CANNOT_SEE_PRIMARY: u8 = 14;

/// Human-readable label for a fault code, for logging only.
pub fn fault_label(code: u8) -> &'static str {
    match code {
        0 => "none",
        8 => "duplicate transmitter address (F8)",
        14 => "cannot see primary monitor (F14)",
        _ => "unspecified",
    }
}
