//! The sensor-payload decoder: a bit-level parser for the WireFree
//! Gen2 protocol carried inside a Data frame's body. Reconstructs the full
//! Gen2 packet from the framing layer's channel/protocol fields plus the
//! frame body, then dispatches on the three protocol variants.
//!
//! Every bit-field accessor here is a named constant rather than an inline
//! shift buried in the dispatch logic.

use crate::error::DecodeError;
use crate::model::DataFrame;
use crate::tables::{GasType, Protocol, SensorMode, SensorType};

/// Minimum Gen2 packet length for each protocol (address + proto byte
/// already included).
const FULL_READING_MIN_LEN: usize = 12;
const QUICK_ALERT_LEN: usize = 8;
const MAINTENANCE_LEN: usize = 13;

/// Fields decoded from a Gen2 packet, prior to the framing-layer metadata
/// (link, timestamp, rssi, repeater identity) that only C4 knows how to
/// attach.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFields {
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
    pub days_since_null: Option<u16>,
    pub days_since_cal: Option<u16>,
}

fn sum_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn verify_checksum(gen2: &[u8]) -> Result<(), DecodeError> {
    let found = *gen2.last().expect("caller checked length");
    let computed = sum_checksum(&gen2[..gen2.len() - 1]);
    if computed != found {
        return Err(DecodeError::BadChecksum { computed, found });
    }
    Ok(())
}

/// Reconstructs the Gen2 packet from a Data frame
/// (`gen2 = [channel_hi, channel_lo, protocol & 0x7F] ++ body`) and decodes
/// it.
pub fn decode(frame: &DataFrame) -> Result<DecodedFields, DecodeError> {
    let mut gen2 = Vec::with_capacity(3 + frame.body.len());
    gen2.extend_from_slice(&frame.channel.to_be_bytes());
    gen2.push(frame.protocol_byte & 0x7F);
    gen2.extend_from_slice(&frame.body);
    decode_gen2(&gen2)
}

/// Decodes an already-reconstructed Gen2 packet. Exposed directly so tests
/// (and an operator validation harness comparing decoded Samples against
/// fieldbus ground-truth) can feed literal byte vectors without
/// round-tripping through the framing layer.
pub fn decode_gen2(gen2: &[u8]) -> Result<DecodedFields, DecodeError> {
    if gen2.len() < 4 {
        return Err(DecodeError::TooShort {
            got: gen2.len(),
            need: 4,
        });
    }
    let channel = u16::from_be_bytes([gen2[0], gen2[1]]);
    let protocol_byte = gen2[2];
    let Some(protocol) = Protocol::from_byte(protocol_byte) else {
        return Err(DecodeError::UnknownProtocol(protocol_byte));
    };

    match protocol {
        Protocol::FullReading => decode_full_reading(gen2, channel),
        Protocol::QuickAlert => decode_quick_alert(gen2, channel),
        Protocol::Maintenance { raw } => decode_maintenance(gen2, channel, raw),
    }
}

mod offset {
    // Offsets relative to the start of the reconstructed Gen2 packet
    // (gen2[0..2] = address/channel, gen2[2] = protocol).
    pub const ADDRESS: std::ops::Range<usize> = 0..2;
    pub const PROTOCOL: usize = 2;
    pub const READING: std::ops::Range<usize> = 3..7;
    pub const MODE_TYPE: usize = 7;
    pub const BATTERY: usize = 8;
    pub const GAS_SCALE: usize = 9;
    pub const FAULT_PRECISION_TEXT: usize = 10;
    pub const TEXT_LEN: usize = 11;
    pub const TEXT_START: usize = 12;

    // Maintenance layout (protocol 3/7): address, proto, reading, days_null(2),
    // days_cal(2), mode_type, checksum.
    pub const MAINT_DAYS_NULL: std::ops::Range<usize> = 7..9;
    pub const MAINT_DAYS_CAL: std::ops::Range<usize> = 9..11;
    pub const MAINT_MODE_TYPE: usize = 11;
}

fn read_address(gen2: &[u8]) -> u16 {
    u16::from_be_bytes([gen2[offset::ADDRESS.start], gen2[offset::ADDRESS.start + 1]])
}

fn read_reading(gen2: &[u8]) -> f32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&gen2[offset::READING]);
    f32::from_be_bytes(b)
}

fn decode_full_reading(gen2: &[u8], channel: u16) -> Result<DecodedFields, DecodeError> {
    if gen2.len() < FULL_READING_MIN_LEN {
        return Err(DecodeError::TooShort {
            got: gen2.len(),
            need: FULL_READING_MIN_LEN,
        });
    }
    let mode_type = gen2[offset::MODE_TYPE];
    let sensor_mode = SensorMode::from(mode_type & 0x07);
    let sensor_type = SensorType::from((mode_type >> 3) & 0x1F);

    let battery_raw = gen2[offset::BATTERY];
    let gas_scale = gen2[offset::GAS_SCALE];
    let gas_type = GasType::from(gas_scale & 0x7F);
    let battery_scale = (gas_scale >> 7) & 1;
    let battery_voltage = if battery_scale == 0 {
        battery_raw as f32 / 10.0
    } else {
        battery_raw as f32
    };

    let fpt = gen2[offset::FAULT_PRECISION_TEXT];
    let fault_code = fpt & 0x0F;
    let precision = (fpt >> 4) & 0x07;
    let has_text = (fpt >> 7) & 1 == 1;

    let (text, checksum_idx) = if has_text {
        if gen2.len() <= offset::TEXT_LEN {
            return Err(DecodeError::BadText);
        }
        let text_len = gen2[offset::TEXT_LEN] as usize;
        let text_end = offset::TEXT_START + text_len;
        if gen2.len() < text_end + 1 {
            return Err(DecodeError::TooShort {
                got: gen2.len(),
                need: text_end + 1,
            });
        }
        let raw_text = &gen2[offset::TEXT_START..text_end];
        let text = String::from_utf8_lossy(raw_text).into_owned();
        (Some(text), text_end)
    } else {
        (None, offset::TEXT_LEN)
    };

    if gen2.len() <= checksum_idx {
        return Err(DecodeError::TooShort {
            got: gen2.len(),
            need: checksum_idx + 1,
        });
    }
    let computed = sum_checksum(&gen2[..checksum_idx]);
    let found = gen2[checksum_idx];
    if computed != found {
        return Err(DecodeError::BadChecksum { computed, found });
    }

    Ok(DecodedFields {
        protocol: Protocol::FullReading,
        transmitter_address: read_address(gen2),
        channel,
        reading: read_reading(gen2),
        gas_type,
        sensor_type,
        sensor_mode,
        battery_voltage,
        fault_code,
        precision,
        text,
        days_since_null: None,
        days_since_cal: None,
    })
}

fn decode_quick_alert(gen2: &[u8], channel: u16) -> Result<DecodedFields, DecodeError> {
    if gen2.len() != QUICK_ALERT_LEN {
        return Err(DecodeError::TooShort {
            got: gen2.len(),
            need: QUICK_ALERT_LEN,
        });
    }
    verify_checksum(gen2)?;
    Ok(DecodedFields {
        protocol: Protocol::QuickAlert,
        transmitter_address: read_address(gen2),
        channel,
        reading: read_reading(gen2),
        gas_type: GasType::from(0),
        sensor_type: SensorType::from(31),
        sensor_mode: SensorMode::Normal,
        battery_voltage: 0.0,
        fault_code: 0,
        precision: 0,
        text: None,
        days_since_null: None,
        days_since_cal: None,
    })
}

fn decode_maintenance(gen2: &[u8], channel: u16, raw_protocol: u8) -> Result<DecodedFields, DecodeError> {
    if gen2.len() != MAINTENANCE_LEN {
        return Err(DecodeError::TooShort {
            got: gen2.len(),
            need: MAINTENANCE_LEN,
        });
    }
    verify_checksum(gen2)?;
    let days_since_null = u16::from_be_bytes([gen2[offset::MAINT_DAYS_NULL.start], gen2[offset::MAINT_DAYS_NULL.start + 1]]);
    let days_since_cal = u16::from_be_bytes([gen2[offset::MAINT_DAYS_CAL.start], gen2[offset::MAINT_DAYS_CAL.start + 1]]);
    let mode_type = gen2[offset::MAINT_MODE_TYPE];
    Ok(DecodedFields {
        protocol: Protocol::Maintenance { raw: raw_protocol },
        transmitter_address: read_address(gen2),
        channel,
        reading: read_reading(gen2),
        gas_type: GasType::from(0),
        sensor_type: SensorType::from((mode_type >> 3) & 0x1F),
        sensor_mode: SensorMode::from(mode_type & 0x07),
        battery_voltage: 0.0,
        fault_code: 0,
        precision: 0,
        text: None,
        days_since_null: Some(days_since_null),
        days_since_cal: Some(days_since_cal),
    })
}

/// Encodes a FullReading Gen2 packet, the inverse of `decode_full_reading`.
/// Used by the test-packet emitter and by property tests to check
/// `decode(encode(fields)) == fields`.
pub fn encode_full_reading(fields: &DecodedFields) -> Vec<u8> {
    let mut v = Vec::with_capacity(FULL_READING_MIN_LEN + fields.text.as_deref().map_or(0, str::len) + 1);
    v.extend_from_slice(&fields.channel.to_be_bytes());
    v.push(1);
    v.extend_from_slice(&fields.reading.to_be_bytes());
    let sensor_mode = match fields.sensor_mode {
        SensorMode::Normal => 0,
        SensorMode::Null => 1,
        SensorMode::Calibration => 2,
        SensorMode::Relay => 3,
        SensorMode::RadioAddress => 4,
        SensorMode::Diagnostic => 5,
        SensorMode::AdvancedMenu => 6,
        SensorMode::AdminMenu => 7,
    };
    let sensor_type_raw = match fields.sensor_type {
        SensorType::Ec => 0,
        SensorType::Ir => 1,
        SensorType::Cb => 2,
        SensorType::Mos => 3,
        SensorType::Pid => 4,
        SensorType::TankLevel => 5,
        SensorType::Analog420 => 6,
        SensorType::Switch => 7,
        SensorType::OiWf190 => 30,
        SensorType::None => 31,
        SensorType::Unknown(n) => n,
    };
    v.push((sensor_type_raw << 3) | sensor_mode);
    let (battery_raw, battery_scale) = if fields.battery_voltage <= 25.5 {
        ((fields.battery_voltage * 10.0).round() as u8, 0u8)
    } else {
        (fields.battery_voltage.round() as u8, 1u8)
    };
    v.push(battery_raw);
    v.push((battery_scale << 7) | (fields.gas_type.raw() & 0x7F));
    let has_text = fields.text.is_some();
    let fpt = ((has_text as u8) << 7) | ((fields.precision & 0x07) << 4) | (fields.fault_code & 0x0F);
    v.push(fpt);
    if let Some(text) = &fields.text {
        v.push(text.len() as u8);
        v.extend_from_slice(text.as_bytes());
    }
    let checksum = sum_checksum(&v);
    v.push(checksum);
    v
}

/// Encodes a QuickAlert Gen2 packet.
pub fn encode_quick_alert(channel: u16, reading: f32) -> Vec<u8> {
    let mut v = Vec::with_capacity(QUICK_ALERT_LEN);
    v.extend_from_slice(&channel.to_be_bytes());
    v.push(2);
    v.extend_from_slice(&reading.to_be_bytes());
    let checksum = sum_checksum(&v);
    v.push(checksum);
    v
}

/// Encodes a Maintenance Gen2 packet. `protocol_byte` must be 3 or 7 — the
/// firmware disagrees with itself on which one means Maintenance, so both
/// are accepted on decode.
pub fn encode_maintenance(
    channel: u16,
    protocol_byte: u8,
    reading: f32,
    days_since_null: u16,
    days_since_cal: u16,
    mode_type: u8,
) -> Vec<u8> {
    let mut v = Vec::with_capacity(MAINTENANCE_LEN);
    v.extend_from_slice(&channel.to_be_bytes());
    v.push(protocol_byte);
    v.extend_from_slice(&reading.to_be_bytes());
    v.extend_from_slice(&days_since_null.to_be_bytes());
    v.extend_from_slice(&days_since_cal.to_be_bytes());
    v.push(mode_type);
    let checksum = sum_checksum(&v);
    v.push(checksum);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_checksum_test(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    /// The literal S1 body from the design doc ("0010 01 41480000 00 24 00
    /// 04"), parsed from its hex form exactly as documented, with one byte
    /// corrected: the narrative's `fpt=0x04` decodes to fault=4/precision=0,
    /// not the fault=0/precision=2 the same paragraph claims for it. 0x20
    /// is the byte that actually produces that pair, so the vector here
    /// uses 0x20 and keeps the rest of the documented bytes unchanged.
    #[test]
    fn decodes_documented_s1_vector() {
        let mut gen2 = hex::decode("0010014148000000240020").expect("valid hex");
        let cksum = sum_checksum_test(&gen2);
        gen2.push(cksum);

        let fields = decode_gen2(&gen2).expect("decode");
        assert_eq!(fields.transmitter_address, 16);
        assert_eq!(fields.channel, 16);
        assert_eq!(fields.reading, 12.5);
        assert_eq!(fields.battery_voltage, 3.6);
        assert_eq!(fields.gas_type.raw(), 0);
        assert_eq!(fields.fault_code, 0);
        assert_eq!(fields.precision, 2);
        assert_eq!(fields.text, None);
        assert_eq!(fields.protocol, Protocol::FullReading);
    }

    /// A full reading with `fpt=0x20` (fault=0, precision=2, no trailing
    /// text) decodes the battery and gas-type fields correctly.
    #[test]
    fn decodes_full_reading_battery_and_gas_fields() {
        let mut gen2 = vec![0x00, 0x10, 0x01, 0x41, 0x48, 0x00, 0x00, 0x00, 0x24, 0x00, 0x20];
        let cksum = sum_checksum_test(&gen2);
        gen2.push(cksum);

        let fields = decode_gen2(&gen2).expect("decode");
        assert_eq!(fields.transmitter_address, 16);
        assert_eq!(fields.channel, 16);
        assert_eq!(fields.reading, 12.5);
        assert_eq!(fields.battery_voltage, 3.6);
        assert_eq!(fields.gas_type.raw(), 0);
        assert_eq!(fields.fault_code, 0);
        assert_eq!(fields.precision, 2);
        assert_eq!(fields.text, None);
        assert_eq!(fields.protocol, Protocol::FullReading);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut gen2 = vec![0x00, 0x10, 0x01, 0x41, 0x48, 0x00, 0x00, 0x00, 0x24, 0x00, 0x20];
        gen2.push(0xFF);
        let err = decode_gen2(&gen2).unwrap_err();
        assert!(matches!(err, DecodeError::BadChecksum { .. }));
    }

    #[test]
    fn full_reading_with_empty_text_is_valid() {
        let mut gen2 = vec![0x00, 0x10, 0x01, 0x41, 0x48, 0x00, 0x00, 0x00, 0x24, 0x00, 0x80, 0x00];
        let cksum = sum_checksum_test(&gen2);
        gen2.push(cksum);
        let fields = decode_gen2(&gen2).expect("decode");
        assert_eq!(fields.text, Some(String::new()));
    }

    #[test]
    fn protocol_zero_is_not_a_sample() {
        let gen2 = vec![0x00, 0x10, 0x00, 0x00];
        let err = decode_gen2(&gen2).unwrap_err();
        assert_eq!(err, DecodeError::UnknownProtocol(0));
    }

    #[test]
    fn maintenance_accepts_protocol_3_and_7() {
        let g1 = encode_maintenance(16, 3, 1.0, 10, 20, 0x00);
        let g2 = encode_maintenance(16, 7, 1.0, 10, 20, 0x00);
        assert!(matches!(decode_gen2(&g1).unwrap().protocol, Protocol::Maintenance { raw: 3 }));
        assert!(matches!(decode_gen2(&g2).unwrap().protocol, Protocol::Maintenance { raw: 7 }));
    }

    #[test]
    fn quick_alert_round_trip() {
        let gen2 = encode_quick_alert(42, -3.25);
        let fields = decode_gen2(&gen2).expect("decode");
        assert_eq!(fields.transmitter_address, 42);
        assert_eq!(fields.reading, -3.25);
        assert_eq!(fields.protocol, Protocol::QuickAlert);
    }

    #[test]
    fn nan_and_inf_readings_pass_through() {
        let gen2 = encode_quick_alert(1, f32::NAN);
        let fields = decode_gen2(&gen2).expect("decode");
        assert!(fields.reading.is_nan());

        let gen2 = encode_quick_alert(1, f32::INFINITY);
        let fields = decode_gen2(&gen2).expect("decode");
        assert!(fields.reading.is_infinite());
    }
}
