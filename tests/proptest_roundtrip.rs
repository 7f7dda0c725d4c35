//! Property-based round-trip laws: encoding then decoding a Gen2 packet
//! recovers the original fields, for arbitrary protocol payloads, not just
//! the literal fixtures in decode.rs's unit tests.

use proptest::prelude::*;

use wirefree_gateway::decode::{decode_gen2, encode_full_reading, encode_maintenance, encode_quick_alert, DecodedFields};
use wirefree_gateway::model::RadioProfile;
use wirefree_gateway::tables::{GasType, Protocol, SensorMode, SensorType};

fn sensor_mode_from(n: u8) -> SensorMode {
    match n % 8 {
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

proptest! {
    /// FullReading packets without trailing text round-trip exactly.
    #[test]
    fn full_reading_round_trips_without_text(
        channel in 0u16..=0xFFFF,
        reading in prop::num::f32::NORMAL,
        battery_tenths in 0u8..=255,
        gas_raw in 0u8..=0x7F,
        sensor_type_raw in 0u8..=0x1F,
        sensor_mode_raw in 0u8..=7,
        fault_code in 0u8..=0x0F,
        precision in 0u8..=0x07,
    ) {
        let fields = DecodedFields {
            protocol: Protocol::FullReading,
            transmitter_address: channel,
            channel,
            reading,
            gas_type: GasType::from(gas_raw),
            sensor_type: SensorType::from(sensor_type_raw),
            sensor_mode: sensor_mode_from(sensor_mode_raw),
            battery_voltage: battery_tenths as f32 / 10.0,
            fault_code,
            precision,
            text: None,
            days_since_null: None,
            days_since_cal: None,
        };
        let encoded = encode_full_reading(&fields);
        let decoded = decode_gen2(&encoded).expect("round-trip decode");
        prop_assert_eq!(decoded.transmitter_address, fields.transmitter_address);
        prop_assert_eq!(decoded.channel, fields.channel);
        prop_assert_eq!(decoded.reading, fields.reading);
        prop_assert_eq!(decoded.fault_code, fields.fault_code);
        prop_assert_eq!(decoded.precision, fields.precision);
        prop_assert_eq!(decoded.text, None);
    }

    /// FullReading packets carrying short text round-trip the text too.
    #[test]
    fn full_reading_round_trips_with_text(
        channel in 0u16..=0xFFFF,
        reading in prop::num::f32::NORMAL,
        text in "[a-zA-Z0-9 ]{0,40}",
    ) {
        let fields = DecodedFields {
            protocol: Protocol::FullReading,
            transmitter_address: channel,
            channel,
            reading,
            gas_type: GasType::from(0),
            sensor_type: SensorType::from(0),
            sensor_mode: SensorMode::Normal,
            battery_voltage: 3.6,
            fault_code: 0,
            precision: 2,
            text: Some(text.clone()),
            days_since_null: None,
            days_since_cal: None,
        };
        let encoded = encode_full_reading(&fields);
        let decoded = decode_gen2(&encoded).expect("round-trip decode");
        prop_assert_eq!(decoded.text, Some(text));
    }

    /// QuickAlert round-trips address and reading for any finite f32.
    #[test]
    fn quick_alert_round_trips(
        channel in 0u16..=0xFFFF,
        reading in prop::num::f32::NORMAL,
    ) {
        let encoded = encode_quick_alert(channel, reading);
        let decoded = decode_gen2(&encoded).expect("round-trip decode");
        prop_assert_eq!(decoded.transmitter_address, channel);
        prop_assert_eq!(decoded.reading, reading);
        prop_assert_eq!(decoded.protocol, Protocol::QuickAlert);
    }

    /// Maintenance packets round-trip for both documented protocol bytes:
    /// the firmware disagrees on whether maintenance is protocol 3 or 7,
    /// and either is accepted on decode.
    #[test]
    fn maintenance_round_trips(
        channel in 0u16..=0xFFFF,
        protocol_byte in prop::sample::select(vec![3u8, 7u8]),
        reading in prop::num::f32::NORMAL,
        days_null in 0u16..=0xFFFF,
        days_cal in 0u16..=0xFFFF,
        mode_type in 0u8..=0xFF,
    ) {
        let encoded = encode_maintenance(channel, protocol_byte, reading, days_null, days_cal, mode_type);
        let decoded = decode_gen2(&encoded).expect("round-trip decode");
        prop_assert_eq!(decoded.transmitter_address, channel);
        prop_assert_eq!(decoded.reading, reading);
        prop_assert_eq!(decoded.days_since_null, Some(days_null));
        prop_assert_eq!(decoded.days_since_cal, Some(days_cal));
        prop_assert_eq!(decoded.protocol, Protocol::Maintenance { raw: protocol_byte });
    }

    /// RSSI mapping always saturates into the documented 5-95 range,
    /// regardless of the raw byte.
    #[test]
    fn rssi_mapping_always_bounded(byte in any::<u8>()) {
        let pct = wirefree_gateway::demux::rssi_raw_to_percent(byte);
        prop_assert!((5..=95).contains(&pct));
    }

    /// EEPROM profile set/get is a simple round-trip: whatever byte was
    /// last written at an address is what's read back.
    #[test]
    fn radio_profile_set_get_round_trips(addr in any::<u16>(), value in any::<u8>()) {
        let mut profile = RadioProfile::new();
        profile.set(addr, value);
        prop_assert_eq!(profile.get(addr), Some(value));
    }
}
