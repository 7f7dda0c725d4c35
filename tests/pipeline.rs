//! End-to-end tests that cross the module seams the per-file unit tests
//! don't: raw bytes in through the demultiplexer, out as decoded Samples,
//! through the correlator, and into the store.

use std::time::{Duration, Instant};

use wirefree_gateway::correlator::{CorrelationEvent, Correlator, CorrelatorConfig};
use wirefree_gateway::model::{FrameKind, LinkId, LinkRole, Sample};
use wirefree_gateway::store::Store;
use wirefree_gateway::tables::Protocol;

fn sum_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn full_reading_gen2_body(address: u16, reading: f32) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&address.to_be_bytes());
    v.push(1);
    v.extend_from_slice(&reading.to_be_bytes());
    v.push(0x00); // mode_type
    v.push(36); // battery raw -> 3.6V
    v.push(0x00); // gas_scale
    v.push(0x24); // fault/precision/text byte: precision=2, fault=0, no text
    let cksum = sum_checksum(&v);
    v.push(cksum);
    v
}

fn wrap_data_frame(channel: u16, rssi_raw: u8, protocol_and_repeat: u8, gen2_body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(rssi_raw);
    payload.extend_from_slice(&[0, 0, 0]); // repeater mac
    payload.extend_from_slice(&channel.to_be_bytes());
    payload.push(protocol_and_repeat);
    payload.extend_from_slice(gen2_body);

    let mut frame = Vec::new();
    frame.push(0x81);
    frame.push(payload.len() as u8);
    frame.push(0x00);
    frame.extend_from_slice(&payload);
    frame
}

/// A literal Data frame decodes to the documented Sample fields, and its
/// RSSI byte maps to the documented percentage.
#[test]
fn decodes_full_reading_frame_with_rssi() {
    let body = full_reading_gen2_body(16, 12.5);
    let raw = wrap_data_frame(16, 0x1A, 0x01, &body);

    let mut demux = wirefree_gateway::demux::Demultiplexer::new(LinkId(0));
    let frames = demux.feed(&raw);
    assert_eq!(frames.len(), 1);

    let FrameKind::Data(data) = &frames[0].kind else {
        panic!("expected a data frame");
    };
    let fields = wirefree_gateway::decode::decode(data).expect("decode");
    assert_eq!(fields.transmitter_address, 16);
    assert_eq!(fields.channel, 16);
    assert_eq!(fields.reading, 12.5);
    assert_eq!(fields.battery_voltage, 3.6);
    assert_eq!(fields.fault_code, 0);
    assert_eq!(fields.precision, 2);
    assert_eq!(fields.protocol, Protocol::FullReading);

    let rssi = wirefree_gateway::demux::rssi_raw_to_percent(data.rssi_raw);
    assert_eq!(rssi, 68);
}

/// A corrupted checksum is rejected and the demultiplexer has already
/// moved past the frame (no infinite stall on a bad packet).
#[test]
fn corrupt_checksum_frame_is_rejected_but_consumed() {
    let mut body = full_reading_gen2_body(16, 12.5);
    *body.last_mut().unwrap() = 0xFF;
    let raw = wrap_data_frame(16, 0x1A, 0x01, &body);

    let mut demux = wirefree_gateway::demux::Demultiplexer::new(LinkId(0));
    let frames = demux.feed(&raw);
    assert_eq!(frames.len(), 1);
    let FrameKind::Data(data) = &frames[0].kind else {
        panic!("expected a data frame");
    };
    let err = wirefree_gateway::decode::decode(data).unwrap_err();
    assert!(matches!(err, wirefree_gateway::error::DecodeError::BadChecksum { .. }));
}

fn sample_from_decode(link: LinkId, channel: u16, reading: f32, ts: Instant) -> Sample {
    let body = full_reading_gen2_body(channel, reading);
    let raw = wrap_data_frame(channel, 0x1A, 0x01, &body);
    let mut demux = wirefree_gateway::demux::Demultiplexer::new(link);
    let frames = demux.feed(&raw);
    let FrameKind::Data(data) = &frames[0].kind else {
        panic!("expected a data frame");
    };
    let fields = wirefree_gateway::decode::decode(data).expect("decode");
    Sample {
        link_id: link,
        timestamp: ts,
        wall_clock: std::time::SystemTime::now(),
        rssi: wirefree_gateway::demux::rssi_raw_to_percent(data.rssi_raw),
        source_mac: if data.is_repeated {
            data.sensor_mac.or(Some(data.repeater_mac))
        } else {
            None
        },
        is_repeated: data.is_repeated,
        protocol: fields.protocol,
        transmitter_address: fields.transmitter_address,
        channel: fields.channel,
        reading: fields.reading,
        gas_type: fields.gas_type,
        sensor_type: fields.sensor_type,
        sensor_mode: fields.sensor_mode,
        battery_voltage: fields.battery_voltage,
        fault_code: fields.fault_code,
        precision: fields.precision,
        text: fields.text,
        days_since_null: fields.days_since_null,
        days_since_cal: fields.days_since_cal,
    }
}

/// A direct sample followed by a matching primary sample produces a
/// `Match` with the expected latency, built from bytes decoded through the
/// real demux/decode pipeline rather than hand-built `Sample` literals.
#[test]
fn correlator_matches_decoded_samples() {
    let mut correlator = Correlator::new(CorrelatorConfig::default());
    let t0 = Instant::now();
    let direct = sample_from_decode(LinkId(0), 7, 12.0, t0);
    let primary = sample_from_decode(LinkId(1), 7, 12.3, t0 + Duration::from_millis(1200));

    assert!(correlator.ingest(LinkRole::Direct, direct).is_empty());
    let events = correlator.ingest(LinkRole::Primary, primary);
    assert_eq!(events.len(), 1);
    match &events[0] {
        CorrelationEvent::Match(m) => assert_eq!(m.latency, Duration::from_millis(1200)),
        other => panic!("expected Match, got {other:?}"),
    }
}

/// A primary sample with no prior direct sample on its channel is an
/// orphan.
#[test]
fn correlator_orphans_unmatched_primary() {
    let mut correlator = Correlator::new(CorrelatorConfig::default());
    let t0 = Instant::now();
    let primary = sample_from_decode(LinkId(1), 7, 12.0, t0);
    let events = correlator.ingest(LinkRole::Primary, primary);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], CorrelationEvent::Orphan(_)));
}

/// Decoded samples survive a write through the store's batching writer
/// thread and come back out through the read-side query API with the
/// fields the query path actually persists (wall-clock time, reading,
/// battery voltage, channel, fault code).
#[tokio::test]
async fn store_round_trips_a_decoded_sample() {
    let dir = std::env::temp_dir().join(format!(
        "wirefree-gateway-test-{}-{}",
        std::process::id(),
        Instant::now().elapsed().as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let db_path = dir.join("store_round_trip.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let (store, writer) = Store::open(&db_path).expect("open store");
    let sample = sample_from_decode(LinkId(0), 16, 12.5, Instant::now());
    writer.record_sample(LinkId(0), sample.clone()).expect("queue sample");

    // Give the writer thread a moment to flush (batches flush at most every
    // BATCH_MAX_DELAY = 1s, or immediately once the sender side is dropped).
    let mut recent = Vec::new();
    for _ in 0..20 {
        recent = store.recent_samples(16, 10).await.expect("query");
        if !recent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].channel, 16);
    assert_eq!(recent[0].reading, 12.5);
    assert_eq!(recent[0].battery_voltage, 3.6);
    assert_eq!(recent[0].fault_code, 0);

    let _ = std::fs::remove_dir_all(&dir);
}
