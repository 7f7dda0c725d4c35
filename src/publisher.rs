//! Outbound publisher: a pluggable `(topic, bytes)` sink. The core only
//! owns topic formatting and JSON encoding of a `Sample`; the actual broker
//! connection (MQTT or otherwise) is an external collaborator the core is
//! deliberately ignorant of.

use serde::Serialize;
use tracing::debug;

use crate::model::Sample;

/// Anything that can accept a published `(topic, payload)` pair. Implement
/// this for a real broker client; `NullPublisher` is the no-op used by
/// tests and by the binary when no sink is configured.
pub trait Publisher: Send + Sync {
    /// Pure fan-out: a full outbound queue is the publisher's problem to
    /// drop against, not the core's.
    fn publish(&self, topic: &str, payload: &[u8]);
}

pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) {
        debug!(topic, bytes = payload.len(), "publish (null sink)");
    }
}

#[derive(Serialize)]
struct SamplePayload {
    channel: u16,
    transmitter_address: u16,
    reading: f32,
    gas_type: u8,
    fault_code: u8,
    rssi: u8,
    is_repeated: bool,
}

/// `<prefix>/network/<link_id>/channel_<ch>/state`.
pub fn sample_topic(prefix: &str, link_id: u16, channel: u16) -> String {
    format!("{prefix}/network/{link_id}/channel_{channel}/state")
}

pub fn publish_sample(publisher: &dyn Publisher, prefix: &str, sample: &Sample) {
    let topic = sample_topic(prefix, sample.link_id.0, sample.channel);
    let payload = SamplePayload {
        channel: sample.channel,
        transmitter_address: sample.transmitter_address,
        reading: sample.reading,
        gas_type: sample.gas_type.raw(),
        fault_code: sample.fault_code,
        rssi: sample.rssi,
        is_repeated: sample.is_repeated,
    };
    match serde_json::to_vec(&payload) {
        Ok(bytes) => publisher.publish(&topic, &bytes),
        Err(e) => tracing::warn!(error = %e, "failed to encode sample payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_format() {
        assert_eq!(
            sample_topic("gw", 2, 7),
            "gw/network/2/channel_7/state"
        );
    }
}
