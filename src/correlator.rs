//! The multi-network correlator: matches direct-network Samples
//! against their repeated counterparts on the primary network, computing
//! per-hop forwarding latency, and surfacing drops/orphans.
//!
//! Runs as its own task, owning all correlator state exclusively; no
//! external code ever touches `pending_direct`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::model::{LinkId, LinkRole, Match, Sample};

/// Default match window.
pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(10);
/// Default `pending_direct` capacity.
pub const DEFAULT_PENDING_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub enum CorrelationEvent {
    Match(Match),
    /// A direct sample evicted from `pending_direct` without ever matching,
    /// either because the queue was full or because it aged out.
    DirectLoss(Sample),
    /// A primary sample with no matching direct sample within the window.
    Orphan(Sample),
}

pub struct CorrelatorConfig {
    pub match_window: Duration,
    pub pending_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            match_window: DEFAULT_MATCH_WINDOW,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

/// Which role each configured link plays, so the correlator knows whether
/// an incoming Sample joins `pending_direct` or attempts a match.
pub struct LinkRoles {
    roles: std::collections::HashMap<LinkId, LinkRole>,
}

impl LinkRoles {
    pub fn new(roles: impl IntoIterator<Item = (LinkId, LinkRole)>) -> Self {
        Self {
            roles: roles.into_iter().collect(),
        }
    }

    pub fn role_of(&self, link: LinkId) -> Option<LinkRole> {
        self.roles.get(&link).copied()
    }
}

/// Matching predicate: same channel, non-negative latency within the
/// window, and reading within 5%/0.1-unit tolerance of the direct sample
/// (repeaters forward their last-received sample, which may lag a
/// concurrent direct observation).
fn matches(direct: &Sample, primary: &Sample, window: Duration) -> bool {
    if direct.channel != primary.channel {
        return false;
    }
    if primary.timestamp < direct.timestamp {
        return false;
    }
    let delta = primary.timestamp - direct.timestamp;
    if delta > window {
        return false;
    }
    let tolerance = (direct.reading.abs() * 0.05).max(0.1);
    (primary.reading - direct.reading).abs() <= tolerance
}

pub struct Correlator {
    config: CorrelatorConfig,
    pending_direct: VecDeque<Sample>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            pending_direct: VecDeque::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending_direct.len()
    }

    /// Ingests one Sample and returns the events it produced immediately
    /// (zero or one for a direct sample that doesn't overflow the queue,
    /// zero or more for a primary sample plus an overflow eviction).
    pub fn ingest(&mut self, role: LinkRole, sample: Sample) -> Vec<CorrelationEvent> {
        match role {
            LinkRole::Direct => self.ingest_direct(sample),
            LinkRole::Primary => vec![self.ingest_primary(sample)],
        }
    }

    fn ingest_direct(&mut self, sample: Sample) -> Vec<CorrelationEvent> {
        let mut events = Vec::new();
        if self.pending_direct.len() >= self.config.pending_capacity {
            if let Some(evicted) = self.pending_direct.pop_front() {
                debug!(channel = evicted.channel, "pending_direct full, evicting oldest");
                events.push(CorrelationEvent::DirectLoss(evicted));
            }
        }
        self.pending_direct.push_back(sample);
        events
    }

    fn ingest_primary(&mut self, sample: Sample) -> CorrelationEvent {
        // Linear scan the whole queue; among every candidate that matches,
        // the one with the smallest latency wins (spec's tie-break), not
        // the first hit in arrival order — the oldest pending direct
        // sample has the *largest* latency relative to this primary
        // sample, not the smallest.
        let found = self
            .pending_direct
            .iter()
            .enumerate()
            .filter(|(_, d)| matches(d, &sample, self.config.match_window))
            .min_by(|(_, a), (_, b)| {
                let latency_a = sample.timestamp - a.timestamp;
                let latency_b = sample.timestamp - b.timestamp;
                latency_a.cmp(&latency_b)
            })
            .map(|(idx, _)| idx);

        match found {
            Some(idx) => {
                let direct = self.pending_direct.remove(idx).expect("idx in range");
                let latency = sample.timestamp - direct.timestamp;
                trace!(channel = sample.channel, ?latency, "matched");
                CorrelationEvent::Match(Match {
                    direct,
                    repeated: sample,
                    latency,
                })
            }
            None => CorrelationEvent::Orphan(sample),
        }
    }

    /// Wall-clock aging tick (1 Hz): evicts any pending direct sample older
    /// than the match window.
    pub fn tick(&mut self, now: Instant) -> Vec<CorrelationEvent> {
        let window = self.config.match_window;
        let mut events = Vec::new();
        while let Some(front) = self.pending_direct.front() {
            if now.duration_since(front.timestamp) > window {
                let evicted = self.pending_direct.pop_front().unwrap();
                events.push(CorrelationEvent::DirectLoss(evicted));
            } else {
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sample;
    use crate::tables::{GasType, Protocol, SensorMode, SensorType};
    use std::time::SystemTime;

    fn sample(link: LinkId, channel: u16, reading: f32, ts: Instant) -> Sample {
        Sample {
            link_id: link,
            timestamp: ts,
            wall_clock: SystemTime::now(),
            rssi: 80,
            source_mac: None,
            is_repeated: false,
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
            text: None,
            days_since_null: None,
            days_since_cal: None,
        }
    }

    #[test]
    fn direct_then_primary_matches() {
        let mut c = Correlator::new(CorrelatorConfig::default());
        let t0 = Instant::now();
        let direct = sample(LinkId(0), 7, 12.0, t0);
        let primary = sample(LinkId(1), 7, 12.3, t0 + Duration::from_millis(1200));

        let events = c.ingest(LinkRole::Direct, direct);
        assert!(events.is_empty());
        let events = c.ingest(LinkRole::Primary, primary);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CorrelationEvent::Match(m) => {
                assert_eq!(m.latency, Duration::from_millis(1200));
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn two_eligible_candidates_smaller_latency_wins() {
        // Two direct samples on the same channel, both within tolerance and
        // window of one later primary sample. The earlier-arrived one (at
        // t0) has the *larger* latency; the later-arrived one (at t0+500ms)
        // has the smaller latency and must be the one matched.
        let mut c = Correlator::new(CorrelatorConfig::default());
        let t0 = Instant::now();
        let older = sample(LinkId(0), 7, 12.0, t0);
        let newer = sample(LinkId(0), 7, 12.1, t0 + Duration::from_millis(500));
        let primary = sample(LinkId(1), 7, 12.2, t0 + Duration::from_millis(900));

        c.ingest(LinkRole::Direct, older);
        c.ingest(LinkRole::Direct, newer);
        assert_eq!(c.pending_len(), 2);

        let events = c.ingest(LinkRole::Primary, primary);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CorrelationEvent::Match(m) => {
                assert_eq!(m.latency, Duration::from_millis(400));
                assert_eq!(m.direct.reading, 12.1);
            }
            other => panic!("expected match, got {other:?}"),
        }
        // The unmatched older sample remains pending.
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn primary_without_direct_is_orphan() {
        let mut c = Correlator::new(CorrelatorConfig::default());
        let t0 = Instant::now();
        let primary = sample(LinkId(1), 7, 12.0, t0);
        let events = c.ingest(LinkRole::Primary, primary);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CorrelationEvent::Orphan(_)));
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn aging_evicts_as_direct_loss() {
        let mut c = Correlator::new(CorrelatorConfig {
            match_window: Duration::from_secs(1),
            ..CorrelatorConfig::default()
        });
        let t0 = Instant::now();
        c.ingest(LinkRole::Direct, sample(LinkId(0), 1, 10.0, t0));
        let events = c.tick(t0 + Duration::from_secs(2));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CorrelationEvent::DirectLoss(_)));
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut c = Correlator::new(CorrelatorConfig {
            pending_capacity: 2,
            ..CorrelatorConfig::default()
        });
        let t0 = Instant::now();
        c.ingest(LinkRole::Direct, sample(LinkId(0), 1, 10.0, t0));
        c.ingest(LinkRole::Direct, sample(LinkId(0), 2, 10.0, t0));
        let events = c.ingest(LinkRole::Direct, sample(LinkId(0), 3, 10.0, t0));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CorrelationEvent::DirectLoss(_)));
        assert_eq!(c.pending_len(), 2);
    }

    #[test]
    fn tolerance_boundary() {
        let mut c = Correlator::new(CorrelatorConfig::default());
        let t0 = Instant::now();
        // direct=12.0, tolerance = max(0.1, 0.6) = 0.6; 12.6 matches, 12.61 doesn't.
        c.ingest(LinkRole::Direct, sample(LinkId(0), 7, 12.0, t0));
        let events = c.ingest(
            LinkRole::Primary,
            sample(LinkId(1), 7, 12.61, t0 + Duration::from_millis(100)),
        );
        assert!(matches!(events[0], CorrelationEvent::Orphan(_)));
    }
}
