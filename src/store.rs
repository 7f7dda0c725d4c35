//! The local durable sample store. SQLite tables: `raw_packets`,
//! `decoded_packets`, `fault_events`, `matches`, each with the indexes the
//! four required queries below need. Per-link aggregates are computed on
//! demand from `decoded_packets` rather than snapshotted into a separate
//! stats table, since nothing here consumes stored stats rows directly.
//!
//! Writes are asynchronous: callers hand `Sample`/`Match`/`FaultEvent`
//! values to a bounded queue; a dedicated writer thread drains it in
//! batches of up to 256 records or every second, whichever comes first.
//! A crash loses only whatever sat in that last batch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rusqlite::{params, Connection};
use tracing::error;

use crate::error::StoreError;
use crate::model::{FaultEvent, LinkId, Match, Sample};
use crate::tables::fault_label;

/// Bound on the in-memory write queue: a crash should only ever lose
/// in-flight batches, so the queue itself stays small.
const WRITE_QUEUE_CAPACITY: usize = 10_000;
const BATCH_MAX_RECORDS: usize = 256;
const BATCH_MAX_DELAY: Duration = Duration::from_secs(1);

enum WriteOp {
    Sample(LinkId, Sample),
    Match(Match),
    FaultEvent(LinkId, u16, Sample),
}

#[derive(Debug, Clone)]
pub struct LinkAggregate {
    pub packet_count: u64,
    pub distinct_channels: u64,
    pub mean_rssi: f64,
    pub fault_count: u64,
}

#[derive(Debug, Clone)]
pub struct DuplicateAddress {
    pub transmitter_address: u16,
    pub channel_count: u64,
    pub channels: Vec<u16>,
}

/// Handle held by callers who want to write samples. Cheap to clone; backed
/// by a bounded channel into the writer thread.
#[derive(Clone)]
pub struct StoreWriter {
    tx: std::sync::mpsc::SyncSender<WriteOp>,
}

impl StoreWriter {
    pub fn record_sample(&self, link: LinkId, sample: Sample) -> Result<(), StoreError> {
        self.try_send(WriteOp::Sample(link, sample))
    }

    pub fn record_match(&self, m: Match) -> Result<(), StoreError> {
        self.try_send(WriteOp::Match(m))
    }

    pub fn record_fault(&self, link: LinkId, channel: u16, sample: Sample) -> Result<(), StoreError> {
        self.try_send(WriteOp::FaultEvent(link, channel, sample))
    }

    fn try_send(&self, op: WriteOp) -> Result<(), StoreError> {
        use std::sync::mpsc::TrySendError;
        self.tx.try_send(op).map_err(|e| match e {
            TrySendError::Full(_) => StoreError::QueueSaturated { dropped: 1 },
            TrySendError::Disconnected(_) => StoreError::QueueSaturated { dropped: 1 },
        })
    }
}

/// The query side: a shared read connection, separate from the writer
/// thread's connection (both point at the same on-disk file; SQLite's WAL
/// mode lets readers and the writer coexist without blocking each other).
pub struct Store {
    read_conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, runs schema
    /// migration, and spawns the batching writer thread. Returns the query
    /// handle and the writer handle separately since they have different
    /// ownership shapes (`Store` is `!Clone`, `StoreWriter` is `Clone`).
    pub fn open(path: &str) -> Result<(Self, StoreWriter), StoreError> {
        let write_conn = Connection::open(path)?;
        write_conn.pragma_update(None, "journal_mode", "WAL")?;
        create_schema(&write_conn)?;

        let read_conn = Connection::open(path)?;
        read_conn.pragma_update(None, "journal_mode", "WAL")?;

        let (tx, rx) = std::sync::mpsc::sync_channel(WRITE_QUEUE_CAPACITY);
        std::thread::Builder::new()
            .name("store-writer".into())
            .spawn(move || writer_loop(write_conn, rx))
            .expect("failed to spawn store writer thread");

        Ok((
            Self {
                read_conn: Arc::new(Mutex::new(read_conn)),
            },
            StoreWriter { tx },
        ))
    }

    /// Recent samples for a channel, newest first, bounded by `limit`.
    pub async fn recent_samples(&self, channel: u16, limit: u32) -> Result<Vec<Sample>, StoreError> {
        let conn = self.read_conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store read connection poisoned");
            let mut stmt = conn.prepare(
                "SELECT timestamp, link_id, channel, transmitter_address, protocol, reading,
                        gas_type, sensor_type, sensor_mode, battery_voltage, fault_code,
                        precision, rssi, is_repeated
                 FROM decoded_packets WHERE channel = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![channel, limit], row_to_sample)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
        .expect("store read task panicked")
    }

    /// Fault events in the last `hours`, optionally filtered by `fault_code`.
    pub async fn fault_history(
        &self,
        hours: u32,
        fault_code: Option<u8>,
    ) -> Result<Vec<FaultEvent>, StoreError> {
        let conn = self.read_conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store read connection poisoned");
            let cutoff = unix_seconds_ago(hours as u64 * 3600);
            let mut stmt = conn.prepare(
                "SELECT link_id, channel, fault_code, first_seen, last_seen, occurrence_count
                 FROM fault_events
                 WHERE last_seen >= ?1 AND (?2 IS NULL OR fault_code = ?2)
                 ORDER BY last_seen DESC",
            )?;
            let rows = stmt.query_map(params![cutoff, fault_code], |row| {
                Ok(FaultEvent {
                    link_id: LinkId(row.get::<_, i64>(0)? as u16),
                    channel: row.get::<_, i64>(1)? as u16,
                    fault_code: row.get::<_, i64>(2)? as u8,
                    first_seen: unix_to_systemtime(row.get(3)?),
                    last_seen: unix_to_systemtime(row.get(4)?),
                    occurrence_count: row.get::<_, i64>(5)? as u64,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
        .expect("store read task panicked")
    }

    /// F8 (duplicate transmitter address) detector: distinct transmitter
    /// addresses seen on more than one channel within the last hour.
    pub async fn duplicate_transmitter_addresses(
        &self,
        window: Duration,
    ) -> Result<Vec<DuplicateAddress>, StoreError> {
        let conn = self.read_conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store read connection poisoned");
            let cutoff = unix_seconds_ago(window.as_secs());
            let mut stmt = conn.prepare(
                "SELECT transmitter_address, COUNT(DISTINCT channel), GROUP_CONCAT(DISTINCT channel)
                 FROM decoded_packets
                 WHERE timestamp >= ?1
                 GROUP BY transmitter_address
                 HAVING COUNT(DISTINCT channel) > 1
                 ORDER BY COUNT(DISTINCT channel) DESC",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                let address: i64 = row.get(0)?;
                let channel_count: i64 = row.get(1)?;
                let channels_csv: String = row.get(2)?;
                let channels = channels_csv
                    .split(',')
                    .filter_map(|s| s.parse::<u16>().ok())
                    .collect();
                Ok(DuplicateAddress {
                    transmitter_address: address as u16,
                    channel_count: channel_count as u64,
                    channels,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
        .expect("store read task panicked")
    }

    /// Per-link aggregates over `window`: packet count, distinct channels,
    /// mean RSSI, fault count (`get_network_diagnostics` in the original
    /// store, keyed by link instead of a free-text network name).
    pub async fn link_aggregates(&self, link: LinkId, window: Duration) -> Result<LinkAggregate, StoreError> {
        let conn = self.read_conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store read connection poisoned");
            let cutoff = unix_seconds_ago(window.as_secs());
            conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT channel), COALESCE(AVG(rssi), 0.0),
                        SUM(CASE WHEN fault_code != 0 THEN 1 ELSE 0 END)
                 FROM decoded_packets
                 WHERE link_id = ?1 AND timestamp >= ?2",
                params![link.0, cutoff],
                |row| {
                    Ok(LinkAggregate {
                        packet_count: row.get::<_, i64>(0)? as u64,
                        distinct_channels: row.get::<_, i64>(1)? as u64,
                        mean_rssi: row.get(2)?,
                        fault_count: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .map_err(StoreError::from)
        })
        .await
        .expect("store read task panicked")
    }
}

fn row_to_sample(row: &rusqlite::Row) -> rusqlite::Result<Sample> {
    use crate::tables::{GasType, Protocol, SensorMode, SensorType};
    let protocol_raw: i64 = row.get(4)?;
    Ok(Sample {
        link_id: LinkId(row.get::<_, i64>(1)? as u16),
        timestamp: std::time::Instant::now(),
        wall_clock: unix_to_systemtime(row.get(0)?),
        rssi: row.get::<_, i64>(12)? as u8,
        source_mac: None,
        is_repeated: row.get::<_, i64>(13)? != 0,
        protocol: Protocol::from_byte(protocol_raw as u8).unwrap_or(Protocol::FullReading),
        transmitter_address: row.get::<_, i64>(3)? as u16,
        channel: row.get::<_, i64>(2)? as u16,
        reading: row.get(5)?,
        gas_type: GasType::from(row.get::<_, i64>(6)? as u8),
        sensor_type: SensorType::from(row.get::<_, i64>(7)? as u8),
        sensor_mode: SensorMode::from(row.get::<_, i64>(8)? as u8),
        battery_voltage: row.get(9)?,
        fault_code: row.get::<_, i64>(10)? as u8,
        precision: row.get::<_, i64>(11)? as u8,
        text: None,
        days_since_null: None,
        days_since_cal: None,
    })
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS raw_packets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            link_id INTEGER NOT NULL,
            raw_hex TEXT NOT NULL,
            length INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS decoded_packets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            link_id INTEGER NOT NULL,
            channel INTEGER NOT NULL,
            transmitter_address INTEGER NOT NULL,
            protocol INTEGER NOT NULL,
            reading REAL NOT NULL,
            gas_type INTEGER NOT NULL,
            sensor_type INTEGER NOT NULL,
            sensor_mode INTEGER NOT NULL,
            battery_voltage REAL NOT NULL,
            fault_code INTEGER NOT NULL,
            precision INTEGER NOT NULL,
            rssi INTEGER NOT NULL,
            is_repeated INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fault_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            link_id INTEGER NOT NULL,
            channel INTEGER NOT NULL,
            fault_code INTEGER NOT NULL,
            fault_name TEXT NOT NULL,
            transmitter_address INTEGER,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel INTEGER NOT NULL,
            direct_timestamp INTEGER NOT NULL,
            repeated_timestamp INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_decoded_link_ts ON decoded_packets(link_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_decoded_channel_ts ON decoded_packets(channel, timestamp);
        CREATE INDEX IF NOT EXISTS idx_decoded_fault ON decoded_packets(fault_code);
        CREATE INDEX IF NOT EXISTS idx_decoded_address ON decoded_packets(transmitter_address);
        CREATE INDEX IF NOT EXISTS idx_fault_events_code ON fault_events(fault_code);
        ",
    )?;
    Ok(())
}

/// Runs on a dedicated OS thread (rusqlite's `Connection` is not `Sync`, and
/// SQLite writes are blocking); batches up to `BATCH_MAX_RECORDS` writes or
/// flushes every `BATCH_MAX_DELAY`, whichever comes first.
///
/// Uses `recv_timeout` rather than an untimed blocking receive: a batch with
/// one record and no further traffic must still flush once `BATCH_MAX_DELAY`
/// elapses, not wait indefinitely for a second record to show up.
fn writer_loop(conn: Connection, rx: std::sync::mpsc::Receiver<WriteOp>) {
    let mut batch = Vec::with_capacity(BATCH_MAX_RECORDS);
    loop {
        batch.clear();
        let deadline = std::time::Instant::now() + BATCH_MAX_DELAY;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() || batch.len() >= BATCH_MAX_RECORDS {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(op) => batch.push(op),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => break,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    if !batch.is_empty() {
                        flush_batch(&conn, &batch);
                    }
                    return;
                }
            }
        }
        if !batch.is_empty() {
            flush_batch(&conn, &batch);
        }
    }
}

fn flush_batch(conn: &Connection, batch: &[WriteOp]) {
    if let Err(e) = flush_batch_inner(conn, batch) {
        error!(error = %e, records = batch.len(), "store write batch failed");
    }
}

fn flush_batch_inner(conn: &Connection, batch: &[WriteOp]) -> rusqlite::Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    for op in batch {
        match op {
            WriteOp::Sample(link, sample) => insert_sample(conn, *link, sample)?,
            WriteOp::Match(m) => insert_match(conn, m)?,
            WriteOp::FaultEvent(link, channel, sample) => {
                upsert_fault_event(conn, *link, *channel, sample)?
            }
        }
    }
    conn.execute_batch("COMMIT")?;
    Ok(())
}

fn insert_sample(conn: &Connection, link: LinkId, sample: &Sample) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO decoded_packets (
            timestamp, link_id, channel, transmitter_address, protocol, reading,
            gas_type, sensor_type, sensor_mode, battery_voltage, fault_code,
            precision, rssi, is_repeated
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            systemtime_to_unix(sample.wall_clock),
            link.0,
            sample.channel,
            sample.transmitter_address,
            protocol_code(&sample.protocol),
            sample.reading,
            sample.gas_type.raw(),
            sensor_type_raw(&sample.sensor_type),
            sample.sensor_mode as i64,
            sample.battery_voltage,
            sample.fault_code,
            sample.precision,
            sample.rssi,
            sample.is_repeated as i64,
        ],
    )?;
    Ok(())
}

fn insert_match(conn: &Connection, m: &Match) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO matches (channel, direct_timestamp, repeated_timestamp, latency_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            m.direct.channel,
            systemtime_to_unix(m.direct.wall_clock),
            systemtime_to_unix(m.repeated.wall_clock),
            m.latency.as_millis() as i64,
        ],
    )?;
    Ok(())
}

fn upsert_fault_event(
    conn: &Connection,
    link: LinkId,
    channel: u16,
    sample: &Sample,
) -> rusqlite::Result<()> {
    let now = systemtime_to_unix(SystemTime::now());
    let hour_ago = now - 3600;
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM fault_events
             WHERE link_id = ?1 AND channel = ?2 AND fault_code = ?3 AND last_seen >= ?4",
            params![link.0, channel, sample.fault_code, hour_ago],
            |row| row.get(0),
        )
        .ok();

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE fault_events SET last_seen = ?1, occurrence_count = occurrence_count + 1
                 WHERE id = ?2",
                params![now, id],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO fault_events (
                    link_id, channel, fault_code, fault_name, transmitter_address,
                    first_seen, last_seen, occurrence_count
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)",
                params![
                    link.0,
                    channel,
                    sample.fault_code,
                    fault_label(sample.fault_code),
                    sample.transmitter_address,
                    now,
                ],
            )?;
        }
    }
    Ok(())
}

fn protocol_code(p: &crate::tables::Protocol) -> i64 {
    use crate::tables::Protocol;
    match p {
        Protocol::FullReading => 1,
        Protocol::QuickAlert => 2,
        Protocol::Maintenance { raw } => *raw as i64,
    }
}

fn sensor_type_raw(t: &crate::tables::SensorType) -> i64 {
    use crate::tables::SensorType;
    match *t {
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
        SensorType::Unknown(n) => n as i64,
    }
}

fn systemtime_to_unix(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn unix_to_systemtime(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn unix_seconds_ago(secs: u64) -> i64 {
    systemtime_to_unix(SystemTime::now()) - secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(count >= 4);
    }
}
