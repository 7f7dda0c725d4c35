//! The serial link: owns one physical port, exposes byte-oriented
//! read/write with hardware flow control, and the two non-framed query
//! helpers (MAC address, RSSI) that are only safe to use while the receive
//! loop is paused.
//!
//! Hardware RTS/CTS is mandatory — the radios stall without it — and the
//! read timeout is kept short (≤ 100 ms) so the owning task can interleave
//! shutdown checks and arbiter quiesce requests between reads.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Default read timeout — short enough that the owning task can interleave
/// shutdown/quiesce checks between reads.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Fixed header byte the radio prefixes onto a MAC-address query response.
const MAC_QUERY: [u8; 2] = [0xCC, 0x10];
const MAC_RESP_HEADER: u8 = 0xCC;
const RSSI_QUERY: [u8; 2] = [0xCC, 0x22];

/// Owns the physical port. Not `Clone`: exclusive ownership is enforced by
/// construction (one `SerialLink` per link, handed to exactly one
/// `NetworkReceiver`).
pub struct SerialLink {
    port: SerialStream,
    name: String,
}

impl SerialLink {
    /// Opens `path` at `baud`, 8N1, hardware RTS/CTS flow control.
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::Hardware)
            .timeout(READ_TIMEOUT)
            .open_native_async()
            .map_err(|e| TransportError::Read(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Self {
            port,
            name: path.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads whatever is available, bounded by `READ_TIMEOUT`. Returns
    /// `Ok(0)` on timeout rather than blocking the caller indefinitely —
    /// callers use this to interleave shutdown/quiesce checks.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match tokio::time::timeout(READ_TIMEOUT, self.port.read(buf)).await {
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(TransportError::Read(e)),
            Err(_) => Ok(0),
        }
    }

    /// Writes `bytes` as a single call. `tokio-serial`/the OS may still
    /// fragment a write across multiple USB packets for bursts much longer
    /// than this is ever called with; the escape sequence (6 bytes) and exit
    /// sequence (6 bytes) are well inside any sane USB-serial MTU, which is
    /// what the command-mode escape's 600 µs inter-byte constraint actually
    /// depends on.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port
            .write_all(bytes)
            .await
            .map_err(TransportError::Write)?;
        self.port.flush().await.map_err(TransportError::Write)
    }

    /// Drains pending bytes from the OS buffer. Only safe while the receiver
    /// is paused (the arbiter calls this before entering command mode).
    pub fn reset_input(&self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Read(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Send a 2-byte MAC query, read a 4-byte response with a fixed header
    /// byte. Best-effort: failures are logged and surfaced to the caller as
    /// `None` rather than a hard error, since the receive loop treats this
    /// as a non-fatal pre-flight step.
    pub async fn query_mac(&mut self) -> Option<[u8; 3]> {
        if let Err(e) = self.write_all(&MAC_QUERY).await {
            warn!(link = %self.name, error = %e, "MAC query write failed");
            return None;
        }
        let mut resp = [0u8; 4];
        if self.read_exact_best_effort(&mut resp).await.is_err() {
            return None;
        }
        if resp[0] != MAC_RESP_HEADER {
            warn!(link = %self.name, header = resp[0], "unexpected MAC query header");
            return None;
        }
        let mac = [resp[1], resp[2], resp[3]];
        debug!(link = %self.name, ?mac, "queried MAC address");
        Some(mac)
    }

    /// Send a 2-byte RSSI query, read a 2-byte response.
    pub async fn query_rssi(&mut self) -> Option<u8> {
        if let Err(e) = self.write_all(&RSSI_QUERY).await {
            warn!(link = %self.name, error = %e, "RSSI query write failed");
            return None;
        }
        let mut resp = [0u8; 2];
        if self.read_exact_best_effort(&mut resp).await.is_err() {
            return None;
        }
        Some(resp[1])
    }

    async fn read_exact_best_effort(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while filled < buf.len() {
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            let n = self.read(&mut buf[filled..]).await?;
            filled += n;
        }
        Ok(())
    }
}
