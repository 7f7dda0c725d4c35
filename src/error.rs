//! Crate-wide error taxonomy.
//!
//! Mirrors the error classes from the design doc: transport, framing,
//! decoding, control-plane and store errors are kept as distinct types so
//! each layer can decide what recovers locally (framing, decoding) and what
//! propagates to a caller or triggers a reconnect (transport, control-plane).

use std::io;
use thiserror::Error;

/// Transport-level failures on a serial link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port closed")]
    Closed,
    #[error("read error: {0}")]
    Read(#[source] io::Error),
    #[error("write error: {0}")]
    Write(#[source] io::Error),
    #[error("read timed out")]
    Timeout,
}

/// Packet-decoding failures. Confined to a single frame; never fatal to
/// the link.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short ({got} < {need} bytes)")]
    TooShort { got: usize, need: usize },
    #[error("checksum mismatch: computed {computed:#04x}, found {found:#04x}")]
    BadChecksum { computed: u8, found: u8 },
    #[error("unknown protocol byte {0}")]
    UnknownProtocol(u8),
    #[error("text field truncated")]
    BadText,
}

/// Control-plane failures. Propagated to the caller that requested
/// the transaction; the arbiter always attempts the exit sequence before
/// surfacing this.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a command-mode session is already in progress on this link")]
    Busy,
    #[error("radio did not echo the expected header for {op}")]
    UnexpectedResponse { op: &'static str },
    #[error("command-mode transaction timed out during {op}")]
    Timeout { op: &'static str },
    #[error("failed to enter command mode (no CC 43 4F 4D echo)")]
    EnterFailed,
    #[error("failed to exit command mode cleanly")]
    ExitFailed,
    #[error("firmware verify mismatch after {mismatches} retries")]
    VerifyMismatch { mismatches: u8 },
    #[error("firmware write rejected, status {0:#04x}")]
    FirmwareStatus(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Durable-store failures. Buffered in memory up to a cap; this error
/// is only surfaced once that cap is exceeded.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("write queue saturated, dropped {dropped} records")]
    QueueSaturated { dropped: usize },
}

/// Top-level error used where a caller needs a single type across layers
/// (e.g. the binary's composition root).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}
