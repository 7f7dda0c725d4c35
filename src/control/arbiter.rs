//! The control-plane arbiter: serialises command-mode sessions against the
//! receiver's read loop on the same physical port.
//!
//! The port is shared via `Arc<tokio::sync::Mutex<SerialLink>>` rather than
//! a free-for-all lock: `NetworkReceiver` only ever holds the guard for the
//! duration of one read-and-parse iteration, and checks the `quiesce` watch
//! flag *before* taking the lock, so it naturally stops competing for the
//! port within one iteration of requesting a pause — the receiver always
//! gets to finish draining whatever it already read before the arbiter's
//! `lock().await` resolves. That reproduces a "the receiver must be allowed
//! to drain pending bytes first" handoff with an ordinary, auditable
//! primitive instead of a bespoke channel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::error::ControlError;
use crate::serial::SerialLink;

const ESCAPE_SEQUENCE: [u8; 6] = [0x41, 0x54, 0x2B, 0x2B, 0x2B, 0x0D];
const ENTER_ECHO: [u8; 4] = [0xCC, 0x43, 0x4F, 0x4D];
const EXIT_SEQUENCE: [u8; 5] = [0xCC, 0x41, 0x54, 0x4F, 0x0D];
const EXIT_ECHO: [u8; 4] = [0xCC, 0x44, 0x41, 0x54];

const INTERFACE_TIMEOUT: Duration = Duration::from_millis(1);
const ENTER_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// The per-link command-mode state machine: `Data -> Entering -> Command ->
/// Exiting -> Data`, with `Entering -> Data` and `Exiting -> Command`
/// modeling failure (no echo).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Data,
    Entering,
    Command,
    Exiting,
}

/// Shared between the owning `NetworkReceiver` task and the `Arbiter`.
pub struct ArbiterHandle {
    pub(crate) port: Arc<Mutex<SerialLink>>,
    pub(crate) quiesce_tx: watch::Sender<bool>,
}

impl ArbiterHandle {
    pub fn quiesce_rx(&self) -> watch::Receiver<bool> {
        self.quiesce_tx.subscribe()
    }
}

/// One arbiter per port. Only one command-mode session may be
/// in-flight at a time; a second caller gets `Busy` immediately rather than
/// queuing, so operators get a prompt error instead of an unbounded wait.
pub struct Arbiter {
    port: Arc<Mutex<SerialLink>>,
    quiesce_tx: watch::Sender<bool>,
    busy: AtomicBool,
}

impl Arbiter {
    pub fn new(link: SerialLink) -> (Self, ArbiterHandle) {
        let port = Arc::new(Mutex::new(link));
        let (quiesce_tx, _rx) = watch::channel(false);
        let handle = ArbiterHandle {
            port: port.clone(),
            quiesce_tx: quiesce_tx.clone(),
        };
        (
            Self {
                port,
                quiesce_tx,
                busy: AtomicBool::new(false),
            },
            handle,
        )
    }

    /// Quiesces the receiver, drains the port, waits the interface timeout,
    /// writes the escape sequence and confirms the echo. On success the
    /// session is in `LinkState::Command` and the receiver stays paused
    /// until `end_session` runs; on failure the receiver is resumed
    /// immediately (nothing to exit out of — the `Entering -> Data`
    /// transition) and the busy flag is released.
    pub async fn begin_session(&self) -> Result<CommandSession, ControlError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControlError::Busy);
        }

        self.quiesce_tx.send(true).ok();
        let mut port = self.port.clone().lock_owned().await;
        let enter = async {
            port.reset_input()?;
            tokio::time::sleep(INTERFACE_TIMEOUT).await;
            enter_command_mode(&mut port).await
        }
        .await;

        match enter {
            Ok(()) => Ok(CommandSession {
                port,
                state: LinkState::Command,
            }),
            Err(e) => {
                self.quiesce_tx.send(false).ok();
                self.busy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Unconditionally sends the exit sequence, resumes the receiver, and
    /// releases the busy flag, regardless of what the caller did with the
    /// session in between — leaving the radio in command mode silently
    /// loses all sensor frames, so exit is never skipped.
    pub async fn end_session(&self, mut session: CommandSession) -> Result<(), ControlError> {
        let exit_result = exit_command_mode(&mut session.port).await;
        if let Err(e) = &exit_result {
            warn!(error = %e, "exit-command-mode sequence failed, link state unknown");
        }
        self.quiesce_tx.send(false).ok();
        self.busy.store(false, Ordering::Release);
        exit_result
    }

    /// Convenience wrapper for the common one-shot case: begin a session,
    /// run `body` against it, always end the session afterwards (even if
    /// `body` errored), and fold both results into one `Result`. `body`
    /// takes the session by value and must hand it back alongside its own
    /// result, since a closure bound of the shape `FnOnce(&mut CommandSession)
    /// -> impl Future` cannot be expressed without the future's type
    /// depending on a lifetime the closure doesn't own — passing the session
    /// by value sidesteps that entirely.
    pub async fn with_session<T, F, Fut>(&self, body: F) -> Result<T, ControlError>
    where
        F: FnOnce(CommandSession) -> Fut,
        Fut: Future<Output = (Result<T, ControlError>, CommandSession)>,
    {
        let session = self.begin_session().await?;
        let (body_result, session) = body(session).await;
        let exit_result = self.end_session(session).await;
        match (body_result, exit_result) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }
}

/// Owned access to the port for the duration of one command-mode session;
/// operations in `super::ops` take this by value rather than sharing the raw
/// link so they can't accidentally run outside a session. Holding an
/// `OwnedMutexGuard` (rather than borrowing `&mut SerialLink` with a
/// lifetime tied to the `Arbiter`) lets a session be moved freely into and
/// out of async closures and across `.await` points without any borrow
/// surviving the call that produced it.
pub struct CommandSession {
    port: OwnedMutexGuard<SerialLink>,
    state: LinkState,
}

impl CommandSession {
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Writes `request` and reads exactly `response_len` bytes within
    /// `timeout`. Used by every radio control operation; each documents its
    /// own request/response shape.
    pub async fn transact(
        &mut self,
        op: &'static str,
        request: &[u8],
        response_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ControlError> {
        self.port.write_all(request).await?;
        let mut resp = vec![0u8; response_len];
        let mut filled = 0;
        let deadline = tokio::time::Instant::now() + timeout;
        while filled < resp.len() {
            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::Timeout { op });
            }
            let n = self.port.read(&mut resp[filled..]).await?;
            filled += n;
        }
        Ok(resp)
    }

    /// Like `transact` but the caller doesn't know the response length up
    /// front (firmware read, EEPROM read): reads until `timeout` elapses
    /// with no further bytes arriving, or `max_len` is reached.
    pub async fn transact_variable(
        &mut self,
        request: &[u8],
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ControlError> {
        self.port.write_all(request).await?;
        let mut resp = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 64];
        while resp.len() < max_len {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            let n = self.port.read(&mut chunk).await?;
            if n == 0 {
                if !resp.is_empty() {
                    break;
                }
                continue;
            }
            resp.extend_from_slice(&chunk[..n]);
        }
        Ok(resp)
    }

    /// Fire-and-forget write with no response (soft reset).
    pub async fn write_only(&mut self, request: &[u8]) -> Result<(), ControlError> {
        self.port.write_all(request).await?;
        Ok(())
    }
}

async fn enter_command_mode(port: &mut SerialLink) -> Result<(), ControlError> {
    port.write_all(&ESCAPE_SEQUENCE).await?;
    tokio::time::sleep(INTERFACE_TIMEOUT).await;
    let mut resp = [0u8; 4];
    let mut filled = 0;
    let deadline = tokio::time::Instant::now() + ENTER_READ_TIMEOUT;
    while filled < resp.len() {
        if tokio::time::Instant::now() >= deadline {
            return Err(ControlError::EnterFailed);
        }
        let n = port.read(&mut resp[filled..]).await?;
        filled += n;
    }
    if resp != ENTER_ECHO {
        return Err(ControlError::EnterFailed);
    }
    info!("entered command mode");
    Ok(())
}

async fn exit_command_mode(port: &mut SerialLink) -> Result<(), ControlError> {
    port.write_all(&EXIT_SEQUENCE).await?;
    let mut resp = [0u8; 4];
    let mut filled = 0;
    let deadline = tokio::time::Instant::now() + ENTER_READ_TIMEOUT;
    while filled < resp.len() {
        if tokio::time::Instant::now() >= deadline {
            return Err(ControlError::ExitFailed);
        }
        let n = port.read(&mut resp[filled..]).await?;
        filled += n;
    }
    if resp != EXIT_ECHO {
        return Err(ControlError::ExitFailed);
    }
    info!("exited command mode");
    Ok(())
}
