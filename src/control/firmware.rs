//! Encrypted firmware-image upgrade sequence: enter command mode, erase,
//! chunked write/read-back/compare with bounded retry, decrypt, reset,
//! reopen and verify.

use std::time::Duration;

use tracing::{info, warn};

use super::arbiter::Arbiter;
use super::ops::{ControlOps, RadioStatus};
use crate::error::ControlError;
use crate::serial::SerialLink;

/// Default chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 128;
pub const MAX_CHUNK_SIZE: usize = 255;

/// Address at which writes start incurring an internal 300 ms erase delay.
const ERASE_BOUNDARY: u16 = 0x0800;
const POST_ERASE_EXTRA_TIMEOUT: Duration = Duration::from_millis(300);
const BASE_CHUNK_TIMEOUT: Duration = Duration::from_secs(2);

/// Whole-image mismatch budget; more than this aborts the upgrade.
const MAX_TOTAL_MISMATCHES: u32 = 3;

const RESET_SETTLE: Duration = Duration::from_secs(3);

pub struct FirmwareUpgrade<'a> {
    ops: ControlOps<'a>,
    chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct UpgradeReport {
    pub chunks_written: usize,
    pub mismatches: u32,
    pub verify_status: RadioStatus,
}

impl<'a> FirmwareUpgrade<'a> {
    pub fn new(arbiter: &'a Arbiter) -> Self {
        Self {
            ops: ControlOps::new(arbiter),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0 && chunk_size <= MAX_CHUNK_SIZE);
        self.chunk_size = chunk_size;
        self
    }

    /// Erases, writes and verifies every chunk, then decrypts the image —
    /// each step its own command-mode session. Call `reset_and_verify`
    /// afterwards to reset the radio and confirm the new image is live.
    pub async fn write_image(&self, arbiter: &Arbiter, image: &[u8]) -> Result<(), ControlError> {
        let mut total_mismatches = 0u32;

        let erase_result = arbiter
            .with_session(|mut session| async move {
                let r = self.ops.erase(&mut session).await;
                (r, session)
            })
            .await;
        erase_result?;
        info!("firmware image erased");

        for (chunk_index, chunk) in image.chunks(self.chunk_size).enumerate() {
            let addr = (chunk_index * self.chunk_size) as u16;
            let timeout = chunk_timeout(addr, chunk.len() as u16, self.chunk_size as u16);
            let chunk = chunk.to_vec();
            let chunk_for_attempt = chunk.clone();
            let write_ok = arbiter
                .with_session(|mut session| async move {
                    let r = write_and_verify_chunk(&self.ops, &mut session, addr, &chunk_for_attempt, timeout)
                        .await;
                    (r, session)
                })
                .await;

            match write_ok {
                Ok(()) => {}
                Err(_) => {
                    total_mismatches += 1;
                    warn!(addr, "chunk mismatch, retrying once");
                    if total_mismatches > MAX_TOTAL_MISMATCHES {
                        return Err(ControlError::VerifyMismatch {
                            mismatches: total_mismatches as u8,
                        });
                    }
                    arbiter
                        .with_session(|mut session| async move {
                            let r = write_and_verify_chunk(&self.ops, &mut session, addr, &chunk, timeout)
                                .await;
                            (r, session)
                        })
                        .await
                        .map_err(|_| ControlError::VerifyMismatch {
                            mismatches: total_mismatches as u8,
                        })?;
                }
            }
        }

        arbiter
            .with_session(|mut session| async move {
                let result = async {
                    let status = self.ops.decrypt_image(&mut session).await?;
                    if status != 0 {
                        return Err(ControlError::FirmwareStatus(status));
                    }
                    Ok(())
                }
                .await;
                (result, session)
            })
            .await?;
        info!("firmware image decrypted, will take effect on next reset");
        Ok(())
    }

    /// Reset, wait for the hardware to settle, reopen the link and confirm
    /// the new image via `verify_upgrade`. The caller owns reconnect policy
    /// and hands back a fresh `Arbiter` built on the reopened port.
    pub async fn reset_and_verify(
        &self,
        path: &str,
        baud: u32,
    ) -> Result<(Arbiter, UpgradeReport), ControlError> {
        self.ops.soft_reset().await.ok();
        tokio::time::sleep(RESET_SETTLE).await;

        let link = SerialLink::open(path, baud)?;
        let (arbiter, _handle) = Arbiter::new(link);
        let ops = ControlOps::new(&arbiter);
        let (fw, status) = ops.verify_upgrade().await?;
        info!(firmware = fw, ?status, "firmware upgrade verified");
        Ok((
            arbiter,
            UpgradeReport {
                chunks_written: 0,
                mismatches: 0,
                verify_status: status,
            },
        ))
    }
}

fn chunk_timeout(addr: u16, _chunk_len: u16, chunk_size: u16) -> Duration {
    // The 300 ms internal erase delay only applies on the first write that
    // crosses the erase boundary, i.e. the chunk starting just below it.
    if addr < ERASE_BOUNDARY && addr + chunk_size >= ERASE_BOUNDARY {
        BASE_CHUNK_TIMEOUT + POST_ERASE_EXTRA_TIMEOUT
    } else {
        BASE_CHUNK_TIMEOUT
    }
}

async fn write_and_verify_chunk(
    ops: &ControlOps<'_>,
    session: &mut super::arbiter::CommandSession,
    addr: u16,
    chunk: &[u8],
    timeout: Duration,
) -> Result<(), ControlError> {
    ops.firmware_write(session, addr, chunk, timeout).await?;
    let readback = ops.firmware_read(session, addr, chunk.len() as u16).await?;
    if readback != chunk {
        return Err(ControlError::VerifyMismatch { mismatches: 1 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_timeout_extends_across_erase_boundary() {
        let normal = chunk_timeout(0x0000, 128, 128);
        assert_eq!(normal, BASE_CHUNK_TIMEOUT);

        let crossing = chunk_timeout(0x0780, 128, 128);
        assert_eq!(crossing, BASE_CHUNK_TIMEOUT + POST_ERASE_EXTRA_TIMEOUT);
    }

    #[test]
    fn chunk_timeout_unaffected_past_boundary() {
        let past = chunk_timeout(0x1000, 128, 128);
        assert_eq!(past, BASE_CHUNK_TIMEOUT);
    }
}
