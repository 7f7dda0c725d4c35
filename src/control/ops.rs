//! Radio control-plane operations: one method per command-mode transaction,
//! each a thin wrapper around `CommandSession::transact`.
//!
//! Every request is `CC <opcode> [args...]`; every response is
//! prefix-matched on `CC <opcode>` and validated by length, with the single
//! documented exception of the EEPROM-write acknowledgement.

use std::time::Duration;

use tracing::info;

use super::arbiter::{Arbiter, CommandSession};
use crate::error::ControlError;
use crate::model::RadioProfile;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const DECRYPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Radio firmware status byte as returned by Status/Verify-upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    OutOfRange,
    Server,
    InRange,
    Unknown(u8),
}

impl From<u8> for RadioStatus {
    fn from(b: u8) -> Self {
        match b {
            0x01 => RadioStatus::OutOfRange,
            0x02 => RadioStatus::Server,
            0x03 => RadioStatus::InRange,
            other => RadioStatus::Unknown(other),
        }
    }
}

/// A thin, typed facade over `Arbiter::with_session` — one method per
/// control-plane operation, each opening its own session so the `Busy`
/// contract applies per-call rather than requiring callers to manage
/// sessions by hand.
pub struct ControlOps<'a> {
    arbiter: &'a Arbiter,
}

impl<'a> ControlOps<'a> {
    pub fn new(arbiter: &'a Arbiter) -> Self {
        Self { arbiter }
    }

    /// `CC 00 00` -> `CC <firmware> <status>`.
    pub async fn status(&self) -> Result<(u8, RadioStatus), ControlError> {
        self.arbiter
            .with_session(|mut session| async move {
                let result = async {
                    let resp = session
                        .transact("status", &[0xCC, 0x00, 0x00], 3, DEFAULT_TIMEOUT)
                        .await?;
                    expect_header(&resp, "status")?;
                    Ok((resp[1], RadioStatus::from(resp[2])))
                }
                .await;
                (result, session)
            })
            .await
    }

    /// `CC C0 <addr> <len>` -> `CC <addr> <len> <data...>`. Snapshots one
    /// EEPROM field into a `RadioProfile` entry per byte.
    pub async fn read_eeprom(&self, addr: u8, len: u8) -> Result<Vec<u8>, ControlError> {
        self.arbiter
            .with_session(|mut session| async move {
                let result = async {
                    let req = [0xCC, 0xC0, addr, len];
                    let resp = session
                        .transact("read_eeprom", &req, 3 + len as usize, DEFAULT_TIMEOUT)
                        .await?;
                    expect_header(&resp, "read_eeprom")?;
                    if resp[1] != addr || resp[2] != len {
                        return Err(ControlError::UnexpectedResponse { op: "read_eeprom" });
                    }
                    Ok(resp[3..].to_vec())
                }
                .await;
                (result, session)
            })
            .await
    }

    /// Convenience wrapper: reads the whole documented EEPROM map into a
    /// `RadioProfile`.
    pub async fn read_radio_profile(&self, addresses: &[u8]) -> Result<RadioProfile, ControlError> {
        let mut profile = RadioProfile::default();
        for &addr in addresses {
            let data = self.read_eeprom(addr, 1).await?;
            profile.set(addr as u16, data[0]);
        }
        Ok(profile)
    }

    /// `CC C1 <addr> <len> <data...>` -> `<addr> <len> <last_byte>`. The
    /// response carries no `0xCC` prefix — a documented hardware wart — so
    /// this is the one operation whose response check differs from every
    /// other.
    pub async fn write_eeprom(&self, addr: u8, data: &[u8]) -> Result<(), ControlError> {
        if data.is_empty() {
            return Err(ControlError::UnexpectedResponse { op: "write_eeprom" });
        }
        let len = data.len() as u8;
        let data = data.to_vec();
        self.arbiter
            .with_session(|mut session| async move {
                let result = async {
                    let mut req = vec![0xCC, 0xC1, addr, len];
                    req.extend_from_slice(&data);
                    let resp = session
                        .transact("write_eeprom", &req, 3, DEFAULT_TIMEOUT)
                        .await?;
                    if resp[0] != addr || resp[1] != len {
                        return Err(ControlError::UnexpectedResponse { op: "write_eeprom" });
                    }
                    // Non-empty, guarded by the caller-facing check above `with_session`.
                    let expected_last = data[data.len() - 1];
                    if resp[2] != expected_last {
                        return Err(ControlError::UnexpectedResponse { op: "write_eeprom" });
                    }
                    Ok(())
                }
                .await;
                (result, session)
            })
            .await
    }

    /// `CC 02 <chan>` -> `CC <chan>`. Non-persistent; pair with
    /// `persist_channel` for an `ATWR`-equivalent EEPROM write when the
    /// change should survive a reset.
    pub async fn set_channel_live(&self, channel: u8) -> Result<(), ControlError> {
        self.arbiter
            .with_session(|mut session| async move {
                let result = async {
                    let resp = session
                        .transact("set_channel_live", &[0xCC, 0x02, channel], 2, DEFAULT_TIMEOUT)
                        .await?;
                    expect_header(&resp, "set_channel_live")?;
                    if resp[1] != channel {
                        return Err(ControlError::UnexpectedResponse {
                            op: "set_channel_live",
                        });
                    }
                    Ok(())
                }
                .await;
                (result, session)
            })
            .await
    }

    /// Writes the channel EEPROM address so the live change survives a
    /// reset. A distinct call from `set_channel_live` because the hardware
    /// exposes them as two separate operations with different persistence.
    pub async fn persist_channel(&self, channel: u8) -> Result<(), ControlError> {
        self.write_eeprom(crate::model::eeprom::CHANNEL as u8, &[channel])
            .await
    }

    /// `CC C1 <TRANSMITTER_ADDRESS> 1 <addr>` — an address change is just an
    /// EEPROM write to the documented transmitter-address offset; exposed
    /// under its own name because operators reason about it as a distinct
    /// command.
    pub async fn change_transmitter_address(&self, new_address: u8) -> Result<(), ControlError> {
        self.write_eeprom(crate::model::eeprom::TRANSMITTER_ADDRESS as u8, &[new_address])
            .await
    }

    /// `CC FF` — no response; caller must wait ≥ 1 s then reopen the link.
    pub async fn soft_reset(&self) -> Result<(), ControlError> {
        self.arbiter
            .with_session(|mut session| async move {
                let result = async {
                    session.write_only(&[0xCC, 0xFF]).await?;
                    info!("soft reset sent");
                    Ok(())
                }
                .await;
                (result, session)
            })
            .await
    }

    /// `CC C4 <addr16> <len16> <data...>` -> `CC C4 <status> <addr16>`.
    /// `timeout` should be widened by the caller to 300 ms beyond the
    /// default on the first write crossing `0x0800` (internal erase delay).
    pub async fn firmware_write(
        &self,
        session: &mut CommandSession,
        addr: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let mut req = vec![0xCC, 0xC4];
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&(data.len() as u16).to_be_bytes());
        req.extend_from_slice(data);
        let resp = session.transact("firmware_write", &req, 5, timeout).await?;
        if resp[0] != 0xCC || resp[1] != 0xC4 {
            return Err(ControlError::UnexpectedResponse {
                op: "firmware_write",
            });
        }
        let status = resp[2];
        if status != 0 {
            return Err(ControlError::FirmwareStatus(status));
        }
        let echoed_addr = u16::from_be_bytes([resp[3], resp[4]]);
        if echoed_addr != addr {
            return Err(ControlError::UnexpectedResponse {
                op: "firmware_write",
            });
        }
        Ok(())
    }

    /// `CC C9 <addr16> <len16>` -> `CC C9 <status> <addr16> <data...>`.
    pub async fn firmware_read(
        &self,
        session: &mut CommandSession,
        addr: u16,
        len: u16,
    ) -> Result<Vec<u8>, ControlError> {
        let mut req = vec![0xCC, 0xC9];
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&len.to_be_bytes());
        let resp = session
            .transact("firmware_read", &req, 5 + len as usize, DEFAULT_TIMEOUT)
            .await?;
        if resp[0] != 0xCC || resp[1] != 0xC9 {
            return Err(ControlError::UnexpectedResponse { op: "firmware_read" });
        }
        let status = resp[2];
        if status != 0 {
            return Err(ControlError::FirmwareStatus(status));
        }
        Ok(resp[5..].to_vec())
    }

    /// `CC C6` -> `CC C6`.
    pub async fn erase(&self, session: &mut CommandSession) -> Result<(), ControlError> {
        let resp = session
            .transact("erase", &[0xCC, 0xC6], 2, DEFAULT_TIMEOUT)
            .await?;
        expect_header(&resp, "erase")?;
        if resp[1] != 0xC6 {
            return Err(ControlError::UnexpectedResponse { op: "erase" });
        }
        Ok(())
    }

    /// `CC C5` -> `CC C5 <status>`.
    pub async fn decrypt_image(&self, session: &mut CommandSession) -> Result<u8, ControlError> {
        let resp = session
            .transact("decrypt_image", &[0xCC, 0xC5], 3, DECRYPT_TIMEOUT)
            .await?;
        expect_header(&resp, "decrypt_image")?;
        if resp[1] != 0xC5 {
            return Err(ControlError::UnexpectedResponse {
                op: "decrypt_image",
            });
        }
        Ok(resp[2])
    }

    /// `CC 00 02` -> `CC <fw> <status>`.
    pub async fn verify_upgrade(&self) -> Result<(u8, RadioStatus), ControlError> {
        self.arbiter
            .with_session(|mut session| async move {
                let result = async {
                    let resp = session
                        .transact("verify_upgrade", &[0xCC, 0x00, 0x02], 3, DEFAULT_TIMEOUT)
                        .await?;
                    expect_header(&resp, "verify_upgrade")?;
                    Ok((resp[1], RadioStatus::from(resp[2])))
                }
                .await;
                (result, session)
            })
            .await
    }
}

fn expect_header(resp: &[u8], op: &'static str) -> Result<(), ControlError> {
    if resp.first() != Some(&0xCC) {
        return Err(ControlError::UnexpectedResponse { op });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_status_from_byte() {
        assert_eq!(RadioStatus::from(0x01), RadioStatus::OutOfRange);
        assert_eq!(RadioStatus::from(0x02), RadioStatus::Server);
        assert_eq!(RadioStatus::from(0x03), RadioStatus::InRange);
        assert_eq!(RadioStatus::from(0x09), RadioStatus::Unknown(0x09));
    }
}
