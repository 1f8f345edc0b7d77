//! Firmware update session.
//!
//! ```text
//! Idle ─▶ Negotiating ─▶ Transferring ─▶ Verifying ─▶ Completed
//!              │               │              │
//!              └───────────────┴──────────────┴──▶ Aborted
//! ```
//!
//! - Negotiating: `OTA_START:size,crc,block_size`, reply must carry `OTA_READY`.
//! - Transferring: block frames in order, each acknowledged by `OTA_ACK:n`;
//!   a `OTA_NAK:n` or missing verdict costs one attempt.
//! - Verifying: `OTA_END`, reply `OK:OTA_VERIFY,CRC=xxxxxxxx` must match.
//!
//! Every abort sends a best-effort `OTA_ABORT`. Aborted sessions are never
//! retried automatically.

use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::image::FirmwareImage;
use crate::link::Link;
use crate::protocol::{BlockFrame, Command, Inbound};
use crate::session::command::CommandSession;
use crate::session::{CancelToken, SessionConfig};

/// Phase of a firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Not started.
    #[default]
    Idle,
    /// Announcing the image.
    Negotiating,
    /// Streaming blocks.
    Transferring,
    /// Waiting for the device checksum.
    Verifying,
    /// Verified by the device.
    Completed,
    /// Stopped before completion.
    Aborted,
}

impl Phase {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Progress of a firmware transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferState {
    /// Current phase.
    pub phase: Phase,
    /// Index of the next block to send.
    pub next_block: u16,
    /// Total number of blocks.
    pub total_blocks: u16,
    /// Attempts spent on each block so far.
    pub attempts: Vec<u32>,
    /// Blocks the device acknowledged.
    pub acked_blocks: u16,
    /// Bytes the device acknowledged.
    pub bytes_acked: usize,
    /// Image size.
    pub total_bytes: usize,
}

impl TransferState {
    fn new(image: &FirmwareImage) -> Self {
        let total_blocks = image.block_count();
        Self {
            phase: Phase::Idle,
            next_block: 0,
            total_blocks,
            attempts: vec![0; usize::from(total_blocks)],
            acked_blocks: 0,
            bytes_acked: 0,
            total_bytes: image.len(),
        }
    }

    /// Acknowledged share of the image, 0..=100.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        u8::try_from(self.bytes_acked * 100 / self.total_bytes).unwrap_or(100)
    }
}

/// How much the device may have been affected by an aborted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareRisk {
    /// Aborted before verification; the running firmware is untouched.
    DeviceUnchanged,
    /// Aborted during verification; the device may or may not boot the new image.
    Uncertain,
}

/// Terminal result of an update.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The device verified the image.
    Completed,
    /// The update stopped early.
    Aborted {
        /// Why it stopped.
        reason: Error,
        /// What that means for the device.
        risk: FirmwareRisk,
    },
}

impl UpdateOutcome {
    /// Whether the update completed.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Final report of a firmware session.
#[derive(Debug)]
pub struct UpdateReport {
    /// How it ended.
    pub outcome: UpdateOutcome,
    /// Transfer progress at the end.
    pub transfer: TransferState,
}

impl UpdateReport {
    /// Convert into a plain result, failing with the abort reason.
    pub fn into_result(self) -> Result<TransferState> {
        match self.outcome {
            UpdateOutcome::Completed => Ok(self.transfer),
            UpdateOutcome::Aborted { reason, .. } => Err(reason),
        }
    }
}

pub(crate) struct FirmwareSession<'a> {
    link: &'a Link,
    config: &'a SessionConfig,
    image: &'a FirmwareImage,
    cancel: &'a CancelToken,
    state: TransferState,
}

impl<'a> FirmwareSession<'a> {
    pub(crate) fn new(
        link: &'a Link,
        config: &'a SessionConfig,
        image: &'a FirmwareImage,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            link,
            config,
            image,
            cancel,
            state: TransferState::new(image),
        }
    }

    /// Drive the update to a terminal phase.
    pub(crate) fn run(mut self) -> UpdateReport {
        info!(
            "Updating firmware on {}: {} bytes in {} blocks, CRC32 {:08X}",
            self.link.port_name(),
            self.image.len(),
            self.image.block_count(),
            self.image.crc32()
        );

        let result = self.run_phases();

        let outcome = match result {
            Ok(()) => {
                self.enter(Phase::Completed);
                info!("Firmware update verified");
                UpdateOutcome::Completed
            },
            Err(reason) => {
                let risk = if self.state.phase == Phase::Verifying {
                    FirmwareRisk::Uncertain
                } else {
                    FirmwareRisk::DeviceUnchanged
                };
                warn!("Firmware update aborted in {}: {reason}", self.state.phase);
                self.send_abort();
                self.enter(Phase::Aborted);
                UpdateOutcome::Aborted { reason, risk }
            },
        };

        UpdateReport {
            outcome,
            transfer: self.state,
        }
    }

    fn run_phases(&mut self) -> Result<()> {
        self.negotiate()?;
        self.transfer()?;
        self.verify()
    }

    fn session(&self) -> CommandSession<'a> {
        CommandSession::new(self.link, self.config)
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Firmware phase: {} -> {phase}", self.state.phase);
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.link
            .shared()
            .events()
            .publish(&Event::Firmware(self.state.clone()));
    }

    fn check_continue(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.link.is_alive() {
            return Err(Error::ConnectionLost);
        }
        Ok(())
    }

    fn negotiate(&mut self) -> Result<()> {
        self.enter(Phase::Negotiating);
        self.check_continue()?;

        let size = u32::try_from(self.image.len())
            .map_err(|_| Error::InvalidImage("image too large".into()))?;
        let announce = Command::OtaStart {
            size,
            crc: self.image.crc32(),
            block_size: self.image.block_size(),
        };
        let response = self
            .session()
            .send_with_timeout(&announce, self.config.ota_ready_timeout)?;

        if !response.has_flag("OTA_READY") {
            return Err(Error::Protocol(format!(
                "device did not accept the image: {response}"
            )));
        }
        if let Some(echo) = response.int("SIZE") {
            if echo != i64::from(size) {
                return Err(Error::Protocol(format!(
                    "device expects {echo} bytes, image has {size}"
                )));
            }
        }
        if let Some(echo) = response.hex("CRC") {
            if echo != self.image.crc32() {
                return Err(Error::Protocol(format!(
                    "device expects CRC32 {echo:08X}, image has {:08X}",
                    self.image.crc32()
                )));
            }
        }
        Ok(())
    }

    fn transfer(&mut self) -> Result<()> {
        self.enter(Phase::Transferring);

        let image = self.image;
        for (index, data) in image.blocks() {
            self.check_continue()?;
            self.state.next_block = index;
            self.send_block(index, data)?;

            self.state.acked_blocks += 1;
            self.state.bytes_acked += data.len();
            self.state.next_block = index.saturating_add(1);
            self.publish();
        }
        Ok(())
    }

    fn send_block(&mut self, index: u16, data: &[u8]) -> Result<()> {
        let frame = BlockFrame::new(index, data).build();
        let max = self.config.block_attempts.max(1);

        for attempt in 1..=max {
            self.state.attempts[usize::from(index)] = attempt;
            self.link.drain_stale();
            self.link.send(frame.clone())?;

            match self.await_verdict(index)? {
                Some(true) => {
                    debug!("Block {index} acknowledged");
                    return Ok(());
                },
                Some(false) => {
                    warn!("Block {index} rejected (attempt {attempt}/{max})");
                },
                None => {
                    warn!("No verdict for block {index} (attempt {attempt}/{max})");
                },
            }

            if attempt < max {
                self.check_continue()?;
            }
        }

        Err(Error::Timeout(format!(
            "block {index} not acknowledged after {max} attempts"
        )))
    }

    /// `Some(accepted)` on a verdict for `index`, `None` on timeout.
    fn await_verdict(&self, index: u16) -> Result<Option<bool>> {
        let deadline = Instant::now() + self.config.block_ack_timeout;
        loop {
            match self.link.recv(deadline)? {
                None => return Ok(None),
                Some(Inbound::BlockAck {
                    index: got,
                    accepted,
                }) if got == index => return Ok(Some(accepted)),
                Some(Inbound::Reply { response, .. }) if response.is_error() => {
                    return Err(Error::Rejected(format!(
                        "device stopped the transfer: {response}"
                    )));
                },
                Some(other) => debug!("Ignoring {other:?} while waiting for block {index}"),
            }
        }
    }

    fn verify(&mut self) -> Result<()> {
        self.enter(Phase::Verifying);
        self.check_continue()?;

        let expected = self.image.crc32();
        let response = self
            .session()
            .exchange(&Command::OtaEnd, self.config.verify_timeout)?;

        if response.is_error() {
            return Err(Error::Integrity {
                expected,
                actual: response.hex("CRC"),
            });
        }
        if !response.has_flag("OTA_VERIFY") {
            return Err(Error::Protocol(format!(
                "unexpected verification reply: {response}"
            )));
        }
        let actual = response.hex("CRC").ok_or_else(|| {
            Error::Protocol(format!("verification reply without CRC: {response}"))
        })?;
        if actual != expected {
            return Err(Error::Integrity {
                expected,
                actual: Some(actual),
            });
        }
        Ok(())
    }

    fn send_abort(&self) {
        if !self.link.is_alive() {
            return;
        }
        if let Err(e) = self.session().notify(&Command::OtaAbort) {
            debug!("OTA_ABORT not sent: {e}");
        }
    }
}
