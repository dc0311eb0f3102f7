//! The bootloader flasher state machine.
//!
//! Owns the raw port for the duration of the flashing phase and walks
//! `Idle → ChipDetected → StubRunning → Erased → Writing → Finished`.
//! Out-of-order steps are protocol errors, not panics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kitprov_link::SerialPort;

use crate::chip::{CHIP_DETECT_MAGIC_REG, ChipKind};
use crate::image::{FirmwareImage, StubImage};
use crate::proto::{self, Command, Response};
use crate::slip::{self, SlipDecoder};
use crate::{FLASH_WRITE_SIZE, FlashError, RAM_WRITE_SIZE};

/// Sync attempts before giving up on the ROM loader.
const SYNC_ATTEMPTS: usize = 7;
/// Per-attempt sync response timeout.
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
/// Default command response timeout.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Whole-chip erase can take a while on large parts.
const ERASE_TIMEOUT: Duration = Duration::from_secs(120);
/// How long the stub gets to print its greeting after launch.
const STUB_GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Flashing phase, advanced strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    ChipDetected(ChipKind),
    StubRunning,
    Erased,
    Writing { seq: usize, total: usize },
    Finished,
}

impl FlashState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::ChipDetected(_) => "ChipDetected",
            Self::StubRunning => "StubRunning",
            Self::Erased => "Erased",
            Self::Writing { .. } => "Writing",
            Self::Finished => "Finished",
        }
    }
}

/// Bytes-written progress emitted after each flash block.
#[derive(Debug, Clone, Copy)]
pub struct FlashProgress {
    pub written: usize,
    pub total: usize,
}

/// Drives the ROM loader protocol over a raw, exclusively-owned port.
///
/// The text-mode transport must be closed and unlocked before this type
/// touches the link; it opens the port itself and releases it with
/// [`disconnect`](Self::disconnect) when flashing is done.
pub struct RomFlasher {
    port: Arc<dyn SerialPort>,
    cancel: CancellationToken,
    state: FlashState,
    decoder: SlipDecoder,
    /// 4 on the ESP32 ROM loader, 2 once the stub is running.
    status_len: usize,
}

impl RomFlasher {
    pub fn new(port: Arc<dyn SerialPort>, cancel: CancellationToken) -> Self {
        Self {
            port,
            cancel,
            state: FlashState::Idle,
            decoder: SlipDecoder::new(),
            status_len: 4,
        }
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Opens the port, syncs with the ROM loader, and detects the chip.
    pub async fn connect(&mut self, baud: u32) -> Result<ChipKind, FlashError> {
        self.expect("Idle", |s| matches!(s, FlashState::Idle))?;
        self.port.open(baud).await?;
        self.sync().await?;

        let magic = self.read_reg(CHIP_DETECT_MAGIC_REG).await?;
        let chip = ChipKind::from_magic(magic).ok_or(FlashError::UnsupportedChip(magic))?;
        info!(chip = chip.name(), "ROM loader connected");
        self.state = FlashState::ChipDetected(chip);
        Ok(chip)
    }

    /// Uploads the stub into RAM, runs it, and waits for its greeting.
    pub async fn run_stub(&mut self, stub: &StubImage) -> Result<(), FlashError> {
        self.expect("ChipDetected", |s| matches!(s, FlashState::ChipDetected(_)))?;

        for (bytes, addr) in [(&stub.text, stub.text_start), (&stub.data, stub.data_start)] {
            if bytes.is_empty() {
                continue;
            }
            self.upload_segment(bytes, addr).await?;
        }

        // MEM_END with flag 0 jumps to the entry point.
        self.command(
            Command::MemEnd,
            &proto::words(0, stub.entry, 0, 0)[..8],
            0,
            RESPONSE_TIMEOUT,
        )
        .await?;

        self.wait_greeting(STUB_GREETING_TIMEOUT).await?;
        debug!("stub greeted, switching to stub status format");
        self.status_len = 2;
        self.state = FlashState::StubRunning;
        Ok(())
    }

    /// Erases the entire flash. Stub only.
    pub async fn erase_flash(&mut self) -> Result<(), FlashError> {
        self.expect("StubRunning", |s| matches!(s, FlashState::StubRunning))?;
        info!("erasing flash");
        self.command(Command::EraseFlash, &[], 0, ERASE_TIMEOUT).await?;
        self.state = FlashState::Erased;
        Ok(())
    }

    /// Writes the firmware image in 16 KiB blocks.
    ///
    /// Cancellation is honored only between blocks; an in-flight block
    /// always completes so the device is never left mid-write.
    pub async fn write_image(
        &mut self,
        image: &FirmwareImage,
        progress_tx: &mpsc::Sender<FlashProgress>,
    ) -> Result<(), FlashError> {
        self.expect("Erased", |s| matches!(s, FlashState::Erased))?;
        image.validate()?;

        let total = image.data.len();
        let blocks = image.num_blocks(FLASH_WRITE_SIZE);
        debug!(total, blocks, offset = image.flash_offset, "flash begin");

        self.command(
            Command::FlashBegin,
            &proto::words(
                total as u32,
                blocks as u32,
                FLASH_WRITE_SIZE as u32,
                image.flash_offset,
            ),
            0,
            RESPONSE_TIMEOUT,
        )
        .await?;
        self.state = FlashState::Writing { seq: 0, total: blocks };

        let mut written = 0usize;
        for seq in 0..blocks {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }

            let start = seq * FLASH_WRITE_SIZE;
            let end = (start + FLASH_WRITE_SIZE).min(total);
            let chunk = &image.data[start..end];

            // The final block is padded to the full write size on the wire.
            let mut block = chunk.to_vec();
            block.resize(FLASH_WRITE_SIZE, 0xFF);

            let payload = proto::data_payload(&block, seq as u32);
            self.command(
                Command::FlashData,
                &payload,
                proto::checksum(&block),
                RESPONSE_TIMEOUT,
            )
            .await?;

            written += chunk.len();
            self.state = FlashState::Writing { seq: seq + 1, total: blocks };
            let _ = progress_tx.try_send(FlashProgress { written, total });
        }

        info!(written, blocks, "firmware image written");
        Ok(())
    }

    /// Finalizes the write, optionally rebooting into the new firmware.
    pub async fn finish(&mut self, reboot: bool) -> Result<(), FlashError> {
        self.expect("Writing (all blocks sent)", |s| {
            matches!(s, FlashState::Writing { seq, total } if seq == total)
        })?;
        // 0 reboots, 1 stays in the loader.
        let word = u32::from(!reboot).to_le_bytes();
        self.command(Command::FlashEnd, &word, 0, RESPONSE_TIMEOUT).await?;
        self.state = FlashState::Finished;
        Ok(())
    }

    /// Releases the port. The caller owns the post-reboot settle delay.
    pub async fn disconnect(&mut self) -> Result<(), FlashError> {
        self.port.close().await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Protocol plumbing
    // -----------------------------------------------------------------

    fn expect(
        &self,
        expected: &'static str,
        ok: impl Fn(&FlashState) -> bool,
    ) -> Result<(), FlashError> {
        if ok(&self.state) {
            Ok(())
        } else {
            Err(FlashError::OutOfOrder {
                expected,
                actual: self.state.name(),
            })
        }
    }

    async fn sync(&mut self) -> Result<(), FlashError> {
        let payload = proto::sync_payload();
        for attempt in 1..=SYNC_ATTEMPTS {
            match self.command(Command::Sync, &payload, 0, SYNC_TIMEOUT).await {
                Ok(_) => {
                    debug!(attempt, "loader sync ok");
                    return Ok(());
                }
                Err(FlashError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FlashError::SyncFailed(SYNC_ATTEMPTS))
    }

    async fn read_reg(&mut self, addr: u32) -> Result<u32, FlashError> {
        let resp = self
            .command(Command::ReadReg, &addr.to_le_bytes(), 0, RESPONSE_TIMEOUT)
            .await?;
        Ok(resp.value)
    }

    async fn upload_segment(&mut self, bytes: &[u8], addr: u32) -> Result<(), FlashError> {
        let blocks = bytes.len().div_ceil(RAM_WRITE_SIZE);
        self.command(
            Command::MemBegin,
            &proto::words(bytes.len() as u32, blocks as u32, RAM_WRITE_SIZE as u32, addr),
            0,
            RESPONSE_TIMEOUT,
        )
        .await?;

        for (seq, chunk) in bytes.chunks(RAM_WRITE_SIZE).enumerate() {
            let payload = proto::data_payload(chunk, seq as u32);
            self.command(
                Command::MemData,
                &payload,
                proto::checksum(chunk),
                RESPONSE_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }

    /// Sends one command and waits for its matching response, skipping
    /// stale responses and non-response frames.
    async fn command(
        &mut self,
        cmd: Command,
        payload: &[u8],
        checksum: u32,
        timeout: Duration,
    ) -> Result<Response, FlashError> {
        let frame = slip::encode(&proto::request(cmd, payload, checksum));
        self.port.write(&frame).await?;
        self.wait_response(cmd, timeout).await
    }

    async fn wait_response(
        &mut self,
        cmd: Command,
        timeout: Duration,
    ) -> Result<Response, FlashError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let chunk = match tokio::time::timeout_at(deadline, self.port.read()).await {
                Err(_) => return Err(FlashError::Timeout(cmd)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(chunk)) => chunk,
            };
            for frame in self.decoder.push(&chunk) {
                let Some(resp) = Response::parse(&frame)? else {
                    continue;
                };
                if resp.cmd == cmd as u8 {
                    resp.check_status(cmd, self.status_len)?;
                    return Ok(resp);
                }
                // Response to an earlier command (extra sync echoes); skip.
            }
        }
    }

    async fn wait_greeting(&mut self, timeout: Duration) -> Result<(), FlashError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let chunk = match tokio::time::timeout_at(deadline, self.port.read()).await {
                Err(_) => return Err(FlashError::StubSilent),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(chunk)) => chunk,
            };
            for frame in self.decoder.push(&chunk) {
                if frame == b"OHAI" {
                    return Ok(());
                }
            }
        }
    }
}
