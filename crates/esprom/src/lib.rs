//! ESP ROM bootloader protocol.
//!
//! Drives the microcontroller's built-in serial loader when no runtime is
//! present on the device: sync, chip detection, stub upload, flash erase,
//! and chunked firmware writes. Used by exactly one caller, the
//! provisioning orchestrator, and only after the text-mode transport has
//! been fully closed, because this protocol needs raw control of the link.

mod chip;
mod flasher;
mod image;
pub mod proto;
pub mod slip;

pub use chip::{CHIP_DETECT_MAGIC_REG, ChipKind};
pub use flasher::{FlashProgress, FlashState, RomFlasher};
pub use image::{FirmwareImage, StubImage};

use kitprov_link::LinkError;

/// Flash write block size (16 KiB), matching the loader's
/// `FLASH_WRITE_SIZE`.
pub const FLASH_WRITE_SIZE: usize = 0x4000;

/// RAM upload block size used for stub segments.
pub const RAM_WRITE_SIZE: usize = 0x1800;

/// Standard application flash offset for ESP32 firmware images.
pub const DEFAULT_FLASH_OFFSET: u32 = 0x1000;

/// Baud rate the ROM loader listens at after reset.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Errors produced by the bootloader protocol.
///
/// Every variant is fatal to the provisioning run: flashing is
/// destructive and must not proceed on uncertain footing.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("no response to sync after {0} attempts")]
    SyncFailed(usize),

    #[error("timed out waiting for response to {0:?}")]
    Timeout(proto::Command),

    #[error("malformed response frame: {0}")]
    Malformed(String),

    #[error("command {cmd:?} failed with status {code:#04x}")]
    Status { cmd: proto::Command, code: u8 },

    #[error("unsupported chip (detect magic {0:#010x})")]
    UnsupportedChip(u32),

    #[error("flash step out of order: expected {expected}, state is {actual}")]
    OutOfOrder {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("firmware image rejected: {0}")]
    BadImage(String),

    #[error("stub did not greet after launch")]
    StubSilent,

    #[error("cancelled")]
    Cancelled,
}
