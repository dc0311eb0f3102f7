//! Firmware and stub image types.

use sha2::{Digest, Sha256};

use crate::{DEFAULT_FLASH_OFFSET, FlashError};

/// An immutable firmware binary plus its target flash address.
///
/// Created once per pipeline run from the firmware source and consumed
/// only by the flasher.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// Raw firmware bytes.
    pub data: Vec<u8>,
    /// Flash address the image is written at.
    pub flash_offset: u32,
    /// Size the firmware source declared for the blob.
    pub declared_size: usize,
    /// Optional hex SHA-256 digest declared by the firmware source.
    pub sha256: Option<String>,
}

impl FirmwareImage {
    /// Wraps raw bytes at the standard ESP32 application offset.
    pub fn new(data: Vec<u8>) -> Self {
        let declared_size = data.len();
        Self {
            data,
            flash_offset: DEFAULT_FLASH_OFFSET,
            declared_size,
            sha256: None,
        }
    }

    /// Hex SHA-256 digest of the image bytes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hex::encode(hasher.finalize())
    }

    /// Rejects an image whose bytes do not match its declared metadata.
    /// Run before any destructive flash step.
    pub fn validate(&self) -> Result<(), FlashError> {
        if self.data.is_empty() {
            return Err(FlashError::BadImage("image is empty".into()));
        }
        if self.data.len() != self.declared_size {
            return Err(FlashError::BadImage(format!(
                "blob is {} bytes but source declared {}",
                self.data.len(),
                self.declared_size
            )));
        }
        if let Some(expected) = &self.sha256 {
            let actual = self.digest();
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FlashError::BadImage(format!(
                    "digest mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        Ok(())
    }

    /// Number of fixed-size blocks needed to write the image.
    pub fn num_blocks(&self, block_size: usize) -> usize {
        self.data.len().div_ceil(block_size)
    }
}

/// The loader stub: a small accelerator program uploaded into RAM via
/// the ROM protocol and executed before erase/write operations.
///
/// Supplied as data by the host alongside the firmware binary.
#[derive(Debug, Clone)]
pub struct StubImage {
    /// Entry point address.
    pub entry: u32,
    /// Executable segment.
    pub text: Vec<u8>,
    /// Load address of the executable segment.
    pub text_start: u32,
    /// Data segment.
    pub data: Vec<u8>,
    /// Load address of the data segment.
    pub data_start: u32,
}
