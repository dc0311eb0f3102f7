//! Chip variant detection.

/// Register whose value identifies the chip family.
pub const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

/// Supported chip variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipKind {
    Esp32,
    Esp32S3,
    Esp32C3,
}

impl ChipKind {
    /// Maps a detect-register magic value to a chip variant.
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            0x00F0_1D83 => Some(Self::Esp32),
            0x0000_0009 => Some(Self::Esp32S3),
            // The C3 has several ROM revisions with distinct magics.
            0x6921_506F | 0x1B31_506F | 0x4881_606F | 0x4361_606F => Some(Self::Esp32C3),
            _ => None,
        }
    }

    /// Human-readable chip name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Esp32 => "ESP32",
            Self::Esp32S3 => "ESP32-S3",
            Self::Esp32C3 => "ESP32-C3",
        }
    }
}

impl std::fmt::Display for ChipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esp32_magic() {
        assert_eq!(ChipKind::from_magic(0x00F0_1D83), Some(ChipKind::Esp32));
    }

    #[test]
    fn c3_rom_revisions_all_map() {
        for magic in [0x6921_506F, 0x1B31_506F, 0x4881_606F, 0x4361_606F] {
            assert_eq!(ChipKind::from_magic(magic), Some(ChipKind::Esp32C3));
        }
    }

    #[test]
    fn unknown_magic_is_none() {
        assert_eq!(ChipKind::from_magic(0xDEAD_BEEF), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(ChipKind::Esp32.to_string(), "ESP32");
        assert_eq!(ChipKind::Esp32S3.to_string(), "ESP32-S3");
    }
}
