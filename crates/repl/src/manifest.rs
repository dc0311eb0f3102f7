//! The file manifest: named text files to install on the device.

use serde::{Deserialize, Serialize};

/// One manifest entry: a named text file destined for the device
/// filesystem. Manifest order is significant for progress reporting but
/// not for correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// The stock application manifest shipped with the kit firmware.
///
/// Hosts that author their own file sets supply their own manifest; this
/// is the default the kit's standard missions expect to find installed.
pub fn default_manifest() -> Vec<SourceFile> {
    vec![
        SourceFile::new(
            "ble_advertising.py",
            include_str!("../assets/ble_advertising.py"),
        ),
        SourceFile::new(
            "ble_uart_peripheral.py",
            include_str!("../assets/ble_uart_peripheral.py"),
        ),
        SourceFile::new("initBLE.py", include_str!("../assets/initBLE.py")),
        SourceFile::new("main.py", include_str!("../assets/main.py")),
        SourceFile::new(
            "keyboardhandler.py",
            include_str!("../assets/keyboardhandler.py"),
        ),
        SourceFile::new("boot.py", include_str!("../assets/boot.py")),
    ]
}
