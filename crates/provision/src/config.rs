//! Pipeline tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator configuration. The defaults match the kit hardware; the
/// progress windows exist mainly so tests can pin them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Serial baud rate for both the runtime and the ROM loader.
    pub baud: u32,
    /// Overall-percent window the firmware write maps into.
    pub flash_window: (f32, f32),
    /// Overall-percent window per-file deployment maps into.
    pub deploy_window: (f32, f32),
    /// Wait after flashing for the device to reboot into the runtime.
    pub post_flash_settle: Duration,
    /// Wait before deploying for the prompt to become responsive.
    pub repl_ready_delay: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            flash_window: (35.0, 40.0),
            deploy_window: (42.0, 97.0),
            post_flash_settle: Duration::from_secs(2),
            repl_ready_delay: Duration::from_secs(1),
        }
    }
}
