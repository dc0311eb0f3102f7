//! Text-mode (REPL) side of the provisioning pipeline.
//!
//! Once a MicroPython prompt is reachable, whether the probe found it or
//! a fresh flash produced it, these components do everything else:
//! write the application files, verify the device filesystem, and reset
//! the board into normal operation.

mod deploy;
mod manifest;
mod probe;
mod quote;
mod reset;
mod verify;

pub use deploy::{DeployProgress, ReplFileDeployer};
pub use manifest::{SourceFile, default_manifest};
pub use probe::{ProbeResult, ReplProbe};
pub use quote::python_string_literal;
pub use reset::soft_reset;
pub use verify::{DeploymentVerifier, LISTING_MARKER, VerificationResult};

use kitprov_link::LinkError;

/// Ctrl-C: interrupt a running program.
pub const CTRL_C: u8 = 0x03;
/// Ctrl-A: enter raw REPL mode.
pub const CTRL_A: u8 = 0x01;
/// Ctrl-B: leave raw mode for the friendly interactive prompt.
pub const CTRL_B: u8 = 0x02;
/// Ctrl-D: soft-reset the interpreter from the interactive prompt.
pub const CTRL_D: u8 = 0x04;

/// The interactive prompt marker.
pub const PROMPT: &str = ">>>";
/// Start of the runtime's boot banner.
pub const BANNER: &str = "MicroPython";
/// Sentinel the probe asks the device to print.
pub const SENTINEL: &str = "micropython_check";

/// Errors produced by the REPL components.
///
/// Link failures here are absorbed by the fail-open/fail-soft policies
/// of the individual components; only cancellation must always escape.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("cancelled")]
    Cancelled,
}
