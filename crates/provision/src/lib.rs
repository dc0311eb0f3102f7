//! End-to-end device provisioning.
//!
//! The [`ProvisioningOrchestrator`] takes a freshly unboxed (or
//! arbitrarily messed-up) kit board from "unknown state" to "running the
//! standard application": detect whether a MicroPython runtime is
//! present, flash firmware through the ROM loader if not, install the
//! application files through the prompt, verify they landed, and reset
//! the board into normal operation. Hosts drive it through a progress
//! event channel and a cancellation token.

mod config;
mod error;
mod orchestrator;
mod session;
mod sources;

pub use config::ProvisionConfig;
pub use error::ProvisionError;
pub use orchestrator::ProvisioningOrchestrator;
pub use session::{Phase, ProvisionEvent, ProvisionOutcome, ProvisionReport};
pub use sources::{FirmwareBundle, FirmwareSource, ManifestSource, SourceError, SourceFuture};
