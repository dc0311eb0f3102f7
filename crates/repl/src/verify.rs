//! Post-deployment verification against the device filesystem listing.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kitprov_link::{LinkError, SerialTransport, WatchConfig, read_until};

use crate::{ReplError, SourceFile};

/// Prefix the listing command tags its output with, so the listing can
/// be picked out of prompt echo and stray boot noise.
pub const LISTING_MARKER: &str = "__listing__";

/// Pause between the import and the listing command.
const COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Outcome of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    /// Names of required files the device listing did not contain.
    pub missing: BTreeSet<String>,
}

impl VerificationResult {
    pub fn verified(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks that deployed files actually landed on the device filesystem.
pub struct DeploymentVerifier<'a> {
    transport: &'a SerialTransport,
    cancel: CancellationToken,
}

impl<'a> DeploymentVerifier<'a> {
    pub fn new(transport: &'a SerialTransport, cancel: CancellationToken) -> Self {
        Self { transport, cancel }
    }

    /// Asks the device for a directory listing and reports which of the
    /// `required` files are absent from it.
    ///
    /// Fail-soft: if the listing cannot be obtained at all, every
    /// required file is reported missing and the caller decides how loud
    /// to be about it. Only cancellation is an error.
    pub async fn verify(&self, required: &[SourceFile]) -> Result<VerificationResult, ReplError> {
        if required.is_empty() {
            return Ok(VerificationResult::default());
        }

        let listing = match self.fetch_listing().await {
            Ok(text) => text,
            Err(ReplError::Cancelled) => return Err(ReplError::Cancelled),
            Err(e) => {
                warn!(error = %e, "could not obtain device listing");
                return Ok(all_missing(required));
            }
        };

        // The listing entries come back quoted, but a plain substring
        // check per name subsumes every quoting style the interpreter
        // might use.
        let missing: BTreeSet<String> = required
            .iter()
            .filter(|f| !listing.contains(f.name.as_str()))
            .map(|f| f.name.clone())
            .collect();

        if missing.is_empty() {
            info!(files = required.len(), "verification passed");
        } else {
            warn!(?missing, "verification found missing files");
        }
        Ok(VerificationResult { missing })
    }

    async fn fetch_listing(&self) -> Result<String, ReplError> {
        let writer = self.transport.acquire_writer()?;
        let reader = self.transport.acquire_reader()?;

        writer.write_str("import os\r\n").await?;
        sleep(COMMAND_DELAY).await;
        writer
            .write_str(&format!("print('{LISTING_MARKER}', os.listdir())\r\n"))
            .await?;

        // The command echo itself contains the marker, so waiting for
        // the marker would stop before the listing arrives. The closing
        // bracket of the printed list is the real end-of-listing signal.
        match read_until(&reader, &["]"], WatchConfig::default(), &self.cancel).await {
            Ok(watch) => Ok(watch.text),
            Err(LinkError::Cancelled) => Err(ReplError::Cancelled),
            Err(e) => Err(ReplError::Link(e)),
        }
    }
}

fn all_missing(required: &[SourceFile]) -> VerificationResult {
    VerificationResult {
        missing: required.iter().map(|f| f.name.clone()).collect(),
    }
}
