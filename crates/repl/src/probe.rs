//! Runtime detection over the interactive prompt.
//!
//! The probe breaks out of any running program, recovers to the
//! interactive prompt, and asks the device to print a sentinel. Anything
//! short of conclusive evidence of a runtime (silence, garbage, a
//! transport error, a busy link) resolves to "needs flashing": a blank or
//! wedged device must not be mistaken for a provisioned one.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kitprov_link::{
    LinkError, ReaderGuard, SerialTransport, Watch, WatchConfig, WriterGuard, read_until,
};

use crate::{BANNER, CTRL_B, CTRL_C, PROMPT, ReplError, SENTINEL};

/// Gap between probe control sequences.
const STEP_DELAY: Duration = Duration::from_millis(100);

/// What the probe concluded, plus the raw transcript for diagnostics.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub runtime_present: bool,
    pub transcript: String,
}

/// Determines whether a MicroPython runtime is already on the device.
pub struct ReplProbe<'a> {
    transport: &'a SerialTransport,
    cancel: CancellationToken,
}

impl<'a> ReplProbe<'a> {
    pub fn new(transport: &'a SerialTransport, cancel: CancellationToken) -> Self {
        Self { transport, cancel }
    }

    /// Runs the probe. Only cancellation escapes as an error; every
    /// link-level failure resolves to "runtime absent".
    pub async fn probe(&self) -> Result<ProbeResult, ReplError> {
        if self.transport.reader_locked() || self.transport.writer_locked() {
            debug!("link is busy; assuming no runtime");
            return Ok(absent(String::new()));
        }

        let writer = match self.transport.acquire_writer() {
            Ok(w) => w,
            Err(e) => return Ok(fail_open(e)),
        };
        let reader = match self.transport.acquire_reader() {
            Ok(r) => r,
            Err(e) => return Ok(fail_open(e)),
        };

        // Guards drop at the end of this scope, releasing both sides on
        // every outcome.
        match self.exchange(&writer, &reader).await {
            Ok(watch) => {
                let present = watch.found();
                if present {
                    info!("runtime detected");
                } else {
                    info!("no runtime response within deadline");
                }
                Ok(ProbeResult {
                    runtime_present: present,
                    transcript: watch.text,
                })
            }
            Err(ReplError::Cancelled) => Err(ReplError::Cancelled),
            Err(ReplError::Link(e)) => Ok(fail_open(e)),
        }
    }

    async fn exchange(
        &self,
        writer: &WriterGuard<'_>,
        reader: &ReaderGuard<'_>,
    ) -> Result<Watch, ReplError> {
        // Twice Ctrl-C to break out of any running program, Ctrl-B in
        // case the device is stuck in raw mode, then ask for proof.
        writer.write(&[CTRL_C]).await?;
        sleep(STEP_DELAY).await;
        writer.write(&[CTRL_C]).await?;
        sleep(STEP_DELAY).await;
        writer.write(&[CTRL_B]).await?;
        sleep(STEP_DELAY).await;
        writer.write_str("\r\n").await?;
        sleep(STEP_DELAY).await;
        writer
            .write_str(&format!("print(\"{SENTINEL}\")\r\n"))
            .await?;

        match read_until(
            reader,
            &[SENTINEL, PROMPT, BANNER],
            WatchConfig::default(),
            &self.cancel,
        )
        .await
        {
            Ok(watch) => Ok(watch),
            Err(LinkError::Cancelled) => Err(ReplError::Cancelled),
            Err(e) => Err(ReplError::Link(e)),
        }
    }
}

fn absent(transcript: String) -> ProbeResult {
    ProbeResult {
        runtime_present: false,
        transcript,
    }
}

fn fail_open(e: LinkError) -> ProbeResult {
    debug!(error = %e, "probe failed; assuming no runtime");
    absent(String::new())
}
