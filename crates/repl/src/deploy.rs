//! File installation through the interactive prompt.
//!
//! The deployer pastes each manifest file into the device line by line
//! as `f.write(...)` statements. It is strictly fail-soft: a link error
//! mid-deployment stops the run and reports how many files made it, and
//! the caller decides whether that count is good enough.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kitprov_link::{SerialTransport, WriterGuard};

use crate::{CTRL_A, CTRL_B, CTRL_C, ReplError, SourceFile, python_string_literal};

/// Pacing between lines pasted into the prompt. The interpreter needs a
/// beat to execute each statement before the next arrives.
const LINE_DELAY: Duration = Duration::from_millis(20);
/// Pause after the mode-reset sequence before the first file.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Emitted after each file finishes installing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployProgress {
    pub installed: usize,
    pub total: usize,
    pub name: String,
}

/// Writes manifest files onto the device filesystem via the prompt.
pub struct ReplFileDeployer<'a> {
    transport: &'a SerialTransport,
    cancel: CancellationToken,
}

impl<'a> ReplFileDeployer<'a> {
    pub fn new(transport: &'a SerialTransport, cancel: CancellationToken) -> Self {
        Self { transport, cancel }
    }

    /// Installs `files` in manifest order, reporting per-file progress.
    ///
    /// Returns the number of files fully installed. The count is short
    /// of `files.len()` when a link error stopped the run; only
    /// cancellation is returned as an error.
    pub async fn deploy(
        &self,
        files: &[SourceFile],
        progress: Option<&mpsc::Sender<DeployProgress>>,
    ) -> Result<usize, ReplError> {
        if files.is_empty() {
            return Ok(0);
        }

        let writer = match self.transport.acquire_writer() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "cannot deploy, link writer unavailable");
                return Ok(0);
            }
        };

        if let Err(e) = self.enter_prompt(&writer).await {
            warn!(error = %e, "failed to reach the prompt");
            return self.absorb(e, 0);
        }

        let total = files.len();
        let mut installed = 0;
        for file in files {
            if self.cancel.is_cancelled() {
                return Err(ReplError::Cancelled);
            }
            match self.write_file(&writer, file).await {
                Ok(()) => {
                    installed += 1;
                    debug!(name = %file.name, installed, total, "file installed");
                    if let Some(tx) = progress {
                        let _ = tx.try_send(DeployProgress {
                            installed,
                            total,
                            name: file.name.clone(),
                        });
                    }
                }
                Err(ReplError::Cancelled) => return Err(ReplError::Cancelled),
                Err(e) => {
                    warn!(name = %file.name, error = %e, "deployment stopped mid-run");
                    return self.absorb(e, installed);
                }
            }
        }

        info!(installed, total, "all files installed");
        Ok(installed)
    }

    /// Breaks out of any running program and lands on the friendly
    /// prompt, whatever mode the device was left in.
    async fn enter_prompt(&self, writer: &WriterGuard<'_>) -> Result<(), ReplError> {
        writer.write(&[CTRL_C]).await?;
        sleep(LINE_DELAY).await;
        writer.write(&[CTRL_A]).await?;
        sleep(LINE_DELAY).await;
        writer.write(&[CTRL_B]).await?;
        sleep(SETTLE_DELAY).await;
        Ok(())
    }

    /// Pastes one file: open, one `f.write` per line, close.
    async fn write_file(&self, writer: &WriterGuard<'_>, file: &SourceFile) -> Result<(), ReplError> {
        writer
            .write_str(&format!("f = open('{}', 'w')\r\n", file.name))
            .await?;
        sleep(LINE_DELAY).await;

        // `lines()` normalizes CRLF and ignores a trailing newline; each
        // line is re-terminated with `\n` on the device, so the installed
        // file always ends in exactly one newline per line of content.
        for line in file.content.lines() {
            if self.cancel.is_cancelled() {
                return Err(ReplError::Cancelled);
            }
            let literal = python_string_literal(&format!("{line}\n"));
            writer.write_str(&format!("f.write({literal})\r\n")).await?;
            sleep(LINE_DELAY).await;
        }

        writer.write_str("f.close()\r\n").await?;
        sleep(LINE_DELAY).await;
        Ok(())
    }

    fn absorb(&self, e: ReplError, installed: usize) -> Result<usize, ReplError> {
        match e {
            ReplError::Cancelled => Err(ReplError::Cancelled),
            _ => Ok(installed),
        }
    }
}
