//! Marker-bounded polling reads.
//!
//! The probe and the verifier both need the same thing: send a command,
//! then collect whatever the device prints until a known marker shows up
//! or the device goes quiet. This is that one shared primitive: a
//! polling read where each poll races the pending read against a short
//! timer, bounded by an overall deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::transport::ReaderGuard;
use crate::LinkError;

/// Timing parameters for [`read_until`].
#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Per-poll read timeout. A poll that times out just loops.
    pub poll: Duration,
    /// Overall deadline. Expiry is a normal outcome, not an error.
    pub deadline: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(200),
            deadline: Duration::from_secs(3),
        }
    }
}

/// Outcome of a marker-bounded read.
#[derive(Debug, Clone)]
pub struct Watch {
    /// Everything the device printed, decoded lossily as UTF-8.
    pub text: String,
    /// Index into the marker slice of the marker that matched, if any.
    pub matched: Option<usize>,
}

impl Watch {
    /// Whether any marker was seen before the deadline.
    pub fn found(&self) -> bool {
        self.matched.is_some()
    }
}

/// Reads from `reader` until one of `markers` appears in the accumulated
/// text or the deadline expires.
///
/// A non-responsive device degrades to an empty-handed [`Watch`] rather
/// than hanging the caller. Cancellation is checked before every poll and
/// surfaces as [`LinkError::Cancelled`]; transport errors propagate.
pub async fn read_until(
    reader: &ReaderGuard<'_>,
    markers: &[&str],
    cfg: WatchConfig,
    cancel: &CancellationToken,
) -> Result<Watch, LinkError> {
    let start = Instant::now();
    let mut text = String::new();

    loop {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        if start.elapsed() >= cfg.deadline {
            trace!(len = text.len(), "watch deadline expired");
            return Ok(Watch {
                text,
                matched: None,
            });
        }

        match tokio::time::timeout(cfg.poll, reader.read()).await {
            // Poll timer won the race; try again until the deadline.
            Err(_) => continue,
            Ok(Err(e)) => return Err(e),
            Ok(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                text.push_str(&String::from_utf8_lossy(&chunk));
                if let Some(i) = markers.iter().position(|m| text.contains(m)) {
                    trace!(marker = markers[i], "watch matched");
                    return Ok(Watch {
                        text,
                        matched: Some(i),
                    });
                }
            }
        }
    }
}
