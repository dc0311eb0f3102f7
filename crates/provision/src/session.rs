//! Run-scoped session state and the outward-facing event types.

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Pipeline phase. `Flashing` and the retry pair are conditional;
/// `Cancelled` can follow any non-terminal phase; `Failed` only follows
/// `Init` or `Flashing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Probing,
    Flashing,
    Deploying,
    Verifying,
    RetryDeploying,
    ReVerifying,
    Resetting,
    Done,
    Cancelled,
    Failed,
}

/// Events streamed to the host while a run is in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionEvent {
    Phase { phase: Phase },
    Progress { percent: f32, message: String },
    Completed { report: ProvisionReport },
    Cancelled,
    Failed { error: String },
}

/// Final report of a completed (non-cancelled, non-fatal) run.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub success: bool,
    pub message: String,
    pub files_installed: usize,
}

/// How a run ended, cancellation distinguished at the type level so no
/// caller can mistake an aborted run for a finished one.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    Completed(ProvisionReport),
    Cancelled,
}

/// Private per-run state. Owns the monotonic progress clamp: percent
/// only ever moves forward within a run, whatever order component
/// progress callbacks land in.
pub(crate) struct ProvisionSession {
    pub(crate) id: Uuid,
    pub(crate) phase: Phase,
    percent: f32,
    pub(crate) files_installed: usize,
}

impl ProvisionSession {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: Phase::Init,
            percent: 0.0,
            files_installed: 0,
        }
    }

    /// Advances the clamp and returns the percent to report.
    pub(crate) fn advance(&mut self, percent: f32) -> f32 {
        if percent > self.percent {
            self.percent = percent.min(100.0);
        } else {
            debug!(
                session = %self.id,
                requested = percent,
                held = self.percent,
                "progress clamp held"
            );
        }
        self.percent
    }

    pub(crate) fn percent(&self) -> f32 {
        self.percent
    }
}
