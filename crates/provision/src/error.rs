//! Fatal provisioning errors.
//!
//! Only two conditions abort a run: the serial link cannot be opened at
//! all, and a firmware flashing failure (a half-flashed device has no
//! runtime to fall back to). Everything else is policy: probe ambiguity
//! fails open into flashing, verification gaps fail soft into the final
//! report, and reset failures are logged and forgotten.

use kitprov_esprom::FlashError;

use crate::sources::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("serial link unavailable: {0}")]
    TransportUnavailable(String),

    #[error("firmware flashing failed: {0}")]
    Flash(#[from] FlashError),

    #[error("collaborator source failed: {0}")]
    Source(#[from] SourceError),
}
