//! External collaborator traits.
//!
//! The orchestrator does not know where firmware binaries or application
//! manifests come from. Hosts supply implementations of these traits
//! (bundled assets, a download cache, a test fixture) and the pipeline
//! fetches through them once per run.

use std::future::Future;
use std::pin::Pin;

use kitprov_esprom::{FirmwareImage, StubImage};
use kitprov_repl::SourceFile;

/// Boxed future type for the object-safe source traits.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid payload from source: {0}")]
    Invalid(String),
}

/// Everything needed for one flashing pass: the firmware binary and the
/// loader stub that accelerates erase/write.
#[derive(Debug, Clone)]
pub struct FirmwareBundle {
    pub image: FirmwareImage,
    pub stub: StubImage,
}

/// Provides firmware bundles by id.
pub trait FirmwareSource: Send + Sync {
    fn fetch<'a>(&'a self, firmware_id: &'a str) -> SourceFuture<'a, FirmwareBundle>;
}

/// Provides the application file manifest to install.
pub trait ManifestSource: Send + Sync {
    fn fetch(&self) -> SourceFuture<'_, Vec<SourceFile>>;
}
