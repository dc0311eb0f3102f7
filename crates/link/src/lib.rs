//! Serial link layer for the provisioning pipeline.
//!
//! Every byte the pipeline exchanges with the device goes through this
//! crate: the [`SerialPort`] contract supplied by the host environment,
//! the [`SerialTransport`] wrapper enforcing the one-reader/one-writer
//! lock discipline, and the marker-bounded [`read_until`] primitive used
//! wherever the pipeline waits for the device to say something.

mod port;
mod transport;
mod watch;

pub use port::{PortFuture, SerialPort};
pub use transport::{ReaderGuard, SerialTransport, WriterGuard};
pub use watch::{Watch, WatchConfig, read_until};

/// Errors produced by the serial link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("serial I/O error: {0}")]
    Io(String),

    #[error("port is closed")]
    Closed,

    #[error("{0} side of the link is already locked")]
    Busy(&'static str),

    #[error("cancelled")]
    Cancelled,
}
