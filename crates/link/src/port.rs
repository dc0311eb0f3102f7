//! Host-environment serial port contract.

use std::future::Future;
use std::pin::Pin;

use crate::LinkError;

/// Boxed future returned by [`SerialPort`] methods.
pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// Abstract serial port supplied by the host environment.
///
/// The host (desktop app, bridge service, test harness) implements this
/// trait on top of whatever serial stack it has. Using a trait keeps the
/// pipeline decoupled from the concrete port and testable with scripted
/// device simulators.
pub trait SerialPort: Send + Sync {
    /// Opens the port at the given baud rate. Opening an already-open
    /// port is an error at this level; [`SerialTransport::open`] makes it
    /// a no-op.
    ///
    /// [`SerialTransport::open`]: crate::SerialTransport::open
    fn open(&self, baud: u32) -> PortFuture<'_, ()>;

    /// Closes the port. Implementations must cancel any pending read
    /// before closing so a mid-flight `read` resolves instead of hanging.
    fn close(&self) -> PortFuture<'_, ()>;

    /// Writes all of `data` to the port.
    fn write(&self, data: &[u8]) -> PortFuture<'_, ()>;

    /// Resolves with the next available chunk of bytes, however many the
    /// device produced. Resolves with [`LinkError::Closed`] if the port
    /// closes while the read is pending.
    fn read(&self) -> PortFuture<'_, Vec<u8>>;

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;
}
