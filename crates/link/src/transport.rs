//! Transport wrapper enforcing the lock discipline.
//!
//! The pipeline allows at most one live reader and one live writer on the
//! physical port at any time. Acquisition is scoped: guards release their
//! side on drop, so every exit path leaves the link unlocked, errors and
//! cancellation included.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::port::SerialPort;
use crate::LinkError;

/// Owns the single physical serial connection for a provisioning run.
///
/// Single source of truth for open/closed state and for exclusive
/// read/write lock acquisition. All text-mode I/O in the pipeline funnels
/// through this type; only the bootloader flasher bypasses it, and only
/// after the transport has been fully closed.
pub struct SerialTransport {
    port: Arc<dyn SerialPort>,
    reader_locked: AtomicBool,
    writer_locked: AtomicBool,
}

impl SerialTransport {
    /// Wraps a host-supplied port.
    pub fn new(port: Arc<dyn SerialPort>) -> Self {
        Self {
            port,
            reader_locked: AtomicBool::new(false),
            writer_locked: AtomicBool::new(false),
        }
    }

    /// Returns the underlying port, for components that need raw
    /// exclusive control (the bootloader flasher). The transport must be
    /// closed and unlocked before the port is used that way.
    pub fn port(&self) -> Arc<dyn SerialPort> {
        Arc::clone(&self.port)
    }

    /// Opens the port. No-op if already open.
    pub async fn open(&self, baud: u32) -> Result<(), LinkError> {
        if self.port.is_open() {
            return Ok(());
        }
        debug!(baud, "opening serial port");
        self.port.open(baud).await
    }

    /// Closes the port. No-op if already closed. Safe to call while a
    /// read is pending: the port contract cancels the read first.
    pub async fn close(&self) -> Result<(), LinkError> {
        if !self.port.is_open() {
            return Ok(());
        }
        debug!("closing serial port");
        self.port.close().await
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.port.is_open()
    }

    /// Whether the read side is currently locked.
    pub fn reader_locked(&self) -> bool {
        self.reader_locked.load(Ordering::Acquire)
    }

    /// Whether the write side is currently locked.
    pub fn writer_locked(&self) -> bool {
        self.writer_locked.load(Ordering::Acquire)
    }

    /// Acquires the exclusive read handle.
    ///
    /// Fails with [`LinkError::Busy`] if the read side is already held.
    pub fn acquire_reader(&self) -> Result<ReaderGuard<'_>, LinkError> {
        if self.reader_locked.swap(true, Ordering::AcqRel) {
            return Err(LinkError::Busy("read"));
        }
        Ok(ReaderGuard { transport: self })
    }

    /// Acquires the exclusive write handle.
    ///
    /// Fails with [`LinkError::Busy`] if the write side is already held.
    pub fn acquire_writer(&self) -> Result<WriterGuard<'_>, LinkError> {
        if self.writer_locked.swap(true, Ordering::AcqRel) {
            return Err(LinkError::Busy("write"));
        }
        Ok(WriterGuard { transport: self })
    }
}

/// Exclusive read handle. Releases the read side on drop.
pub struct ReaderGuard<'a> {
    transport: &'a SerialTransport,
}

impl ReaderGuard<'_> {
    /// Reads the next available chunk from the port.
    pub async fn read(&self) -> Result<Vec<u8>, LinkError> {
        self.transport.port.read().await
    }

    /// Releases the handle. Equivalent to dropping it; provided so call
    /// sites can make the release point explicit.
    pub fn release(self) {}
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.transport.reader_locked.store(false, Ordering::Release);
    }
}

/// Exclusive write handle. Releases the write side on drop.
pub struct WriterGuard<'a> {
    transport: &'a SerialTransport,
}

impl WriterGuard<'_> {
    /// Writes all of `data` to the port.
    pub async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        self.transport.port.write(data).await
    }

    /// Writes a string as raw bytes.
    pub async fn write_str(&self, data: &str) -> Result<(), LinkError> {
        self.write(data.as_bytes()).await
    }

    /// Releases the handle. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.transport.writer_locked.store(false, Ordering::Release);
    }
}
