use crate::{PortInfo, Result};

/// A minimal blocking half-duplex serial port.
///
/// Only one request/response exchange may be outstanding at a time; callers are expected
/// to serialize access themselves.
pub trait SerialBus: Send {
    /// Human-readable port name (e.g. "/dev/ttyACM0").
    fn name(&self) -> &str;

    /// Write every byte or fail.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fill `buf` completely, waiting at most `timeout_ms` overall.
    fn read_exact(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<()>;

    /// Drop any stale bytes sitting in the receive buffer.
    fn clear_input(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the port. Later reads and writes fail with `NotOpen`.
    fn close(&mut self) -> Result<()>;
}

/// Enumerates and opens ports for one backend.
pub trait PortBackend: Send + Sync {
    /// Attempt to list available ports for this backend.
    fn list(&self) -> Result<Vec<PortInfo>>;

    /// Open a port by name at the given baud rate.
    fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn SerialBus>>;
}
