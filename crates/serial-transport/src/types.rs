use core::fmt;
use std::time::Instant;

/// A serial port as reported by a backend's enumeration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
        }
    }

    /// USB serial adapters are what servo controller boards enumerate as.
    pub fn is_usb(&self) -> bool {
        self.driver.starts_with("usb")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireKind {
    Tx,
    Rx,
}

/// One chunk of bytes observed on the wire, stamped with a monotonic instant.
#[derive(Clone, Debug)]
pub struct WireEvent {
    pub kind: WireKind,
    pub bytes: Vec<u8>,
    pub at: Instant,
}

impl fmt::Display for WireEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.kind {
            WireKind::Tx => "tx",
            WireKind::Rx => "rx",
        };
        write!(f, "{dir}")?;
        for b in &self.bytes {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}
