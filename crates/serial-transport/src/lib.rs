//! serial-transport: blocking half-duplex serial port abstractions
//!
//! This crate provides the byte-level port traits used by servo bus drivers, with
//! feature-gated backends. The default build enables a `mock` backend so that binaries and
//! tests run on any host without a USB adapter attached.

mod types;
pub use types::{PortInfo, WireEvent, WireKind};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{PortBackend, SerialBus};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBackend, MockPort, Responder, WireLog};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{NativeBackend, NativePort};
