use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no serial port available: {0}")]
    PortNotFound(String),
    #[error("port is not open")]
    NotOpen,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout: got {got} of {wanted} bytes")]
    Timeout { got: usize, wanted: usize },
}
