use crate::classify::{FaultCause, Outcome};
use crate::protocol::CommResult;
use crate::types::{ConnectionState, DeviceId, Role};
use serial_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = ServoError> = core::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServoError {
    #[error("not connected to the servo bus")]
    NotConnected,
    #[error("unknown servo id {0}")]
    UnknownDevice(DeviceId),
    #[error("servo {id} is configured as {actual:?}, operation needs {expected:?}")]
    WrongRole {
        id: DeviceId,
        expected: Role,
        actual: Role,
    },
    #[error("servo {id}: {message}")]
    Communication {
        id: DeviceId,
        result: CommResult,
        message: String,
    },
    #[error("servo {id}: {message}")]
    Fault {
        id: DeviceId,
        cause: FaultCause,
        message: String,
    },
    #[error("servo {0}: wheel mode switch failed")]
    WheelMode(DeviceId),
    #[error("operation discarded before it ran")]
    Discarded,
    #[error("operation panicked: {0}")]
    Panicked(String),
    #[error("not allowed while {0:?}")]
    InvalidState(ConnectionState),
    #[error("invalid bus config: {0}")]
    Config(String),
    #[error("metrics init error: {0}")]
    Metrics(String),
    #[error("port error: {0}")]
    Port(#[from] TransportError),
}

impl ServoError {
    /// Error for an outcome that did not complete. Completed outcomes have no error.
    pub fn from_outcome(id: DeviceId, outcome: &Outcome) -> Option<Self> {
        if outcome.completed() {
            return None;
        }
        let message = outcome.message.clone().unwrap_or_default();
        Some(match outcome.cause {
            Some(cause) if !outcome.is_comm_failure() => ServoError::Fault { id, cause, message },
            _ => ServoError::Communication {
                id,
                result: outcome.result,
                message,
            },
        })
    }
}
