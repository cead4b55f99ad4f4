//! Maps a transport result and a servo error byte to one severity-tagged outcome.

use crate::protocol::{errbits, CommResult};
use crate::registry::DeviceRegistry;
use crate::types::DeviceId;
use core::fmt;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

/// The dominant hardware fault of an error byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultCause {
    Overload,
    Overheat,
    Voltage,
    Angle,
    Overcurrent,
    /// Nonzero byte with none of the recognized flags.
    Unknown(u8),
}

impl FaultCause {
    /// First flag hit in priority order: overload, overheat, voltage, angle, overcurrent.
    pub fn from_bits(bits: u8) -> Option<Self> {
        const PRIORITY: [(u8, FaultCause); 5] = [
            (errbits::OVERLOAD, FaultCause::Overload),
            (errbits::OVERHEAT, FaultCause::Overheat),
            (errbits::VOLTAGE, FaultCause::Voltage),
            (errbits::ANGLE, FaultCause::Angle),
            (errbits::OVERCURRENT, FaultCause::Overcurrent),
        ];
        if bits == 0 {
            return None;
        }
        PRIORITY
            .iter()
            .find(|(flag, _)| bits & flag != 0)
            .map(|(_, cause)| *cause)
            .or(Some(FaultCause::Unknown(bits)))
    }

    /// Faults worth interrupting the operator for even when only a warning.
    pub fn is_severe(self) -> bool {
        matches!(
            self,
            FaultCause::Overload | FaultCause::Overheat | FaultCause::Voltage
        )
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::Overload => write!(f, "Overload or stuck"),
            FaultCause::Overheat => write!(f, "Overheat"),
            FaultCause::Voltage => write!(f, "Voltage error"),
            FaultCause::Angle => write!(f, "Angle sensor error"),
            FaultCause::Overcurrent => write!(f, "Overcurrent"),
            FaultCause::Unknown(bits) => write!(f, "Unknown error code: {bits}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Outcome {
    pub severity: Severity,
    pub result: CommResult,
    pub error_bits: u8,
    pub cause: Option<FaultCause>,
    /// `None` exactly when the outcome is a success.
    pub message: Option<String>,
    /// Whether the operator should see this immediately.
    pub alert: bool,
}

impl Outcome {
    pub fn is_comm_failure(&self) -> bool {
        !self.result.is_success()
    }

    /// Success and warnings both mean the transfer completed.
    pub fn completed(&self) -> bool {
        self.severity != Severity::Error
    }
}

/// Classify without side effects.
///
/// `warn_on_fault` downgrades a hardware fault to a warning; it never affects a
/// communication failure.
pub fn classify(result: CommResult, error: u8, operation: &str, warn_on_fault: bool) -> Outcome {
    let cause = FaultCause::from_bits(error);
    if result.is_success() && cause.is_none() {
        return Outcome {
            severity: Severity::Success,
            result,
            error_bits: error,
            cause: None,
            message: None,
            alert: false,
        };
    }

    let severity = if result.is_success() && warn_on_fault {
        Severity::Warning
    } else {
        Severity::Error
    };

    let message = match (severity, cause) {
        (Severity::Warning, Some(cause)) => cause.to_string(),
        _ => {
            let prefix = if result.is_success() {
                ""
            } else {
                "Communication failed: "
            };
            match cause {
                Some(FaultCause::Unknown(bits)) => {
                    format!("{prefix}{operation} failed: {bits} (code: {result})")
                }
                Some(cause) => format!("{prefix}{cause} (code: {result})"),
                None => format!("{prefix}{operation} failed: {error} (code: {result})"),
            }
        }
    };

    let alert = match severity {
        Severity::Error => true,
        Severity::Warning => cause.is_some_and(FaultCause::is_severe),
        Severity::Success => false,
    };

    Outcome {
        severity,
        result,
        error_bits: error,
        cause,
        message: Some(message),
        alert,
    }
}

/// Classify, log, and record the outcome on the device's registry entry.
pub fn classify_and_record(
    registry: &mut DeviceRegistry,
    id: DeviceId,
    result: CommResult,
    error: u8,
    operation: &str,
    warn_on_fault: bool,
) -> Outcome {
    let outcome = classify(result, error, operation, warn_on_fault);
    match outcome.severity {
        Severity::Success => {}
        Severity::Warning => tracing::warn!(
            servo = id,
            op = operation,
            error_bits = error,
            "servo returned hardware warning: {}",
            outcome.message.as_deref().unwrap_or_default()
        ),
        Severity::Error => tracing::error!(
            servo = id,
            op = operation,
            error_bits = error,
            code = result.code(),
            "servo operation failed: {}",
            outcome.message.as_deref().unwrap_or_default()
        ),
    }
    registry.set_result(id, &outcome);
    outcome
}
