use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

pub type DeviceId = u8;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Bounded 0..=4095 position servo.
    Joint,
    /// Continuous-rotation servo driven by signed speed.
    Wheel,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommState {
    #[default]
    Idle,
    Pending,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct CommStatus {
    pub state: CommState,
    pub last_error: Option<String>,
}

impl CommStatus {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: CommState::Error,
            last_error: Some(message.into()),
        }
    }
}

/// Presentation copy of one registry entry.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub role: Role,
    pub state: CommState,
    pub last_error: Option<String>,
    pub current_position: i32,
    pub last_safe_position: i32,
}

/// Status of every configured device, published after each completed operation.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StatusSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub devices: BTreeMap<DeviceId, DeviceSnapshot>,
}

impl StatusSnapshot {
    pub fn get(&self, id: DeviceId) -> Option<&DeviceSnapshot> {
        self.devices.get(&id)
    }
}

/// A user-facing notification about a servo or the connection.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Alert {
    /// `None` for connection-wide alerts.
    pub device: Option<DeviceId>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl Alert {
    pub fn new(device: Option<DeviceId>, message: impl Into<String>) -> Self {
        Self {
            device,
            message: message.into(),
            at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    RequestingPort,
    PortOpen,
    InitializingDevices,
    Connected,
    DrainingWheels,
    TorqueDisabling,
    PortClosing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_json_shape() {
        let mut devices = BTreeMap::new();
        devices.insert(
            3,
            DeviceSnapshot {
                role: Role::Wheel,
                state: CommState::Warning,
                last_error: Some("Overheat".into()),
                current_position: -120,
                last_safe_position: -120,
            },
        );
        let snap = StatusSnapshot {
            at: OffsetDateTime::UNIX_EPOCH,
            devices,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["at"], "1970-01-01T00:00:00Z");
        assert_eq!(json["devices"]["3"]["role"], "wheel");
        assert_eq!(json["devices"]["3"]["state"], "warning");
        assert_eq!(json["devices"]["3"]["last_error"], "Overheat");
    }

    #[test]
    fn test_comm_status_error_helper() {
        let status = CommStatus::error("Failed to read initial position");
        assert_eq!(status.state, CommState::Error);
        assert_eq!(status.last_error.as_deref(), Some("Failed to read initial position"));
        assert_eq!(CommStatus::default().state, CommState::Idle);
    }
}
