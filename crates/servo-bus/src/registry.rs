//! Authoritative per-device state.
//!
//! The registry does no locking of its own: it lives inside the bus context, which only the
//! command queue's executing operation can reach.

use crate::classify::{Outcome, Severity};
use crate::types::{CommState, CommStatus, DeviceId, DeviceSnapshot, Role, StatusSnapshot};
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceEntry {
    pub role: Role,
    pub status: CommStatus,
    /// Position ticks for joints, signed speed for wheels.
    pub current_position: i32,
    /// Last value confirmed written or read successfully.
    pub last_safe_position: i32,
}

impl DeviceEntry {
    fn new(role: Role) -> Self {
        Self {
            role,
            status: CommStatus::default(),
            current_position: 0,
            last_safe_position: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = (DeviceId, Role)>) -> Self {
        let mut reg = Self::default();
        for (id, role) in devices {
            reg.insert(id, role);
        }
        reg
    }

    pub fn insert(&mut self, id: DeviceId, role: Role) {
        self.devices.insert(id, DeviceEntry::new(role));
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn ids_with_role(&self, role: Role) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, e)| e.role == role)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn role(&self, id: DeviceId) -> Option<Role> {
        self.devices.get(&id).map(|e| e.role)
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(&id)
    }

    pub fn set_pending(&mut self, id: DeviceId) {
        if let Some(entry) = self.devices.get_mut(&id) {
            entry.status = CommStatus {
                state: CommState::Pending,
                last_error: None,
            };
        }
    }

    pub fn set_result(&mut self, id: DeviceId, outcome: &Outcome) {
        let state = match outcome.severity {
            Severity::Success => CommState::Success,
            Severity::Warning => CommState::Warning,
            Severity::Error => CommState::Error,
        };
        self.set_status(
            id,
            CommStatus {
                state,
                last_error: outcome.message.clone(),
            },
        );
    }

    pub fn set_status(&mut self, id: DeviceId, status: CommStatus) {
        if let Some(entry) = self.devices.get_mut(&id) {
            entry.status = status;
        }
    }

    /// Record an optimistic target before the write completes.
    pub fn set_current_position(&mut self, id: DeviceId, position: i32) {
        if let Some(entry) = self.devices.get_mut(&id) {
            entry.current_position = position;
        }
    }

    /// The device confirmed `position`; it becomes the new safe point.
    pub fn commit_position(&mut self, id: DeviceId, position: i32) {
        if let Some(entry) = self.devices.get_mut(&id) {
            entry.current_position = position;
            entry.last_safe_position = position;
        }
    }

    /// Forget an unconfirmed target.
    pub fn rollback_position(&mut self, id: DeviceId) {
        if let Some(entry) = self.devices.get_mut(&id) {
            entry.current_position = entry.last_safe_position;
        }
    }

    /// Back to idle with zeroed position memory.
    pub fn reset_all(&mut self, ids: &[DeviceId]) {
        for id in ids {
            if let Some(entry) = self.devices.get_mut(id) {
                *entry = DeviceEntry::new(entry.role);
            }
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let devices = self
            .devices
            .iter()
            .map(|(id, e)| {
                (
                    *id,
                    DeviceSnapshot {
                        role: e.role,
                        state: e.status.state,
                        last_error: e.status.last_error.clone(),
                        current_position: e.current_position,
                        last_safe_position: e.last_safe_position,
                    },
                )
            })
            .collect();
        StatusSnapshot {
            at: OffsetDateTime::now_utc(),
            devices,
        }
    }
}
