//! The state owned by the command queue: the open port, the packet handler, the device
//! registry, and the outbound status/alert channels. Every method here runs inside a
//! queued operation, so at most one of them touches the bus at a time.

use crate::classify::{classify_and_record, Outcome};
use crate::codec;
use crate::error::{Result, ServoError};
use crate::metrics::MetricsHub;
use crate::packet::{PacketHandler, Reply};
use crate::protocol::{registers, CommResult};
use crate::registry::DeviceRegistry;
use crate::types::{Alert, CommStatus, DeviceId, StatusSnapshot};
use serial_transport::SerialBus;
use tokio::sync::{broadcast, watch};

pub struct BusContext {
    port: Option<Box<dyn SerialBus>>,
    packets: PacketHandler,
    registry: DeviceRegistry,
    status_tx: watch::Sender<StatusSnapshot>,
    alerts: broadcast::Sender<Alert>,
    metrics: MetricsHub,
}

impl BusContext {
    pub fn new(
        packets: PacketHandler,
        registry: DeviceRegistry,
        status_tx: watch::Sender<StatusSnapshot>,
        alerts: broadcast::Sender<Alert>,
        metrics: MetricsHub,
    ) -> Self {
        Self {
            port: None,
            packets,
            registry,
            status_tx,
            alerts,
            metrics,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn install_port(&mut self, port: Box<dyn SerialBus>) {
        tracing::info!(port = port.name(), "servo bus port installed");
        self.port = Some(port);
    }

    pub fn has_port(&self) -> bool {
        self.port.as_ref().is_some_and(|p| p.is_open())
    }

    pub fn close_port(&mut self) -> Result<()> {
        match self.port.take() {
            Some(mut port) => {
                let name = port.name().to_string();
                port.close()?;
                tracing::info!(port = %name, "servo bus port closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn publish(&self) {
        self.status_tx.send_replace(self.registry.snapshot());
    }

    pub fn alert(&self, device: Option<DeviceId>, message: impl Into<String>) {
        let alert = Alert::new(device, message);
        tracing::warn!(servo = ?alert.device, "{}", alert.message);
        // No subscribers is fine; the status snapshot still carries the error.
        let _ = self.alerts.send(alert);
    }

    pub fn set_pending(&mut self, id: DeviceId) {
        self.registry.set_pending(id);
        self.publish();
    }

    pub fn set_status(&mut self, id: DeviceId, status: CommStatus) {
        self.registry.set_status(id, status);
        self.publish();
    }

    pub fn mark_error(&mut self, ids: &[DeviceId], message: &str) {
        for id in ids {
            self.registry.set_status(*id, CommStatus::error(message));
        }
        self.publish();
    }

    pub fn reset(&mut self, ids: &[DeviceId]) {
        self.registry.reset_all(ids);
        self.publish();
    }

    fn exchange(
        &mut self,
        id: DeviceId,
        operation: &'static str,
        warn_on_fault: bool,
        f: impl FnOnce(&PacketHandler, &mut dyn SerialBus) -> Reply,
    ) -> Result<Outcome> {
        self.registry.set_pending(id);
        let reply = match self.port.as_deref_mut() {
            Some(port) => f(&self.packets, port),
            None => Reply {
                result: CommResult::NotAvailable,
                error: 0,
            },
        };
        self.metrics.observe(&reply);
        let outcome = classify_and_record(
            &mut self.registry,
            id,
            reply.result,
            reply.error,
            operation,
            warn_on_fault,
        );
        if outcome.alert {
            self.alert(
                Some(id),
                format!(
                    "Servo {id}: {}",
                    outcome.message.as_deref().unwrap_or_default()
                ),
            );
        }
        self.publish();
        match ServoError::from_outcome(id, &outcome) {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    pub fn ping(&mut self, id: DeviceId) -> Result<Outcome> {
        self.exchange(id, "ping", false, |packets, port| packets.ping(port, id))
    }

    pub fn write_torque_enable(&mut self, id: DeviceId, enable: bool) -> Result<Outcome> {
        self.exchange(id, "torque control", false, |packets, port| {
            packets.write1(port, id, registers::TORQUE_ENABLE, u8::from(enable))
        })
    }

    pub fn write_acceleration(&mut self, id: DeviceId, acceleration: i32) -> Result<Outcome> {
        let value = codec::encode_acceleration(acceleration);
        self.exchange(id, "acceleration control", false, |packets, port| {
            packets.write1(port, id, registers::GOAL_ACC, value)
        })
    }

    pub fn write_speed_limit(&mut self, id: DeviceId, speed: i32) -> Result<Outcome> {
        let value = codec::register_word(
            codec::encode_speed_limit(speed),
            self.packets.protocol_end(),
        );
        self.exchange(id, "speed control", false, |packets, port| {
            packets.write2(port, id, registers::GOAL_SPEED, value)
        })
    }

    /// Goal position write. Hardware faults are warnings; a failed transfer rolls the
    /// position memory back to the last safe value.
    pub fn write_position(&mut self, id: DeviceId, position: i32) -> Result<Outcome> {
        let target = position.clamp(0, i32::from(codec::POSITION_MAX));
        let raw = codec::encode_position(target);
        self.registry.set_current_position(id, target);
        let result = self.exchange(id, "position control", true, |packets, port| {
            packets.write4(port, id, registers::GOAL_POSITION, u32::from(raw))
        });
        match &result {
            Ok(_) => self.registry.commit_position(id, target),
            Err(_) => self.registry.rollback_position(id),
        }
        self.publish();
        result
    }

    /// Signed speed for a wheel-mode servo. Hardware faults are warnings.
    pub fn write_wheel_speed(&mut self, id: DeviceId, speed: i32) -> Result<Outcome> {
        let raw = codec::encode_speed(speed);
        let applied = codec::decode_speed(raw);
        let word = codec::register_word(raw, self.packets.protocol_end());
        let result = self.exchange(id, "wheel speed control", true, |packets, port| {
            packets.write2(port, id, registers::GOAL_SPEED, word)
        });
        if result.is_ok() {
            self.registry.commit_position(id, applied);
            self.publish();
        }
        result
    }

    pub fn write_angle_limit(&mut self, id: DeviceId, address: u8, value: u16) -> Result<Outcome> {
        let value = codec::register_word(value, self.packets.protocol_end());
        self.exchange(id, "wheel mode", false, |packets, port| {
            packets.write2(port, id, address, value)
        })
    }

    /// Present position, byte order fixed up and masked to 16 bits.
    pub fn read_position(&mut self, id: DeviceId) -> Result<u16> {
        let mut raw = 0u32;
        self.exchange(id, "position reading", false, |packets, port| {
            let reply = packets.read4(port, id, registers::PRESENT_POSITION);
            raw = reply.value;
            Reply {
                result: reply.result,
                error: reply.error,
            }
        })?;
        let position = codec::decode_position(raw);
        tracing::debug!(servo = id, raw, position, "present position");
        Ok(position)
    }

    /// Remember a position read back from the device as both current and safe.
    pub fn commit_position(&mut self, id: DeviceId, position: i32) {
        self.registry.commit_position(id, position);
        self.publish();
    }
}
