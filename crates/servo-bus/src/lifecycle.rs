//! Connection lifecycle and the caller-facing servo API.
//!
//! `ServoController` owns the command queue and walks the bus through
//! `Disconnected -> RequestingPort -> PortOpen -> InitializingDevices -> Connected` and back
//! through `DrainingWheels -> TorqueDisabling -> PortClosing -> Disconnected`. Move
//! requests are only accepted while `Connected`; everything that touches the bus goes
//! through the queue.

use crate::classify::Outcome;
use crate::codec;
use crate::config::BusConfig;
use crate::context::BusContext;
use crate::error::{Result, ServoError};
use crate::metrics::MetricsHub;
use crate::packet::PacketHandler;
use crate::queue::{CommandQueue, Ticket};
use crate::registry::DeviceRegistry;
use crate::types::{
    Alert, CommState, CommStatus, ConnectionState, DeviceId, Role, StatusSnapshot,
};
use crate::wheel;
use serial_transport::{PortBackend, SerialBus, TransportError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

const ALERT_CAPACITY: usize = 64;

pub struct ServoController {
    config: BusConfig,
    backend: Arc<dyn PortBackend>,
    roles: BTreeMap<DeviceId, Role>,
    queue: CommandQueue<BusContext>,
    state: watch::Sender<ConnectionState>,
    status: watch::Receiver<StatusSnapshot>,
    alerts: broadcast::Sender<Alert>,
    metrics: MetricsHub,
    // Checked again by caller commands when they run; cleared before teardown drains.
    accepting: Arc<AtomicBool>,
    // Held for the whole of connect/disconnect.
    transition: Mutex<()>,
}

impl ServoController {
    pub fn new(config: BusConfig, backend: Arc<dyn PortBackend>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ServoError::Config(format!("{e:#}")))?;
        let roles: BTreeMap<DeviceId, Role> =
            config.devices.iter().map(|d| (d.id, d.role)).collect();
        let registry = DeviceRegistry::new(roles.iter().map(|(id, role)| (*id, *role)));
        let (status_tx, status) = watch::channel(registry.snapshot());
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
        let metrics = MetricsHub::new().map_err(ServoError::Metrics)?;
        metrics.bus.devices_configured.set(roles.len() as i64);

        let ctx = BusContext::new(
            PacketHandler::new(config.protocol_end, config.read_timeout_ms),
            registry,
            status_tx,
            alerts.clone(),
            metrics.clone(),
        );
        let queue = CommandQueue::new(ctx, config.command_delay());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            config,
            backend,
            roles,
            queue,
            state,
            status,
            alerts,
            metrics,
            accepting: Arc::new(AtomicBool::new(false)),
            transition: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Latest published status of every configured servo.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }

    /// Commands waiting behind the one currently on the bus.
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    fn ids(&self) -> Vec<DeviceId> {
        self.roles.keys().copied().collect()
    }

    fn ids_with_role(&self, role: Role) -> Vec<DeviceId> {
        self.roles
            .iter()
            .filter(|(_, r)| **r == role)
            .map(|(id, _)| *id)
            .collect()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        tracing::debug!(from = ?prev, to = ?next, "connection state");
    }

    /// Caller-boundary guard: connected, known id, and the right role if one is needed.
    fn check(&self, id: DeviceId, expected: Option<Role>) -> Result<Role> {
        if !self.is_connected() {
            return Err(ServoError::NotConnected);
        }
        let actual = *self.roles.get(&id).ok_or(ServoError::UnknownDevice(id))?;
        match expected {
            Some(expected) if expected != actual => Err(ServoError::WrongRole {
                id,
                expected,
                actual,
            }),
            _ => Ok(actual),
        }
    }

    /// Queue a caller command. It is refused at run time if teardown began after the
    /// caller passed [`Self::check`] but before the command reached the queue.
    fn submit_guarded<T, F>(&self, label: &'static str, op: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BusContext) -> Result<T> + Send + 'static,
    {
        let accepting = Arc::clone(&self.accepting);
        self.queue.submit(label, move |ctx: &mut BusContext| {
            if !accepting.load(Ordering::SeqCst) {
                tracing::debug!(op = label, "refusing command queued during teardown");
                return Err(ServoError::NotConnected);
            }
            op(ctx)
        })
    }

    // ---- lifecycle ----

    /// Open the port and initialize every configured servo.
    ///
    /// Only a port failure makes this return an error. Servos that fail to initialize are
    /// left in the error state and the connection still completes.
    pub async fn connect(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let current = self.state();
        if current != ConnectionState::Disconnected {
            return Err(ServoError::InvalidState(current));
        }

        self.set_state(ConnectionState::RequestingPort);
        let name = match self.select_port() {
            Ok(name) => name,
            Err(e) => return self.fail_connect(e).await,
        };

        self.set_state(ConnectionState::PortOpen);
        let port = match self.open_port(name).await {
            Ok(port) => port,
            Err(e) => return self.fail_connect(e).await,
        };
        let stale = self.queue.clear();
        if stale > 0 {
            tracing::debug!(stale, "dropped commands queued before connect");
        }
        self.queue
            .submit("install port", move |ctx: &mut BusContext| {
                ctx.install_port(port);
                Ok(())
            })
            .await?;

        self.set_state(ConnectionState::InitializingDevices);
        for (id, role) in self.roles.clone() {
            match role {
                Role::Wheel => self.initialize_wheel(id).await,
                Role::Joint => self.initialize_joint(id).await,
            }
        }

        self.accepting.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        let status = self.status();
        let failed = status
            .devices
            .values()
            .filter(|d| d.state == CommState::Error)
            .count();
        tracing::info!(devices = self.roles.len(), failed, "servo bus connected");
        Ok(())
    }

    fn select_port(&self) -> Result<String> {
        if let Some(port) = &self.config.port {
            return Ok(port.clone());
        }
        let ports = self.backend.list()?;
        ports
            .iter()
            .find(|p| p.is_usb())
            .or_else(|| ports.first())
            .map(|p| p.name.clone())
            .ok_or_else(|| {
                ServoError::Port(TransportError::PortNotFound("no serial ports found".into()))
            })
    }

    async fn open_port(&self, name: String) -> Result<Box<dyn SerialBus>> {
        let backend = Arc::clone(&self.backend);
        let baud_rate = self.config.baud_rate;
        tracing::info!(port = %name, baud_rate, "opening servo bus");
        tokio::task::spawn_blocking(move || backend.open(&name, baud_rate))
            .await
            .map_err(|e| ServoError::Panicked(e.to_string()))?
            .map_err(ServoError::from)
    }

    async fn fail_connect(&self, err: ServoError) -> Result<()> {
        tracing::error!(error = %err, "failed to connect to servo bus");
        let ids = self.ids();
        let message = err.to_string();
        let marked = self
            .queue
            .submit("connect failed", move |ctx: &mut BusContext| {
                ctx.mark_error(&ids, &message);
                ctx.alert(None, format!("Failed to connect to robot: {message}"));
                Ok(())
            })
            .await;
        if let Err(e) = marked {
            tracing::warn!(error = %e, "could not record connect failure");
        }
        self.set_state(ConnectionState::Disconnected);
        Err(err)
    }

    async fn initialize_wheel(&self, id: DeviceId) {
        let mode = wheel::enable_wheel_mode(&self.queue, id).await;
        let stop = self
            .queue
            .submit("wheel init: stop", move |ctx: &mut BusContext| {
                ctx.write_wheel_speed(id, 0)
            })
            .await;
        if let Err(e) = &stop {
            tracing::warn!(servo = id, error = %e, "wheel did not accept zero speed");
        }
        if mode.is_err() {
            let marked = self
                .queue
                .submit("wheel init: failed", move |ctx: &mut BusContext| {
                    ctx.set_status(id, CommStatus::error("Failed to enable wheel mode"));
                    Ok(())
                })
                .await;
            if let Err(e) = marked {
                tracing::warn!(servo = id, error = %e, "could not record wheel mode failure");
            }
        }
    }

    async fn initialize_joint(&self, id: DeviceId) {
        let acceleration = self.config.init_acceleration;
        let speed = self.config.init_speed;
        let steps: [(&'static str, Ticket<Outcome>); 3] = [
            (
                "torque enable",
                self.queue.submit("joint init: torque", move |ctx: &mut BusContext| {
                    ctx.write_torque_enable(id, true)
                }),
            ),
            (
                "acceleration",
                self.queue.submit("joint init: acceleration", move |ctx: &mut BusContext| {
                    ctx.write_acceleration(id, acceleration)
                }),
            ),
            (
                "speed limit",
                self.queue.submit("joint init: speed", move |ctx: &mut BusContext| {
                    ctx.write_speed_limit(id, speed)
                }),
            ),
        ];
        for (step, ticket) in steps {
            if let Err(e) = ticket.await {
                tracing::warn!(servo = id, step, error = %e, "joint init step failed");
            }
        }

        let read = self
            .queue
            .submit("joint init: position", move |ctx: &mut BusContext| {
                match ctx.read_position(id) {
                    Ok(position) => {
                        ctx.commit_position(id, i32::from(position));
                        Ok(position)
                    }
                    Err(e) => {
                        ctx.set_status(id, CommStatus::error("Failed to read initial position"));
                        Err(e)
                    }
                }
            })
            .await;
        match read {
            Ok(position) => tracing::info!(servo = id, position, "joint ready"),
            Err(e) => tracing::error!(servo = id, error = %e, "failed to read initial position"),
        }
    }

    /// Stop wheels, release torque, close the port and forget all positions.
    ///
    /// Commands that have not started yet are discarded. One already on the bus finishes
    /// first. Failures along the way are logged and never stop the teardown.
    pub async fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let current = self.state();
        if current != ConnectionState::Connected {
            return Err(ServoError::InvalidState(current));
        }

        self.accepting.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::DrainingWheels);
        let discarded = self.queue.clear();
        tracing::info!(discarded, "disconnecting servo bus");
        let stops: Vec<_> = self
            .ids_with_role(Role::Wheel)
            .into_iter()
            .map(|id| {
                let ticket = self.queue.submit("teardown: stop wheel", move |ctx: &mut BusContext| {
                    ctx.write_wheel_speed(id, 0)
                });
                (id, ticket)
            })
            .collect();
        for (id, ticket) in stops {
            if let Err(e) = ticket.await {
                tracing::warn!(servo = id, error = %e, "failed to stop wheel");
            }
        }

        self.set_state(ConnectionState::TorqueDisabling);
        let releases: Vec<_> = self
            .ids()
            .into_iter()
            .map(|id| {
                let ticket = self.queue.submit("teardown: torque off", move |ctx: &mut BusContext| {
                    ctx.write_torque_enable(id, false)
                });
                (id, ticket)
            })
            .collect();
        for (id, ticket) in releases {
            if let Err(e) = ticket.await {
                tracing::warn!(servo = id, error = %e, "failed to disable torque");
            }
        }

        self.set_state(ConnectionState::PortClosing);
        let closed = self
            .queue
            .submit("teardown: close port", |ctx: &mut BusContext| ctx.close_port())
            .await;
        if let Err(e) = closed {
            tracing::warn!(error = %e, "failed to close servo port");
        }
        let ids = self.ids();
        let reset = self
            .queue
            .submit("teardown: reset", move |ctx: &mut BusContext| {
                ctx.reset(&ids);
                Ok(())
            })
            .await;
        if let Err(e) = reset {
            tracing::warn!(error = %e, "failed to reset servo registry");
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("servo bus disconnected");
        Ok(())
    }

    // ---- caller API ----

    /// Absolute goal position in ticks, clamped to 0..=4095.
    pub fn write_position(&self, id: DeviceId, position: i32) -> Result<Ticket<Outcome>> {
        self.check(id, Some(Role::Joint))?;
        Ok(self
            .submit_guarded("write position", move |ctx: &mut BusContext| {
                ctx.write_position(id, position)
            }))
    }

    /// Signed wheel speed, magnitude clamped to 2000.
    pub fn write_wheel_speed(&self, id: DeviceId, speed: i32) -> Result<Ticket<Outcome>> {
        self.check(id, Some(Role::Wheel))?;
        Ok(self
            .submit_guarded("write wheel speed", move |ctx: &mut BusContext| {
                ctx.write_wheel_speed(id, speed)
            }))
    }

    /// Step a joint, or spin a wheel, in `direction` (sign only) scaled by `magnitude`
    /// (clamped to the unit interval).
    ///
    /// A joint steps from its remembered position at the time the command runs, so
    /// back-to-back requests accumulate.
    pub fn request_move(
        &self,
        id: DeviceId,
        direction: i8,
        magnitude: f32,
    ) -> Result<Ticket<Outcome>> {
        let role = self.check(id, None)?;
        let magnitude = if magnitude.is_nan() {
            0.0
        } else {
            magnitude.clamp(0.0, 1.0)
        };
        let sign = i32::from(direction.signum());
        match role {
            Role::Joint => {
                let step = sign * (magnitude * self.config.max_step_ticks as f32).round() as i32;
                Ok(self
                    .submit_guarded("move joint", move |ctx: &mut BusContext| {
                        let current = ctx
                            .registry()
                            .get(id)
                            .map_or(0, |entry| entry.current_position);
                        ctx.write_position(id, current + step)
                    }))
            }
            Role::Wheel => {
                let speed = sign * (magnitude * self.config.wheel_max_speed as f32).round() as i32;
                Ok(self
                    .submit_guarded("move wheel", move |ctx: &mut BusContext| {
                        ctx.write_wheel_speed(id, speed)
                    }))
            }
        }
    }

    /// Move a joint to `fraction` of its travel (0.0 = 0, 1.0 = 4095).
    pub fn request_normalized_position(
        &self,
        id: DeviceId,
        fraction: f32,
    ) -> Result<Ticket<Outcome>> {
        self.write_position(id, codec::position_from_fraction(fraction))
    }

    pub fn request_wheel_stop(&self, id: DeviceId) -> Result<Ticket<Outcome>> {
        self.write_wheel_speed(id, 0)
    }

    /// Read a joint's present position and remember it.
    pub fn read_position(&self, id: DeviceId) -> Result<Ticket<u16>> {
        self.check(id, Some(Role::Joint))?;
        Ok(self
            .submit_guarded("read position", move |ctx: &mut BusContext| {
                let position = ctx.read_position(id)?;
                ctx.commit_position(id, i32::from(position));
                Ok(position)
            }))
    }

    pub fn ping(&self, id: DeviceId) -> Result<Ticket<Outcome>> {
        self.check(id, None)?;
        Ok(self
            .submit_guarded("ping", move |ctx: &mut BusContext| ctx.ping(id)))
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::classify::Severity;
    use crate::config::DeviceConfig;
    use crate::protocol::{errbits, registers, Instruction};
    use crate::sim::{SimulatedServos, SIM_HOME_POSITION};
    use crate::packet::parse_packet;
    use serial_transport::{MockBackend, WireLog};
    use std::time::Duration;

    fn config(joints: &[DeviceId], wheels: &[DeviceId]) -> BusConfig {
        let device = |id: &DeviceId, role| DeviceConfig {
            id: *id,
            role,
            name: None,
        };
        BusConfig {
            devices: joints
                .iter()
                .map(|id| device(id, Role::Joint))
                .chain(wheels.iter().map(|id| device(id, Role::Wheel)))
                .collect(),
            ..BusConfig::default()
        }
    }

    fn controller(
        joints: &[DeviceId],
        wheels: &[DeviceId],
    ) -> (ServoController, SimulatedServos, WireLog) {
        let sim = SimulatedServos::new(joints.iter().chain(wheels).copied());
        let backend = sim.backend();
        let log = backend.log();
        let ctl = ServoController::new(config(joints, wheels), Arc::new(backend)).unwrap();
        (ctl, sim, log)
    }

    fn state_of(ctl: &ServoController, id: DeviceId) -> CommState {
        ctl.status().get(id).unwrap().state
    }

    /// Goal-position frames in wire order as (id, position).
    fn goal_writes(log: &WireLog) -> Vec<(u8, u16)> {
        log.tx()
            .iter()
            .filter_map(|e| {
                let (id, instr, params) = parse_packet(&e.bytes)?;
                match params {
                    [addr, lo, hi, ..]
                        if instr == Instruction::Write as u8
                            && *addr == registers::GOAL_POSITION =>
                    {
                        Some((id, u16::from_le_bytes([*lo, *hi])))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_initializes_joints_and_wheels() {
        let (ctl, sim, log) = controller(&[1, 2], &[7]);
        ctl.connect().await.unwrap();

        assert!(ctl.is_connected());
        for id in [1, 2, 7] {
            assert_eq!(state_of(&ctl, id), CommState::Success, "servo {id}");
        }
        assert_eq!(sim.torque_enabled(1), Some(true));
        assert_eq!(sim.register_byte(2, registers::GOAL_ACC), Some(10));
        assert_eq!(sim.in_wheel_mode(7), Some(true));
        assert_eq!(sim.in_wheel_mode(1), Some(false));
        assert_eq!(sim.goal_speed(7), Some(0));
        let snap = ctl.status();
        assert_eq!(
            snap.get(1).unwrap().current_position,
            i32::from(SIM_HOME_POSITION)
        );
        assert_eq!(log.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_failed_initial_read_does_not_abort_others() {
        let (ctl, sim, _) = controller(&[1, 2, 3, 4], &[]);
        sim.fail_reads(3, registers::PRESENT_POSITION);
        ctl.connect().await.unwrap();

        assert!(ctl.is_connected());
        assert_eq!(state_of(&ctl, 1), CommState::Success);
        assert_eq!(state_of(&ctl, 2), CommState::Success);
        assert_eq!(state_of(&ctl, 4), CommState::Success);
        let three = ctl.status().get(3).cloned().unwrap();
        assert_eq!(three.state, CommState::Error);
        assert_eq!(
            three.last_error.as_deref(),
            Some("Failed to read initial position")
        );
    }

    #[tokio::test]
    async fn test_wheel_mode_failure_marks_device() {
        let (ctl, sim, _) = controller(&[1], &[7]);
        sim.set_silent(7, true);
        ctl.connect().await.unwrap();
        let seven = ctl.status().get(7).cloned().unwrap();
        assert_eq!(seven.state, CommState::Error);
        assert_eq!(seven.last_error.as_deref(), Some("Failed to enable wheel mode"));
        assert_eq!(state_of(&ctl, 1), CommState::Success);
    }

    #[tokio::test]
    async fn test_requests_while_disconnected_are_rejected_without_side_effects() {
        let (ctl, _, log) = controller(&[1, 2], &[]);
        let before = ctl.status();
        assert_eq!(
            ctl.write_position(2, 5000).err(),
            Some(ServoError::NotConnected)
        );
        assert_eq!(ctl.request_move(1, 1, 1.0).err(), Some(ServoError::NotConnected));
        assert_eq!(ctl.pending_commands(), 0);
        assert!(log.tx().is_empty());
        assert_eq!(ctl.status().devices, before.devices);
    }

    #[tokio::test]
    async fn test_role_and_id_guards() {
        let (ctl, _, _) = controller(&[1], &[7]);
        ctl.connect().await.unwrap();
        assert_eq!(
            ctl.request_wheel_stop(1).err(),
            Some(ServoError::WrongRole {
                id: 1,
                expected: Role::Wheel,
                actual: Role::Joint
            })
        );
        assert!(matches!(
            ctl.write_position(7, 100),
            Err(ServoError::WrongRole { id: 7, .. })
        ));
        assert_eq!(ctl.ping(42).err(), Some(ServoError::UnknownDevice(42)));
    }

    #[tokio::test]
    async fn test_back_to_back_writes_land_in_order() {
        let (ctl, sim, log) = controller(&[1], &[]);
        ctl.connect().await.unwrap();
        log.clear();

        let first = ctl.write_position(1, 10).unwrap();
        let second = ctl.write_position(1, 20).unwrap();
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());

        assert_eq!(goal_writes(&log), vec![(1, 10), (1, 20)]);
        assert_eq!(sim.present_position(1), Some(20));
        let one = ctl.status().get(1).cloned().unwrap();
        assert_eq!(one.current_position, 20);
        assert_eq!(one.last_safe_position, 20);
    }

    #[tokio::test]
    async fn test_frames_are_spaced_and_never_overlap() {
        let (ctl, _, log) = controller(&[1, 2, 3], &[]);
        ctl.connect().await.unwrap();
        log.clear();

        let tickets: Vec<_> = (0..6)
            .map(|n| ctl.write_position(1 + (n % 3) as u8, 100 * n).unwrap())
            .collect();
        for t in tickets {
            t.await.unwrap();
        }
        let tx = log.tx();
        assert_eq!(tx.len(), 6);
        for pair in tx.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= ctl.config().command_delay());
        }
        assert_eq!(log.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_request_move_steps_from_remembered_position() {
        let (ctl, sim, _) = controller(&[1], &[7]);
        ctl.connect().await.unwrap();
        let home = i32::from(SIM_HOME_POSITION);

        let a = ctl.request_move(1, 1, 1.0).unwrap();
        let b = ctl.request_move(1, 1, 0.5).unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(ctl.status().get(1).unwrap().current_position, home + 60);

        ctl.request_move(1, -1, 1.0).unwrap().await.unwrap();
        assert_eq!(sim.present_position(1), Some((home + 20) as u16));

        ctl.request_move(7, -1, 0.5).unwrap().await.unwrap();
        assert_eq!(ctl.status().get(7).unwrap().current_position, -500);

        ctl.request_wheel_stop(7).unwrap().await.unwrap();
        assert_eq!(ctl.status().get(7).unwrap().current_position, 0);

        ctl.request_normalized_position(1, 1.0).unwrap().await.unwrap();
        assert_eq!(sim.present_position(1), Some(4095));
    }

    #[tokio::test]
    async fn test_hardware_fault_on_move_is_a_warning() {
        let (ctl, sim, _) = controller(&[1], &[]);
        ctl.connect().await.unwrap();
        let mut alerts = ctl.subscribe_alerts();
        sim.set_error_bits(1, errbits::OVERLOAD | errbits::OVERHEAT);

        let outcome = ctl.write_position(1, 1500).unwrap().await.unwrap();
        assert_eq!(outcome.severity, Severity::Warning);
        let one = ctl.status().get(1).cloned().unwrap();
        assert_eq!(one.state, CommState::Warning);
        assert_eq!(one.last_error.as_deref(), Some("Overload or stuck"));
        assert_eq!(one.last_safe_position, 1500);
        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.device, Some(1));
        assert!(alert.message.contains("Overload"));
    }

    #[tokio::test]
    async fn test_lost_reply_rolls_back_position() {
        let (ctl, sim, _) = controller(&[1], &[]);
        ctl.connect().await.unwrap();
        ctl.write_position(1, 1000).unwrap().await.unwrap();
        sim.set_silent(1, true);

        let err = ctl.write_position(1, 3000).unwrap().await.unwrap_err();
        assert!(matches!(err, ServoError::Communication { id: 1, .. }));
        let one = ctl.status().get(1).cloned().unwrap();
        assert_eq!(one.state, CommState::Error);
        assert_eq!(one.current_position, 1000);
        assert!(one
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("Communication failed: "));
        // the next command still runs
        sim.set_silent(1, false);
        assert!(ctl.write_position(1, 1200).unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn test_teardown_settles_in_flight_and_discards_pending() {
        let (ctl, sim, log) = controller(&[1], &[7, 8]);
        ctl.connect().await.unwrap();
        sim.set_latency(1, Duration::from_millis(150));

        let write = ctl.write_position(1, 1234).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let stop7 = ctl.request_wheel_stop(7).unwrap();
        let stop8 = ctl.request_wheel_stop(8).unwrap();
        ctl.disconnect().await.unwrap();

        assert!(write.await.is_ok());
        assert_eq!(stop7.await.err(), Some(ServoError::Discarded));
        assert_eq!(stop8.await.err(), Some(ServoError::Discarded));
        assert_eq!(sim.present_position(1), Some(1234));
        assert_eq!(sim.torque_enabled(1), Some(false));
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        assert_eq!(log.overlaps(), 0);

        let snap = ctl.status();
        for dev in snap.devices.values() {
            assert_eq!(dev.state, CommState::Idle);
            assert_eq!(dev.current_position, 0);
            assert_eq!(dev.last_safe_position, 0);
        }
        assert_eq!(
            ctl.write_position(1, 10).err(),
            Some(ServoError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_torque_failures_do_not_block_teardown() {
        let (ctl, sim, _) = controller(&[1, 2], &[]);
        ctl.connect().await.unwrap();
        sim.set_silent(1, true);
        ctl.disconnect().await.unwrap();
        assert_eq!(sim.torque_enabled(2), Some(false));
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_port_request_failure_marks_every_device() {
        let backend = MockBackend::silent().without_ports();
        let ctl = ServoController::new(config(&[1, 2, 3], &[]), Arc::new(backend)).unwrap();
        let mut alerts = ctl.subscribe_alerts();

        let err = ctl.connect().await.unwrap_err();
        assert!(matches!(err, ServoError::Port(TransportError::PortNotFound(_))));
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        for id in [1, 2, 3] {
            let dev = ctl.status().get(id).cloned().unwrap();
            assert_eq!(dev.state, CommState::Error);
            assert_eq!(dev.last_error, Some(err.to_string()));
        }
        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.device, None);
        assert!(alert.message.starts_with("Failed to connect to robot"));
    }

    #[tokio::test]
    async fn test_open_failure_fails_closed() {
        let backend = MockBackend::silent().failing_open();
        let ctl = ServoController::new(config(&[1], &[]), Arc::new(backend)).unwrap();
        assert!(ctl.connect().await.is_err());
        assert!(!ctl.is_connected());
        // a later attempt is allowed
        assert!(ctl.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_transitions_are_checked() {
        let (ctl, _, _) = controller(&[1], &[]);
        assert_eq!(
            ctl.disconnect().await.err(),
            Some(ServoError::InvalidState(ConnectionState::Disconnected))
        );
        ctl.connect().await.unwrap();
        assert_eq!(
            ctl.connect().await.err(),
            Some(ServoError::InvalidState(ConnectionState::Connected))
        );
        ctl.disconnect().await.unwrap();
        // reconnect after a full cycle
        ctl.connect().await.unwrap();
        assert!(ctl.is_connected());
    }

    #[tokio::test]
    async fn test_speed_words_land_low_byte_first() {
        let (ctl, sim, _) = controller(&[1], &[7]);
        ctl.connect().await.unwrap();
        assert_eq!(sim.goal_speed(1), Some(300));

        ctl.request_move(7, -1, 0.5).unwrap().await.unwrap();
        assert_eq!(sim.goal_speed(7), Some(codec::encode_speed(-500)));
        assert_eq!(ctl.status().get(7).unwrap().last_safe_position, -500);

        ctl.request_move(7, 1, 0.3).unwrap().await.unwrap();
        assert_eq!(sim.goal_speed(7), Some(300));
        assert_eq!(codec::decode_speed(sim.goal_speed(7).unwrap()), 300);
    }

    #[tokio::test]
    async fn test_command_admitted_before_teardown_is_refused_when_it_runs() {
        let (ctl, sim, log) = controller(&[1], &[]);
        ctl.connect().await.unwrap();
        ctl.write_position(1, 1000).unwrap().await.unwrap();
        log.clear();

        // teardown starts between the caller's guard and its submit
        ctl.check(1, Some(Role::Joint)).unwrap();
        ctl.accepting.store(false, Ordering::SeqCst);
        let late = ctl.submit_guarded("write position", |ctx: &mut BusContext| {
            ctx.write_position(1, 3000)
        });

        assert_eq!(late.await.err(), Some(ServoError::NotConnected));
        assert!(log.tx().is_empty());
        assert_eq!(sim.present_position(1), Some(1000));
        let one = ctl.status().get(1).cloned().unwrap();
        assert_eq!(one.current_position, 1000);
        assert_eq!(one.state, CommState::Success);

        ctl.disconnect().await.unwrap();
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_caller_write_reaches_the_bus_after_teardown_starts() {
        let (ctl, _, log) = controller(&[1, 2], &[]);
        let ctl = Arc::new(ctl);
        ctl.connect().await.unwrap();

        let mut callers = Vec::new();
        for n in 0..4 {
            let ctl = Arc::clone(&ctl);
            callers.push(tokio::spawn(async move {
                for step in 0..50 {
                    let Ok(ticket) = ctl.write_position(1 + (n % 2) as u8, 100 + step) else {
                        break;
                    };
                    let _ = ticket.await;
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        ctl.disconnect().await.unwrap();
        for c in callers {
            c.await.unwrap();
        }

        // after the first torque-off frame no goal position may appear
        let tx = log.tx();
        let first_release = tx.iter().position(|e| {
            parse_packet(&e.bytes).is_some_and(|(_, instr, params)| {
                instr == Instruction::Write as u8
                    && params.first() == Some(&registers::TORQUE_ENABLE)
                    && params.get(1) == Some(&0)
            })
        });
        let first_release = first_release.unwrap();
        assert!(tx[first_release..].iter().all(|e| {
            parse_packet(&e.bytes).map_or(true, |(_, _, params)| {
                params.first() != Some(&registers::GOAL_POSITION)
            })
        }));
        for dev in ctl.status().devices.values() {
            assert_eq!(dev.state, CommState::Idle);
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let ctl = ServoController::new(config(&[], &[]), Arc::new(MockBackend::silent()));
        assert!(matches!(ctl, Err(ServoError::Config(_))));
    }
}
