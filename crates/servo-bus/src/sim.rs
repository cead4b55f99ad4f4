//! Register-file simulation of servos on a mock bus.
//!
//! Each simulated servo keeps a small little-endian register file. Writes land in it,
//! reads come out of it, and the present position follows the goal position immediately.
//! Faults can be injected per servo.

use crate::packet::{build_status, parse_packet};
use crate::protocol::{registers, Instruction, BROADCAST_ID};
use crate::types::DeviceId;
use serial_transport::{MockBackend, Responder};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const REGISTER_FILE_LEN: usize = 128;

/// Resting position of a freshly powered servo (mid travel).
pub const SIM_HOME_POSITION: u16 = 2048;

#[derive(Debug, Clone)]
struct SimServo {
    registers: [u8; REGISTER_FILE_LEN],
    error_bits: u8,
    silent: bool,
    failing_reads: HashSet<u8>,
    failing_writes: HashSet<u8>,
    latency: Duration,
}

impl SimServo {
    fn new() -> Self {
        let mut regs = [0u8; REGISTER_FILE_LEN];
        let home = SIM_HOME_POSITION.to_le_bytes();
        let present = usize::from(registers::PRESENT_POSITION);
        let goal = usize::from(registers::GOAL_POSITION);
        regs[present..present + 2].copy_from_slice(&home);
        regs[goal..goal + 2].copy_from_slice(&home);
        // Position mode: full travel.
        let max = usize::from(registers::MAX_ANGLE_LIMIT);
        regs[max..max + 2].copy_from_slice(&4095u16.to_le_bytes());
        Self {
            registers: regs,
            error_bits: 0,
            silent: false,
            failing_reads: HashSet::new(),
            failing_writes: HashSet::new(),
            latency: Duration::ZERO,
        }
    }

    fn word(&self, address: u8) -> u16 {
        let a = usize::from(address);
        match self.registers.get(a..a + 2) {
            Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
            _ => 0,
        }
    }

    fn write(&mut self, address: u8, data: &[u8]) -> bool {
        if self.failing_writes.contains(&address) {
            return false;
        }
        let start = usize::from(address);
        let Some(slot) = self.registers.get_mut(start..start + data.len()) else {
            return false;
        };
        slot.copy_from_slice(data);
        let goal = usize::from(registers::GOAL_POSITION);
        if start < goal + 2 && start + data.len() > goal {
            let present = usize::from(registers::PRESENT_POSITION);
            let bytes = [self.registers[goal], self.registers[goal + 1]];
            self.registers[present..present + 2].copy_from_slice(&bytes);
        }
        true
    }

    fn read(&self, address: u8, len: u8) -> Option<Vec<u8>> {
        if self.failing_reads.contains(&address) {
            return None;
        }
        let start = usize::from(address);
        self.registers
            .get(start..start + usize::from(len))
            .map(<[u8]>::to_vec)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A bus full of simulated servos. Clones share state, so a test can keep one handle
/// for fault injection while the mock port answers through another.
#[derive(Clone, Default)]
pub struct SimulatedServos {
    servos: Arc<Mutex<BTreeMap<DeviceId, SimServo>>>,
}

impl SimulatedServos {
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        let servos = ids.into_iter().map(|id| (id, SimServo::new())).collect();
        Self {
            servos: Arc::new(Mutex::new(servos)),
        }
    }

    /// A mock backend whose ports are answered by this simulation.
    pub fn backend(&self) -> MockBackend {
        MockBackend::new(Arc::new(Mutex::new(self.clone())))
    }

    fn with<R>(&self, id: DeviceId, f: impl FnOnce(&mut SimServo) -> R) -> Option<R> {
        lock(&self.servos).get_mut(&id).map(f)
    }

    /// Report `bits` in every status packet from `id` (0 clears).
    pub fn set_error_bits(&self, id: DeviceId, bits: u8) {
        self.with(id, |s| s.error_bits = bits);
    }

    /// Stop answering anything addressed to `id`.
    pub fn set_silent(&self, id: DeviceId, silent: bool) {
        self.with(id, |s| s.silent = silent);
    }

    /// Leave reads of `address` on `id` unanswered.
    pub fn fail_reads(&self, id: DeviceId, address: u8) {
        self.with(id, |s| s.failing_reads.insert(address));
    }

    /// Leave writes starting at `address` on `id` unanswered and unapplied.
    pub fn fail_writes(&self, id: DeviceId, address: u8) {
        self.with(id, |s| s.failing_writes.insert(address));
    }

    /// Delay every reply from `id`, keeping the exchange in flight.
    pub fn set_latency(&self, id: DeviceId, latency: Duration) {
        self.with(id, |s| s.latency = latency);
    }

    pub fn register_byte(&self, id: DeviceId, address: u8) -> Option<u8> {
        self.with(id, |s| s.registers.get(usize::from(address)).copied())
            .flatten()
    }

    pub fn register_word(&self, id: DeviceId, address: u8) -> Option<u16> {
        self.with(id, |s| s.word(address))
    }

    pub fn present_position(&self, id: DeviceId) -> Option<u16> {
        self.register_word(id, registers::PRESENT_POSITION)
    }

    pub fn goal_speed(&self, id: DeviceId) -> Option<u16> {
        self.register_word(id, registers::GOAL_SPEED)
    }

    pub fn torque_enabled(&self, id: DeviceId) -> Option<bool> {
        self.register_byte(id, registers::TORQUE_ENABLE).map(|b| b != 0)
    }

    /// Both angle limits zero.
    pub fn in_wheel_mode(&self, id: DeviceId) -> Option<bool> {
        self.with(id, |s| {
            s.word(registers::MIN_ANGLE_LIMIT) == 0 && s.word(registers::MAX_ANGLE_LIMIT) == 0
        })
    }

    fn answer(&self, request: &[u8]) -> (Option<Vec<u8>>, Duration) {
        let Some((id, instruction, params)) = parse_packet(request) else {
            tracing::debug!("simulator ignoring malformed packet");
            return (None, Duration::ZERO);
        };
        if id == BROADCAST_ID {
            return (None, Duration::ZERO);
        }
        let mut servos = lock(&self.servos);
        let Some(servo) = servos.get_mut(&id) else {
            return (None, Duration::ZERO);
        };
        if servo.silent {
            return (None, servo.latency);
        }
        let reply = match instruction {
            i if i == Instruction::Ping as u8 => Some(Vec::new()),
            i if i == Instruction::Read as u8 => match params {
                [address, len] => servo.read(*address, *len),
                _ => None,
            },
            i if i == Instruction::Write as u8 => match params.split_first() {
                Some((address, data)) if servo.write(*address, data) => Some(Vec::new()),
                _ => None,
            },
            _ => None,
        };
        let packet = reply.map(|data| build_status(id, servo.error_bits, &data));
        (packet, servo.latency)
    }
}

impl Responder for SimulatedServos {
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let (reply, latency) = self.answer(request);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        reply
    }
}
