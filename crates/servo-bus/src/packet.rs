//! Request/response packet handling over a [`SerialBus`].
//!
//! Each call performs exactly one exchange: clear stale input, write the request, read the
//! status packet back. Multi-byte register values are split into bytes according to the
//! protocol end-marker (0 = little-endian words, 1 = big-endian words).

use crate::protocol::{CommResult, Instruction, BROADCAST_ID, HEADER, TX_PACKET_MAX_LEN};
use serial_transport::{SerialBus, TransportError};

/// Status of a write exchange: transport result plus the servo's error byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Reply {
    pub result: CommResult,
    pub error: u8,
}

/// Status of a read exchange, with the register value assembled per the end-marker.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReadReply {
    pub value: u32,
    pub result: CommResult,
    pub error: u8,
}

fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build a request packet: header, id, length, instruction, params, checksum.
pub fn build_request(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    build(id, instruction as u8, params)
}

/// Build a status packet as a servo would send it. Used by the simulator and tests.
pub fn build_status(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
    build(id, error, params)
}

fn build(id: u8, code: u8, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8;
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(code);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// A parsed packet: id, instruction or error code, params. `None` when malformed.
pub fn parse_packet(packet: &[u8]) -> Option<(u8, u8, &[u8])> {
    if packet.len() < 6 || packet[..2] != HEADER {
        return None;
    }
    let length = usize::from(packet[3]);
    if length < 2 || packet.len() != 4 + length {
        return None;
    }
    let (body, chk) = packet[2..].split_at(packet.len() - 3);
    if checksum(body) != chk[0] {
        return None;
    }
    Some((packet[2], packet[4], &packet[5..packet.len() - 1]))
}

#[derive(Debug, Clone, Copy)]
pub struct PacketHandler {
    protocol_end: u8,
    read_timeout_ms: u64,
}

impl PacketHandler {
    pub fn new(protocol_end: u8, read_timeout_ms: u64) -> Self {
        Self {
            protocol_end,
            read_timeout_ms,
        }
    }

    pub fn protocol_end(&self) -> u8 {
        self.protocol_end
    }

    fn lobyte(&self, w: u16) -> u8 {
        if self.protocol_end == 0 {
            (w & 0xFF) as u8
        } else {
            (w >> 8) as u8
        }
    }

    fn hibyte(&self, w: u16) -> u8 {
        if self.protocol_end == 0 {
            (w >> 8) as u8
        } else {
            (w & 0xFF) as u8
        }
    }

    fn make_word(&self, a: u8, b: u8) -> u16 {
        if self.protocol_end == 0 {
            u16::from(a) | (u16::from(b) << 8)
        } else {
            (u16::from(a) << 8) | u16::from(b)
        }
    }

    fn make_dword(lo: u16, hi: u16) -> u32 {
        u32::from(lo) | (u32::from(hi) << 16)
    }

    /// One full exchange. Returns the status params (without error byte and checksum).
    fn tx_rx(&self, port: &mut dyn SerialBus, id: u8, request: &[u8]) -> (Vec<u8>, CommResult, u8) {
        if request.len() > TX_PACKET_MAX_LEN {
            return (Vec::new(), CommResult::TxError, 0);
        }
        if !port.is_open() {
            return (Vec::new(), CommResult::NotAvailable, 0);
        }
        if let Err(e) = port.clear_input() {
            tracing::debug!(servo = id, error = %e, "clearing stale input failed");
        }
        if let Err(e) = port.write_all(request) {
            tracing::debug!(servo = id, error = %e, "request write failed");
            return (Vec::new(), CommResult::TxFail, 0);
        }
        if id == BROADCAST_ID {
            return (Vec::new(), CommResult::Success, 0);
        }

        let mut header = [0u8; 4];
        if let Err(e) = port.read_exact(&mut header, self.read_timeout_ms) {
            return (Vec::new(), rx_failure(&e), 0);
        }
        if header[..2] != HEADER || header[2] != id || header[3] < 2 {
            return (Vec::new(), CommResult::RxCorrupt, 0);
        }
        let mut rest = vec![0u8; usize::from(header[3])];
        if let Err(e) = port.read_exact(&mut rest, self.read_timeout_ms) {
            return (Vec::new(), rx_failure(&e), 0);
        }
        let mut packet = header.to_vec();
        packet.extend_from_slice(&rest);
        match parse_packet(&packet) {
            Some((_, error, params)) => (params.to_vec(), CommResult::Success, error),
            None => (Vec::new(), CommResult::RxCorrupt, 0),
        }
    }

    pub fn ping(&self, port: &mut dyn SerialBus, id: u8) -> Reply {
        let request = build_request(id, Instruction::Ping, &[]);
        let (_, result, error) = self.tx_rx(port, id, &request);
        Reply { result, error }
    }

    fn write(&self, port: &mut dyn SerialBus, id: u8, address: u8, data: &[u8]) -> Reply {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(address);
        params.extend_from_slice(data);
        let request = build_request(id, Instruction::Write, &params);
        let (_, result, error) = self.tx_rx(port, id, &request);
        Reply { result, error }
    }

    fn read(&self, port: &mut dyn SerialBus, id: u8, address: u8, len: u8) -> (Vec<u8>, Reply) {
        let request = build_request(id, Instruction::Read, &[address, len]);
        let (data, result, error) = self.tx_rx(port, id, &request);
        if result.is_success() && data.len() != usize::from(len) {
            return (data, Reply {
                result: CommResult::RxCorrupt,
                error,
            });
        }
        (data, Reply { result, error })
    }

    pub fn write1(&self, port: &mut dyn SerialBus, id: u8, address: u8, value: u8) -> Reply {
        self.write(port, id, address, &[value])
    }

    pub fn write2(&self, port: &mut dyn SerialBus, id: u8, address: u8, value: u16) -> Reply {
        let data = [self.lobyte(value), self.hibyte(value)];
        self.write(port, id, address, &data)
    }

    pub fn write4(&self, port: &mut dyn SerialBus, id: u8, address: u8, value: u32) -> Reply {
        let lo = (value & 0xFFFF) as u16;
        let hi = (value >> 16) as u16;
        let data = [
            self.lobyte(lo),
            self.hibyte(lo),
            self.lobyte(hi),
            self.hibyte(hi),
        ];
        self.write(port, id, address, &data)
    }

    pub fn read1(&self, port: &mut dyn SerialBus, id: u8, address: u8) -> ReadReply {
        let (data, reply) = self.read(port, id, address, 1);
        let value = if reply.result.is_success() { u32::from(data[0]) } else { 0 };
        ReadReply {
            value,
            result: reply.result,
            error: reply.error,
        }
    }

    pub fn read2(&self, port: &mut dyn SerialBus, id: u8, address: u8) -> ReadReply {
        let (data, reply) = self.read(port, id, address, 2);
        let value = if reply.result.is_success() {
            u32::from(self.make_word(data[0], data[1]))
        } else {
            0
        };
        ReadReply {
            value,
            result: reply.result,
            error: reply.error,
        }
    }

    pub fn read4(&self, port: &mut dyn SerialBus, id: u8, address: u8) -> ReadReply {
        let (data, reply) = self.read(port, id, address, 4);
        let value = if reply.result.is_success() {
            Self::make_dword(
                self.make_word(data[0], data[1]),
                self.make_word(data[2], data[3]),
            )
        } else {
            0
        };
        ReadReply {
            value,
            result: reply.result,
            error: reply.error,
        }
    }
}

fn rx_failure(e: &TransportError) -> CommResult {
    match e {
        TransportError::Timeout { .. } => CommResult::RxTimeout,
        TransportError::NotOpen => CommResult::NotAvailable,
        _ => CommResult::RxFail,
    }
}
