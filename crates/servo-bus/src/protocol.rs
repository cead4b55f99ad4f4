//! Fixed constants of the Feetech SCS/STS request/response register protocol.
//!
//! Packet format: `[0xFF, 0xFF, id, length, instruction | error, params..., checksum]`

use core::fmt;

pub const HEADER: [u8; 2] = [0xFF, 0xFF];
pub const BROADCAST_ID: u8 = 0xFE;
pub const MAX_ID: u8 = 0xFC;

/// Fixed bus speed of the controller board.
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// End-marker 1 selects big-endian word order on the wire (SCS).
pub const DEFAULT_PROTOCOL_END: u8 = 1;

pub const TX_PACKET_MAX_LEN: usize = 250;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register addresses with their byte widths.
pub mod registers {
    /// Minimum angle limit (2 bytes). Zero together with max disables position limits.
    pub const MIN_ANGLE_LIMIT: u8 = 9;
    /// Maximum angle limit (2 bytes).
    pub const MAX_ANGLE_LIMIT: u8 = 11;
    /// Torque enable (1 byte).
    pub const TORQUE_ENABLE: u8 = 40;
    /// Goal acceleration (1 byte).
    pub const GOAL_ACC: u8 = 41;
    /// Goal position (2 bytes, written as 4 together with goal time).
    pub const GOAL_POSITION: u8 = 42;
    /// Goal speed (2 bytes).
    pub const GOAL_SPEED: u8 = 46;
    /// Present position (2 bytes, read as 4 together with present speed).
    pub const PRESENT_POSITION: u8 = 56;
}

/// Hardware error flags carried in the status packet's error byte.
pub mod errbits {
    pub const VOLTAGE: u8 = 1;
    pub const ANGLE: u8 = 2;
    pub const OVERHEAT: u8 = 4;
    pub const OVERCURRENT: u8 = 8;
    pub const OVERLOAD: u8 = 32;
}

/// Outcome of one request/response exchange at the transport level.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommResult {
    Success,
    PortBusy,
    TxFail,
    RxFail,
    TxError,
    RxWaiting,
    RxTimeout,
    RxCorrupt,
    NotAvailable,
}

impl CommResult {
    pub fn code(self) -> i32 {
        match self {
            CommResult::Success => 0,
            CommResult::PortBusy => -1,
            CommResult::TxFail => -2,
            CommResult::RxFail => -3,
            CommResult::TxError => -4,
            CommResult::RxWaiting => -5,
            CommResult::RxTimeout => -6,
            CommResult::RxCorrupt => -7,
            CommResult::NotAvailable => -9,
        }
    }

    pub fn is_success(self) -> bool {
        self == CommResult::Success
    }
}

impl fmt::Display for CommResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
