//! Pure register value encoders. No I/O happens here; out-of-range inputs are clamped,
//! never rejected.

/// Highest position a positional servo accepts (12-bit encoder).
pub const POSITION_MAX: u16 = 4095;
/// Highest speed magnitude, for both the positional speed limit and wheel speed.
pub const SPEED_MAX: u16 = 2000;
pub const ACCELERATION_MAX: u8 = 254;

/// Direction flag of a wheel speed word.
pub const SPEED_SIGN_BIT: u16 = 1 << 15;
const SPEED_MAGNITUDE_MASK: u16 = 0x07FF;

/// Clamp to `[0, 4095]` and swap the two bytes of the 16-bit word.
///
/// The packet layer serializes words high byte first while the servo stores the goal
/// position low byte first, so the word is pre-swapped here.
pub fn encode_position(value: i32) -> u16 {
    let clamped = value.clamp(0, i32::from(POSITION_MAX)) as u16;
    clamped.swap_bytes()
}

/// Undo the byte swap on the low 16 bits of a raw present-position read.
pub fn decode_position(raw: u32) -> u16 {
    (raw as u16).swap_bytes()
}

/// Signed wheel speed: magnitude (max 2000) in the low 11 bits, sign in bit 15.
pub fn encode_speed(value: i32) -> u16 {
    let magnitude = value.unsigned_abs().min(u32::from(SPEED_MAX)) as u16 & SPEED_MAGNITUDE_MASK;
    if value < 0 && magnitude != 0 {
        magnitude | SPEED_SIGN_BIT
    } else {
        magnitude
    }
}

pub fn decode_speed(raw: u16) -> i32 {
    let magnitude = i32::from(raw & SPEED_MAGNITUDE_MASK);
    if raw & SPEED_SIGN_BIT != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Unsigned speed limit used in positional mode.
pub fn encode_speed_limit(value: i32) -> u16 {
    value.clamp(0, i32::from(SPEED_MAX)) as u16
}

pub fn encode_acceleration(value: i32) -> u8 {
    value.clamp(0, i32::from(ACCELERATION_MAX)) as u8
}

/// Put a 16-bit register value into the order the packet layer needs so that it lands
/// low byte first in the servo. End-marker 1 serializes high byte first, so the word is
/// swapped; end-marker 0 already matches.
pub fn register_word(value: u16, protocol_end: u8) -> u16 {
    if protocol_end == 0 {
        value
    } else {
        value.swap_bytes()
    }
}

/// Map a unit-interval fraction onto the position range. NaN maps to 0.
pub fn position_from_fraction(fraction: f32) -> i32 {
    if fraction.is_nan() {
        return 0;
    }
    (fraction.clamp(0.0, 1.0) * f32::from(POSITION_MAX)).round() as i32
}
