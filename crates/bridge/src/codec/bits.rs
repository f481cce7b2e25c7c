//! Bit access for the controller's packed encodings.
//!
//! Station bitmaps are sent as one byte per board. Station `i` lives at
//! bit `i % 8` of byte `i / 8`, least significant bit first, which is how the
//! firmware builds them (`bitmap[board] += 1 << line`).

/// Number of stations on one board (one bitmap byte).
pub const STATIONS_PER_BOARD: usize = 8;

/// Test the bit for `global_index` in a byte-per-board bitmap.
///
/// An index past the end of the bitmap reads as clear; firmware versions
/// disagree on how many boards they report, so short arrays are normal.
pub fn test_bit(bitmap: &[u8], global_index: usize) -> bool {
    let byte_idx = global_index / STATIONS_PER_BOARD;
    let bit_pos = global_index % STATIONS_PER_BOARD;
    match bitmap.get(byte_idx) {
        Some(byte) => (byte >> bit_pos) & 1 == 1,
        None => false,
    }
}

/// Extract `mask` from `value` after shifting right by `shift`.
pub fn bit_field(value: u16, shift: u8, mask: u16) -> u16 {
    (value >> shift) & mask
}

/// Single-bit flag at position `bit`.
pub fn bit_flag(value: u16, bit: u8) -> bool {
    bit_field(value, bit, 1) == 1
}
