//! CRC16 checksum used by the device firmware.
//!
//! Polynomial 0x8005 (reflected as 0xA001), initial value 0xFFFF, no final
//! XOR. The firmware computes it with a 16-entry table, one nibble at a time,
//! low nibble first; this implementation follows the same steps so the
//! results are bit-identical.

/// Nibble lookup table for the reflected 0x8005 polynomial.
const CRC16_NIBBLE_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// Seed value of the running accumulator.
pub const CRC16_INIT: u16 = 0xFFFF;

/// Compute the frame checksum over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC16_INIT, |crc, &byte| {
        let crc = CRC16_NIBBLE_TABLE[usize::from((crc ^ u16::from(byte)) & 0x0F)] ^ (crc >> 4);
        CRC16_NIBBLE_TABLE[usize::from((crc ^ u16::from(byte >> 4)) & 0x0F)] ^ (crc >> 4)
    })
}
