//! Bus checksum.
//!
//! A bit-serial, reflected CRC32 over polynomial 0x04C11DB7 with a zero seed and
//! no final XOR. This is not the common CRC-32, devices compute exactly this.

pub const CRC32_POLY: u32 = 0x04C1_1DB7;

/// Fold a single byte into a running checksum
pub fn crc32_step(crc: u32, byte: u8) -> u32 {
    let mut crc = crc ^ byte as u32;
    for _ in 0..8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ CRC32_POLY;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// Compute the checksum of a buffer
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0, |crc, b| crc32_step(crc, *b))
}
