//! Checksums used by the supported wire protocols.

use crc::{CRC_16_ARC, CRC_16_IBM_SDLC, Crc};

const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);
const ARC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Modulo-256 sum of all bytes.
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// CRC-16/X-25 (CRC-ITU), used by GT06.
pub fn crc16_x25(data: &[u8]) -> u16 {
    X25.checksum(data)
}

/// CRC-16/ARC (IBM), used by Teltonika.
pub fn crc16_arc(data: &[u8]) -> u16 {
    ARC.checksum(data)
}
