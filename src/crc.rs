//! Modbus CRC16 checksum.
//!
//! Reflected polynomial `0xA001`, initial value `0xFFFF`, least-significant bit
//! first. The checksum is transmitted little-endian at the end of every RTU frame.

use crc::{Crc, CRC_16_MODBUS};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Computes the Modbus CRC16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Returns `frame` with its CRC16 trailer appended in little-endian order.
pub fn append_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Checks the trailing two bytes of `frame` against the CRC16 of the rest.
///
/// Frames shorter than three bytes can not carry a checksum and never match.
pub fn crc_matches(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([trailer[0], trailer[1]])
}
