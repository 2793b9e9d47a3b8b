//! GT06 (Concox) binary protocol.
//!
//! ```text
//! 78 78 <len:u8>  <proto> <content> <serial:u16> <crc:u16> 0D 0A
//! 79 79 <len:u16> <proto> <content> <serial:u16> <crc:u16> 0D 0A
//! ```
//!
//! `len` counts from the protocol byte through the CRC. The CRC is
//! CRC-16/X-25 over everything from the length field through the serial.
//! Devices log in with their IMEI before sending positions.

use crate::checksum::crc16_x25;
use crate::datetime::{YearBase, from_bytes};
use crate::decoder::{DecodeError, DecodeOutcome, Decoded, Decoder, FrameStatus, take_array};
use crate::location::{Position, ProtocolFamily};
use bytes::Buf;

const MAX_FRAME_LEN: usize = 1024;
/// protocol + serial + crc
const MIN_BODY_LEN: usize = 5;
const TRAILER: [u8; 2] = [0x0D, 0x0A];

pub const PROTO_LOGIN: u8 = 0x01;
pub const PROTO_LOCATION: u8 = 0x12;
pub const PROTO_HEARTBEAT: u8 = 0x13;
pub const PROTO_ALARM: u8 = 0x16;
pub const PROTO_LOCATION_EXT: u8 = 0x22;

const COORD_SCALE: f64 = 1_800_000.0;
const FLAG_VALID: u16 = 0x1000;
const FLAG_WEST: u16 = 0x0800;
const FLAG_NORTH: u16 = 0x0400;
const COURSE_MASK: u16 = 0x03FF;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gt06Decoder;

/// Start-marker geometry: (header length including the length field, length width).
fn header(buf: &[u8]) -> Option<(usize, usize)> {
    match buf.first()? {
        0x78 => Some((3, 1)),
        0x79 => Some((4, 2)),
        _ => None,
    }
}

impl Decoder for Gt06Decoder {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Gt06
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        match prefix {
            [first, rest @ ..] if *first == 0x78 || *first == 0x79 => {
                rest.first().is_none_or(|second| second == first)
            }
            _ => false,
        }
    }

    fn extract_frame(&self, buf: &[u8]) -> FrameStatus {
        if !self.matches(buf) {
            return FrameStatus::Invalid;
        }
        let Some((header_len, len_width)) = header(buf) else {
            return FrameStatus::Invalid;
        };
        if buf.len() < header_len {
            return FrameStatus::Incomplete;
        }
        let body_len = match len_width {
            1 => usize::from(buf[2]),
            _ => usize::from(u16::from_be_bytes([buf[2], buf[3]])),
        };
        let total = header_len + body_len + TRAILER.len();
        if body_len < MIN_BODY_LEN || total > MAX_FRAME_LEN {
            return FrameStatus::Invalid;
        }
        if buf.len() < total {
            return FrameStatus::Incomplete;
        }
        if buf[total - 2..total] != TRAILER {
            return FrameStatus::Invalid;
        }
        FrameStatus::Complete(total)
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodeOutcome, DecodeError> {
        let (header_len, _) =
            header(frame).ok_or_else(|| DecodeError::field("start", "not a GT06 frame"))?;
        if frame.len() < header_len + MIN_BODY_LEN + TRAILER.len() {
            return Err(DecodeError::Truncated {
                needed: header_len + MIN_BODY_LEN + TRAILER.len(),
                available: frame.len(),
            });
        }
        let crc_at = frame.len() - TRAILER.len() - 2;
        let expected = u16::from_be_bytes([frame[crc_at], frame[crc_at + 1]]);
        let actual = crc16_x25(&frame[2..crc_at]);
        if expected != actual {
            return Err(DecodeError::Checksum {
                expected: u32::from(expected),
                actual: u32::from(actual),
            });
        }

        let serial_at = crc_at - 2;
        let serial = u16::from_be_bytes([frame[serial_at], frame[serial_at + 1]]);
        let protocol = frame[header_len];
        let content = &frame[header_len + 1..serial_at];

        match protocol {
            PROTO_LOGIN => Ok(DecodeOutcome::new(Decoded::Identification(decode_imei(content)?))
                .with_reply(ack(protocol, serial))),
            PROTO_HEARTBEAT => {
                Ok(DecodeOutcome::new(Decoded::Keepalive).with_reply(ack(protocol, serial)))
            }
            PROTO_LOCATION | PROTO_LOCATION_EXT => Ok(DecodeOutcome::new(Decoded::Positions {
                device_id: None,
                positions: vec![decode_gps(content)?],
            })),
            PROTO_ALARM => Ok(DecodeOutcome::new(Decoded::Positions {
                device_id: None,
                positions: vec![decode_gps(content)?],
            })
            .with_reply(ack(protocol, serial))),
            other => Err(DecodeError::Unsupported(format!(
                "GT06 protocol number {other:#04x}"
            ))),
        }
    }

    fn requires_identification(&self) -> bool {
        true
    }
}

/// Eight BCD bytes, left-padded with one zero nibble to 16 digits.
fn decode_imei(mut content: &[u8]) -> Result<String, DecodeError> {
    let bcd = take_array::<8>(&mut content)?;
    let mut digits = String::with_capacity(16);
    for b in bcd {
        for nibble in [b >> 4, b & 0x0F] {
            if nibble > 9 {
                return Err(DecodeError::field("imei", format!("non-BCD byte {b:#04x}")));
            }
            digits.push(char::from(b'0' + nibble));
        }
    }
    Ok(digits.split_off(1))
}

fn decode_gps(mut content: &[u8]) -> Result<Position, DecodeError> {
    let timestamp = from_bytes(take_array::<6>(&mut content)?, YearBase::Add2000)?;
    let satellites = content.try_get_u8()? & 0x0F;
    let mut latitude = f64::from(content.try_get_u32()?) / COORD_SCALE;
    let mut longitude = f64::from(content.try_get_u32()?) / COORD_SCALE;
    let speed = content.try_get_u8()?;
    let flags = content.try_get_u16()?;

    if flags & FLAG_NORTH == 0 {
        latitude = -latitude;
    }
    if flags & FLAG_WEST != 0 {
        longitude = -longitude;
    }

    Ok(Position::builder(timestamp, latitude, longitude)
        .valid(flags & FLAG_VALID != 0)
        .satellites(satellites)
        .speed(f64::from(speed))
        .heading(f64::from(flags & COURSE_MASK))
        .build()?)
}

/// Short-form acknowledgement echoing the protocol number and serial.
pub fn ack(protocol: u8, serial: u16) -> Vec<u8> {
    let [s0, s1] = serial.to_be_bytes();
    let mut out = vec![0x78, 0x78, 0x05, protocol, s0, s1];
    let crc = crc16_x25(&out[2..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&TRAILER);
    out
}
