//! Teltonika binary protocol over TCP, codecs 8 and 8 Extended.
//!
//! A connection opens with an IMEI handshake, `<len:u16><ascii digits>`,
//! answered with a single `0x01`. Every following packet is an AVL frame:
//!
//! ```text
//! 00 00 00 00 <data_len:u32> <codec> <n> <record>... <n> <crc:u32>
//! ```
//!
//! The CRC is CRC-16/ARC over the data field (codec through the trailing
//! record count), stored in the low half of the `u32`. The server answers
//! with the record count as a big-endian `u32`.

use crate::checksum::crc16_arc;
use crate::datetime::from_unix_millis;
use crate::decoder::{DecodeError, DecodeOutcome, Decoded, Decoder, FrameStatus, take};
use crate::location::{Position, ProtocolFamily};
use bytes::Buf;

pub const CODEC_8: u8 = 0x08;
pub const CODEC_8E: u8 = 0x8E;

const MAX_IMEI_LEN: usize = 17;
const MAX_DATA_LEN: usize = 16 * 1024;
/// preamble + data length
const AVL_HEADER_LEN: usize = 8;
const CRC_LEN: usize = 4;
const COORD_SCALE: f64 = 10_000_000.0;

pub const IO_ODOMETER: u16 = 16;
pub const IO_GSM_SIGNAL: u16 = 21;
pub const IO_HDOP: u16 = 182;

#[derive(Debug, Clone, Copy, Default)]
pub struct TeltonikaDecoder;

impl Decoder for TeltonikaDecoder {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Teltonika
    }

    /// Either an AVL preamble of four zero bytes or a handshake length of
    /// at most [`MAX_IMEI_LEN`] followed by ASCII digits.
    fn matches(&self, prefix: &[u8]) -> bool {
        match prefix {
            [0x00] => true,
            [0x00, 0x00, rest @ ..] => rest.iter().take(2).all(|&b| b == 0),
            [0x00, len, digits @ ..] if usize::from(*len) <= MAX_IMEI_LEN => digits
                .iter()
                .take(usize::from(*len))
                .all(u8::is_ascii_digit),
            _ => false,
        }
    }

    fn extract_frame(&self, buf: &[u8]) -> FrameStatus {
        if !self.matches(buf) {
            return FrameStatus::Invalid;
        }
        let Some(&second) = buf.get(1) else {
            return FrameStatus::Incomplete;
        };
        if second != 0 {
            return extract_imei(buf, usize::from(second));
        }
        if buf.len() < AVL_HEADER_LEN {
            return FrameStatus::Incomplete;
        }
        let data_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        // codec + two record counts at minimum
        if !(3..=MAX_DATA_LEN).contains(&data_len) {
            return FrameStatus::Invalid;
        }
        let total = AVL_HEADER_LEN + data_len + CRC_LEN;
        if buf.len() < total {
            FrameStatus::Incomplete
        } else {
            FrameStatus::Complete(total)
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodeOutcome, DecodeError> {
        if frame.len() >= AVL_HEADER_LEN && frame[..4] == [0, 0, 0, 0] {
            decode_avl(frame)
        } else {
            decode_imei(frame)
        }
    }

    fn requires_identification(&self) -> bool {
        true
    }
}

/// Handshake framing once `matches` has vetted the length and digits seen so far.
fn extract_imei(buf: &[u8], len: usize) -> FrameStatus {
    if buf.len() < 2 + len {
        FrameStatus::Incomplete
    } else {
        FrameStatus::Complete(2 + len)
    }
}

fn decode_imei(mut frame: &[u8]) -> Result<DecodeOutcome, DecodeError> {
    let len = usize::from(frame.try_get_u16()?);
    let digits = take(&mut frame, len)?;
    if len == 0 || len > MAX_IMEI_LEN || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::field("imei", format!("{digits:?}")));
    }
    let imei = String::from_utf8_lossy(digits).into_owned();
    Ok(DecodeOutcome::new(Decoded::Identification(imei)).with_reply(vec![0x01]))
}

fn decode_avl(mut frame: &[u8]) -> Result<DecodeOutcome, DecodeError> {
    take(&mut frame, 4)?;
    let data_len = frame.try_get_u32()? as usize;
    let mut data = take(&mut frame, data_len)?;
    let expected = frame.try_get_u32()?;
    let actual = u32::from(crc16_arc(data));
    if expected != actual {
        return Err(DecodeError::Checksum { expected, actual });
    }

    let codec = data.try_get_u8()?;
    if codec != CODEC_8 && codec != CODEC_8E {
        return Err(DecodeError::Unsupported(format!("Teltonika codec {codec:#04x}")));
    }
    let count = data.try_get_u8()?;
    let mut positions = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        positions.push(decode_record(&mut data, codec == CODEC_8E)?);
    }
    let trailing = data.try_get_u8()?;
    if trailing != count {
        return Err(DecodeError::field(
            "record count",
            format!("header says {count}, trailer says {trailing}"),
        ));
    }
    if data.has_remaining() {
        return Err(DecodeError::field(
            "data",
            format!("{} unexpected trailing bytes", data.remaining()),
        ));
    }

    Ok(DecodeOutcome::new(Decoded::Positions {
        device_id: None,
        positions,
    })
    .with_reply(u32::from(count).to_be_bytes().to_vec()))
}

fn decode_record(buf: &mut &[u8], extended: bool) -> Result<Position, DecodeError> {
    let timestamp = from_unix_millis(buf.try_get_u64()?)?;
    let _priority = buf.try_get_u8()?;
    let longitude = f64::from(buf.try_get_i32()?) / COORD_SCALE;
    let latitude = f64::from(buf.try_get_i32()?) / COORD_SCALE;
    let altitude = buf.try_get_i16()?;
    let angle = buf.try_get_u16()?;
    let satellites = buf.try_get_u8()?;
    let speed = buf.try_get_u16()?;

    let mut builder = Position::builder(timestamp, latitude, longitude)
        .valid(satellites > 0)
        .altitude(f64::from(altitude))
        .heading(f64::from(angle))
        .satellites(satellites)
        .speed(f64::from(speed));

    for (id, value) in read_io(buf, extended)? {
        match id {
            IO_ODOMETER => builder = builder.odometer(value),
            IO_GSM_SIGNAL => {
                if let Ok(signal) = i16::try_from(value) {
                    builder = builder.gsm_signal(signal);
                }
            }
            IO_HDOP => builder = builder.hdop(value as f64 / 10.0),
            _ => {}
        }
    }
    Ok(builder.build()?)
}

/// Fixed-width IO elements as `(id, value)`. Variable-length (8E only)
/// elements are skipped.
fn read_io(buf: &mut &[u8], extended: bool) -> Result<Vec<(u16, u64)>, DecodeError> {
    let _event_id = read_id(buf, extended)?;
    let _total = read_count(buf, extended)?;
    let mut elements = Vec::new();
    for width in [1usize, 2, 4, 8] {
        for _ in 0..read_count(buf, extended)? {
            let id = read_id(buf, extended)?;
            let value = match width {
                1 => u64::from(buf.try_get_u8()?),
                2 => u64::from(buf.try_get_u16()?),
                4 => u64::from(buf.try_get_u32()?),
                _ => buf.try_get_u64()?,
            };
            elements.push((id, value));
        }
    }
    if extended {
        for _ in 0..buf.try_get_u16()? {
            let _id = buf.try_get_u16()?;
            let len = usize::from(buf.try_get_u16()?);
            take(buf, len)?;
        }
    }
    Ok(elements)
}

fn read_count(buf: &mut &[u8], extended: bool) -> Result<usize, DecodeError> {
    if extended {
        Ok(usize::from(buf.try_get_u16()?))
    } else {
        Ok(usize::from(buf.try_get_u8()?))
    }
}

fn read_id(buf: &mut &[u8], extended: bool) -> Result<u16, DecodeError> {
    if extended {
        Ok(buf.try_get_u16()?)
    } else {
        Ok(u16::from(buf.try_get_u8()?))
    }
}
