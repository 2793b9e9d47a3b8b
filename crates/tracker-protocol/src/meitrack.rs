//! Meitrack ASCII protocol.
//!
//! ```text
//! $$<flag><len>,<imei>,<cmd>,<field>,...,*<CS>\r\n
//! ```
//!
//! `<len>` counts bytes from the first comma through the trailing `\r\n`.
//! `<CS>` is two hex digits: the modulo-256 sum of every byte from `$$`
//! through `*`. Every message carries the IMEI, so no login is needed.

use crate::checksum::sum8;
use crate::datetime::parse_yymmddhhmmss;
use crate::decoder::{DecodeError, DecodeOutcome, Decoded, Decoder, FrameStatus};
use crate::location::{Position, ProtocolFamily};

const MAX_FRAME_LEN: usize = 1024;
const MAX_LEN_DIGITS: usize = 4;
/// `$$` + flag
const HEADER_LEN: usize = 3;

// AAA field positions, counted from the IMEI.
const AAA_FIELD_COUNT: usize = 14;
const F_LAT: usize = 3;
const F_LON: usize = 4;
const F_TIME: usize = 5;
const F_STATUS: usize = 6;
const F_SATS: usize = 7;
const F_GSM: usize = 8;
const F_SPEED: usize = 9;
const F_HEADING: usize = 10;
const F_HDOP: usize = 11;
const F_ALTITUDE: usize = 12;
const F_MILEAGE: usize = 13;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeitrackDecoder;

impl Decoder for MeitrackDecoder {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Meitrack
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        if prefix.is_empty() {
            return false;
        }
        let magic = prefix.len().min(2);
        if prefix[..magic] != b"$$"[..magic] {
            return false;
        }
        prefix.get(2).is_none_or(u8::is_ascii_alphabetic)
    }

    fn extract_frame(&self, buf: &[u8]) -> FrameStatus {
        if !self.matches(buf) {
            return FrameStatus::Invalid;
        }
        let search_end = buf.len().min(HEADER_LEN + MAX_LEN_DIGITS + 1);
        let comma = match buf[..search_end].iter().position(|&b| b == b',') {
            Some(i) => i,
            None => {
                let digits = buf.get(HEADER_LEN..).unwrap_or_default();
                if digits.iter().all(u8::is_ascii_digit) && digits.len() <= MAX_LEN_DIGITS {
                    return FrameStatus::Incomplete;
                }
                return FrameStatus::Invalid;
            }
        };
        let digits = &buf[HEADER_LEN.min(comma)..comma];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return FrameStatus::Invalid;
        }
        let len: usize = digits
            .iter()
            .fold(0, |acc, d| acc * 10 + usize::from(d - b'0'));
        let total = comma + len;
        // shortest body: ",*CS\r\n"
        if len < 6 || total > MAX_FRAME_LEN {
            return FrameStatus::Invalid;
        }
        if buf.len() < total {
            return FrameStatus::Incomplete;
        }
        if &buf[total - 2..total] != b"\r\n" {
            return FrameStatus::Invalid;
        }
        FrameStatus::Complete(total)
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodeOutcome, DecodeError> {
        let body = frame
            .strip_suffix(b"\r\n")
            .ok_or_else(|| DecodeError::field("terminator", "missing CRLF"))?;
        let star = body
            .iter()
            .rposition(|&b| b == b'*')
            .ok_or_else(|| DecodeError::field("checksum", "missing '*'"))?;
        let cs_text = std::str::from_utf8(&body[star + 1..])
            .map_err(|_| DecodeError::field("checksum", "not ASCII"))?;
        if cs_text.len() != 2 {
            return Err(DecodeError::field("checksum", format!("{cs_text:?}")));
        }
        let expected = u8::from_str_radix(cs_text, 16)
            .map_err(|_| DecodeError::field("checksum", format!("{cs_text:?}")))?;
        let actual = sum8(&body[..=star]);
        if expected != actual {
            return Err(DecodeError::Checksum {
                expected: u32::from(expected),
                actual: u32::from(actual),
            });
        }

        let comma = body
            .iter()
            .position(|&b| b == b',')
            .filter(|&c| c < star)
            .ok_or_else(|| DecodeError::field("header", "missing length"))?;
        let text = std::str::from_utf8(&body[comma + 1..star])
            .map_err(|_| DecodeError::field("payload", "not UTF-8"))?;
        let fields: Vec<&str> = text.split(',').collect();

        let imei = fields.first().copied().unwrap_or_default();
        if imei.is_empty() {
            return Err(DecodeError::field("imei", "empty"));
        }
        let command = fields.get(1).copied().unwrap_or_default();

        // Only AAA carries a fix; anything else still tells us who is talking.
        let positions = if command == "AAA" {
            vec![decode_aaa(&fields)?]
        } else {
            Vec::new()
        };
        Ok(DecodeOutcome::new(Decoded::Positions {
            device_id: Some(imei.to_owned()),
            positions,
        }))
    }
}

fn decode_aaa(fields: &[&str]) -> Result<Position, DecodeError> {
    if fields.len() < AAA_FIELD_COUNT {
        return Err(DecodeError::field(
            "AAA",
            format!("expected {AAA_FIELD_COUNT} fields, got {}", fields.len()),
        ));
    }
    let timestamp = parse_yymmddhhmmss(fields[F_TIME])?;
    let latitude = required::<f64>("latitude", fields[F_LAT])?;
    let longitude = required::<f64>("longitude", fields[F_LON])?;

    let mut builder = Position::builder(timestamp, latitude, longitude)
        .valid(fields[F_STATUS] == "A")
        .speed(optional::<f64>("speed", fields[F_SPEED])?.unwrap_or(0.0));
    if let Some(sats) = optional("satellites", fields[F_SATS])? {
        builder = builder.satellites(sats);
    }
    if let Some(gsm) = optional("gsm", fields[F_GSM])? {
        builder = builder.gsm_signal(gsm);
    }
    if let Some(heading) = optional("heading", fields[F_HEADING])? {
        builder = builder.heading(heading);
    }
    if let Some(hdop) = optional("hdop", fields[F_HDOP])? {
        builder = builder.hdop(hdop);
    }
    if let Some(altitude) = optional("altitude", fields[F_ALTITUDE])? {
        builder = builder.altitude(altitude);
    }
    if let Some(mileage) = optional("mileage", fields[F_MILEAGE])? {
        builder = builder.odometer(mileage);
    }
    Ok(builder.build()?)
}

fn required<T: std::str::FromStr>(field: &'static str, s: &str) -> Result<T, DecodeError> {
    s.parse()
        .map_err(|_| DecodeError::field(field, format!("{s:?}")))
}

fn optional<T: std::str::FromStr>(field: &'static str, s: &str) -> Result<Option<T>, DecodeError> {
    if s.is_empty() {
        Ok(None)
    } else {
        required(field, s).map(Some)
    }
}
