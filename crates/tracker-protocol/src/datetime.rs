//! Date/time normalization for device wire formats.
//!
//! Trackers encode timestamps in a handful of incompatible ways: decimal digit
//! groups in varying orders, hexadecimal groups, one raw byte per field, BCD
//! bytes, or epoch milliseconds. Every function here is pure and returns a UTC
//! instant with millisecond precision, or a [`DateTimeError`] when a field is
//! malformed or the resulting date does not exist.
//!
//! Two-digit years are never guessed: the caller states the [`YearBase`]
//! according to the width of the field on the wire.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateTimeError {
    /// A field was empty, non-numeric, or had the wrong width.
    #[error("malformed {field} field: {value:?}")]
    Format { field: &'static str, value: String },
    /// Every field parsed but the combination is not a real instant.
    #[error("invalid date/time: {0}")]
    Invalid(String),
}

fn format_err(field: &'static str, value: &str) -> DateTimeError {
    DateTimeError::Format {
        field,
        value: value.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Field groups
// ---------------------------------------------------------------------------

/// How the year field maps onto a calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearBase {
    /// Two-digit year, offset into the 2000s (`21` is 2021).
    Add2000,
    /// The year is already absolute (`2021` is 2021).
    Absolute,
}

/// Textual date/time fields as cut out of a message.
#[derive(Debug, Clone, Copy)]
pub struct DateFields<'a> {
    pub year: &'a str,
    pub month: &'a str,
    pub day: &'a str,
    pub hour: &'a str,
    pub minute: &'a str,
    pub second: &'a str,
    pub millis: Option<&'a str>,
}

impl<'a> DateFields<'a> {
    pub fn new(
        year: &'a str,
        month: &'a str,
        day: &'a str,
        hour: &'a str,
        minute: &'a str,
        second: &'a str,
    ) -> Self {
        DateFields {
            year,
            month,
            day,
            hour,
            minute,
            second,
            millis: None,
        }
    }

    pub fn with_millis(mut self, millis: &'a str) -> Self {
        self.millis = Some(millis);
        self
    }
}

// ---------------------------------------------------------------------------
// Generic conversions
// ---------------------------------------------------------------------------

/// Build a timestamp from decimal digit groups.
///
/// With [`YearBase::Add2000`] the year must have at most two digits; with
/// [`YearBase::Absolute`] it must have exactly four.
pub fn from_decimal(fields: &DateFields<'_>, base: YearBase) -> Result<DateTime<Utc>, DateTimeError> {
    let year_width = match base {
        YearBase::Add2000 => 1..=2,
        YearBase::Absolute => 4..=4,
    };
    let year = parse_number("year", fields.year, 10, year_width)?;
    let millis = match fields.millis {
        Some(m) => parse_number("millis", m, 10, 1..=3)?,
        None => 0,
    };
    assemble(
        apply_base(year, base),
        parse_number("month", fields.month, 10, 1..=2)?,
        parse_number("day", fields.day, 10, 1..=2)?,
        parse_number("hour", fields.hour, 10, 1..=2)?,
        parse_number("minute", fields.minute, 10, 1..=2)?,
        parse_number("second", fields.second, 10, 1..=2)?,
        millis,
    )
}

/// Build a timestamp from hexadecimal digit groups (`"15"` is 21).
pub fn from_hex(fields: &DateFields<'_>, base: YearBase) -> Result<DateTime<Utc>, DateTimeError> {
    let year_width = match base {
        YearBase::Add2000 => 1..=2,
        YearBase::Absolute => 1..=4,
    };
    let year = parse_number("year", fields.year, 16, year_width)?;
    let millis = match fields.millis {
        Some(m) => parse_number("millis", m, 16, 1..=3)?,
        None => 0,
    };
    assemble(
        apply_base(year, base),
        parse_number("month", fields.month, 16, 1..=2)?,
        parse_number("day", fields.day, 16, 1..=2)?,
        parse_number("hour", fields.hour, 16, 1..=2)?,
        parse_number("minute", fields.minute, 16, 1..=2)?,
        parse_number("second", fields.second, 16, 1..=2)?,
        millis,
    )
}

/// Build a timestamp from six raw bytes, one per field, in
/// year-month-day-hour-minute-second order.
pub fn from_bytes(bytes: [u8; 6], base: YearBase) -> Result<DateTime<Utc>, DateTimeError> {
    let [y, mo, d, h, mi, s] = bytes.map(u32::from);
    assemble(apply_base(y, base), mo, d, h, mi, s, 0)
}

/// Build a timestamp from six BCD bytes (`0x21` is 21) in
/// year-month-day-hour-minute-second order.
pub fn from_bcd(bytes: [u8; 6], base: YearBase) -> Result<DateTime<Utc>, DateTimeError> {
    const NAMES: [&str; 6] = ["year", "month", "day", "hour", "minute", "second"];
    let mut values = [0u32; 6];
    for (i, b) in bytes.iter().enumerate() {
        let (hi, lo) = (b >> 4, b & 0x0F);
        if hi > 9 || lo > 9 {
            return Err(format_err(NAMES[i], &format!("{b:02X}")));
        }
        values[i] = u32::from(hi) * 10 + u32::from(lo);
    }
    let [y, mo, d, h, mi, s] = values;
    assemble(apply_base(y, base), mo, d, h, mi, s, 0)
}

/// Convert Unix epoch milliseconds.
pub fn from_unix_millis(millis: u64) -> Result<DateTime<Utc>, DateTimeError> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| DateTimeError::Invalid(format!("epoch millis {millis} out of range")))
}

// ---------------------------------------------------------------------------
// Named layouts
// ---------------------------------------------------------------------------

/// `yyMMddHHmmss`, two-digit year in the 2000s.
pub fn parse_yymmddhhmmss(s: &str) -> Result<DateTime<Utc>, DateTimeError> {
    let s = fixed_width("yyMMddHHmmss", s, 12)?;
    from_decimal(
        &DateFields::new(&s[0..2], &s[2..4], &s[4..6], &s[6..8], &s[8..10], &s[10..12]),
        YearBase::Add2000,
    )
}

/// `yyyyMMddHHmmss`, four-digit year taken as-is.
pub fn parse_yyyymmddhhmmss(s: &str) -> Result<DateTime<Utc>, DateTimeError> {
    let s = fixed_width("yyyyMMddHHmmss", s, 14)?;
    from_decimal(
        &DateFields::new(&s[0..4], &s[4..6], &s[6..8], &s[8..10], &s[10..12], &s[12..14]),
        YearBase::Absolute,
    )
}

/// `ddMMyyHHmmss`, two-digit year in the 2000s.
pub fn parse_ddmmyyhhmmss(s: &str) -> Result<DateTime<Utc>, DateTimeError> {
    let s = fixed_width("ddMMyyHHmmss", s, 12)?;
    from_decimal(
        &DateFields::new(&s[4..6], &s[2..4], &s[0..2], &s[6..8], &s[8..10], &s[10..12]),
        YearBase::Add2000,
    )
}

/// Separate `dd/MM/yy` date and `HH:mm:ss` time fields.
pub fn parse_ddmmyy_hhmmss(date: &str, time: &str) -> Result<DateTime<Utc>, DateTimeError> {
    let [day, month, year] = split_three("date", date, '/')?;
    let [hour, minute, second] = split_three("time", time, ':')?;
    from_decimal(
        &DateFields::new(year, month, day, hour, minute, second),
        YearBase::Add2000,
    )
}

/// NMEA-style `HHmmss[.f]` time and `ddMMyy` date fields.
///
/// The fractional part is seconds, so `.5` is 500 ms and `.125` is 125 ms;
/// digits beyond milliseconds are ignored.
pub fn parse_hhmmss_ss_ddmmyy(time: &str, date: &str) -> Result<DateTime<Utc>, DateTimeError> {
    let date = fixed_width("ddMMyy", date, 6)?;
    let (clock, fraction) = match time.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (time, None),
    };
    let clock = fixed_width("HHmmss", clock, 6)?;

    let mut millis_digits = String::with_capacity(3);
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format_err("millis", fraction));
        }
        millis_digits.extend(fraction.chars().take(3));
    }
    while millis_digits.len() < 3 {
        millis_digits.push('0');
    }

    from_decimal(
        &DateFields::new(
            &date[4..6],
            &date[2..4],
            &date[0..2],
            &clock[0..2],
            &clock[2..4],
            &clock[4..6],
        )
        .with_millis(&millis_digits),
        YearBase::Add2000,
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn apply_base(year: u32, base: YearBase) -> u32 {
    match base {
        YearBase::Add2000 => year + 2000,
        YearBase::Absolute => year,
    }
}

/// Reject anything that is not exactly `width` ASCII bytes, so later slicing
/// is always on character boundaries.
fn fixed_width<'a>(field: &'static str, s: &'a str, width: usize) -> Result<&'a str, DateTimeError> {
    if s.len() != width || !s.is_ascii() {
        return Err(format_err(field, s));
    }
    Ok(s)
}

fn split_three<'a>(
    field: &'static str,
    s: &'a str,
    sep: char,
) -> Result<[&'a str; 3], DateTimeError> {
    let mut parts = s.split(sep);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(c), None) if [a, b, c].iter().all(|p| p.len() == 2) => {
            Ok([a, b, c])
        }
        _ => Err(format_err(field, s)),
    }
}

fn parse_number(
    field: &'static str,
    s: &str,
    radix: u32,
    width: std::ops::RangeInclusive<usize>,
) -> Result<u32, DateTimeError> {
    if !width.contains(&s.len()) || !s.chars().all(|c| c.is_digit(radix)) {
        return Err(format_err(field, s));
    }
    u32::from_str_radix(s, radix).map_err(|_| format_err(field, s))
}

fn assemble(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    millis: u32,
) -> Result<DateTime<Utc>, DateTimeError> {
    let invalid = || {
        DateTimeError::Invalid(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}"
        ))
    };
    let year = i32::try_from(year).map_err(|_| invalid())?;
    if millis >= 1000 {
        return Err(invalid());
    }
    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_milli_opt(hour, minute, second, millis))
        .ok_or_else(invalid)?;
    Ok(Utc.from_utc_datetime(&naive))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
