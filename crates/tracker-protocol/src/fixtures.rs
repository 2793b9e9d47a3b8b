//! Frame builders for tests. Enabled with the `test-support` feature.

use crate::checksum::{crc16_arc, crc16_x25, sum8};
use crate::gt06::{PROTO_HEARTBEAT, PROTO_LOCATION, PROTO_LOGIN};

// ---------------------------------------------------------------------------
// Meitrack
// ---------------------------------------------------------------------------

/// `$$A<len>,<imei>,<cmd>,<fields...>,*<CS>\r\n` with a correct length and checksum.
pub fn meitrack_frame(imei: &str, command: &str, fields: &[&str]) -> Vec<u8> {
    let mut rest = format!(",{imei},{command}");
    for f in fields {
        rest.push(',');
        rest.push_str(f);
    }
    rest.push_str(",*");
    // checksum digits + CRLF
    let len = rest.len() + 4;
    let mut out = format!("$$A{len}{rest}").into_bytes();
    let cs = sum8(&out);
    out.extend_from_slice(format!("{cs:02X}\r\n").as_bytes());
    out
}

/// An `AAA` position report with fixed auxiliary values: 9 satellites,
/// GSM 12, 38 km/h, heading 120, HDOP 1.2, altitude 35 m, mileage 12345 m.
pub fn meitrack_aaa(imei: &str, yymmddhhmmss: &str, latitude: f64, longitude: f64) -> Vec<u8> {
    let lat = format!("{latitude:.6}");
    let lon = format!("{longitude:.6}");
    meitrack_frame(
        imei,
        "AAA",
        &[
            "35",
            &lat,
            &lon,
            yymmddhhmmss,
            "A",
            "9",
            "12",
            "38",
            "120",
            "1.2",
            "35",
            "12345",
            "402",
            "460|0|E166|A08B",
            "0000",
        ],
    )
}

// ---------------------------------------------------------------------------
// GT06
// ---------------------------------------------------------------------------

/// Short-form (`78 78`) packet with a correct length and CRC.
pub fn gt06_packet(protocol: u8, content: &[u8], serial: u16) -> Vec<u8> {
    let len = u8::try_from(content.len() + 5).expect("GT06 short packet content too long");
    let mut out = vec![0x78, 0x78, len, protocol];
    out.extend_from_slice(content);
    out.extend_from_slice(&serial.to_be_bytes());
    let crc = crc16_x25(&out[2..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
    out
}

pub fn gt06_login(imei: &str, serial: u16) -> Vec<u8> {
    let digits: Vec<u8> = format!("{imei:0>16}").bytes().map(|b| b - b'0').collect();
    let bcd: Vec<u8> = digits.chunks(2).map(|p| (p[0] << 4) | p[1]).collect();
    gt06_packet(PROTO_LOGIN, &bcd, serial)
}

pub fn gt06_heartbeat(serial: u16) -> Vec<u8> {
    // terminal info, voltage, gsm, alarm/language
    gt06_packet(PROTO_HEARTBEAT, &[0x40, 0x04, 0x04, 0x00, 0x01], serial)
}

/// Values for a GT06 GPS block.
#[derive(Debug, Clone)]
pub struct Gt06Fix {
    /// year (two-digit), month, day, hour, minute, second
    pub time: [u8; 6],
    pub latitude: f64,
    pub longitude: f64,
    pub speed: u8,
    pub course: u16,
    pub valid: bool,
    pub satellites: u8,
}

pub fn gt06_location(fix: &Gt06Fix, serial: u16) -> Vec<u8> {
    let mut content = fix.time.to_vec();
    content.push(0xC0 | (fix.satellites & 0x0F));
    content.extend_from_slice(&((fix.latitude.abs() * 1_800_000.0).round() as u32).to_be_bytes());
    content.extend_from_slice(&((fix.longitude.abs() * 1_800_000.0).round() as u32).to_be_bytes());
    content.push(fix.speed);
    let mut flags = fix.course & 0x03FF;
    if fix.valid {
        flags |= 0x1000;
    }
    if fix.longitude < 0.0 {
        flags |= 0x0800;
    }
    if fix.latitude >= 0.0 {
        flags |= 0x0400;
    }
    content.extend_from_slice(&flags.to_be_bytes());
    // MCC, MNC, LAC, cell id
    content.extend_from_slice(&[0x01, 0xCC, 0x00, 0x28, 0x7D, 0x00, 0x1F, 0xB8]);
    gt06_packet(PROTO_LOCATION, &content, serial)
}

// ---------------------------------------------------------------------------
// Teltonika
// ---------------------------------------------------------------------------

pub fn teltonika_imei(imei: &str) -> Vec<u8> {
    let len = u16::try_from(imei.len()).expect("IMEI too long");
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(imei.as_bytes());
    out
}

/// One AVL record. IO elements are emitted only for the `Some` fields.
#[derive(Debug, Clone)]
pub struct AvlRecord {
    pub timestamp_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i16,
    pub angle: u16,
    pub satellites: u8,
    pub speed: u16,
    pub odometer: Option<u32>,
    pub gsm_signal: Option<u8>,
    pub hdop_tenths: Option<u16>,
}

pub fn teltonika_avl(codec: u8, records: &[AvlRecord]) -> Vec<u8> {
    let extended = codec == crate::teltonika::CODEC_8E;
    let count = u8::try_from(records.len()).expect("too many AVL records");

    let mut data = vec![codec, count];
    for rec in records {
        data.extend_from_slice(&rec.timestamp_ms.to_be_bytes());
        data.push(1);
        data.extend_from_slice(&((rec.longitude * 1e7).round() as i32).to_be_bytes());
        data.extend_from_slice(&((rec.latitude * 1e7).round() as i32).to_be_bytes());
        data.extend_from_slice(&rec.altitude.to_be_bytes());
        data.extend_from_slice(&rec.angle.to_be_bytes());
        data.push(rec.satellites);
        data.extend_from_slice(&rec.speed.to_be_bytes());

        let one: Vec<(u16, u64)> = rec
            .gsm_signal
            .map(|v| (crate::teltonika::IO_GSM_SIGNAL, u64::from(v)))
            .into_iter()
            .collect();
        let two: Vec<(u16, u64)> = rec
            .hdop_tenths
            .map(|v| (crate::teltonika::IO_HDOP, u64::from(v)))
            .into_iter()
            .collect();
        let four: Vec<(u16, u64)> = rec
            .odometer
            .map(|v| (crate::teltonika::IO_ODOMETER, u64::from(v)))
            .into_iter()
            .collect();
        let total = one.len() + two.len() + four.len();

        push_sized(&mut data, 0, extended);
        push_sized(&mut data, total as u16, extended);
        for (width, group) in [(1usize, &one), (2, &two), (4, &four), (8, &Vec::new())] {
            push_sized(&mut data, group.len() as u16, extended);
            for &(id, value) in group {
                push_sized(&mut data, id, extended);
                data.extend_from_slice(&value.to_be_bytes()[8 - width..]);
            }
        }
        if extended {
            // no variable-length elements
            data.extend_from_slice(&0u16.to_be_bytes());
        }
    }
    data.push(count);

    let mut out = vec![0, 0, 0, 0];
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&u32::from(crc16_arc(&data)).to_be_bytes());
    out
}

/// Counts and ids are one byte in codec 8, two in codec 8E.
fn push_sized(out: &mut Vec<u8>, value: u16, extended: bool) {
    if extended {
        out.extend_from_slice(&value.to_be_bytes());
    } else {
        out.push(value as u8);
    }
}
