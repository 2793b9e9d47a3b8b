//! Canonical location record and device identity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ProtocolFamily
// ---------------------------------------------------------------------------

/// Wire protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    Meitrack,
    Gt06,
    Teltonika,
}

impl ProtocolFamily {
    /// Every supported family, in matching priority order.
    pub const ALL: [ProtocolFamily; 3] = [
        ProtocolFamily::Meitrack,
        ProtocolFamily::Gt06,
        ProtocolFamily::Teltonika,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolFamily::Meitrack => "meitrack",
            ProtocolFamily::Gt06 => "gt06",
            ProtocolFamily::Teltonika => "teltonika",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProtocolFamily {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ProtocolFamily::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown protocol '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Device identity / reference
// ---------------------------------------------------------------------------

/// Raw identifier a device announced, before registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    pub raw_id: String,
    pub protocol: ProtocolFamily,
}

impl DeviceIdentity {
    pub fn new(raw_id: impl Into<String>, protocol: ProtocolFamily) -> Self {
        DeviceIdentity {
            raw_id: raw_id.into(),
            protocol,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.raw_id)
    }
}

/// A device as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRef {
    pub device_id: String,
    pub asset_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
    #[error("speed {0} must be a non-negative number")]
    Speed(f64),
    #[error("heading {0} outside [0, 360)")]
    Heading(f64),
    #[error("hdop {0} must be a non-negative number")]
    Hdop(f64),
    #[error("altitude {0} must be finite")]
    Altitude(f64),
}

/// One validated fix, as produced by a decoder.
///
/// Fields are private so every instance has passed [`PositionBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    timestamp: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    valid: bool,
    /// km/h
    speed: f64,
    heading: Option<f64>,
    /// meters
    altitude: Option<f64>,
    satellites: Option<u8>,
    hdop: Option<f64>,
    gsm_signal: Option<i16>,
    /// meters
    odometer: Option<u64>,
}

impl Position {
    pub fn builder(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> PositionBuilder {
        PositionBuilder {
            position: Position {
                timestamp,
                latitude,
                longitude,
                valid: true,
                speed: 0.0,
                heading: None,
                altitude: None,
                satellites: None,
                hdop: None,
                gsm_signal: None,
                odometer: None,
            },
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn latitude(&self) -> f64 {
        self.latitude
    }
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
    pub fn valid(&self) -> bool {
        self.valid
    }
    pub fn speed(&self) -> f64 {
        self.speed
    }
    pub fn heading(&self) -> Option<f64> {
        self.heading
    }
    pub fn altitude(&self) -> Option<f64> {
        self.altitude
    }
    pub fn satellites(&self) -> Option<u8> {
        self.satellites
    }
    pub fn hdop(&self) -> Option<f64> {
        self.hdop
    }
    pub fn gsm_signal(&self) -> Option<i16> {
        self.gsm_signal
    }
    pub fn odometer(&self) -> Option<u64> {
        self.odometer
    }
}

#[derive(Debug, Clone)]
pub struct PositionBuilder {
    position: Position,
}

impl PositionBuilder {
    pub fn valid(mut self, valid: bool) -> Self {
        self.position.valid = valid;
        self
    }
    pub fn speed(mut self, kmh: f64) -> Self {
        self.position.speed = kmh;
        self
    }
    pub fn heading(mut self, degrees: f64) -> Self {
        self.position.heading = Some(degrees);
        self
    }
    pub fn altitude(mut self, meters: f64) -> Self {
        self.position.altitude = Some(meters);
        self
    }
    pub fn satellites(mut self, count: u8) -> Self {
        self.position.satellites = Some(count);
        self
    }
    pub fn hdop(mut self, hdop: f64) -> Self {
        self.position.hdop = Some(hdop);
        self
    }
    pub fn gsm_signal(mut self, signal: i16) -> Self {
        self.position.gsm_signal = Some(signal);
        self
    }
    pub fn odometer(mut self, meters: u64) -> Self {
        self.position.odometer = Some(meters);
        self
    }

    /// Validate ranges. Out-of-range values are rejected, never clamped.
    pub fn build(self) -> Result<Position, PositionError> {
        let p = self.position;
        if !(-90.0..=90.0).contains(&p.latitude) {
            return Err(PositionError::Latitude(p.latitude));
        }
        if !(-180.0..=180.0).contains(&p.longitude) {
            return Err(PositionError::Longitude(p.longitude));
        }
        if !p.speed.is_finite() || p.speed < 0.0 {
            return Err(PositionError::Speed(p.speed));
        }
        if let Some(h) = p.heading
            && !(0.0..360.0).contains(&h)
        {
            return Err(PositionError::Heading(h));
        }
        if let Some(h) = p.hdop
            && (!h.is_finite() || h < 0.0)
        {
            return Err(PositionError::Hdop(h));
        }
        if let Some(a) = p.altitude
            && !a.is_finite()
        {
            return Err(PositionError::Altitude(a));
        }
        Ok(p)
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// A resolved, immutable location event ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    device: DeviceRef,
    protocol: ProtocolFamily,
    #[serde(flatten)]
    position: Position,
}

impl Location {
    pub fn new(device: DeviceRef, protocol: ProtocolFamily, position: Position) -> Self {
        Location {
            device,
            protocol,
            position,
        }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }
    pub fn protocol(&self) -> ProtocolFamily {
        self.protocol
    }
    pub fn position(&self) -> &Position {
        &self.position
    }
}
