//! Listener configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/tracklink/listener.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - At least one `[[endpoints]]` entry with a `port` and a non-empty
//!   `protocols` list
//!
//! Everything else has a default.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracker_protocol::ProtocolFamily;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tracklink/listener.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub schema_version: u32,
    pub stats_interval: Duration,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub registry: RegistryConfig,
    pub endpoints: Vec<EndpointConfig>,
}

/// Per-session limits shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub identification_timeout: Duration,
    /// Largest number of unconsumed bytes a session may retain.
    pub max_buffer_bytes: usize,
    /// Positions held while waiting for a login message.
    pub max_pending_messages: usize,
    /// Bytes examined before giving up on protocol detection.
    pub probe_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            idle_timeout: Duration::from_secs(300),
            identification_timeout: Duration::from_secs(60),
            max_buffer_bytes: 32 * 1024,
            max_pending_messages: 32,
            probe_bytes: 64,
        }
    }
}

/// Location delivery policy (the `[sink]` table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Per-session queue between the read loop and the sink.
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(5000),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    /// Every identifier resolves to a device of the same name.
    Open,
    /// Only identifiers listed in `[[registry.devices]]` resolve.
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub mode: RegistryMode,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub identifier: String,
    /// None matches the identifier on any protocol.
    pub protocol: Option<ProtocolFamily>,
    pub device_id: String,
    pub asset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub address: IpAddr,
    pub port: u16,
    pub transport: Transport,
    pub protocols: Vec<ProtocolFamily>,
    pub max_sessions: usize,
}

impl EndpointConfig {
    /// TCP endpoint with default limits.
    pub fn tcp(address: IpAddr, port: u16, protocols: Vec<ProtocolFamily>) -> Self {
        EndpointConfig {
            address,
            port,
            transport: Transport::Tcp,
            protocols,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// UDP endpoint with default limits.
    pub fn udp(address: IpAddr, port: u16, protocols: Vec<ProtocolFamily>) -> Self {
        EndpointConfig {
            transport: Transport::Udp,
            ..Self::tcp(address, port, protocols)
        }
    }
}

const DEFAULT_MAX_SESSIONS: usize = 1024;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    stats_interval_secs: Option<u64>,
    session: Option<RawSessionConfig>,
    sink: Option<RawSinkConfig>,
    registry: Option<RawRegistryConfig>,
    endpoints: Option<Vec<RawEndpointConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    idle_timeout_secs: Option<u64>,
    identification_timeout_secs: Option<u64>,
    max_buffer_bytes: Option<usize>,
    max_pending_messages: Option<usize>,
    probe_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawSinkConfig {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRegistryConfig {
    mode: Option<String>,
    devices: Option<Vec<RawDeviceEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceEntry {
    identifier: Option<String>,
    protocol: Option<String>,
    device_id: Option<String>,
    asset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointConfig {
    address: Option<String>,
    port: Option<u16>,
    transport: Option<String>,
    protocols: Option<Vec<String>>,
    max_sessions: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load listener config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ListenerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load listener config from the default path.
pub fn load_config() -> Result<ListenerConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load listener config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ListenerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let stats_interval_secs = raw
        .stats_interval_secs
        .unwrap_or(DEFAULT_STATS_INTERVAL_SECS);
    if stats_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "stats_interval_secs must be at least 1".to_owned(),
        ));
    }

    let session = build_session(raw.session)?;
    let delivery = build_delivery(raw.sink)?;
    let registry = build_registry(raw.registry)?;

    let raw_endpoints = raw
        .endpoints
        .ok_or_else(|| ConfigError::MissingField("endpoints".to_owned()))?;
    if raw_endpoints.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[endpoints]] entry is required".to_owned(),
        ));
    }
    let mut endpoints = Vec::with_capacity(raw_endpoints.len());
    let mut seen = HashSet::new();
    for (i, e) in raw_endpoints.into_iter().enumerate() {
        let endpoint = build_endpoint(i, e)?;
        if endpoint.port != 0 && !seen.insert((endpoint.address, endpoint.port, endpoint.transport))
        {
            return Err(ConfigError::InvalidValue(format!(
                "endpoints[{}]: {} {}:{} is configured twice",
                i, endpoint.transport, endpoint.address, endpoint.port
            )));
        }
        endpoints.push(endpoint);
    }

    Ok(ListenerConfig {
        schema_version,
        stats_interval: Duration::from_secs(stats_interval_secs),
        session,
        delivery,
        registry,
        endpoints,
    })
}

// ---------------------------------------------------------------------------
// Section builders
// ---------------------------------------------------------------------------

fn build_session(raw: Option<RawSessionConfig>) -> Result<SessionConfig, ConfigError> {
    let defaults = SessionConfig::default();
    let Some(s) = raw else {
        return Ok(defaults);
    };
    let session = SessionConfig {
        idle_timeout: s
            .idle_timeout_secs
            .map_or(defaults.idle_timeout, Duration::from_secs),
        identification_timeout: s
            .identification_timeout_secs
            .map_or(defaults.identification_timeout, Duration::from_secs),
        max_buffer_bytes: s.max_buffer_bytes.unwrap_or(defaults.max_buffer_bytes),
        max_pending_messages: s
            .max_pending_messages
            .unwrap_or(defaults.max_pending_messages),
        probe_bytes: s.probe_bytes.unwrap_or(defaults.probe_bytes),
    };
    if session.idle_timeout.is_zero() {
        return Err(ConfigError::InvalidValue(
            "session.idle_timeout_secs must be at least 1".to_owned(),
        ));
    }
    if session.identification_timeout.is_zero() {
        return Err(ConfigError::InvalidValue(
            "session.identification_timeout_secs must be at least 1".to_owned(),
        ));
    }
    if session.max_buffer_bytes == 0 {
        return Err(ConfigError::InvalidValue(
            "session.max_buffer_bytes must be at least 1".to_owned(),
        ));
    }
    if session.probe_bytes == 0 || session.probe_bytes > session.max_buffer_bytes {
        return Err(ConfigError::InvalidValue(format!(
            "session.probe_bytes must be between 1 and max_buffer_bytes ({}), got {}",
            session.max_buffer_bytes, session.probe_bytes
        )));
    }
    Ok(session)
}

fn build_delivery(raw: Option<RawSinkConfig>) -> Result<DeliveryConfig, ConfigError> {
    let defaults = DeliveryConfig::default();
    let Some(s) = raw else {
        return Ok(defaults);
    };
    let delivery = DeliveryConfig {
        max_attempts: s.max_attempts.unwrap_or(defaults.max_attempts),
        backoff: s.backoff_ms.map_or(defaults.backoff, Duration::from_millis),
        max_backoff: s
            .max_backoff_ms
            .map_or(defaults.max_backoff, Duration::from_millis),
        queue_capacity: s.queue_capacity.unwrap_or(defaults.queue_capacity),
    };
    if delivery.max_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "sink.max_attempts must be at least 1".to_owned(),
        ));
    }
    if delivery.queue_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "sink.queue_capacity must be at least 1".to_owned(),
        ));
    }
    if delivery.backoff > delivery.max_backoff {
        return Err(ConfigError::InvalidValue(format!(
            "sink.backoff_ms ({}) exceeds sink.max_backoff_ms ({})",
            delivery.backoff.as_millis(),
            delivery.max_backoff.as_millis()
        )));
    }
    Ok(delivery)
}

fn build_registry(raw: Option<RawRegistryConfig>) -> Result<RegistryConfig, ConfigError> {
    let Some(r) = raw else {
        return Ok(RegistryConfig {
            mode: RegistryMode::Open,
            devices: Vec::new(),
        });
    };
    let mode = match r.mode.as_deref().unwrap_or("open") {
        "open" => RegistryMode::Open,
        "static" => RegistryMode::Static,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "registry.mode must be \"open\" or \"static\", got \"{}\"",
                other
            )));
        }
    };
    let mut devices = Vec::new();
    for (i, d) in r.devices.unwrap_or_default().into_iter().enumerate() {
        let identifier = d.identifier.ok_or_else(|| {
            ConfigError::MissingField(format!("registry.devices[{}].identifier", i))
        })?;
        let device_id = d.device_id.ok_or_else(|| {
            ConfigError::MissingField(format!("registry.devices[{}].device_id", i))
        })?;
        let protocol = d
            .protocol
            .as_deref()
            .map(ProtocolFamily::try_from)
            .transpose()
            .map_err(|e| ConfigError::InvalidValue(format!("registry.devices[{}]: {}", i, e)))?;
        devices.push(DeviceEntry {
            identifier,
            protocol,
            device_id,
            asset: d.asset,
        });
    }
    Ok(RegistryConfig { mode, devices })
}

fn build_endpoint(i: usize, e: RawEndpointConfig) -> Result<EndpointConfig, ConfigError> {
    let port = e
        .port
        .ok_or_else(|| ConfigError::MissingField(format!("endpoints[{}].port", i)))?;
    let address = match e.address {
        Some(a) => a.parse::<IpAddr>().map_err(|_| {
            ConfigError::InvalidValue(format!("endpoints[{}].address '{}' is not an IP", i, a))
        })?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let transport = match e.transport.as_deref().unwrap_or("tcp") {
        "tcp" => Transport::Tcp,
        "udp" => Transport::Udp,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "endpoints[{}].transport must be \"tcp\" or \"udp\", got \"{}\"",
                i, other
            )));
        }
    };
    let raw_protocols = e
        .protocols
        .ok_or_else(|| ConfigError::MissingField(format!("endpoints[{}].protocols", i)))?;
    if raw_protocols.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "endpoints[{}].protocols must not be empty",
            i
        )));
    }
    let mut protocols = Vec::with_capacity(raw_protocols.len());
    for p in &raw_protocols {
        let family = ProtocolFamily::try_from(p.as_str())
            .map_err(|err| ConfigError::InvalidValue(format!("endpoints[{}]: {}", i, err)))?;
        if !protocols.contains(&family) {
            protocols.push(family);
        }
    }
    // Teltonika UDP uses a different framing from the TCP codec
    if transport == Transport::Udp && protocols.contains(&ProtocolFamily::Teltonika) {
        return Err(ConfigError::InvalidValue(format!(
            "endpoints[{}]: teltonika is only supported over tcp",
            i
        )));
    }
    let max_sessions = e.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS);
    if max_sessions == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "endpoints[{}].max_sessions must be at least 1",
            i
        )));
    }
    Ok(EndpointConfig {
        address,
        port,
        transport,
        protocols,
        max_sessions,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
