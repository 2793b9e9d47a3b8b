//! Device registries configurable from the listener's TOML file.

use std::collections::HashMap;
use tracker_protocol::{DeviceIdentity, DeviceRef, DeviceRegistry, ProtocolFamily, RegistryError};

use crate::config::{DeviceEntry, RegistryConfig, RegistryMode};

/// Accepts every device, using its raw identifier as the device id.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRegistry;

impl DeviceRegistry for OpenRegistry {
    async fn resolve(&self, identity: &DeviceIdentity) -> Result<Option<DeviceRef>, RegistryError> {
        Ok(Some(DeviceRef {
            device_id: identity.raw_id.clone(),
            asset_id: None,
        }))
    }
}

/// Fixed identifier table. An entry bound to a protocol wins over an entry
/// for the same identifier without one.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    by_protocol: HashMap<(String, ProtocolFamily), DeviceRef>,
    any_protocol: HashMap<String, DeviceRef>,
}

impl StaticRegistry {
    pub fn new(entries: &[DeviceEntry]) -> Self {
        let mut registry = StaticRegistry::default();
        for entry in entries {
            let device = DeviceRef {
                device_id: entry.device_id.clone(),
                asset_id: entry.asset.clone(),
            };
            match entry.protocol {
                Some(protocol) => {
                    registry
                        .by_protocol
                        .insert((entry.identifier.clone(), protocol), device);
                }
                None => {
                    registry.any_protocol.insert(entry.identifier.clone(), device);
                }
            }
        }
        registry
    }

    pub fn lookup(&self, identity: &DeviceIdentity) -> Option<&DeviceRef> {
        self.by_protocol
            .get(&(identity.raw_id.clone(), identity.protocol))
            .or_else(|| self.any_protocol.get(&identity.raw_id))
    }

    pub fn len(&self) -> usize {
        self.by_protocol.len() + self.any_protocol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceRegistry for StaticRegistry {
    async fn resolve(&self, identity: &DeviceIdentity) -> Result<Option<DeviceRef>, RegistryError> {
        Ok(self.lookup(identity).cloned())
    }
}

/// Registry selected by `[registry] mode`.
#[derive(Debug, Clone)]
pub enum ConfiguredRegistry {
    Open(OpenRegistry),
    Static(StaticRegistry),
}

impl ConfiguredRegistry {
    pub fn from_config(config: &RegistryConfig) -> Self {
        match config.mode {
            RegistryMode::Open => ConfiguredRegistry::Open(OpenRegistry),
            RegistryMode::Static => ConfiguredRegistry::Static(StaticRegistry::new(&config.devices)),
        }
    }
}

impl DeviceRegistry for ConfiguredRegistry {
    async fn resolve(&self, identity: &DeviceIdentity) -> Result<Option<DeviceRef>, RegistryError> {
        match self {
            ConfiguredRegistry::Open(r) => r.resolve(identity).await,
            ConfiguredRegistry::Static(r) => r.resolve(identity).await,
        }
    }
}
