// mock_registry: In-memory DeviceRegistry for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracker_protocol::{DeviceIdentity, DeviceRef, DeviceRegistry, RegistryError};

/// Resolves only identities added with [`MemoryRegistry::add`]. Clones share
/// the same table, so devices can be registered while a listener runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    devices: Arc<Mutex<HashMap<DeviceIdentity, DeviceRef>>>,
    lookups: Arc<AtomicUsize>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, identity: DeviceIdentity, device_id: &str) {
        self.devices.lock().unwrap().insert(
            identity,
            DeviceRef {
                device_id: device_id.to_owned(),
                asset_id: None,
            },
        );
    }

    /// Number of resolve calls served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl DeviceRegistry for MemoryRegistry {
    async fn resolve(&self, identity: &DeviceIdentity) -> Result<Option<DeviceRef>, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.devices.lock().unwrap().get(identity).cloned())
    }
}
