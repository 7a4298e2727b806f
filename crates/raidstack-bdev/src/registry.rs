//! Registry of backing block devices.
//!
//! Devices are looked up by name or by their UUID string, which acts as an
//! alias.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::device::{BlockDevice, Descriptor};
use crate::error::{BdevError, BdevResult};

/// Registry of the host's visible block devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<BlockDevice>>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Fails if a device with the same name exists.
    pub fn add(&self, device: Arc<BlockDevice>) -> BdevResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(device.name()) {
            return Err(BdevError::AlreadyExists(device.name().to_string()));
        }
        info!(device = %device.name(), uuid = %device.uuid(), "block device registered");
        devices.insert(device.name().to_string(), device);
        Ok(())
    }

    /// Remove a device from the registry. The caller is responsible for
    /// delivering a remove event to whoever holds it open.
    pub fn remove(&self, name: &str) -> Option<Arc<BlockDevice>> {
        let removed = self.devices.write().remove(name);
        if removed.is_some() {
            info!(device = %name, "block device unregistered");
        }
        removed
    }

    /// Look up by name, falling back to the UUID alias.
    pub fn get(&self, name_or_uuid: &str) -> Option<Arc<BlockDevice>> {
        let devices = self.devices.read();
        if let Some(device) = devices.get(name_or_uuid) {
            return Some(Arc::clone(device));
        }
        let uuid: Uuid = name_or_uuid.parse().ok()?;
        devices
            .values()
            .find(|d| d.uuid() == uuid)
            .map(Arc::clone)
    }

    /// Open a descriptor on a registered device.
    pub fn open(&self, name_or_uuid: &str, write: bool) -> BdevResult<Descriptor> {
        self.get(name_or_uuid)
            .map(|device| Descriptor::new(device, write))
            .ok_or_else(|| BdevError::NotFound(name_or_uuid.to_string()))
    }

    /// Snapshot of all registered devices.
    pub fn list(&self) -> Vec<Arc<BlockDevice>> {
        self.devices.read().values().map(Arc::clone).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_open() {
        let registry = DeviceRegistry::new();
        registry
            .add(Arc::new(BlockDevice::new("d0", 512, 16)))
            .unwrap();

        assert!(registry.open("d0", false).is_ok());
        assert!(matches!(
            registry.open("d1", false),
            Err(BdevError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = DeviceRegistry::new();
        registry
            .add(Arc::new(BlockDevice::new("d0", 512, 16)))
            .unwrap();
        assert!(matches!(
            registry.add(Arc::new(BlockDevice::new("d0", 512, 16))),
            Err(BdevError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_uuid_alias_lookup() {
        let registry = DeviceRegistry::new();
        let dev = Arc::new(BlockDevice::new("d0", 512, 16));
        let uuid = dev.uuid();
        registry.add(dev).unwrap();

        let found = registry.get(&uuid.to_string()).unwrap();
        assert_eq!(found.name(), "d0");
    }
}
