//! The array registry and control-plane surface.
//!
//! All control-plane operations (create, assemble, configure, deconfigure,
//! add, remove, grow, delete) run to completion under a single control lock,
//! which plays the role of a dedicated application thread. Data-path
//! submissions never take that lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use raidstack_bdev::DeviceRegistry;
use tracing::{debug, info};
use uuid::Uuid;

use crate::array::RaidArray;
use crate::error::{RaidError, RaidResult};
use crate::personality::PersonalityRegistry;
use crate::types::{RaidLevel, RaidState};

/// Tunables for the background process (rebuild window and bandwidth).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidOptions {
    pub process_window_size_kb: u32,
    /// 0 means unlimited.
    pub process_max_bandwidth_mb_sec: u32,
}

impl Default for RaidOptions {
    fn default() -> Self {
        Self {
            process_window_size_kb: 1024,
            process_max_bandwidth_mb_sec: 0,
        }
    }
}

/// Parameters for creating a new array.
pub struct CreateParams {
    pub name: String,
    pub strip_size_kb: u32,
    pub num_base_devices: u8,
    pub level: RaidLevel,
    pub superblock_enabled: bool,
    pub uuid: Option<Uuid>,
}

/// Owner of every array and the entry point for control-plane operations.
pub struct RaidManager {
    devices: Arc<DeviceRegistry>,
    personalities: Arc<PersonalityRegistry>,
    arrays: RwLock<Vec<Arc<RaidArray>>>,
    /// Registered block-device front ends, keyed by array name.
    frontends: RwLock<HashMap<String, Arc<RaidArray>>>,
    opts: RwLock<RaidOptions>,
    shutdown: AtomicBool,
    /// Serializes control-plane operations ("application thread").
    pub(crate) ctl_lock: tokio::sync::Mutex<()>,
}

impl RaidManager {
    /// Create a manager using the process-wide personality registry.
    #[must_use]
    pub fn new(devices: Arc<DeviceRegistry>) -> Arc<Self> {
        Self::with_personalities(devices, Arc::clone(PersonalityRegistry::global()))
    }

    /// Create a manager with an explicit personality registry.
    #[must_use]
    pub fn with_personalities(
        devices: Arc<DeviceRegistry>,
        personalities: Arc<PersonalityRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            personalities,
            arrays: RwLock::new(Vec::new()),
            frontends: RwLock::new(HashMap::new()),
            opts: RwLock::new(RaidOptions::default()),
            shutdown: AtomicBool::new(false),
            ctl_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn personalities(&self) -> &Arc<PersonalityRegistry> {
        &self.personalities
    }

    pub fn options(&self) -> RaidOptions {
        *self.opts.read()
    }

    pub fn set_options(&self, opts: RaidOptions) -> RaidResult<()> {
        if opts.process_window_size_kb == 0 {
            return Err(RaidError::InvalidParameter(
                "process window size must be non-zero".into(),
            ));
        }
        *self.opts.write() = opts;
        Ok(())
    }

    pub fn shutdown_started(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Create a new array record. Member binding happens separately through
    /// the add flow.
    pub async fn create_array(&self, params: CreateParams) -> RaidResult<Arc<RaidArray>> {
        let _ctl = self.ctl_lock.lock().await;
        self.create_array_inner(params)
    }

    pub(crate) fn create_array_inner(&self, params: CreateParams) -> RaidResult<Arc<RaidArray>> {
        if self.find_by_name(&params.name).is_some() {
            return Err(RaidError::AlreadyExists(format!(
                "array '{}'",
                params.name
            )));
        }

        let array = RaidArray::new(
            &self.personalities,
            &params.name,
            params.strip_size_kb,
            params.num_base_devices,
            params.level,
            params.superblock_enabled,
            params.uuid,
        )?;

        info!(
            array = %array.name(),
            uuid = %array.uuid(),
            level = %array.level(),
            slots = array.num_base_devices(),
            superblock = array.superblock_enabled(),
            "array created"
        );

        self.arrays.write().push(Arc::clone(&array));
        Ok(array)
    }

    /// Delete an array by name. Idempotent: a delete already in progress is
    /// reported as such.
    pub async fn delete_array(&self, name: &str) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;
        let array = self
            .find_by_name(name)
            .ok_or_else(|| RaidError::NotFound(format!("array '{name}'")))?;
        array.delete(self).await
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<RaidArray>> {
        self.arrays
            .read()
            .iter()
            .find(|array| array.name() == name)
            .map(Arc::clone)
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<Arc<RaidArray>> {
        self.arrays
            .read()
            .iter()
            .find(|array| array.uuid() == uuid)
            .map(Arc::clone)
    }

    /// Snapshot of all arrays, optionally filtered by state.
    pub fn list_arrays(&self, state: Option<RaidState>) -> Vec<Arc<RaidArray>> {
        self.arrays
            .read()
            .iter()
            .filter(|array| state.is_none_or(|s| array.state() == s))
            .map(Arc::clone)
            .collect()
    }

    /// Reverse lookup: the array and slot currently bound to a device.
    pub(crate) fn find_base_by_device_name(
        &self,
        device_name: &str,
    ) -> Option<(Arc<RaidArray>, usize)> {
        let arrays = self.arrays.read();
        for array in arrays.iter() {
            if let Some(slot) = array.find_slot_by_device_name(device_name) {
                return Some((Arc::clone(array), slot));
            }
        }
        None
    }

    /// Expose the array as a logical block device.
    pub(crate) fn register_frontend(&self, array: &Arc<RaidArray>) -> RaidResult<()> {
        let mut frontends = self.frontends.write();
        if frontends.contains_key(array.name()) {
            return Err(RaidError::AlreadyExists(format!(
                "front end '{}'",
                array.name()
            )));
        }
        frontends.insert(array.name().to_string(), Arc::clone(array));
        info!(array = %array.name(), "block device front end registered");
        Ok(())
    }

    pub(crate) fn unregister_frontend(&self, array: &Arc<RaidArray>) {
        if self.frontends.write().remove(array.name()).is_some() {
            info!(array = %array.name(), "block device front end unregistered");
        }
    }

    /// Whether the array is currently exposed as a logical block device.
    pub fn frontend_registered(&self, name: &str) -> bool {
        self.frontends.read().contains_key(name)
    }

    /// Drop an array record from the registry; the record is freed when the
    /// last reference goes away.
    pub(crate) fn registry_remove(&self, array: &Arc<RaidArray>) {
        debug!(array = %array.name(), "removing array from registry");
        self.arrays
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, array));
        self.frontends.write().remove(array.name());
    }

    /// Begin global shutdown: subsequent destructs release every descriptor,
    /// then delete all arrays.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let arrays = self.list_arrays(None);
        for array in arrays {
            let _ctl = self.ctl_lock.lock().await;
            if let Err(err) = array.delete(self).await {
                debug!(array = %array.name(), %err, "delete during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestEnv;

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let env = TestEnv::new();
        env.create_mirror("r1", 2).await.unwrap();
        let err = env.create_mirror("r1", 2).await.unwrap_err();
        assert_eq!(err.errno(), -17);
    }

    #[tokio::test]
    async fn test_delete_unknown_array() {
        let env = TestEnv::new();
        let err = env.manager.delete_array("nope").await.unwrap_err();
        assert_eq!(err.errno(), -19);
    }

    #[tokio::test]
    async fn test_options_validation() {
        let env = TestEnv::new();
        assert!(env
            .manager
            .set_options(RaidOptions {
                process_window_size_kb: 0,
                process_max_bandwidth_mb_sec: 10,
            })
            .is_err());
        let opts = RaidOptions {
            process_window_size_kb: 512,
            process_max_bandwidth_mb_sec: 100,
        };
        env.manager.set_options(opts).unwrap();
        assert_eq!(env.manager.options(), opts);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let env = crate::test_util::online_mirror("r1", &["d0", "d1"]).await;
        env.manager.shutdown().await;

        assert!(env.manager.list_arrays(None).is_empty());
        assert!(env.device("d0").claimed_by().is_none());
        assert!(env.device("d1").claimed_by().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_state() {
        let env = TestEnv::new();
        env.create_mirror("r1", 2).await.unwrap();
        assert_eq!(env.manager.list_arrays(None).len(), 1);
        assert_eq!(
            env.manager
                .list_arrays(Some(RaidState::Configuring))
                .len(),
            1
        );
        assert!(env.manager.list_arrays(Some(RaidState::Online)).is_empty());
    }
}
