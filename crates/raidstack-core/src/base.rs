//! Per-slot member state and the bind flow that attaches a backing device
//! to a slot.

use std::sync::Arc;

use raidstack_bdev::{Descriptor, IoChannel};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::array::RaidArray;
use crate::error::{RaidError, RaidResult};
use crate::manager::RaidManager;
use crate::superblock::{SbProbe, Superblock};
use crate::types::RaidState;

/// Callback invoked with the final status of a member removal.
pub type RemoveCb = Box<dyn FnOnce(i32) + Send + Sync>;

/// State of one slot position in an array.
pub(crate) struct BaseInfo {
    /// Assigned device name; may be absent until the slot is bound.
    pub name: Option<String>,
    /// Expected device UUID; may be absent until the slot is bound.
    pub uuid: Option<Uuid>,
    /// Open descriptor; present iff the slot is configured or mid-bind.
    pub desc: Option<Descriptor>,
    /// Channel used for superblock I/O on the application thread.
    pub app_channel: Option<IoChannel>,
    /// Capacity of the backing device in blocks.
    pub block_count: u64,
    /// First data block on the backing device.
    pub data_offset: u64,
    /// Size of the data region in blocks.
    pub data_size: u64,
    pub is_configured: bool,
    pub remove_scheduled: bool,
    pub remove_cb: Option<RemoveCb>,
}

impl BaseInfo {
    pub fn empty() -> Self {
        Self {
            name: None,
            uuid: None,
            desc: None,
            app_channel: None,
            block_count: 0,
            data_offset: 0,
            data_size: 0,
            is_configured: false,
            remove_scheduled: false,
            remove_cb: None,
        }
    }
}

/// Public snapshot of one slot, for listings.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub name: Option<String>,
    pub uuid: Option<Uuid>,
    pub is_configured: bool,
    pub remove_scheduled: bool,
    pub block_count: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

impl RaidArray {
    /// Snapshot of all slots.
    pub fn slot_snapshot(&self) -> Vec<SlotInfo> {
        self.slots()
            .read()
            .iter()
            .map(|slot| SlotInfo {
                name: slot.name.clone(),
                uuid: slot.uuid,
                is_configured: slot.is_configured,
                remove_scheduled: slot.remove_scheduled,
                block_count: slot.block_count,
                data_offset: slot.data_offset,
                data_size: slot.data_size,
            })
            .collect()
    }

    /// Bind the backing device to `slot`.
    ///
    /// The slot must carry a name and/or an expected UUID. The device is
    /// opened, identity-checked, claimed, measured and (for superblock
    /// arrays) given its data offset. `existing` marks slots preassigned by
    /// assembly or pre-configuration; freshly added devices are additionally
    /// scanned for a foreign superblock before the bind commits.
    pub(crate) async fn configure_base_device(
        &self,
        manager: &RaidManager,
        slot_idx: usize,
        existing: bool,
    ) -> RaidResult<()> {
        let (slot_name, slot_uuid, stored_offset, stored_size) = {
            let slots = self.slots().read();
            let slot = &slots[slot_idx];
            debug_assert!(slot.desc.is_none());
            (
                slot.name.clone(),
                slot.uuid,
                slot.data_offset,
                slot.data_size,
            )
        };

        // Resolve the device by UUID alias first so both identity properties
        // are validated before the claim.
        let name = if let Some(uuid) = slot_uuid {
            let device = manager
                .devices()
                .get(&uuid.to_string())
                .ok_or_else(|| RaidError::NotFound(uuid.to_string()))?;
            match slot_name {
                None => {
                    debug_assert!(existing);
                    device.name().to_string()
                }
                Some(name) => {
                    if name != device.name() {
                        error!(
                            expected = %name,
                            actual = %device.name(),
                            "name mismatch for base device"
                        );
                        return Err(RaidError::InvalidParameter(format!(
                            "name mismatch for base device '{}'",
                            device.name()
                        )));
                    }
                    name
                }
            }
        } else {
            slot_name.ok_or_else(|| {
                RaidError::InvalidParameter(format!("slot {slot_idx} has no device name"))
            })?
        };

        let desc = manager.devices().open(&name, true)?;
        let device = Arc::clone(desc.device());

        let uuid = match slot_uuid {
            None => device.uuid(),
            Some(expected) => {
                if expected != device.uuid() {
                    error!(device = %name, "UUID mismatch for base device");
                    return Err(RaidError::InvalidParameter(format!(
                        "UUID mismatch for base device '{name}'"
                    )));
                }
                expected
            }
        };

        if let Err(err) = device.claim(self.name()) {
            warn!(device = %name, %err, "unable to claim base device");
            return Err(RaidError::Busy(format!(
                "base device '{name}' is already claimed"
            )));
        }
        debug!(device = %name, array = %self.name(), "base device claimed");

        let app_channel = desc.channel();
        let block_count = device.block_count();

        let mut data_offset = stored_offset;
        if self.superblock_enabled() {
            let mut offset = if stored_offset == 0 {
                Superblock::min_data_offset_blocks(device.block_size())
            } else {
                stored_offset
            };

            let boundary = device.optimal_io_boundary();
            if boundary != 0 {
                let aligned = offset.div_ceil(boundary) * boundary;
                if stored_offset != 0 && stored_offset != aligned {
                    warn!(
                        device = %name,
                        stored = stored_offset,
                        optimal = aligned,
                        "data offset differs from optimal value"
                    );
                } else {
                    offset = aligned;
                }
            }
            data_offset = offset;
        }

        if data_offset >= block_count {
            error!(
                device = %name,
                data_offset,
                block_count,
                "data offset exceeds base device capacity"
            );
            device.release();
            return Err(RaidError::InvalidParameter(format!(
                "data offset exceeds capacity of base device '{name}'"
            )));
        }

        let data_size = if stored_size == 0 {
            block_count - data_offset
        } else if data_offset + stored_size > block_count {
            error!(
                device = %name,
                data_offset,
                data_size = stored_size,
                block_count,
                "data region exceeds base device capacity"
            );
            device.release();
            return Err(RaidError::InvalidParameter(format!(
                "data region exceeds capacity of base device '{name}'"
            )));
        } else {
            stored_size
        };

        {
            let mut slots = self.slots().write();
            let slot = &mut slots[slot_idx];
            slot.name = Some(name.clone());
            slot.uuid = Some(uuid);
            slot.desc = Some(desc);
            slot.app_channel = Some(app_channel.clone());
            slot.block_count = block_count;
            slot.data_offset = data_offset;
            slot.data_size = data_size;
        }

        if existing {
            self.configure_base_device_cont(manager, slot_idx).await
        } else {
            // A freshly added device must not carry someone else's metadata.
            match Superblock::load(&app_channel).await {
                Ok(SbProbe::Absent) => self.configure_base_device_cont(manager, slot_idx).await,
                Ok(SbProbe::Valid(_)) => {
                    error!(device = %name, "existing raid superblock found on device");
                    let mut slots = self.slots().write();
                    self.free_base_resource_locked(&mut slots[slot_idx]);
                    Err(RaidError::AlreadyExists(format!(
                        "device '{name}' carries a raid superblock"
                    )))
                }
                Err(err) => {
                    error!(device = %name, %err, "failed to examine device");
                    let mut slots = self.slots().write();
                    self.free_base_resource_locked(&mut slots[slot_idx]);
                    Err(err)
                }
            }
        }
    }

    /// Commit a successful bind and trigger configuration once every
    /// operational member has been discovered.
    async fn configure_base_device_cont(
        &self,
        manager: &RaidManager,
        slot_idx: usize,
    ) -> RaidResult<()> {
        {
            let mut slots = self.slots().write();
            slots[slot_idx].is_configured = true;
        }

        if self.state() == RaidState::Online {
            // A member joining an online array counts as operational right
            // away; there is no rebuild process in between.
            self.adjust_operational(1);
        }
        let discovered = self.adjust_discovered(1);
        debug_assert!(discovered <= self.num_base_devices());
        debug_assert!(self.num_operational() <= self.num_base_devices());
        debug_assert!(self.num_operational() >= self.min_operational());

        info!(
            array = %self.name(),
            slot = slot_idx,
            discovered,
            operational = self.num_operational(),
            "base device bound"
        );

        // Configure when the discovered count reaches the number of members
        // known to be operational; for a degraded assembly that is fewer
        // than the slot count.
        if self.state() == RaidState::Configuring && discovered == self.num_operational() {
            if let Err(err) = self.configure(manager).await {
                error!(array = %self.name(), %err, "failed to configure array");
                return Err(err);
            }
        }
        Ok(())
    }
}
