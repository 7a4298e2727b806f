//! Discovery of newly presented backing devices.
//!
//! A device without a superblock can still complete a pre-configured array
//! that named it; a device with one is matched to its array by UUID, with
//! sequence numbers deciding between competing copies.

use std::sync::Arc;

use raidstack_bdev::BlockDevice;
use tracing::{debug, error, info, warn};

use crate::array::RaidArray;
use crate::error::RaidResult;
use crate::manager::{CreateParams, RaidManager};
use crate::superblock::{SbProbe, SlotState, Superblock};
use crate::types::RaidState;

impl RaidManager {
    /// Examine a newly visible device and decide whether it joins an
    /// existing array, creates one from its superblock, or is ignored.
    pub async fn examine(&self, device_name: &str) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;

        let desc = self.devices().open(device_name, false)?;
        let channel = desc.channel();
        let device = Arc::clone(desc.device());

        let probe = match Superblock::load(&channel).await {
            Ok(probe) => probe,
            Err(err) => {
                error!(device = %device_name, %err, "failed to examine device");
                return Err(err);
            }
        };
        drop(desc);

        match probe {
            SbProbe::Absent => {
                self.examine_no_sb(&device).await;
                Ok(())
            }
            SbProbe::Valid(sb) => self.examine_sb(sb, &device).await,
        }
    }

    /// No on-disk metadata: bind the device into any slot that was
    /// pre-configured with its name.
    async fn examine_no_sb(&self, device: &Arc<BlockDevice>) {
        for array in self.list_arrays(None) {
            let slot = array.slots().read().iter().position(|slot| {
                slot.desc.is_none() && slot.name.as_deref() == Some(device.name())
            });
            if let Some(slot_idx) = slot {
                if let Err(err) = array.configure_base_device(self, slot_idx, true).await {
                    warn!(
                        device = %device.name(),
                        array = %array.name(),
                        %err,
                        "failed to bind examined device"
                    );
                }
            }
        }
    }

    async fn examine_sb(&self, sb: Superblock, device: &Arc<BlockDevice>) -> RaidResult<()> {
        if sb.block_size != device.block_size() {
            warn!(
                device = %device.name(),
                device_block_size = device.block_size(),
                sb_block_size = sb.block_size,
                "device block size does not match the value in the superblock"
            );
            return Ok(());
        }

        if sb.uuid.is_nil() {
            warn!(device = %device.name(), "nil array UUID in superblock");
            return Ok(());
        }

        let mut sb = sb;
        let mut existing = self.find_by_uuid(sb.uuid);

        if let Some(array) = existing.as_ref() {
            let current_seq = array.superblock_seq().unwrap_or(0);
            if sb.seq > current_seq {
                debug!(
                    device = %device.name(),
                    array = %array.name(),
                    presented = sb.seq,
                    current = current_seq,
                    "presented superblock is newer than the existing array's"
                );
                if array.state() != RaidState::Configuring {
                    warn!(
                        array = %array.name(),
                        device = %device.name(),
                        "newer superblock found but the array is not configuring"
                    );
                    return Ok(());
                }
                // Rebuild the array from the newer record.
                if let Err(err) = array.delete(self).await {
                    error!(array = %array.name(), %err, "failed to delete stale array");
                    return Err(err);
                }
                existing = None;
            } else if sb.seq < current_seq {
                debug!(
                    device = %device.name(),
                    presented = sb.seq,
                    current = current_seq,
                    "presented superblock is older; using the existing one"
                );
                match array.sb().lock().clone() {
                    Some(current) => sb = current,
                    None => return Ok(()),
                }
            }
        }

        let Some(entry) = sb
            .slots
            .iter()
            .find(|entry| entry.uuid == device.uuid())
            .cloned()
        else {
            debug!(device = %device.name(), "superblock does not contain this device's UUID");
            return Ok(());
        };

        let array = match existing {
            Some(array) => array,
            None => match self.create_from_sb(&sb) {
                Ok(array) => array,
                Err(err) => {
                    error!(array = %sb.name, %err, "failed to create array from superblock");
                    return Err(err);
                }
            },
        };

        if entry.state != SlotState::Configured {
            info!(
                device = %device.name(),
                array = %array.name(),
                "device is not an active member; ignoring"
            );
            return Ok(());
        }

        let Some(slot_idx) = array.find_slot_by_uuid(device.uuid()) else {
            error!(
                device = %device.name(),
                array = %array.name(),
                "device is not a member of the array"
            );
            return Ok(());
        };

        if array.slots().read()[slot_idx].desc.is_some() {
            debug!(device = %device.name(), "device is already bound; ignoring");
            return Ok(());
        }

        if let Err(err) = array.configure_base_device(self, slot_idx, true).await {
            error!(
                device = %device.name(),
                array = %array.name(),
                %err,
                "failed to bind examined device"
            );
        }
        Ok(())
    }

    /// Reconstitute an array record from a persisted superblock.
    fn create_from_sb(&self, sb: &Superblock) -> RaidResult<Arc<RaidArray>> {
        let strip_size_kb =
            (u64::from(sb.strip_size) * u64::from(sb.block_size) / 1024) as u32;

        let array = self.create_array_inner(CreateParams {
            name: sb.name.clone(),
            strip_size_kb,
            num_base_devices: sb.num_base_devices,
            level: sb.level,
            superblock_enabled: true,
            uuid: Some(sb.uuid),
        })?;

        *array.sb().lock() = Some(sb.clone());

        let mut operational = 0;
        {
            let mut slots = array.slots().write();
            for entry in &sb.slots {
                let Some(slot) = slots.get_mut(entry.slot as usize) else {
                    warn!(
                        array = %sb.name,
                        slot = entry.slot,
                        "superblock entry points beyond the slot array"
                    );
                    continue;
                };
                if entry.state == SlotState::Configured {
                    slot.uuid = Some(entry.uuid);
                    operational += 1;
                }
                slot.data_offset = entry.data_offset;
                slot.data_size = entry.data_size;
            }
        }
        array.set_operational(operational);

        info!(
            array = %array.name(),
            uuid = %array.uuid(),
            operational,
            "array assembled from superblock"
        );
        Ok(array)
    }
}
