//! Member management: add, remove (with quiesce fencing), grow and
//! base-device resize.

use std::sync::Arc;

use raidstack_bdev::{BdevError, DeviceEvent};
use tracing::{debug, error, info, warn};

use crate::array::RaidArray;
use crate::base::{BaseInfo, RemoveCb};
use crate::error::{RaidError, RaidResult};
use crate::manager::RaidManager;
use crate::superblock::{SbSlot, SlotState};
use crate::types::RaidState;

fn is_device_pending(err: &RaidError) -> bool {
    matches!(
        err,
        RaidError::NotFound(_) | RaidError::Bdev(BdevError::NotFound(_))
    )
}

impl RaidManager {
    /// Preassign `device_name` to `slot` of an array and bind it.
    ///
    /// A missing device is not fatal: the name stays assigned and the
    /// examine path binds the device when it appears.
    pub async fn add_base_device_at(
        &self,
        raid_name: &str,
        device_name: &str,
        slot: usize,
    ) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;
        let array = self
            .find_by_name(raid_name)
            .ok_or_else(|| RaidError::NotFound(format!("array '{raid_name}'")))?;
        self.add_base_device_inner(&array, device_name, slot).await?;
        self.complete_online_join(&array, slot).await
    }

    /// Bind `device_name` into the first empty slot of an array.
    pub async fn add_base_device(&self, raid_name: &str, device_name: &str) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;
        let array = self
            .find_by_name(raid_name)
            .ok_or_else(|| RaidError::NotFound(format!("array '{raid_name}'")))?;

        let slot = array
            .slots()
            .read()
            .iter()
            .position(|slot| slot.name.is_none() && slot.uuid.is_none())
            .ok_or_else(|| {
                RaidError::Busy(format!("array '{raid_name}' has no empty slot"))
            })?;

        self.add_base_device_inner(&array, device_name, slot).await?;
        self.complete_online_join(&array, slot).await
    }

    pub(crate) async fn add_base_device_inner(
        &self,
        array: &Arc<RaidArray>,
        device_name: &str,
        slot_idx: usize,
    ) -> RaidResult<()> {
        {
            let mut slots = array.slots().write();
            let slot = slots.get_mut(slot_idx).ok_or_else(|| {
                RaidError::InvalidParameter(format!(
                    "slot {slot_idx} out of range on array '{}'",
                    array.name()
                ))
            })?;

            if let Some(name) = slot.name.as_ref() {
                return Err(RaidError::Busy(format!(
                    "slot {slot_idx} on array '{}' already assigned to device '{name}'",
                    array.name()
                )));
            }
            if let Some(uuid) = slot.uuid {
                return Err(RaidError::Busy(format!(
                    "slot {slot_idx} on array '{}' already assigned to device {uuid}",
                    array.name()
                )));
            }

            slot.name = Some(device_name.to_string());
        }

        match array.configure_base_device(self, slot_idx, false).await {
            Ok(()) => Ok(()),
            Err(err) if is_device_pending(&err) => {
                // The slot keeps its name; examine will bind the device
                // when it shows up.
                debug!(
                    array = %array.name(),
                    device = %device_name,
                    "base device not present yet"
                );
                Err(err)
            }
            Err(err) => {
                let mut slots = array.slots().write();
                array.free_base_resource_locked(&mut slots[slot_idx]);
                Err(err)
            }
        }
    }

    /// Remove the member bound to `device_name`.
    ///
    /// Idempotent: removing an already-scheduled member succeeds
    /// immediately. The final status is delivered through `cb`.
    pub async fn remove_base_device(
        &self,
        device_name: &str,
        cb: Option<RemoveCb>,
    ) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;

        let (array, slot_idx) = self
            .find_base_by_device_name(device_name)
            .ok_or_else(|| RaidError::NotFound(format!("base device '{device_name}'")))?;

        debug!(array = %array.name(), device = %device_name, slot = slot_idx, "remove base device");

        {
            let mut slots = array.slots().write();
            let slot = &mut slots[slot_idx];
            if slot.remove_scheduled {
                return Ok(());
            }
            debug_assert!(slot.desc.is_some());
            slot.remove_scheduled = true;
            slot.remove_cb = cb;
        }

        if array.state() != RaidState::Online {
            // Not registered (or already unregistered): clean up in place.
            // This changes only the discovered count, not the operational
            // count.
            {
                let mut slots = array.slots().write();
                array.free_base_resource_locked(&mut slots[slot_idx]);
            }
            if array.num_discovered() == 0 {
                self.registry_remove(&array);
            }
            fire_remove_done(&array, slot_idx, 0);
            return Ok(());
        }

        let operational = array.adjust_operational(-1);
        if operational < array.min_operational() {
            // Not enough members left to keep the array operational.
            array.deconfigure(self).await;
            fire_remove_done(&array, slot_idx, 0);
            return Ok(());
        }

        if let Err(err) = array.gate().quiesce().await {
            warn!(array = %array.name(), %err, "failed to quiesce array");
            array.adjust_operational(1);
            let mut slots = array.slots().write();
            let slot = &mut slots[slot_idx];
            slot.remove_scheduled = false;
            slot.remove_cb = None;
            return Err(RaidError::Busy(format!(
                "array '{}' could not be quiesced",
                array.name()
            )));
        }

        // In-flight and new I/O stop seeing the member before its
        // descriptor goes away.
        array.for_each_channel(|channel| channel.clear_slot(slot_idx));
        array.gate().unquiesce();

        {
            let mut slots = array.slots().write();
            array.free_base_resource_locked(&mut slots[slot_idx]);
        }

        let mut status = 0;
        if array.superblock_enabled() {
            {
                let mut sb_guard = array.sb().lock();
                if let Some(sb) = sb_guard.as_mut() {
                    if let Some(entry) = sb.slots.iter_mut().find(|entry| {
                        entry.state == SlotState::Configured && entry.slot == slot_idx as u8
                    }) {
                        entry.state = SlotState::Failed;
                    }
                }
            }
            if let Err(err) = array.write_superblock().await {
                error!(array = %array.name(), %err, "failed to write superblock");
                status = err.errno();
            }
        }

        info!(
            array = %array.name(),
            device = %device_name,
            operational = array.num_operational(),
            "base device removed"
        );
        fire_remove_done(&array, slot_idx, status);
        Ok(())
    }

    /// Add one more member to an ONLINE array, growing the slot count when
    /// no empty slot is left.
    pub async fn grow_base_device(&self, raid_name: &str, device_name: &str) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;

        let array = self
            .find_by_name(raid_name)
            .ok_or_else(|| RaidError::NotFound(format!("array '{raid_name}'")))?;
        if self.devices().get(device_name).is_none() {
            return Err(RaidError::NotFound(format!("base device '{device_name}'")));
        }
        if array.destroy_started() {
            return Err(RaidError::DeleteInProgress(array.name().to_string()));
        }

        let empty_slot = array
            .slots()
            .read()
            .iter()
            .position(|slot| slot.name.is_none() && slot.uuid.is_none());
        if let Some(slot) = empty_slot {
            self.add_base_device_inner(&array, device_name, slot).await?;
            return self.complete_online_join(&array, slot).await;
        }

        if !array.personality().supports_resize() {
            return Err(RaidError::Unsupported(format!(
                "personality '{}' cannot grow",
                array.level()
            )));
        }
        if array.state() != RaidState::Online {
            return Err(RaidError::InvalidParameter(format!(
                "array '{raid_name}' is not online"
            )));
        }

        let old_num = array.num_base_devices();
        if old_num == u8::MAX {
            return Err(RaidError::InvalidParameter(format!(
                "array '{raid_name}' already has the maximum number of slots"
            )));
        }
        let old_min = array.min_operational();
        let new_min = array
            .personality()
            .constraint()
            .min_operational(old_num + 1)?;

        let slot_idx = {
            let mut slots = array.slots().write();
            let mut slot = BaseInfo::empty();
            slot.name = Some(device_name.to_string());
            slots.push(slot);
            slots.len() - 1
        };
        array.set_min_operational(new_min);

        if let Err(err) = array.configure_base_device(self, slot_idx, false).await {
            let mut slots = array.slots().write();
            slots.pop();
            drop(slots);
            array.set_min_operational(old_min);
            return Err(err);
        }

        if let Err(err) = array.personality().resize(&array) {
            error!(array = %array.name(), %err, "personality resize failed");
            let mut slots = array.slots().write();
            array.free_base_resource_locked(&mut slots[slot_idx]);
            slots.pop();
            drop(slots);
            array.adjust_operational(-1);
            array.set_min_operational(old_min);
            return Err(err);
        }

        // Publish and persist the new geometry only after the personality
        // accepted it.
        self.complete_online_join(&array, slot_idx).await?;

        info!(
            array = %array.name(),
            device = %device_name,
            slots = array.num_base_devices(),
            "array grown"
        );
        Ok(())
    }

    /// Finish a member's join to an ONLINE array: install its channel into
    /// every live worker channel (the counterpart of the slot nulling done
    /// on removal) and record it in the superblock.
    async fn complete_online_join(
        &self,
        array: &Arc<RaidArray>,
        slot_idx: usize,
    ) -> RaidResult<()> {
        if array.state() != RaidState::Online {
            return Ok(());
        }
        array.attach_slot_channels(slot_idx);
        self.persist_online_join(array, slot_idx).await
    }

    /// Record a member that joined an ONLINE array in the superblock and
    /// persist it.
    async fn persist_online_join(&self, array: &Arc<RaidArray>, slot_idx: usize) -> RaidResult<()> {
        if !array.superblock_enabled() || array.state() != RaidState::Online {
            return Ok(());
        }

        let entry = {
            let slots = array.slots().read();
            let slot = &slots[slot_idx];
            SbSlot {
                uuid: slot.uuid.unwrap_or_default(),
                slot: slot_idx as u8,
                state: SlotState::Configured,
                data_offset: slot.data_offset,
                data_size: slot.data_size,
            }
        };
        let changed = {
            let mut sb_guard = array.sb().lock();
            match sb_guard.as_mut() {
                Some(sb) => {
                    let mut changed = false;
                    if sb.num_base_devices != array.num_base_devices() {
                        sb.num_base_devices = array.num_base_devices();
                        changed = true;
                    }
                    if sb.raid_size != array.block_count() {
                        sb.raid_size = array.block_count();
                        changed = true;
                    }
                    let present = sb.slots.iter().any(|existing| {
                        existing.state == SlotState::Configured && existing.uuid == entry.uuid
                    });
                    if !present {
                        sb.slots.push(entry);
                        changed = true;
                    }
                    changed
                }
                None => false,
            }
        };
        if !changed {
            return Ok(());
        }
        array.write_superblock().await
    }

    /// Route an asynchronous event on a backing device.
    pub async fn handle_device_event(
        &self,
        device_name: &str,
        event: DeviceEvent,
    ) -> RaidResult<()> {
        match event {
            DeviceEvent::Remove => self.remove_base_device(device_name, None).await,
            DeviceEvent::Resize => self.handle_base_device_resize(device_name).await,
        }
    }

    async fn handle_base_device_resize(&self, device_name: &str) -> RaidResult<()> {
        let _ctl = self.ctl_lock.lock().await;

        let (array, slot_idx) = self
            .find_base_by_device_name(device_name)
            .ok_or_else(|| RaidError::NotFound(format!("base device '{device_name}'")))?;

        let new_count = {
            let mut slots = array.slots().write();
            let slot = &mut slots[slot_idx];
            let device = slot
                .desc
                .as_ref()
                .map(|desc| Arc::clone(desc.device()))
                .ok_or_else(|| RaidError::NotFound(format!("base device '{device_name}'")))?;
            let old = slot.block_count;
            slot.block_count = device.block_count();
            info!(
                device = %device_name,
                old,
                new = slot.block_count,
                "base device was resized"
            );
            slot.block_count
        };
        debug!(device = %device_name, new_count, "noting new base device capacity");

        if array.personality().supports_resize() {
            array.personality().resize(&array)?;
        }
        Ok(())
    }
}

fn fire_remove_done(array: &Arc<RaidArray>, slot_idx: usize, status: i32) {
    let cb = {
        let mut slots = array.slots().write();
        match slots.get_mut(slot_idx) {
            Some(slot) => {
                slot.remove_scheduled = false;
                slot.remove_cb.take()
            }
            None => None,
        }
    };
    if let Some(cb) = cb {
        cb(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{online_mirror, online_mirror_sb, TestEnv};
    use crate::types::RaidLevel;
    use raidstack_bdev::IoStatus;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[tokio::test]
    async fn test_add_rejects_out_of_range_slot() {
        let env = TestEnv::new();
        env.add_device("d0", 4096, 1 << 18);
        env.create_mirror("r1", 2).await.unwrap();
        let err = env
            .manager
            .add_base_device_at("r1", "d0", 5)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -22);
    }

    #[tokio::test]
    async fn test_add_rejects_assigned_slot() {
        let env = TestEnv::new();
        env.add_device("d0", 4096, 1 << 18);
        env.add_device("d1", 4096, 1 << 18);
        env.create_mirror("r1", 2).await.unwrap();

        env.manager.add_base_device_at("r1", "d0", 0).await.unwrap();
        let err = env
            .manager
            .add_base_device_at("r1", "d1", 0)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -16);
    }

    #[tokio::test]
    async fn test_add_missing_device_keeps_slot_name() {
        let env = TestEnv::new();
        env.create_mirror("r1", 2).await.unwrap();

        let err = env
            .manager
            .add_base_device_at("r1", "ghost", 0)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -19);

        let array = env.manager.find_by_name("r1").unwrap();
        assert_eq!(array.slot_snapshot()[0].name.as_deref(), Some("ghost"));
    }

    #[tokio::test]
    async fn test_add_claimed_device_rejected_and_slot_cleared() {
        let env = TestEnv::new();
        let dev = env.add_device("d0", 4096, 1 << 18);
        dev.claim("someone-else").unwrap();
        env.create_mirror("r1", 2).await.unwrap();

        let err = env
            .manager
            .add_base_device_at("r1", "d0", 0)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -16);

        let array = env.manager.find_by_name("r1").unwrap();
        assert!(array.slot_snapshot()[0].name.is_none());
    }

    #[tokio::test]
    async fn test_degraded_tolerant_remove() {
        let env = online_mirror_sb("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        assert_eq!(array.state(), RaidState::Online);

        let status = Arc::new(AtomicI32::new(i32::MIN));
        let status_cb = Arc::clone(&status);
        env.manager
            .remove_base_device(
                "d0",
                Some(Box::new(move |s| {
                    status_cb.store(s, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        assert_eq!(status.load(Ordering::SeqCst), 0);
        assert_eq!(array.state(), RaidState::Online);
        assert_eq!(array.num_operational(), 1);

        // the on-disk record now marks slot 0 as failed
        let sb = array.sb().lock().clone().unwrap();
        let entry = sb.slots.iter().find(|entry| entry.slot == 0).unwrap();
        assert_eq!(entry.state, SlotState::Failed);

        // I/O still works against the surviving member
        let channel = array.get_channel().unwrap();
        let data = bytes::Bytes::from(vec![7u8; 4096]);
        let status = array.write_blocks(&channel, 0, 1, data).await.unwrap();
        assert_eq!(status, IoStatus::Success);
    }

    #[tokio::test]
    async fn test_below_minimum_remove_deconfigures() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();

        env.manager.remove_base_device("d0", None).await.unwrap();
        assert_eq!(array.state(), RaidState::Online);

        env.manager.remove_base_device("d1", None).await.unwrap();
        assert_eq!(array.state(), RaidState::Offline);
        assert!(!env.manager.frontend_registered("r1"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let env = online_mirror("r1", &["d0", "d1"]).await;

        env.manager.remove_base_device("d0", None).await.unwrap();
        // the member is gone, so a second call cannot find it
        let err = env
            .manager
            .remove_base_device("d0", None)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -19);
    }

    #[tokio::test]
    async fn test_remove_unknown_device() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let err = env
            .manager
            .remove_base_device("ghost", None)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -19);
    }

    #[tokio::test]
    async fn test_quiesce_failure_clears_remove_scheduled() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();

        // hold the gate closed so the removal cannot quiesce
        array.gate().quiesce().await.unwrap();

        let err = env
            .manager
            .remove_base_device("d0", None)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), -16);

        let snapshot = array.slot_snapshot();
        assert!(!snapshot[0].remove_scheduled);
        assert_eq!(array.num_operational(), 2);

        // the operation can be retried once the gate reopens
        array.gate().unquiesce();
        env.manager.remove_base_device("d0", None).await.unwrap();
        assert_eq!(array.num_operational(), 1);
    }

    #[tokio::test]
    async fn test_grow_adds_slot_and_updates_superblock() {
        let env = online_mirror_sb("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        env.add_device("d2", 4096, 1 << 18);

        let seq_before = array.superblock_seq().unwrap();
        env.manager.grow_base_device("r1", "d2").await.unwrap();

        assert_eq!(array.num_base_devices(), 3);
        assert_eq!(array.num_operational(), 3);
        assert_eq!(array.num_discovered(), 3);
        assert_eq!(array.state(), RaidState::Online);

        let sb = array.sb().lock().clone().unwrap();
        assert_eq!(sb.num_base_devices, 3);
        assert!(sb.seq > seq_before);
        assert!(sb
            .slots
            .iter()
            .any(|entry| entry.slot == 2 && entry.state == SlotState::Configured));
    }

    #[tokio::test]
    async fn test_grow_requires_resize_hook() {
        let env = TestEnv::new();
        for name in ["d0", "d1"] {
            env.add_device(name, 4096, 1 << 18);
        }
        env.manager
            .create_array(crate::manager::CreateParams {
                name: "r0".into(),
                strip_size_kb: 64,
                num_base_devices: 2,
                level: RaidLevel::Raid0,
                superblock_enabled: false,
                uuid: None,
            })
            .await
            .unwrap();
        env.manager.add_base_device_at("r0", "d0", 0).await.unwrap();
        env.manager.add_base_device_at("r0", "d1", 1).await.unwrap();
        env.add_device("d2", 4096, 1 << 18);

        let err = env
            .manager
            .grow_base_device("r0", "d2")
            .await
            .unwrap_err();
        assert!(matches!(err, RaidError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_grow_fills_empty_slot_first() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();

        // removal leaves slot 0 empty but the array online
        env.manager.remove_base_device("d0", None).await.unwrap();
        assert_eq!(array.num_base_devices(), 2);

        env.add_device("d2", 4096, 1 << 18);
        env.manager.grow_base_device("r1", "d2").await.unwrap();

        // the empty slot was reused, no new slot appended
        assert_eq!(array.num_base_devices(), 2);
        assert_eq!(array.slot_snapshot()[0].name.as_deref(), Some("d2"));
    }

    #[tokio::test]
    async fn test_grow_updates_live_channels() {
        let env = online_mirror_sb("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();

        // channel obtained before the grow, as a long-lived worker would
        let channel = array.get_channel().unwrap();
        assert_eq!(channel.num_slots(), 2);

        env.add_device("d2", 4096, 1 << 18);
        env.manager.grow_base_device("r1", "d2").await.unwrap();

        // the pre-existing channel sees the new member
        assert_eq!(channel.num_slots(), 3);
        assert!(channel.base_channel(2).is_some());

        // a write through the old channel lands on the new member too
        let data = bytes::Bytes::from(vec![9u8; 4096]);
        let status = array
            .write_blocks(&channel, 0, 1, data.clone())
            .await
            .unwrap();
        assert_eq!(status, IoStatus::Success);

        let data_offset = array.slot_snapshot()[2].data_offset;
        let ch = raidstack_bdev::Descriptor::new(env.device("d2"), false).channel();
        let mut buf = bytes::BytesMut::new();
        assert_eq!(
            ch.read_blocks(data_offset, 1, &mut buf).await,
            Ok(IoStatus::Success)
        );
        assert_eq!(&buf[..], &data[..]);

        // a reset through the old channel fans out to all three members
        assert_eq!(array.reset(&channel).await.unwrap(), IoStatus::Success);
    }

    #[tokio::test]
    async fn test_add_into_freed_slot_updates_live_channels() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        // removal nulls the live entry
        env.manager.remove_base_device("d0", None).await.unwrap();
        assert!(channel.base_channel(0).is_none());

        // reusing the freed slot installs the replacement in place
        env.add_device("d2", 4096, 1 << 18);
        env.manager.grow_base_device("r1", "d2").await.unwrap();

        let replacement = channel.base_channel(0).unwrap();
        assert_eq!(replacement.device().name(), "d2");
        assert_eq!(channel.num_slots(), 2);
    }

    #[tokio::test]
    async fn test_resize_event_updates_capacity() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let before = array.slot_snapshot()[0].block_count;

        env.device("d0").resize((1 << 18) + 4096);
        env.manager
            .handle_device_event("d0", DeviceEvent::Resize)
            .await
            .unwrap();

        let after = array.slot_snapshot()[0].block_count;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_remove_event_routes_to_remove_flow() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();

        env.manager
            .handle_device_event("d0", DeviceEvent::Remove)
            .await
            .unwrap();
        assert_eq!(array.num_operational(), 1);
    }
}
