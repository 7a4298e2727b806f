//! The RAID array record and its lifecycle engine.
//!
//! An array starts CONFIGURING, collects its member slots one at a time and
//! goes ONLINE once every operational member has been discovered. Member
//! removal below the personality's minimum, or an explicit delete, takes it
//! OFFLINE; OFFLINE is terminal for the instance.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use raidstack_bdev::{MetadataFormat, QuiesceGate};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::base::BaseInfo;
use crate::channel::RaidChannel;
use crate::error::{RaidError, RaidResult};
use crate::manager::RaidManager;
use crate::personality::{Personality, PersonalityRegistry};
use crate::superblock::{SbSlot, SlotState, Superblock, SB_NAME_SIZE, SB_VERSION};
use crate::types::{RaidLevel, RaidState};

/// One RAID virtual block device.
pub struct RaidArray {
    name: String,
    uuid: Uuid,
    level: RaidLevel,
    strip_size_kb: u32,
    sb_enabled: bool,
    personality: Arc<dyn Personality>,

    state: Mutex<RaidState>,
    /// Slot array; guards mutations visible to data-path threads.
    slots: RwLock<Vec<BaseInfo>>,

    min_operational: AtomicU8,
    discovered: AtomicU8,
    operational: AtomicU8,

    strip_size_blocks: AtomicU32,
    block_size: AtomicU32,
    blocklen_shift: AtomicU32,
    block_count: AtomicU64,
    md: Mutex<MetadataFormat>,

    sb: Mutex<Option<Superblock>>,
    /// Serializes superblock writes; sequence numbers are totally ordered.
    sb_write_lock: tokio::sync::Mutex<()>,

    destroy_started: AtomicBool,
    channels: Mutex<Vec<Weak<RaidChannel>>>,
    gate: QuiesceGate,

    stop_done: Notify,
    this: Weak<RaidArray>,
}

impl std::fmt::Debug for RaidArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaidArray")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl RaidArray {
    /// Allocate a new array record in CONFIGURING state.
    ///
    /// Validates everything that does not need the member devices yet: name
    /// bound, strip-size rules, personality availability, slot-count minimum
    /// and the degradation-constraint arithmetic.
    pub(crate) fn new(
        personalities: &PersonalityRegistry,
        name: &str,
        strip_size_kb: u32,
        num_base_devices: u8,
        level: RaidLevel,
        sb_enabled: bool,
        uuid: Option<Uuid>,
    ) -> RaidResult<Arc<RaidArray>> {
        if name.is_empty() || name.len() >= SB_NAME_SIZE {
            return Err(RaidError::InvalidParameter(format!(
                "array name must be 1..{} characters",
                SB_NAME_SIZE - 1
            )));
        }

        if level == RaidLevel::Raid1 {
            if strip_size_kb != 0 {
                return Err(RaidError::InvalidParameter(
                    "strip size is not supported by raid1".into(),
                ));
            }
        } else if !strip_size_kb.is_power_of_two() {
            return Err(RaidError::InvalidParameter(format!(
                "invalid strip size {strip_size_kb}"
            )));
        }

        let personality = personalities.find(level).ok_or_else(|| {
            RaidError::InvalidParameter(format!("unsupported raid level '{level}'"))
        })?;

        if num_base_devices < personality.min_base_devices() {
            return Err(RaidError::InvalidParameter(format!(
                "at least {} base devices required for {level}",
                personality.min_base_devices()
            )));
        }

        let min_operational = personality.constraint().min_operational(num_base_devices)?;

        let uuid = match uuid {
            Some(uuid) if !uuid.is_nil() => uuid,
            _ => Uuid::new_v4(),
        };

        let slots: Vec<BaseInfo> = (0..num_base_devices).map(|_| BaseInfo::empty()).collect();

        Ok(Arc::new_cyclic(|this| RaidArray {
            name: name.to_string(),
            uuid,
            level,
            strip_size_kb,
            sb_enabled,
            personality,
            state: Mutex::new(RaidState::Configuring),
            slots: RwLock::new(slots),
            min_operational: AtomicU8::new(min_operational),
            discovered: AtomicU8::new(0),
            operational: AtomicU8::new(num_base_devices),
            strip_size_blocks: AtomicU32::new(0),
            block_size: AtomicU32::new(0),
            blocklen_shift: AtomicU32::new(0),
            block_count: AtomicU64::new(0),
            md: Mutex::new(MetadataFormat::default()),
            sb: Mutex::new(None),
            sb_write_lock: tokio::sync::Mutex::new(()),
            destroy_started: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
            gate: QuiesceGate::new(),
            stop_done: Notify::new(),
            this: this.clone(),
        }))
    }

    /// Strong handle on this record; valid for as long as any handle is.
    pub(crate) fn arc(&self) -> Arc<RaidArray> {
        self.this.upgrade().expect("array record still referenced")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn level(&self) -> RaidLevel {
        self.level
    }

    pub fn state(&self) -> RaidState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: RaidState) {
        *self.state.lock() = state;
    }

    pub fn strip_size_kb(&self) -> u32 {
        self.strip_size_kb
    }

    /// Strip size in blocks; zero until configured.
    pub fn strip_size_blocks(&self) -> u32 {
        self.strip_size_blocks.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn blocklen_shift(&self) -> u32 {
        self.blocklen_shift.load(Ordering::Acquire)
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Acquire)
    }

    /// Set by the personality's start/resize hooks.
    pub fn set_block_count(&self, blocks: u64) {
        self.block_count.store(blocks, Ordering::Release);
    }

    pub fn num_base_devices(&self) -> u8 {
        self.slots.read().len() as u8
    }

    pub fn num_discovered(&self) -> u8 {
        self.discovered.load(Ordering::Acquire)
    }

    pub fn num_operational(&self) -> u8 {
        self.operational.load(Ordering::Acquire)
    }

    pub fn min_operational(&self) -> u8 {
        self.min_operational.load(Ordering::Acquire)
    }

    pub fn superblock_enabled(&self) -> bool {
        self.sb_enabled
    }

    /// Sequence number of the in-memory superblock, if any.
    pub fn superblock_seq(&self) -> Option<u64> {
        self.sb.lock().as_ref().map(|sb| sb.seq)
    }

    pub fn personality(&self) -> &Arc<dyn Personality> {
        &self.personality
    }

    pub(crate) fn gate(&self) -> &QuiesceGate {
        &self.gate
    }

    pub(crate) fn slots(&self) -> &RwLock<Vec<BaseInfo>> {
        &self.slots
    }

    pub(crate) fn sb(&self) -> &Mutex<Option<Superblock>> {
        &self.sb
    }

    pub(crate) fn channels(&self) -> &Mutex<Vec<Weak<RaidChannel>>> {
        &self.channels
    }

    pub(crate) fn destroy_started(&self) -> bool {
        self.destroy_started.load(Ordering::Acquire)
    }

    pub(crate) fn adjust_discovered(&self, delta: i8) -> u8 {
        if delta >= 0 {
            self.discovered.fetch_add(delta as u8, Ordering::AcqRel) + delta as u8
        } else {
            let sub = delta.unsigned_abs();
            self.discovered.fetch_sub(sub, Ordering::AcqRel) - sub
        }
    }

    pub(crate) fn adjust_operational(&self, delta: i8) -> u8 {
        if delta >= 0 {
            self.operational.fetch_add(delta as u8, Ordering::AcqRel) + delta as u8
        } else {
            let sub = delta.unsigned_abs();
            self.operational.fetch_sub(sub, Ordering::AcqRel) - sub
        }
    }

    pub(crate) fn set_operational(&self, count: u8) {
        self.operational.store(count, Ordering::Release);
    }

    pub(crate) fn set_min_operational(&self, count: u8) {
        self.min_operational.store(count, Ordering::Release);
    }

    /// Signals completion of an asynchronous personality stop.
    pub fn personality_stop_done(&self) {
        self.stop_done.notify_one();
    }

    /// Transition to ONLINE. Called when the discovered count has reached
    /// the operational count.
    pub(crate) async fn configure(&self, manager: &RaidManager) -> RaidResult<()> {
        debug_assert_eq!(self.state(), RaidState::Configuring);
        debug_assert_eq!(self.num_discovered(), self.num_operational());

        // Every configured member must agree on the block size.
        let mut blocklen = 0u32;
        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                let Some(desc) = slot.desc.as_ref() else {
                    continue;
                };
                let bs = desc.device().block_size();
                if blocklen == 0 {
                    blocklen = bs;
                } else if blocklen != bs {
                    error!(array = %self.name, "base device block sizes do not match");
                    return Err(RaidError::InvalidParameter(
                        "base device block sizes do not match".into(),
                    ));
                }
            }
        }
        debug_assert!(blocklen > 0);

        let strip_blocks = (u64::from(self.strip_size_kb) * 1024 / u64::from(blocklen)) as u32;
        if strip_blocks == 0 && self.level != RaidLevel::Raid1 {
            error!(array = %self.name, "strip size is smaller than the device block size");
            return Err(RaidError::InvalidParameter(
                "strip size cannot be smaller than the device block size".into(),
            ));
        }
        self.strip_size_blocks.store(strip_blocks, Ordering::Release);
        self.blocklen_shift
            .store(blocklen.trailing_zeros(), Ordering::Release);
        self.block_size.store(blocklen, Ordering::Release);

        self.configure_metadata_format()?;

        self.personality.start(self)?;

        if self.sb_enabled {
            let fresh = self.sb.lock().is_none();
            if fresh {
                self.init_superblock();
            } else if let Err(err) = self.validate_superblock() {
                self.stop_personality().await;
                return Err(err);
            }

            if let Err(err) = self.write_superblock().await {
                error!(array = %self.name, %err, "failed to write superblock");
                self.stop_personality().await;
                return Err(err);
            }
        }

        self.set_state(RaidState::Online);
        if let Err(err) = manager.register_frontend(&self.arc()) {
            error!(array = %self.name, %err, "failed to register block device front end");
            self.stop_personality().await;
            self.set_state(RaidState::Configuring);
            return Err(err);
        }

        info!(
            array = %self.name,
            uuid = %self.uuid,
            level = %self.level,
            block_count = self.block_count(),
            block_size = self.block_size(),
            "array is online"
        );
        Ok(())
    }

    /// Reject members whose metadata format disagrees with the first
    /// configured slot, and any member with end-to-end protection enabled.
    fn configure_metadata_format(&self) -> RaidResult<()> {
        let slots = self.slots.read();
        let mut baseline: Option<MetadataFormat> = None;

        for slot in slots.iter() {
            let Some(desc) = slot.desc.as_ref() else {
                continue;
            };
            let md = desc.device().metadata_format();

            if md.dif_enabled {
                error!(array = %self.name, "base device has DIF/DIX enabled");
                return Err(RaidError::IncompatibleMetadata(
                    "base device has DIF/DIX enabled".into(),
                ));
            }

            match baseline {
                None => baseline = Some(md),
                Some(first) => {
                    if first.len != md.len || first.interleave != md.interleave {
                        error!(array = %self.name, "base devices have different metadata formats");
                        return Err(RaidError::IncompatibleMetadata(
                            "base devices have different metadata formats".into(),
                        ));
                    }
                }
            }
        }

        if let Some(md) = baseline {
            *self.md.lock() = md;
        }
        Ok(())
    }

    /// Fill a fresh superblock from the current array geometry.
    fn init_superblock(&self) {
        let slots = self.slots.read();
        let entries = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_configured)
            .map(|(i, slot)| SbSlot {
                uuid: slot.uuid.unwrap_or_default(),
                slot: i as u8,
                state: SlotState::Configured,
                data_offset: slot.data_offset,
                data_size: slot.data_size,
            })
            .collect();

        *self.sb.lock() = Some(Superblock {
            version: SB_VERSION,
            seq: 0,
            uuid: self.uuid,
            name: self.name.clone(),
            level: self.level,
            strip_size: self.strip_size_blocks(),
            block_size: self.block_size(),
            raid_size: self.block_count(),
            num_base_devices: slots.len() as u8,
            slots: entries,
        });
    }

    /// Cross-check an assembled superblock against the configured geometry.
    fn validate_superblock(&self) -> RaidResult<()> {
        let sb_guard = self.sb.lock();
        let sb = sb_guard
            .as_ref()
            .ok_or_else(|| RaidError::InvalidParameter("array has no superblock".into()))?;

        debug_assert_eq!(sb.uuid, self.uuid);
        if sb.block_size != self.block_size() {
            return Err(RaidError::InvalidParameter(
                "block size does not match value in superblock".into(),
            ));
        }
        if sb.raid_size != self.block_count() {
            return Err(RaidError::InvalidParameter(
                "array size does not match value in superblock".into(),
            ));
        }
        Ok(())
    }

    /// Persist the superblock to every open member.
    ///
    /// The sequence number is bumped first; the write succeeds only if every
    /// member write succeeded. On partial failure the bumped copy still wins
    /// at the next assembly.
    pub(crate) async fn write_superblock(&self) -> RaidResult<()> {
        let _ordered = self.sb_write_lock.lock().await;

        let record = {
            let mut sb_guard = self.sb.lock();
            let sb = sb_guard
                .as_mut()
                .ok_or_else(|| RaidError::InvalidParameter("array has no superblock".into()))?;
            sb.seq += 1;
            sb.clone()
        };

        let channels: Vec<_> = {
            let slots = self.slots.read();
            slots
                .iter()
                .filter_map(|slot| slot.app_channel.clone())
                .collect()
        };

        debug!(array = %self.name, seq = record.seq, members = channels.len(), "writing superblock");

        let results =
            futures::future::join_all(channels.iter().map(|ch| record.write_to(ch))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn stop_personality(&self) {
        let notified = self.stop_done.notified();
        if !self.personality.stop(self) {
            notified.await;
        }
    }

    /// Take the array offline and run the destruct sequence.
    pub(crate) async fn deconfigure(&self, manager: &RaidManager) {
        if self.state() != RaidState::Online {
            return;
        }

        self.set_state(RaidState::Offline);
        debug_assert!(self.num_discovered() > 0);
        info!(array = %self.name, "array state changing from online to offline");

        manager.unregister_frontend(&self.arc());
        // Drain in-flight logical I/O before tearing members down.
        if let Err(err) = self.gate.quiesce().await {
            warn!(array = %self.name, %err, "quiesce during deconfigure failed");
        }

        self.destruct(manager).await;
    }

    /// Destruct sequence run by the unregister pipeline.
    pub(crate) async fn destruct(&self, manager: &RaidManager) {
        debug!(array = %self.name, "destructing array");

        {
            let mut slots = self.slots.write();
            for slot in slots.iter_mut() {
                // Descriptors are released when shutdown has begun or the
                // member's removal is scheduled; otherwise the examine path
                // may reattach them later.
                if manager.shutdown_started() || slot.remove_scheduled {
                    self.free_base_resource_locked(slot);
                }
            }
        }

        self.stop_personality().await;

        if self.num_discovered() == 0 {
            manager.registry_remove(&self.arc());
        }
    }

    /// Delete the array. Idempotent: a second call reports
    /// [`RaidError::DeleteInProgress`].
    pub(crate) async fn delete(&self, manager: &RaidManager) -> RaidResult<()> {
        if self.destroy_started.swap(true, Ordering::AcqRel) {
            debug!(array = %self.name, "delete already in progress");
            return Err(RaidError::DeleteInProgress(self.name.clone()));
        }

        info!(array = %self.name, "deleting array");

        let online = self.state() == RaidState::Online;
        {
            let mut slots = self.slots.write();
            for slot in slots.iter_mut() {
                slot.remove_scheduled = true;
                if !online {
                    self.free_base_resource_locked(slot);
                }
            }
        }

        if self.num_discovered() == 0 {
            manager.registry_remove(&self.arc());
        } else {
            self.deconfigure(manager).await;
        }
        Ok(())
    }

    /// Release a slot's backing resources. Must be called with the slot
    /// array write-locked.
    pub(crate) fn free_base_resource_locked(&self, slot: &mut BaseInfo) {
        slot.name = None;
        if self.state() != RaidState::Configuring {
            slot.uuid = None;
        }

        let Some(desc) = slot.desc.take() else {
            return;
        };
        desc.device().release();
        slot.app_channel = None;

        if slot.is_configured {
            slot.is_configured = false;
            let prev = self.discovered.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0);
        }
    }

    pub(crate) fn find_slot_by_uuid(&self, uuid: Uuid) -> Option<usize> {
        self.slots
            .read()
            .iter()
            .position(|slot| slot.uuid == Some(uuid))
    }

    pub(crate) fn find_slot_by_device_name(&self, name: &str) -> Option<usize> {
        self.slots.read().iter().position(|slot| {
            slot.desc
                .as_ref()
                .is_some_and(|desc| desc.device().name() == name)
        })
    }
}
