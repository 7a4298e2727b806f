//! Shared test fixtures: a device/manager environment and two minimal
//! personalities that exercise the engine's fan-out paths.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::join_all;
use raidstack_bdev::{BlockDevice, DeviceRegistry, IoChannel, IoStatus, IoType, SubmitError};

use crate::array::RaidArray;
use crate::error::{RaidError, RaidResult};
use crate::io::RaidIo;
use crate::manager::{CreateParams, RaidManager};
use crate::personality::{Constraint, Personality, PersonalityRegistry};
use crate::types::RaidLevel;

pub(crate) fn test_personalities() -> Arc<PersonalityRegistry> {
    let registry = Arc::new(PersonalityRegistry::new());
    registry.register(Arc::new(MirrorPersona)).unwrap();
    registry.register(Arc::new(StripePersona)).unwrap();
    registry
}

pub(crate) struct TestEnv {
    pub devices: Arc<DeviceRegistry>,
    pub manager: Arc<RaidManager>,
}

impl TestEnv {
    pub fn new() -> Self {
        let devices = Arc::new(DeviceRegistry::new());
        let manager =
            RaidManager::with_personalities(Arc::clone(&devices), test_personalities());
        Self { devices, manager }
    }

    /// Simulate a host restart: the same devices with their data, fresh
    /// engine state, no claims.
    pub fn restarted(env: &TestEnv) -> Self {
        for device in env.devices.list() {
            device.release();
        }
        let manager =
            RaidManager::with_personalities(Arc::clone(&env.devices), test_personalities());
        Self {
            devices: Arc::clone(&env.devices),
            manager,
        }
    }

    pub fn add_device(&self, name: &str, block_size: u32, blocks: u64) -> Arc<BlockDevice> {
        let device = Arc::new(BlockDevice::new(name, block_size, blocks));
        self.devices.add(Arc::clone(&device)).unwrap();
        device
    }

    pub fn device(&self, name: &str) -> Arc<BlockDevice> {
        self.devices.get(name).unwrap()
    }

    pub async fn create_mirror(&self, name: &str, slots: u8) -> RaidResult<Arc<RaidArray>> {
        self.manager
            .create_array(CreateParams {
                name: name.into(),
                strip_size_kb: 0,
                num_base_devices: slots,
                level: RaidLevel::Raid1,
                superblock_enabled: false,
                uuid: None,
            })
            .await
    }
}

async fn mirror_env(name: &str, devices: &[&str], superblock: bool) -> TestEnv {
    let env = TestEnv::new();
    for device in devices {
        env.add_device(device, 4096, 1 << 18);
    }
    env.manager
        .create_array(CreateParams {
            name: name.into(),
            strip_size_kb: 0,
            num_base_devices: devices.len() as u8,
            level: RaidLevel::Raid1,
            superblock_enabled: superblock,
            uuid: None,
        })
        .await
        .unwrap();
    for (slot, device) in devices.iter().enumerate() {
        env.manager
            .add_base_device_at(name, device, slot)
            .await
            .unwrap();
    }
    env
}

/// A mirror array, online, without on-disk metadata.
pub(crate) async fn online_mirror(name: &str, devices: &[&str]) -> TestEnv {
    mirror_env(name, devices, false).await
}

/// A mirror array, online, with superblocks on every member.
pub(crate) async fn online_mirror_sb(name: &str, devices: &[&str]) -> TestEnv {
    mirror_env(name, devices, true).await
}

/// Retry a channel write until the device stops rejecting it.
async fn channel_write(ch: &IoChannel, offset: u64, num: u64, data: &[u8]) -> IoStatus {
    loop {
        match ch.write_blocks(offset, num, data).await {
            Ok(status) => return status,
            Err(SubmitError::NoMem) => ch.device().wait_for_capacity().await,
            Err(SubmitError::Failed) => return IoStatus::Failed,
        }
    }
}

async fn channel_read(ch: &IoChannel, offset: u64, num: u64, buf: &mut BytesMut) -> IoStatus {
    loop {
        match ch.read_blocks(offset, num, buf).await {
            Ok(status) => return status,
            Err(SubmitError::NoMem) => ch.device().wait_for_capacity().await,
            Err(SubmitError::Failed) => return IoStatus::Failed,
        }
    }
}

/// Channels of all present members, with their data offsets.
fn member_channels(io: &RaidIo) -> Vec<(u64, IoChannel)> {
    let snapshot = io.array().slot_snapshot();
    (0..io.channel().num_slots())
        .filter_map(|slot| {
            io.channel()
                .base_channel(slot)
                .map(|ch| (snapshot[slot].data_offset, ch))
        })
        .collect()
}

/// Mirroring test personality: writes go to every present member, reads to
/// the first one.
pub(crate) struct MirrorPersona;

impl MirrorPersona {
    fn compute_size(array: &RaidArray) -> RaidResult<u64> {
        array
            .slot_snapshot()
            .iter()
            .filter(|slot| slot.is_configured)
            .map(|slot| slot.data_size)
            .min()
            .ok_or_else(|| RaidError::InvalidParameter("no configured members".into()))
    }
}

#[async_trait]
impl Personality for MirrorPersona {
    fn level(&self) -> RaidLevel {
        RaidLevel::Raid1
    }

    fn min_base_devices(&self) -> u8 {
        2
    }

    fn constraint(&self) -> Constraint {
        Constraint::MinOperational(1)
    }

    fn start(&self, array: &RaidArray) -> RaidResult<()> {
        array.set_block_count(Self::compute_size(array)?);
        Ok(())
    }

    fn supports_resize(&self) -> bool {
        true
    }

    fn resize(&self, array: &RaidArray) -> RaidResult<()> {
        array.set_block_count(Self::compute_size(array)?);
        Ok(())
    }

    fn supports_null_payload(&self) -> bool {
        true
    }

    async fn submit_rw(&self, io: &RaidIo) {
        match io.io_type() {
            IoType::Write => {
                let targets = member_channels(io);
                if targets.is_empty() {
                    io.complete(IoStatus::Failed);
                    return;
                }
                io.set_remaining(targets.len() as u64);
                let data = io.write_payload();
                join_all(targets.iter().map(|(data_offset, ch)| {
                    let data = data.clone();
                    async move {
                        let status = channel_write(
                            ch,
                            data_offset + io.offset_blocks(),
                            io.num_blocks(),
                            &data,
                        )
                        .await;
                        io.complete_part(1, status);
                    }
                }))
                .await;
            }
            IoType::Read => {
                let Some((data_offset, ch)) = member_channels(io).into_iter().next() else {
                    io.complete(IoStatus::Failed);
                    return;
                };
                io.set_remaining(1);
                let mut buf = BytesMut::new();
                let status = channel_read(
                    &ch,
                    data_offset + io.offset_blocks(),
                    io.num_blocks(),
                    &mut buf,
                )
                .await;
                if status == IoStatus::Success {
                    io.with_read_payload(|payload| {
                        payload.clear();
                        payload.extend_from_slice(&buf);
                    });
                }
                io.complete_part(1, status);
            }
            _ => io.complete(IoStatus::Failed),
        }
    }

    async fn submit_null_payload(&self, io: &RaidIo) {
        let targets = member_channels(io);
        if targets.is_empty() {
            io.complete(IoStatus::Failed);
            return;
        }
        io.set_remaining(targets.len() as u64);
        join_all(targets.iter().map(|(data_offset, ch)| async move {
            let offset = data_offset + io.offset_blocks();
            let status = loop {
                let result = match io.io_type() {
                    IoType::Flush => ch.flush(offset, io.num_blocks()).await,
                    _ => ch.unmap(offset, io.num_blocks()).await,
                };
                match result {
                    Ok(status) => break status,
                    Err(SubmitError::NoMem) => ch.device().wait_for_capacity().await,
                    Err(SubmitError::Failed) => break IoStatus::Failed,
                }
            };
            io.complete_part(1, status);
        }))
        .await;
    }
}

/// Striping-slot test personality with a first-fit range mapping; enough to
/// drive the request plumbing without real stripe math.
pub(crate) struct StripePersona;

#[async_trait]
impl Personality for StripePersona {
    fn level(&self) -> RaidLevel {
        RaidLevel::Raid0
    }

    fn min_base_devices(&self) -> u8 {
        1
    }

    fn start(&self, array: &RaidArray) -> RaidResult<()> {
        let total: u64 = array
            .slot_snapshot()
            .iter()
            .filter(|slot| slot.is_configured)
            .map(|slot| slot.data_size)
            .sum();
        if total == 0 {
            return Err(RaidError::InvalidParameter("no configured members".into()));
        }
        array.set_block_count(total);
        Ok(())
    }

    async fn submit_rw(&self, io: &RaidIo) {
        let snapshot = io.array().slot_snapshot();
        let mut start = io.offset_blocks();

        for (slot, info) in snapshot.iter().enumerate() {
            if start >= info.data_size {
                start -= info.data_size;
                continue;
            }
            let Some(ch) = io.channel().base_channel(slot) else {
                io.complete(IoStatus::Failed);
                return;
            };
            io.set_remaining(1);
            let offset = info.data_offset + start;
            let status = match io.io_type() {
                IoType::Write => {
                    channel_write(&ch, offset, io.num_blocks(), &io.write_payload()).await
                }
                IoType::Read => {
                    let mut buf = BytesMut::new();
                    let status = channel_read(&ch, offset, io.num_blocks(), &mut buf).await;
                    if status == IoStatus::Success {
                        io.with_read_payload(|payload| {
                            payload.clear();
                            payload.extend_from_slice(&buf);
                        });
                    }
                    status
                }
                _ => IoStatus::Failed,
            };
            io.complete_part(1, status);
            return;
        }
        io.complete(IoStatus::Failed);
    }
}
