//! On-device superblock: fixed little-endian record identifying an array and
//! its slot layout.
//!
//! The record sits at block 0 of every member device, ahead of the data
//! region. Field widths and positions are stable; new fields append within
//! the bounded `length`. The CRC is computed over the record with the CRC
//! field zeroed.

use bytes::BytesMut;
use raidstack_bdev::{IoChannel, IoStatus, SubmitError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RaidError, RaidResult};
use crate::types::RaidLevel;

/// Magic at the start of every superblock.
pub const SB_MAGIC: [u8; 8] = *b"RAIDSTCK";

/// Current superblock format version.
pub const SB_VERSION: u32 = 1;

/// Upper bound on the serialized record, in bytes.
pub const SB_MAX_SIZE: usize = 4096;

/// Size of the on-disk name field; names must be shorter than this.
pub const SB_NAME_SIZE: usize = 64;

/// Minimum gap reserved ahead of the data region on every member.
pub const MIN_DATA_OFFSET_BYTES: u64 = 1024 * 1024;

const SB_HEADER_LEN: usize = 8 + 4 + 4 + 4 + 8 + 16 + SB_NAME_SIZE + 4 + 4 + 4 + 8 + 1 + 1;
const SB_SLOT_LEN: usize = 16 + 1 + 1 + 8 + 8;
const CRC_OFFSET: usize = 16;

/// State of a member recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Configured,
    Failed,
}

impl SlotState {
    fn to_wire(self) -> u8 {
        match self {
            SlotState::Configured => 0,
            SlotState::Failed => 1,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(SlotState::Configured),
            1 => Some(SlotState::Failed),
            _ => None,
        }
    }
}

/// Per-member entry in the superblock.
#[derive(Debug, Clone)]
pub struct SbSlot {
    pub uuid: Uuid,
    pub slot: u8,
    pub state: SlotState,
    pub data_offset: u64,
    pub data_size: u64,
}

/// Parsed superblock record.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u32,
    pub seq: u64,
    pub uuid: Uuid,
    pub name: String,
    pub level: RaidLevel,
    /// Strip size in blocks.
    pub strip_size: u32,
    pub block_size: u32,
    /// Total array size in blocks.
    pub raid_size: u64,
    /// Slot count of the array (may exceed the number of entries).
    pub num_base_devices: u8,
    pub slots: Vec<SbSlot>,
}

/// Outcome of probing a device for a superblock.
#[derive(Debug)]
pub enum SbProbe {
    Valid(Superblock),
    /// No record, bad magic, bad CRC or unsupported version.
    Absent,
}

impl Superblock {
    /// Serialized length in bytes.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        SB_HEADER_LEN + self.slots.len() * SB_SLOT_LEN
    }

    /// Minimum data offset in blocks for a member with `block_size`.
    #[must_use]
    pub fn min_data_offset_blocks(block_size: u32) -> u64 {
        debug_assert_eq!(MIN_DATA_OFFSET_BYTES % u64::from(block_size), 0);
        MIN_DATA_OFFSET_BYTES / u64::from(block_size)
    }

    /// Serialize with a freshly computed CRC.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.serialized_len();
        debug_assert!(len <= SB_MAX_SIZE);

        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&SB_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // crc, patched below
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(self.uuid.as_bytes());

        let mut name = [0u8; SB_NAME_SIZE];
        let name_bytes = self.name.as_bytes();
        debug_assert!(name_bytes.len() < SB_NAME_SIZE);
        name[..name_bytes.len()].copy_from_slice(name_bytes);
        buf.extend_from_slice(&name);

        buf.extend_from_slice(&self.level.to_wire().to_le_bytes());
        buf.extend_from_slice(&self.strip_size.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.raid_size.to_le_bytes());
        buf.push(self.num_base_devices);
        buf.push(self.slots.len() as u8);

        for entry in &self.slots {
            buf.extend_from_slice(entry.uuid.as_bytes());
            buf.push(entry.slot);
            buf.push(entry.state.to_wire());
            buf.extend_from_slice(&entry.data_offset.to_le_bytes());
            buf.extend_from_slice(&entry.data_size.to_le_bytes());
        }

        let crc = crc32c::crc32c(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a record out of `buf`. Returns `None` when the buffer does not
    /// hold a valid superblock.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Superblock> {
        if buf.len() < SB_HEADER_LEN || buf[..8] != SB_MAGIC {
            return None;
        }

        let version = read_u32(buf, 8);
        if version != SB_VERSION {
            warn!(version, "unsupported superblock version");
            return None;
        }

        let length = read_u32(buf, 12) as usize;
        if length < SB_HEADER_LEN || length > SB_MAX_SIZE || length > buf.len() {
            warn!(length, "superblock length out of bounds");
            return None;
        }

        let stored_crc = read_u32(buf, CRC_OFFSET);
        let mut record = buf[..length].to_vec();
        record[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        let crc = crc32c::crc32c(&record);
        if crc != stored_crc {
            warn!(stored_crc, crc, "superblock checksum mismatch");
            return None;
        }

        let seq = read_u64(buf, 20);
        let uuid = Uuid::from_slice(&buf[28..44]).ok()?;

        let name_field = &buf[44..44 + SB_NAME_SIZE];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(SB_NAME_SIZE);
        let name = std::str::from_utf8(&name_field[..name_len]).ok()?.to_string();

        let level = RaidLevel::from_wire(read_u32(buf, 108)).ok()?;
        let strip_size = read_u32(buf, 112);
        let block_size = read_u32(buf, 116);
        let raid_size = read_u64(buf, 120);
        let num_base_devices = buf[128];
        let entry_count = buf[129] as usize;

        if length != SB_HEADER_LEN + entry_count * SB_SLOT_LEN {
            warn!(length, entry_count, "superblock entry count disagrees with length");
            return None;
        }

        let mut slots = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let base = SB_HEADER_LEN + i * SB_SLOT_LEN;
            let entry_uuid = Uuid::from_slice(&buf[base..base + 16]).ok()?;
            let slot = buf[base + 16];
            let state = SlotState::from_wire(buf[base + 17])?;
            let data_offset = read_u64(buf, base + 18);
            let data_size = read_u64(buf, base + 26);
            slots.push(SbSlot {
                uuid: entry_uuid,
                slot,
                state,
                data_offset,
                data_size,
            });
        }

        Some(Superblock {
            version,
            seq,
            uuid,
            name,
            level,
            strip_size,
            block_size,
            raid_size,
            num_base_devices,
            slots,
        })
    }

    /// Probe a device for a superblock through its application-thread
    /// channel.
    ///
    /// Transient submission rejections are retried; an I/O failure is
    /// reported as an error, anything unparseable as [`SbProbe::Absent`].
    pub async fn load(channel: &IoChannel) -> RaidResult<SbProbe> {
        let device = channel.device();
        let block_size = u64::from(device.block_size());
        let sb_blocks = (SB_MAX_SIZE as u64).div_ceil(block_size).min(device.block_count());

        let mut buf = BytesMut::new();
        let status = loop {
            match channel.read_blocks(0, sb_blocks, &mut buf).await {
                Ok(status) => break status,
                Err(SubmitError::NoMem) => device.wait_for_capacity().await,
                Err(SubmitError::Failed) => {
                    return Err(RaidError::Io(format!(
                        "superblock read submission failed on '{}'",
                        device.name()
                    )));
                }
            }
        };

        if status != IoStatus::Success {
            return Err(RaidError::Io(format!(
                "superblock read failed on '{}'",
                device.name()
            )));
        }

        match Superblock::from_bytes(&buf) {
            Some(sb) => {
                debug!(device = %device.name(), array = %sb.name, seq = sb.seq, "superblock found");
                Ok(SbProbe::Valid(sb))
            }
            None => Ok(SbProbe::Absent),
        }
    }

    /// Write the record to one member through its application-thread channel.
    pub async fn write_to(&self, channel: &IoChannel) -> RaidResult<()> {
        let device = channel.device();
        let block_size = device.block_size() as usize;
        let mut bytes = self.to_bytes();
        bytes.resize(bytes.len().div_ceil(block_size) * block_size, 0);
        let num_blocks = (bytes.len() / block_size) as u64;

        let status = loop {
            match channel.write_blocks(0, num_blocks, &bytes).await {
                Ok(status) => break status,
                Err(SubmitError::NoMem) => device.wait_for_capacity().await,
                Err(SubmitError::Failed) => {
                    return Err(RaidError::Io(format!(
                        "superblock write submission failed on '{}'",
                        device.name()
                    )));
                }
            }
        };

        if status != IoStatus::Success {
            return Err(RaidError::Io(format!(
                "superblock write failed on '{}'",
                device.name()
            )));
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use raidstack_bdev::{BlockDevice, Descriptor};
    use std::sync::Arc;

    fn sample_sb() -> Superblock {
        Superblock {
            version: SB_VERSION,
            seq: 7,
            uuid: Uuid::new_v4(),
            name: "r0".to_string(),
            level: RaidLevel::Raid0,
            strip_size: 16,
            block_size: 4096,
            raid_size: 1 << 20,
            num_base_devices: 3,
            slots: (0..3)
                .map(|i| SbSlot {
                    uuid: Uuid::new_v4(),
                    slot: i,
                    state: SlotState::Configured,
                    data_offset: 256,
                    data_size: (1 << 18) - 256,
                })
                .collect(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let sb = sample_sb();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), sb.serialized_len());

        let parsed = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.seq, sb.seq);
        assert_eq!(parsed.uuid, sb.uuid);
        assert_eq!(parsed.name, sb.name);
        assert_eq!(parsed.level, sb.level);
        assert_eq!(parsed.strip_size, sb.strip_size);
        assert_eq!(parsed.block_size, sb.block_size);
        assert_eq!(parsed.raid_size, sb.raid_size);
        assert_eq!(parsed.num_base_devices, sb.num_base_devices);
        assert_eq!(parsed.slots.len(), 3);
        assert_eq!(parsed.slots[2].uuid, sb.slots[2].uuid);
        assert_eq!(parsed.slots[2].state, SlotState::Configured);
    }

    #[test]
    fn test_corruption_detected() {
        let sb = sample_sb();
        let mut bytes = sb.to_bytes();
        bytes[40] ^= 0xFF;
        assert!(Superblock::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_bad_magic_is_not_a_superblock() {
        let sb = sample_sb();
        let mut bytes = sb.to_bytes();
        bytes[0] = b'X';
        assert!(Superblock::from_bytes(&bytes).is_none());
    }

    #[tokio::test]
    async fn test_load_from_device() {
        let device = Arc::new(BlockDevice::new("d0", 512, 4096));
        let channel = Descriptor::new(Arc::clone(&device), true).channel();

        // empty device: absent
        assert!(matches!(
            Superblock::load(&channel).await.unwrap(),
            SbProbe::Absent
        ));

        let mut sb = sample_sb();
        sb.block_size = 512;
        sb.write_to(&channel).await.unwrap();

        match Superblock::load(&channel).await.unwrap() {
            SbProbe::Valid(loaded) => assert_eq!(loaded.uuid, sb.uuid),
            SbProbe::Absent => panic!("superblock expected"),
        }
    }

    #[tokio::test]
    async fn test_load_io_failure() {
        let device = Arc::new(BlockDevice::new("d0", 512, 4096));
        device.set_fail_reads(true);
        let channel = Descriptor::new(Arc::clone(&device), false).channel();
        assert!(Superblock::load(&channel).await.is_err());
    }
}
