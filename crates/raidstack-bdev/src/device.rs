//! Backing block devices and their I/O channels.
//!
//! A [`BlockDevice`] is a named, UUID-identified block store with a fixed
//! block size and a (resizable) block count. Data lives in a sparse page map
//! so devices of arbitrary capacity cost only what is written to them.
//!
//! I/O is submitted through an [`IoChannel`] cloned from an open
//! [`Descriptor`]. Submissions can be transiently rejected with
//! [`SubmitError::NoMem`]; callers park on [`BlockDevice::wait_for_capacity`]
//! and retry, mirroring the host wait-queue contract the RAID core relies on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BdevError, BdevResult};

/// Logical block I/O operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoType {
    Read,
    Write,
    Flush,
    Unmap,
    Reset,
}

/// Completion status of a submitted I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    Failed,
}

/// Submission-time failure, reported before an I/O is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Transient resource exhaustion; retry after the device signals
    /// capacity.
    NoMem,
    /// Non-transient submission failure.
    Failed,
}

/// Asynchronous event on a backing device, routed to whoever holds it open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Remove,
    Resize,
}

/// Optional-opcode capabilities of a device. READ and WRITE are always
/// supported.
#[derive(Debug, Clone, Copy)]
pub struct IoCaps {
    pub flush: bool,
    pub unmap: bool,
    pub reset: bool,
}

impl Default for IoCaps {
    fn default() -> Self {
        Self {
            flush: true,
            unmap: true,
            reset: true,
        }
    }
}

impl IoCaps {
    /// Whether `io_type` is supported under these capabilities.
    #[must_use]
    pub fn supports(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Read | IoType::Write => true,
            IoType::Flush => self.flush,
            IoType::Unmap => self.unmap,
            IoType::Reset => self.reset,
        }
    }
}

/// Per-block metadata format advertised by a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataFormat {
    /// Metadata bytes per block (0 = none).
    pub len: u32,
    /// Metadata interleaved with data blocks.
    pub interleave: bool,
    /// End-to-end protection (DIF/DIX) enabled.
    pub dif_enabled: bool,
}

/// A backing block device with a sparse in-memory store.
pub struct BlockDevice {
    name: String,
    uuid: Uuid,
    block_size: u32,
    block_count: AtomicU64,
    optimal_io_boundary: u64,
    md: MetadataFormat,
    caps: RwLock<IoCaps>,
    pages: Mutex<HashMap<u64, Box<[u8]>>>,
    claimed_by: Mutex<Option<String>>,
    nomem_budget: AtomicI64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_submit: AtomicBool,
    capacity: Notify,
}

impl BlockDevice {
    /// Create a device with a random UUID.
    pub fn new(name: impl Into<String>, block_size: u32, block_count: u64) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            block_size,
            block_count: AtomicU64::new(block_count),
            optimal_io_boundary: 0,
            md: MetadataFormat::default(),
            caps: RwLock::new(IoCaps::default()),
            pages: Mutex::new(HashMap::new()),
            claimed_by: Mutex::new(None),
            nomem_budget: AtomicI64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            capacity: Notify::new(),
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Optimal I/O boundary in blocks (0 = none advertised).
    #[must_use]
    pub fn with_optimal_io_boundary(mut self, blocks: u64) -> Self {
        self.optimal_io_boundary = blocks;
        self
    }

    #[must_use]
    pub fn with_metadata_format(mut self, md: MetadataFormat) -> Self {
        self.md = md;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Acquire)
    }

    pub fn optimal_io_boundary(&self) -> u64 {
        self.optimal_io_boundary
    }

    pub fn metadata_format(&self) -> MetadataFormat {
        self.md
    }

    pub fn io_caps(&self) -> IoCaps {
        *self.caps.read()
    }

    pub fn set_io_caps(&self, caps: IoCaps) {
        *self.caps.write() = caps;
    }

    /// Change the advertised capacity. The owner is expected to deliver a
    /// [`DeviceEvent::Resize`] afterwards.
    pub fn resize(&self, block_count: u64) {
        let old = self.block_count.swap(block_count, Ordering::AcqRel);
        debug!(device = %self.name, old, new = block_count, "device resized");
    }

    /// Claim the device for exclusive use by `owner`.
    pub fn claim(&self, owner: &str) -> BdevResult<()> {
        let mut claimed = self.claimed_by.lock();
        if let Some(existing) = claimed.as_ref() {
            return Err(BdevError::Claimed {
                device: self.name.clone(),
                owner: existing.clone(),
            });
        }
        *claimed = Some(owner.to_string());
        Ok(())
    }

    /// Release a previous claim. Releasing an unclaimed device is a no-op.
    pub fn release(&self) {
        *self.claimed_by.lock() = None;
    }

    pub fn claimed_by(&self) -> Option<String> {
        self.claimed_by.lock().clone()
    }

    /// Reject the next `count` submissions with [`SubmitError::NoMem`].
    pub fn inject_nomem(&self, count: u32) {
        self.nomem_budget.store(i64::from(count), Ordering::Release);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Make every submission fail hard (not retryable).
    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::Release);
    }

    /// Wait until the device has submission capacity again. Returns
    /// immediately if no NoMem budget is pending.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.capacity.notified();
            if self.nomem_budget.load(Ordering::Acquire) <= 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wake parked submitters. Called internally when an I/O completes; tests
    /// may call it after clearing an injected NoMem budget.
    pub fn signal_capacity(&self) {
        self.capacity.notify_waiters();
    }

    fn admit(&self) -> Result<(), SubmitError> {
        if self.fail_submit.load(Ordering::Acquire) {
            return Err(SubmitError::Failed);
        }
        let mut budget = self.nomem_budget.load(Ordering::Acquire);
        while budget > 0 {
            match self.nomem_budget.compare_exchange(
                budget,
                budget - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Err(SubmitError::NoMem),
                Err(current) => budget = current,
            }
        }
        Ok(())
    }

    fn in_range(&self, offset_blocks: u64, num_blocks: u64) -> bool {
        offset_blocks
            .checked_add(num_blocks)
            .is_some_and(|end| end <= self.block_count())
    }

    fn do_read(&self, offset_blocks: u64, num_blocks: u64, buf: &mut BytesMut) -> IoStatus {
        if self.fail_reads.load(Ordering::Acquire) {
            return IoStatus::Failed;
        }
        if !self.in_range(offset_blocks, num_blocks) {
            warn!(
                device = %self.name,
                offset_blocks, num_blocks,
                "read beyond device capacity"
            );
            return IoStatus::Failed;
        }
        let bs = self.block_size as usize;
        buf.clear();
        buf.resize(num_blocks as usize * bs, 0);
        let pages = self.pages.lock();
        for i in 0..num_blocks {
            if let Some(page) = pages.get(&(offset_blocks + i)) {
                let start = i as usize * bs;
                buf[start..start + bs].copy_from_slice(page);
            }
        }
        IoStatus::Success
    }

    fn do_write(&self, offset_blocks: u64, num_blocks: u64, data: &[u8]) -> IoStatus {
        if self.fail_writes.load(Ordering::Acquire) {
            return IoStatus::Failed;
        }
        if !self.in_range(offset_blocks, num_blocks) {
            warn!(
                device = %self.name,
                offset_blocks, num_blocks,
                "write beyond device capacity"
            );
            return IoStatus::Failed;
        }
        let bs = self.block_size as usize;
        if data.len() != num_blocks as usize * bs {
            warn!(
                device = %self.name,
                len = data.len(),
                num_blocks,
                "write payload does not match block count"
            );
            return IoStatus::Failed;
        }
        let mut pages = self.pages.lock();
        for i in 0..num_blocks {
            let start = i as usize * bs;
            pages.insert(
                offset_blocks + i,
                data[start..start + bs].to_vec().into_boxed_slice(),
            );
        }
        IoStatus::Success
    }

    fn do_unmap(&self, offset_blocks: u64, num_blocks: u64) -> IoStatus {
        if !self.in_range(offset_blocks, num_blocks) {
            return IoStatus::Failed;
        }
        let mut pages = self.pages.lock();
        for i in 0..num_blocks {
            pages.remove(&(offset_blocks + i));
        }
        IoStatus::Success
    }
}

/// An open handle on a [`BlockDevice`].
///
/// Closing is dropping. The claim, if any, is separate and must be released
/// through [`BlockDevice::release`].
#[derive(Clone)]
pub struct Descriptor {
    device: Arc<BlockDevice>,
    write: bool,
}

impl Descriptor {
    /// Open a descriptor on a device. Hosts usually go through
    /// [`crate::DeviceRegistry::open`] instead.
    #[must_use]
    pub fn new(device: Arc<BlockDevice>, write: bool) -> Self {
        Self { device, write }
    }

    pub fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Obtain an I/O channel for the calling worker.
    #[must_use]
    pub fn channel(&self) -> IoChannel {
        IoChannel {
            device: Arc::clone(&self.device),
            write: self.write,
        }
    }
}

/// Per-worker submission handle for one device.
#[derive(Clone)]
pub struct IoChannel {
    device: Arc<BlockDevice>,
    write: bool,
}

impl IoChannel {
    pub fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    /// Read `num_blocks` blocks at `offset_blocks` into `buf`.
    pub async fn read_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        buf: &mut BytesMut,
    ) -> Result<IoStatus, SubmitError> {
        self.device.admit()?;
        let status = self.device.do_read(offset_blocks, num_blocks, buf);
        self.device.signal_capacity();
        Ok(status)
    }

    /// Write `data` (exactly `num_blocks` blocks) at `offset_blocks`.
    pub async fn write_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        data: &[u8],
    ) -> Result<IoStatus, SubmitError> {
        if !self.write {
            warn!(device = %self.device.name, "write on read-only descriptor");
            return Err(SubmitError::Failed);
        }
        self.device.admit()?;
        let status = self.device.do_write(offset_blocks, num_blocks, data);
        self.device.signal_capacity();
        Ok(status)
    }

    pub async fn flush(
        &self,
        _offset_blocks: u64,
        _num_blocks: u64,
    ) -> Result<IoStatus, SubmitError> {
        self.device.admit()?;
        let status = if self.device.io_caps().flush {
            IoStatus::Success
        } else {
            IoStatus::Failed
        };
        self.device.signal_capacity();
        Ok(status)
    }

    pub async fn unmap(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<IoStatus, SubmitError> {
        if !self.write {
            warn!(device = %self.device.name, "unmap on read-only descriptor");
            return Err(SubmitError::Failed);
        }
        self.device.admit()?;
        let status = if self.device.io_caps().unmap {
            self.device.do_unmap(offset_blocks, num_blocks)
        } else {
            IoStatus::Failed
        };
        self.device.signal_capacity();
        Ok(status)
    }

    pub async fn reset(&self) -> Result<IoStatus, SubmitError> {
        self.device.admit()?;
        self.device.signal_capacity();
        Ok(IoStatus::Success)
    }
}
