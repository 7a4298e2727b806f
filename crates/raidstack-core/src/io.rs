//! Logical I/O requests and their per-member accounting.
//!
//! One logical I/O fans out into several base-device I/Os. The request
//! carries a `remaining` counter set by whoever dispatches the children;
//! each child completion flows through [`RaidIo::complete_part`], which
//! rolls failures up and completes the logical I/O exactly once when the
//! counter reaches zero.
//!
//! RESET is handled here directly: one child per slot, empty slots counted
//! as immediate successes, transient submission rejections parked on the
//! device's capacity wait queue and resumed from the saved submission index.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use raidstack_bdev::{IoStatus, IoType, SubmitError};
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::array::RaidArray;
use crate::channel::RaidChannel;
use crate::error::{RaidError, RaidResult};
use crate::types::RaidState;

/// Interception hook a personality may install on a request. The hook takes
/// over completion and must eventually call [`RaidIo::complete_logical`].
pub type CompletionHook = Box<dyn Fn(&RaidIo, IoStatus) + Send + Sync>;

/// Context of one logical block I/O.
pub struct RaidIo {
    io_type: IoType,
    offset_blocks: u64,
    num_blocks: u64,
    array: Arc<RaidArray>,
    channel: Arc<RaidChannel>,

    /// Payload for WRITE requests; cheap to clone per child.
    write_payload: Bytes,
    /// Buffer a READ request is assembled into.
    read_payload: Mutex<BytesMut>,

    remaining: AtomicU64,
    submitted: AtomicU64,
    rolled_status: Mutex<IoStatus>,

    result: Mutex<Option<IoStatus>>,
    done: Notify,
    completion_hook: Mutex<Option<CompletionHook>>,
}

impl RaidIo {
    pub(crate) fn new(
        io_type: IoType,
        offset_blocks: u64,
        num_blocks: u64,
        array: Arc<RaidArray>,
        channel: Arc<RaidChannel>,
        write_payload: Bytes,
        read_payload: BytesMut,
    ) -> Self {
        Self {
            io_type,
            offset_blocks,
            num_blocks,
            array,
            channel,
            write_payload,
            read_payload: Mutex::new(read_payload),
            remaining: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            rolled_status: Mutex::new(IoStatus::Success),
            result: Mutex::new(None),
            done: Notify::new(),
            completion_hook: Mutex::new(None),
        }
    }

    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    pub fn offset_blocks(&self) -> u64 {
        self.offset_blocks
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn array(&self) -> &Arc<RaidArray> {
        &self.array
    }

    pub fn channel(&self) -> &Arc<RaidChannel> {
        &self.channel
    }

    /// Payload of a WRITE request.
    pub fn write_payload(&self) -> Bytes {
        self.write_payload.clone()
    }

    /// Mutable access to the READ assembly buffer.
    pub fn with_read_payload<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        f(&mut self.read_payload.lock())
    }

    pub(crate) fn take_read_payload(&self) -> Bytes {
        std::mem::take(&mut *self.read_payload.lock()).freeze()
    }

    /// Number of base-device I/Os still outstanding.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Set before dispatching any child.
    pub fn set_remaining(&self, count: u64) {
        self.remaining.store(count, Ordering::Release);
    }

    /// Index of the next child to submit; used to resume after a transient
    /// rejection.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn advance_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
    }

    /// Install a completion-interception hook.
    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.completion_hook.lock() = Some(hook);
    }

    /// Account one part of the fan-out. `completed` is interpreted by the
    /// dispatcher (one child, or a block count for range work).
    ///
    /// Returns true when this part completed the logical I/O.
    pub fn complete_part(&self, completed: u64, status: IoStatus) -> bool {
        let prev = self.remaining.fetch_sub(completed, Ordering::AcqRel);
        assert!(prev >= completed, "partial completion underflow");

        if status != IoStatus::Success {
            *self.rolled_status.lock() = status;
        }

        if prev == completed {
            let rolled = *self.rolled_status.lock();
            self.complete(rolled);
            true
        } else {
            false
        }
    }

    /// Complete the logical I/O, diverting through the interception hook if
    /// one is installed.
    pub fn complete(&self, status: IoStatus) {
        let hook = self.completion_hook.lock().take();
        match hook {
            Some(hook) => hook(self, status),
            None => self.complete_logical(status),
        }
    }

    /// Deliver the final completion. Runs exactly once.
    pub fn complete_logical(&self, status: IoStatus) {
        let mut result = self.result.lock();
        if result.is_some() {
            warn!(io_type = ?self.io_type, "duplicate logical completion ignored");
            return;
        }
        *result = Some(status);
        self.done.notify_one();
    }

    /// Wait for the logical completion.
    pub(crate) async fn wait(&self) -> IoStatus {
        loop {
            let notified = self.done.notified();
            if let Some(status) = *self.result.lock() {
                return status;
            }
            notified.await;
        }
    }
}

impl RaidArray {
    /// Whether the array supports `io_type`: every configured member must
    /// support it, and FLUSH/UNMAP additionally require the personality's
    /// null-payload submitter.
    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Read | IoType::Write => true,
            IoType::Flush | IoType::Unmap => {
                self.personality().supports_null_payload() && self.members_support(io_type)
            }
            IoType::Reset => self.members_support(io_type),
        }
    }

    fn members_support(&self, io_type: IoType) -> bool {
        let slots = self.slots().read();
        slots
            .iter()
            .filter_map(|slot| slot.desc.as_ref())
            .all(|desc| desc.device().io_caps().supports(io_type))
    }

    fn check_accepts_io(&self, offset_blocks: u64, num_blocks: u64) -> RaidResult<()> {
        if self.state() != RaidState::Online {
            return Err(RaidError::InvalidParameter(format!(
                "array '{}' is not online",
                self.name()
            )));
        }
        let end = offset_blocks
            .checked_add(num_blocks)
            .ok_or_else(|| RaidError::InvalidParameter("I/O range overflow".into()))?;
        if end > self.block_count() {
            return Err(RaidError::InvalidParameter(format!(
                "I/O beyond array capacity ({end} > {})",
                self.block_count()
            )));
        }
        Ok(())
    }

    /// Read `num_blocks` blocks at `offset_blocks`.
    ///
    /// The payload buffer is obtained here and handed to the personality's
    /// read-write submitter.
    pub async fn read_blocks(
        &self,
        channel: &Arc<RaidChannel>,
        offset_blocks: u64,
        num_blocks: u64,
    ) -> RaidResult<(IoStatus, Bytes)> {
        self.check_accepts_io(offset_blocks, num_blocks)?;
        let _permit = self.gate().enter().await;

        let mut buf = BytesMut::new();
        buf.resize(num_blocks as usize * self.block_size() as usize, 0);

        let io = RaidIo::new(
            IoType::Read,
            offset_blocks,
            num_blocks,
            self.arc(),
            Arc::clone(channel),
            Bytes::new(),
            buf,
        );
        self.personality().submit_rw(&io).await;
        let status = io.wait().await;
        Ok((status, io.take_read_payload()))
    }

    /// Write `data` (exactly `num_blocks` blocks) at `offset_blocks`.
    pub async fn write_blocks(
        &self,
        channel: &Arc<RaidChannel>,
        offset_blocks: u64,
        num_blocks: u64,
        data: Bytes,
    ) -> RaidResult<IoStatus> {
        self.check_accepts_io(offset_blocks, num_blocks)?;
        if data.len() != num_blocks as usize * self.block_size() as usize {
            return Err(RaidError::InvalidParameter(
                "write payload does not match block count".into(),
            ));
        }
        let _permit = self.gate().enter().await;

        let io = RaidIo::new(
            IoType::Write,
            offset_blocks,
            num_blocks,
            self.arc(),
            Arc::clone(channel),
            data,
            BytesMut::new(),
        );
        self.personality().submit_rw(&io).await;
        Ok(io.wait().await)
    }

    /// Submit a FLUSH or UNMAP over `offset_blocks..+num_blocks`.
    pub async fn submit_null_payload(
        &self,
        channel: &Arc<RaidChannel>,
        io_type: IoType,
        offset_blocks: u64,
        num_blocks: u64,
    ) -> RaidResult<IoStatus> {
        debug_assert!(matches!(io_type, IoType::Flush | IoType::Unmap));
        self.check_accepts_io(offset_blocks, num_blocks)?;
        if !self.io_type_supported(io_type) {
            return Err(RaidError::Unsupported(format!(
                "array '{}' does not support {io_type:?}",
                self.name()
            )));
        }
        let _permit = self.gate().enter().await;

        let io = RaidIo::new(
            io_type,
            offset_blocks,
            num_blocks,
            self.arc(),
            Arc::clone(channel),
            Bytes::new(),
            BytesMut::new(),
        );
        self.personality().submit_null_payload(&io).await;
        Ok(io.wait().await)
    }

    /// Reset the array: one reset per slot, aggregated into a single
    /// completion. Accepted resets observe all earlier-submitted child I/Os.
    pub async fn reset(&self, channel: &Arc<RaidChannel>) -> RaidResult<IoStatus> {
        if self.state() != RaidState::Online {
            return Err(RaidError::InvalidParameter(format!(
                "array '{}' is not online",
                self.name()
            )));
        }
        let _permit = self.gate().enter().await;

        let io = RaidIo::new(
            IoType::Reset,
            0,
            0,
            self.arc(),
            Arc::clone(channel),
            Bytes::new(),
            BytesMut::new(),
        );
        self.submit_reset(&io).await;
        Ok(io.wait().await)
    }

    async fn submit_reset(&self, io: &RaidIo) {
        let num_slots = io.channel().num_slots() as u64;

        if io.remaining() == 0 {
            io.set_remaining(num_slots);
        }

        loop {
            let slot = io.submitted();
            if slot >= num_slots {
                return;
            }

            let Some(base_channel) = io.channel().base_channel(slot as usize) else {
                // Empty or failed member: counts as an immediate success.
                io.advance_submitted();
                io.complete_part(1, IoStatus::Success);
                continue;
            };

            match base_channel.reset().await {
                Ok(status) => {
                    io.advance_submitted();
                    io.complete_part(1, status);
                }
                Err(SubmitError::NoMem) => {
                    // Park until the device frees capacity, then resume from
                    // the saved submission index.
                    base_channel.device().wait_for_capacity().await;
                }
                Err(SubmitError::Failed) => {
                    error!(array = %self.name(), slot, "reset submission failed");
                    io.complete(IoStatus::Failed);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::online_mirror;

    #[tokio::test]
    async fn test_complete_part_rolls_up_failure() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        let io = RaidIo::new(
            IoType::Write,
            0,
            1,
            Arc::clone(&array),
            channel,
            Bytes::new(),
            BytesMut::new(),
        );
        io.set_remaining(3);
        assert!(!io.complete_part(1, IoStatus::Success));
        assert!(!io.complete_part(1, IoStatus::Failed));
        assert!(io.complete_part(1, IoStatus::Success));
        // a child failure wins over later successes
        assert_eq!(io.wait().await, IoStatus::Failed);
    }

    #[tokio::test]
    async fn test_completion_hook_intercepts() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        let io = RaidIo::new(
            IoType::Write,
            0,
            1,
            Arc::clone(&array),
            channel,
            Bytes::new(),
            BytesMut::new(),
        );
        io.set_completion_hook(Box::new(|io, status| {
            // flip the status before delivering
            let flipped = match status {
                IoStatus::Success => IoStatus::Failed,
                IoStatus::Failed => IoStatus::Success,
            };
            io.complete_logical(flipped);
        }));

        io.set_remaining(1);
        io.complete_part(1, IoStatus::Success);
        assert_eq!(io.wait().await, IoStatus::Failed);
    }

    #[tokio::test]
    async fn test_reset_counts_empty_slots_as_success() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        // simulate a failed member: null its channel entry
        channel.clear_slot(0);

        assert_eq!(array.reset(&channel).await.unwrap(), IoStatus::Success);
    }

    #[tokio::test]
    async fn test_reset_resumes_after_transient_nomem() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        // the second child submission is rejected once, then succeeds
        env.device("d1").inject_nomem(1);

        assert_eq!(array.reset(&channel).await.unwrap(), IoStatus::Success);
    }

    #[tokio::test]
    async fn test_io_rejected_unless_online() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        env.manager.delete_array("r1").await.unwrap();
        assert!(array.reset(&channel).await.is_err());
        assert!(array.read_blocks(&channel, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_mirror_write_read_roundtrip() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        let data = Bytes::from(vec![0x5Au8; 4096 * 2]);
        let status = array
            .write_blocks(&channel, 8, 2, data.clone())
            .await
            .unwrap();
        assert_eq!(status, IoStatus::Success);

        let (status, read) = array.read_blocks(&channel, 8, 2).await.unwrap();
        assert_eq!(status, IoStatus::Success);
        assert_eq!(&read[..], &data[..]);

        // the write landed on both members
        for name in ["d0", "d1"] {
            let device = env.device(name);
            let ch = raidstack_bdev::Descriptor::new(device, false).channel();
            let mut buf = bytes::BytesMut::new();
            assert_eq!(ch.read_blocks(8, 2, &mut buf).await, Ok(IoStatus::Success));
            assert_eq!(&buf[..], &data[..]);
        }
    }

    #[tokio::test]
    async fn test_member_write_failure_rolls_up() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        env.device("d1").set_fail_writes(true);
        let data = Bytes::from(vec![1u8; 4096]);
        let status = array.write_blocks(&channel, 0, 1, data).await.unwrap();
        assert_eq!(status, IoStatus::Failed);
    }

    #[tokio::test]
    async fn test_flush_and_unmap_supported_by_mirror() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        assert!(array.io_type_supported(IoType::Flush));
        assert!(array.io_type_supported(IoType::Unmap));

        let status = array
            .submit_null_payload(&channel, IoType::Flush, 0, 4)
            .await
            .unwrap();
        assert_eq!(status, IoStatus::Success);
        let status = array
            .submit_null_payload(&channel, IoType::Unmap, 0, 4)
            .await
            .unwrap();
        assert_eq!(status, IoStatus::Success);
    }

    #[tokio::test]
    async fn test_opcode_support_is_member_intersection() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        // one member without unmap support disables it for the array
        let mut caps = env.device("d1").io_caps();
        caps.unmap = false;
        env.device("d1").set_io_caps(caps);

        assert!(!array.io_type_supported(IoType::Unmap));
        assert!(array.io_type_supported(IoType::Flush));
        assert!(array
            .submit_null_payload(&channel, IoType::Unmap, 0, 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_io_beyond_capacity_rejected() {
        let env = online_mirror("r1", &["d0", "d1"]).await;
        let array = env.manager.find_by_name("r1").unwrap();
        let channel = array.get_channel().unwrap();

        let end = array.block_count();
        assert!(array.read_blocks(&channel, end, 1).await.is_err());
    }
}
