//! Per-worker fan-out channels.
//!
//! Each worker holds one [`RaidChannel`] per array: a slot-indexed table of
//! backing-device channels (empty for absent or failed members) plus an
//! optional personality-private context. Member removal nulls the slot's
//! entry in every live channel, one channel at a time, before the backing
//! descriptor is released; a member joining an online array is installed
//! into every live channel the same way, growing the table when the slot
//! was appended after the channel was created.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use raidstack_bdev::IoChannel;
use tracing::debug;

use crate::array::RaidArray;
use crate::error::{RaidError, RaidResult};
use crate::types::RaidState;

/// Per-worker channel of one array.
pub struct RaidChannel {
    base: RwLock<Vec<Option<IoChannel>>>,
    personality_ctx: Option<Box<dyn Any + Send + Sync>>,
}

impl RaidChannel {
    /// Number of slot entries (fixed at channel creation).
    pub fn num_slots(&self) -> usize {
        self.base.read().len()
    }

    /// Backing channel for `slot`, if the member is present.
    pub fn base_channel(&self, slot: usize) -> Option<IoChannel> {
        self.base.read().get(slot).and_then(Clone::clone)
    }

    /// Personality-private channel context.
    pub fn personality_ctx(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.personality_ctx.as_deref()
    }

    pub(crate) fn clear_slot(&self, slot: usize) {
        let mut base = self.base.write();
        if let Some(entry) = base.get_mut(slot) {
            *entry = None;
        }
    }

    /// Install (or replace) the backing channel for `slot`, growing the
    /// table when the slot was appended after this channel was created.
    pub(crate) fn set_slot(&self, slot: usize, channel: IoChannel) {
        let mut base = self.base.write();
        if base.len() <= slot {
            base.resize_with(slot + 1, || None);
        }
        base[slot] = Some(channel);
    }
}

impl RaidArray {
    /// Create the calling worker's channel. The array must be ONLINE.
    pub fn get_channel(&self) -> RaidResult<Arc<RaidChannel>> {
        if self.state() != RaidState::Online {
            return Err(RaidError::InvalidParameter(format!(
                "array '{}' is not online",
                self.name()
            )));
        }

        let base: Vec<Option<IoChannel>> = {
            let slots = self.slots().read();
            slots
                .iter()
                .map(|slot| slot.desc.as_ref().map(raidstack_bdev::Descriptor::channel))
                .collect()
        };

        let channel = Arc::new(RaidChannel {
            base: RwLock::new(base),
            personality_ctx: self.personality().make_channel_ctx(self),
        });

        self.channels().lock().push(Arc::downgrade(&channel));
        Ok(channel)
    }

    /// Walk all live channels, one at a time, pruning dropped ones.
    pub(crate) fn for_each_channel(&self, mut f: impl FnMut(&RaidChannel)) {
        let mut channels = self.channels().lock();
        channels.retain(|weak| match weak.upgrade() {
            Some(channel) => {
                f(&channel);
                true
            }
            None => false,
        });
        debug!(array = %self.name(), channels = channels.len(), "channel walk complete");
    }

    /// Make a newly bound member visible to every live channel; the
    /// counterpart of the slot nulling done before removal.
    pub(crate) fn attach_slot_channels(&self, slot_idx: usize) {
        let channel = {
            let slots = self.slots().read();
            slots
                .get(slot_idx)
                .and_then(|slot| slot.desc.as_ref())
                .map(raidstack_bdev::Descriptor::channel)
        };
        let Some(channel) = channel else {
            return;
        };
        self.for_each_channel(|ch| ch.set_slot(slot_idx, channel.clone()));
    }
}
