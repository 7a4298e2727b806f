//! RAID array engine.
//!
//! Composes several backing block devices into one logical block device
//! with pluggable RAID personalities, persisted on-device metadata and a
//! discovery protocol that reassembles arrays after restart.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────┐
//! │       Control contract      │  (rpc)
//! └──────────────┬──────────────┘
//! ┌──────────────▼──────────────┐
//! │         RaidManager         │  lifecycle · examine · members
//! │  ┌───────────────────────┐  │
//! │  │ RaidArray ── slots    │  │  superblock · channels · fan-out I/O
//! │  └───────────┬───────────┘  │
//! └──────────────┼──────────────┘
//! ┌──────────────▼──────────────┐
//! │  Personality (per level)    │  striping · mirroring · parity · concat
//! └──────────────┬──────────────┘
//! ┌──────────────▼──────────────┐
//! │   Host block-device layer   │  (raidstack-bdev)
//! └─────────────────────────────┘
//! ```

pub mod array;
pub mod channel;
pub mod error;
pub mod io;
pub mod manager;
pub mod personality;
pub mod rpc;
pub mod superblock;
pub mod types;

mod base;
mod examine;
mod member;

#[cfg(test)]
mod test_util;

pub use array::RaidArray;
pub use base::{RemoveCb, SlotInfo};
pub use channel::RaidChannel;
pub use error::{RaidError, RaidResult};
pub use io::{CompletionHook, RaidIo};
pub use manager::{CreateParams, RaidManager, RaidOptions};
pub use personality::{Constraint, Personality, PersonalityRegistry};
pub use superblock::{SbProbe, SbSlot, SlotState, Superblock};
pub use types::{RaidLevel, RaidState};
