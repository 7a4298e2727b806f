//! Host block-device layer for the raidstack RAID engine.
//!
//! This crate provides the surface the RAID core consumes from its host:
//! a registry of backing block devices, open descriptors with single-claim
//! semantics, per-worker I/O channels, a quiesce gate for stalling logical
//! I/O, and a capacity wait queue for retrying transiently rejected
//! submissions.
//!
//! Devices are backed by a sparse in-memory page store. That is enough to
//! run a RAID array end to end (including on-disk metadata round trips) and
//! to inject the failure modes the core has to handle.

pub mod device;
pub mod error;
pub mod quiesce;
pub mod registry;

pub use device::{
    BlockDevice, Descriptor, DeviceEvent, IoCaps, IoChannel, IoStatus, IoType, MetadataFormat,
    SubmitError,
};
pub use error::{BdevError, BdevResult};
pub use quiesce::QuiesceGate;
pub use registry::DeviceRegistry;
