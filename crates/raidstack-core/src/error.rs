//! RAID engine error types.
//!
//! The control contract reports failures as negative errno codes; every
//! variant maps onto one through [`RaidError::errno`].

use raidstack_bdev::BdevError;
use thiserror::Error;

/// Errno values used by the control contract.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOTSUP: i32 = 95;
    pub const EALREADY: i32 = 114;
}

/// RAID engine error
#[derive(Error, Debug)]
pub enum RaidError {
    /// Malformed input or constraint violation
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Array or device not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Name collision or foreign metadata already present
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Slot or device already in use
    #[error("busy: {0}")]
    Busy(String),

    /// Allocation or channel-acquisition failure
    #[error("out of resources: {0}")]
    NoResources(String),

    /// Metadata format disagreement (DIF/DIX, block size, interleave)
    #[error("incompatible metadata format: {0}")]
    IncompatibleMetadata(String),

    /// Delete already in progress for this array
    #[error("delete already in progress for array '{0}'")]
    DeleteInProgress(String),

    /// Operation requires a capability the personality does not provide
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Backing-device I/O failure on the control plane
    #[error("I/O error: {0}")]
    Io(String),

    /// Host block-device layer error
    #[error(transparent)]
    Bdev(#[from] BdevError),
}

/// Result type for RAID engine operations
pub type RaidResult<T> = Result<T, RaidError>;

impl RaidError {
    /// Negative errno representation for the control contract.
    #[must_use]
    pub fn errno(&self) -> i32 {
        use errno::*;
        let code = match self {
            RaidError::InvalidParameter(_) => EINVAL,
            RaidError::NotFound(_) => ENODEV,
            RaidError::AlreadyExists(_) => EEXIST,
            RaidError::Busy(_) => EBUSY,
            RaidError::NoResources(_) => ENOMEM,
            RaidError::IncompatibleMetadata(_) => EPERM,
            RaidError::DeleteInProgress(_) => EALREADY,
            RaidError::Unsupported(_) => ENOTSUP,
            RaidError::Io(_) => EIO,
            RaidError::Bdev(err) => match err {
                BdevError::NotFound(_) => ENODEV,
                BdevError::AlreadyExists(_) => EEXIST,
                BdevError::Claimed { .. } | BdevError::AlreadyQuiesced => EBUSY,
                BdevError::NotClaimed(_) | BdevError::ReadOnly(_) => EPERM,
                BdevError::InvalidArgument(_) => EINVAL,
            },
        };
        -code
    }
}
