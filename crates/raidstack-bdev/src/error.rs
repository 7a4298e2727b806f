//! Block-device layer error types

use thiserror::Error;

/// Block-device layer error
#[derive(Error, Debug)]
pub enum BdevError {
    /// Device not found in the registry
    #[error("block device not found: {0}")]
    NotFound(String),

    /// A device with the same name is already registered
    #[error("block device already exists: {0}")]
    AlreadyExists(String),

    /// Device is already claimed by another owner
    #[error("block device '{device}' is claimed by '{owner}'")]
    Claimed { device: String, owner: String },

    /// Device is not claimed, or claimed by someone else
    #[error("block device '{0}' is not claimed by the caller")]
    NotClaimed(String),

    /// The quiesce gate is already closed
    #[error("device is already quiesced")]
    AlreadyQuiesced,

    /// Read-only descriptor used for a write-side operation
    #[error("descriptor for '{0}' is read-only")]
    ReadOnly(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for block-device layer operations
pub type BdevResult<T> = Result<T, BdevError>;
