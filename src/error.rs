//! Error types for upperfs
//!
//! Every subsystem returns [`Result`]; the FUSE layer turns an [`Error`]
//! into a POSIX status with [`Error::to_errno`].

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Error reported by an underlying filesystem call
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No such path or identity
    #[error("Not found: {0}")]
    NotFound(String),

    /// Named attribute is not stored for the path
    #[error("No such attribute: {0}")]
    NoAttribute(String),

    /// Create-only attribute write hit an existing value
    #[error("Attribute already exists: {0}")]
    AttributeExists(String),

    /// Caller buffer cannot hold the result
    #[error("Buffer too small: need {needed} bytes, have {capacity}")]
    OutOfRange { needed: usize, capacity: usize },

    /// Write refused by the quota
    #[error("Quota exceeded")]
    QuotaExceeded,

    /// Attribute store could not be opened or was already closed
    #[error("Attribute store unavailable: {0}")]
    BackendUnavailable(String),

    /// Storage-level failure inside the attribute store
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Arena growth failed while creating an identity record
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// POSIX error code reported to the kernel
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound(_) => libc::ENOENT,
            Error::NoAttribute(_) => libc::ENODATA,
            Error::AttributeExists(_) => libc::EEXIST,
            Error::OutOfRange { .. } => libc::ERANGE,
            Error::QuotaExceeded => libc::ENOSPC,
            Error::BackendUnavailable(_) | Error::Storage(_) => libc::ENOTSUP,
            Error::OutOfMemory => libc::ENOMEM,
            Error::InvalidArgument(_) | Error::InvalidSize(_) => libc::EINVAL,
            Error::Config(_) | Error::InvalidConfig(_) => libc::EIO,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}
