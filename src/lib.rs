//! upperfs - passthrough FUSE filesystem
//!
//! Mirrors a source directory through the kernel and adds three things on
//! top: one stable node per distinct source object, a byte quota enforced
//! at write time, and extended attributes kept in a side database.

pub mod config;
pub mod error;
pub mod fs;
pub mod quota;
pub mod xattr;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::UpperFs;
    pub use crate::quota::SpaceAccountant;
    pub use crate::xattr::AttributeStore;
}
