//! FUSE filesystem implementation
//!
//! Serves a source directory through the kernel, one node per distinct
//! source object.

mod filesystem;
mod handle;
pub mod inode;
mod lower;

pub use filesystem::UpperFs;
pub use inode::{IdentityCache, NodeId, ROOT_ID};
