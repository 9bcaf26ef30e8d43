//! Extended attributes kept in a side database instead of the mirrored tree

mod key;
mod store;

pub use store::{AttrReply, AttributeStore, SetMode};
