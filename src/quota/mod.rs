//! Quota module
//!
//! Tracks how many bytes live under a subtree and refuses writes once a
//! configured ceiling is reached.

mod accountant;
pub mod size;
mod space;

pub use accountant::SpaceAccountant;
pub use size::{format_size, parse_size};
pub use space::total_size;
