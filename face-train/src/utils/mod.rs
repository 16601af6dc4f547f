//! Misc utilities.

mod checkpoint;
mod rate_counter;
mod ratio;

pub use checkpoint::*;
pub use rate_counter::*;
pub use ratio::*;
