//! Corpus loading and the stratified dataset partitioner.

mod class_index;
mod label_scheme;
mod partition;
mod record;
mod source;

pub use class_index::*;
pub use label_scheme::*;
pub use partition::*;
pub use record::*;
pub use source::*;
