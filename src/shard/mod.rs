//! On-disk shard data: types, binary codec, external-reference sets, and
//! the range-aware shard wrapper.

pub mod codec;
pub mod ranged;
pub mod reference_set;
pub mod types;

pub use ranged::{KeyRange, RangedShard};
pub use reference_set::ExternalReferenceSet;
pub use types::*;
