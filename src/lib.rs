//! shardcheck: out-of-core integrity analysis of exported object-store shards.
//!
//! An exported store is a set of shard files, each holding a forward
//! adjacency map (object id -> referenced ids). The analysis runs in three
//! stages, each usable on its own:
//!
//! - [`convert`]: derive per shard an external-reference set (`.ref`) and
//!   a reverse map (`.brf`).
//! - [`missing`]: reduce every reference set against every forward map;
//!   survivors are referenced but defined nowhere.
//! - [`reverse`]: walk reverse maps from a set of ids toward the roots.
//!
//! [`IntegrityAnalyzer`] chains the three.

pub mod analyzer;
pub mod config;
pub mod convert;
pub mod error;
pub mod missing;
pub mod pipeline;
pub mod resource;
pub mod reverse;
pub mod shard;

pub use analyzer::{IntegrityAnalyzer, IntegrityReport};
pub use config::{AnalysisConfig, ObjectIdRange};
pub use convert::{ConversionOutput, ConversionStats, ShardConverter};
pub use error::{AnalysisError, Result};
pub use missing::{MissingObjectSearch, MissingObjects, MissingSearchStats};
pub use pipeline::CancelToken;
pub use reverse::{ParentChains, ReverseSearch, ReverseSearchStats};
pub use shard::{AdjacencyMap, ObjectId, ReverseMap, ShardCatalog, ShardDescriptor};
