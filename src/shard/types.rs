//! Shard identities, adjacency map types, and the shard catalog.
//!
//! A catalog is the store exporter's output as seen by this crate: per
//! storage channel, a sorted mapping from shard sequence number to the file
//! holding that shard's forward adjacency map. Every pipeline works on the
//! flattened catalog, where each shard gets a dense index `0..F` ordered by
//! `(channel, sequence)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

// ── Constants ───────────────────────────────────────────────────────

/// Extension of derived external-reference set files.
pub const REFERENCE_SET_EXTENSION: &str = "ref";

/// Extension of derived reverse-map files.
pub const REVERSE_MAP_EXTENSION: &str = "brf";

/// Prefix of channel sub-directories recognised by [`ShardCatalog::scan_dir`].
pub const CHANNEL_DIR_PREFIX: &str = "channel_";

// ── Core types ──────────────────────────────────────────────────────

/// 64-bit object id. The on-disk `int64` is reinterpreted bit-for-bit.
pub type ObjectId = u64;

/// Forward adjacency map of one shard: object id -> referenced ids.
///
/// Values keep their on-disk order and may repeat or be empty.
pub type AdjacencyMap = BTreeMap<ObjectId, Vec<ObjectId>>;

/// Reverse adjacency map of one shard: referenced id -> referencing ids.
pub type ReverseMap = BTreeMap<ObjectId, BTreeSet<ObjectId>>;

/// Kind of artifact derived from a raw shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivedKind {
    ReferenceSet,
    ReverseMap,
}

impl DerivedKind {
    pub fn extension(self) -> &'static str {
        match self {
            DerivedKind::ReferenceSet => REFERENCE_SET_EXTENSION,
            DerivedKind::ReverseMap => REVERSE_MAP_EXTENSION,
        }
    }
}

/// Path of a derived artifact: same base name, extension replaced.
pub fn derived_path(shard_path: &Path, kind: DerivedKind) -> PathBuf {
    shard_path.with_extension(kind.extension())
}

// ── ShardDescriptor ─────────────────────────────────────────────────

/// One shard file of the exported store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Dense position of this shard in the flattened catalog.
    pub index: usize,
    pub channel: u32,
    pub sequence: u64,
    pub path: PathBuf,
}

impl ShardDescriptor {
    pub fn reference_set_path(&self) -> PathBuf {
        derived_path(&self.path, DerivedKind::ReferenceSet)
    }

    pub fn reverse_map_path(&self) -> PathBuf {
        derived_path(&self.path, DerivedKind::ReverseMap)
    }
}

// ── ShardCatalog ────────────────────────────────────────────────────

/// Per-channel shard descriptor set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCatalog {
    channels: BTreeMap<u32, BTreeMap<u64, PathBuf>>,
}

impl ShardCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from an explicit per-channel mapping.
    pub fn from_channels(channels: BTreeMap<u32, BTreeMap<u64, PathBuf>>) -> Self {
        Self { channels }
    }

    /// Register one shard file. A later insert for the same
    /// `(channel, sequence)` replaces the earlier path.
    pub fn insert(&mut self, channel: u32, sequence: u64, path: impl Into<PathBuf>) {
        self.channels
            .entry(channel)
            .or_default()
            .insert(sequence, path.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_shard(mut self, channel: u32, sequence: u64, path: impl Into<PathBuf>) -> Self {
        self.insert(channel, sequence, path);
        self
    }

    /// Discover shards below `root`.
    ///
    /// Every sub-directory named `channel_<n>` is channel `n`; every file
    /// in it whose extension equals `extension` is a shard. Sequence numbers
    /// follow file-name order. Derived `.ref`/`.brf` files never match
    /// unless `extension` names them explicitly.
    pub fn scan_dir(root: &Path, extension: &str) -> Result<Self> {
        let mut catalog = Self::new();
        let entries = fs::read_dir(root).map_err(|e| AnalysisError::io(root, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| AnalysisError::io(root, e))?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let channel = match dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHANNEL_DIR_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                Some(channel) => channel,
                None => continue,
            };

            let mut files = Vec::new();
            for file in fs::read_dir(&dir).map_err(|e| AnalysisError::io(&dir, e))? {
                let file = file.map_err(|e| AnalysisError::io(&dir, e))?.path();
                if file.is_file() && file.extension().and_then(|e| e.to_str()) == Some(extension) {
                    files.push(file);
                }
            }
            files.sort();

            for (sequence, file) in files.into_iter().enumerate() {
                catalog.insert(channel, sequence as u64, file);
            }
        }

        Ok(catalog)
    }

    /// Total number of shards across all channels.
    pub fn len(&self) -> usize {
        self.channels.values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Flattened shard list ordered by `(channel, sequence)`.
    pub fn shards(&self) -> Vec<ShardDescriptor> {
        self.channels
            .iter()
            .flat_map(|(&channel, shards)| {
                shards
                    .iter()
                    .map(move |(&sequence, path)| (channel, sequence, path.clone()))
            })
            .enumerate()
            .map(|(index, (channel, sequence, path))| ShardDescriptor {
                index,
                channel,
                sequence,
                path,
            })
            .collect()
    }

    /// Derived `.ref` paths in shard-index order.
    pub fn reference_set_paths(&self) -> Vec<PathBuf> {
        self.shards().iter().map(|s| s.reference_set_path()).collect()
    }

    /// Derived `.brf` paths in shard-index order.
    pub fn reverse_map_paths(&self) -> Vec<PathBuf> {
        self.shards().iter().map(|s| s.reverse_map_path()).collect()
    }
}
