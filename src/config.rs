//! Analysis configuration.
//!
//! Every pipeline takes its pool sizes from here. Pool sizes are clamped to
//! `MIN_POOL_SIZE..=MAX_POOL_SIZE` when a pipeline starts, with a warning
//! for every out-of-range request. Configurations serialize to JSON so
//! tooling can keep them next to an exported store.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::shard::types::ObjectId;

// ── Constants ───────────────────────────────────────────────────────

pub const MIN_POOL_SIZE: usize = 1;

pub const MAX_POOL_SIZE: usize = 12;

/// Capacity of every inter-stage queue unless configured otherwise.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Clamp a requested pool size for `role`, warning when it is out of range.
pub fn clamp_pool_size(role: &str, requested: usize) -> usize {
    let clamped = requested.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
    if clamped != requested {
        tracing::warn!(
            role,
            requested,
            clamped,
            "pool size out of range {}..={}, clamping",
            MIN_POOL_SIZE,
            MAX_POOL_SIZE
        );
    }
    clamped
}

// ── ObjectIdRange ───────────────────────────────────────────────────

/// Inclusive range of ids that name real objects.
///
/// The store shares its numeric id space with other id kinds; only ids in
/// this range are collected into external-reference sets. The default
/// admits every id except 0, the store's null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdRange {
    pub min: ObjectId,
    pub max: ObjectId,
}

impl Default for ObjectIdRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: ObjectId::MAX,
        }
    }
}

impl ObjectIdRange {
    pub fn contains(&self, id: ObjectId) -> bool {
        id >= self.min && id <= self.max
    }
}

// ── Per-pipeline configs ────────────────────────────────────────────

/// Conversion pipeline (raw shard -> `.ref` + `.brf`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub loaders: usize,
    pub set_builders: usize,
    pub reverse_builders: usize,
    pub queue_capacity: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            loaders: 2,
            set_builders: 2,
            reverse_builders: 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ConversionConfig {
    /// Copy with every pool size clamped into range.
    pub fn clamped(&self) -> Self {
        Self {
            loaders: clamp_pool_size("loader", self.loaders),
            set_builders: clamp_pool_size("set_builder", self.set_builders),
            reverse_builders: clamp_pool_size("reverse_builder", self.reverse_builders),
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Missing-object search pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissingSearchConfig {
    pub map_loaders: usize,
    pub set_initializers: usize,
    pub reducer_stages: usize,
    pub queue_capacity: usize,
}

impl Default for MissingSearchConfig {
    fn default() -> Self {
        Self {
            map_loaders: 2,
            set_initializers: 1,
            reducer_stages: 4,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl MissingSearchConfig {
    pub fn clamped(&self) -> Self {
        Self {
            map_loaders: clamp_pool_size("map_loader", self.map_loaders),
            set_initializers: clamp_pool_size("set_initializer", self.set_initializers),
            reducer_stages: clamp_pool_size("reducer_stage", self.reducer_stages),
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Reverse-parent search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseSearchConfig {
    /// Scan shard pairs for overlap on the rayon pool.
    pub parallel_overlap_scan: bool,
}

impl Default for ReverseSearchConfig {
    fn default() -> Self {
        Self {
            parallel_overlap_scan: true,
        }
    }
}

// ── AnalysisConfig ──────────────────────────────────────────────────

/// Complete configuration of an analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub conversion: ConversionConfig,
    pub missing: MissingSearchConfig,
    pub reverse: ReverseSearchConfig,
    pub id_range: ObjectIdRange,
}

impl AnalysisConfig {
    /// Pool sizes derived from the host (see [`crate::resource`]).
    pub fn auto_tune() -> Self {
        crate::resource::ResourceManager::auto_tune().into_config()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings that cannot run. Pool sizes are not checked here:
    /// they are clamped, with a warning, when a pipeline starts.
    pub fn validate(&self) -> Result<()> {
        if self.id_range.min > self.id_range.max {
            return Err(AnalysisError::Config(format!(
                "id_range min {} exceeds max {}",
                self.id_range.min, self.id_range.max
            )));
        }
        if self.conversion.queue_capacity == 0 || self.missing.queue_capacity == 0 {
            return Err(AnalysisError::Config("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
