//! System resource detection and adaptive pool sizing.
//!
//! Detects available RAM and CPU cores, then derives pipeline pool sizes
//! from them. Stateless: each call to `ResourceManager::auto_tune()`
//! re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::config::{AnalysisConfig, ConversionConfig, MissingSearchConfig, MAX_POOL_SIZE};

// ── Constants ───────────────────────────────────────────────────────

const GB: u64 = 1024 * 1024 * 1024;

/// Below this much total RAM the host is memory-constrained.
const LOW_MEMORY_GB: f64 = 4.0;

/// At or above this pressure the host is memory-constrained.
const HIGH_PRESSURE: f64 = 0.85;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    /// Too little RAM in total, or too little of it free, to keep several
    /// forward maps resident at once.
    pub fn is_memory_constrained(&self) -> bool {
        let total_gb = self.total_memory_bytes as f64 / GB as f64;
        total_gb < LOW_MEMORY_GB || self.memory_pressure() >= HIGH_PRESSURE
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Pool sizes computed from system resources.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningProfile {
    /// Threads reading forward maps (conversion loaders, search map loaders).
    pub loaders: usize,
    /// Threads per builder role in conversion.
    pub builders: usize,
    /// Reducer stages of the missing-object search.
    pub reducer_stages: usize,
    /// Threads re-loading reference sets between laps.
    pub set_initializers: usize,
}

impl TuningProfile {
    /// Compute a tuning profile from detected resources.
    ///
    /// Heuristics, where "constrained" means RAM < 4 GB or memory
    /// pressure >= 0.85:
    /// - `loaders`: constrained -> 1, else `clamp(cpu / 4, 1, 4)`. Every
    ///   loader holds a whole forward map, so loaders are the memory hogs.
    /// - `builders`: `clamp(cpu / 4, 1, 12)`.
    /// - `reducer_stages`: constrained -> 2, else `clamp(cpu / 2, 2, 12)`.
    /// - `set_initializers`: `clamp(cpu / 8, 1, 2)`.
    pub fn from_resources(res: &SystemResources) -> Self {
        let constrained = res.is_memory_constrained();
        let cpus = res.cpu_count.max(1);

        let loaders = if constrained {
            1
        } else {
            (cpus / 4).clamp(1, 4)
        };

        let builders = (cpus / 4).clamp(1, MAX_POOL_SIZE);

        let reducer_stages = if constrained {
            2
        } else {
            (cpus / 2).clamp(2, MAX_POOL_SIZE)
        };

        let set_initializers = (cpus / 8).clamp(1, 2);

        Self {
            loaders,
            builders,
            reducer_stages,
            set_initializers,
        }
    }

    /// Full analysis configuration using this profile's sizes.
    pub fn into_config(self) -> AnalysisConfig {
        let defaults = AnalysisConfig::default();
        AnalysisConfig {
            conversion: ConversionConfig {
                loaders: self.loaders,
                set_builders: self.builders,
                reverse_builders: self.builders,
                ..defaults.conversion
            },
            missing: MissingSearchConfig {
                map_loaders: self.loaders,
                set_initializers: self.set_initializers,
                reducer_stages: self.reducer_stages,
                ..defaults.missing
            },
            ..defaults
        }
    }
}

impl Default for TuningProfile {
    /// Conservative defaults suitable for tests and unknown environments.
    fn default() -> Self {
        Self {
            loaders: 2,
            builders: 2,
            reducer_stages: 4,
            set_initializers: 1,
        }
    }
}

// ── ResourceManager ─────────────────────────────────────────────────

/// Stateless utility: detect system resources and compute tuning profile.
pub struct ResourceManager;

impl ResourceManager {
    /// Probe the system and return an adaptive tuning profile.
    pub fn auto_tune() -> TuningProfile {
        let resources = SystemResources::detect();
        let profile = TuningProfile::from_resources(&resources);
        tracing::info!(
            cpus = resources.cpu_count,
            total_memory = resources.total_memory_bytes,
            memory_pressure = resources.memory_pressure(),
            loaders = profile.loaders,
            reducer_stages = profile.reducer_stages,
            "auto-tuned analysis pools"
        );
        profile
    }
}

// ── Tests ───────────────────────────────────────────────────────────
