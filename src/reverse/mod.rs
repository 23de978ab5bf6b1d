//! Reverse-parent search.
//!
//! Given a set of ids, find who references them, who references those, and
//! so on toward the roots, using the per-shard reverse maps (`.brf`).
//! The shards are first rewritten into disjoint key ranges (see
//! [`partition`]); afterwards each id is served by the single shard whose
//! range contains it, and every shard is loaded once per visit with all
//! pending ids in its range drained together.

pub mod partition;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::Span;

use crate::config::{AnalysisConfig, ReverseSearchConfig};
use crate::error::Result;
use crate::pipeline::CancelToken;
use crate::shard::{KeyRange, ObjectId, RangedShard};

// ── Result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReverseSearchStats {
    pub shards: usize,
    pub merge_passes: usize,
    pub merges: usize,
    pub shard_loads: usize,
    /// Ids for which parents were found.
    pub ids_resolved: usize,
    /// Ids no shard range covers.
    pub ids_unresolved: usize,
    pub elapsed: Duration,
}

/// Direct parents of every id reached by a search.
///
/// An id without an entry is either a root or was not found in any shard;
/// neither is an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParentChains {
    parents: BTreeMap<ObjectId, Vec<ObjectId>>,
    stats: ReverseSearchStats,
}

impl ParentChains {
    /// Parents of `id`, ascending.
    pub fn get(&self, id: ObjectId) -> Option<&[ObjectId]> {
        self.parents.get(&id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.parents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &[ObjectId])> {
        self.parents.iter().map(|(&id, ps)| (id, ps.as_slice()))
    }

    /// Follow the smallest parent from `id` until an id without parents or
    /// a repeat. The result starts with `id` itself.
    pub fn chain_to_root(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut chain = vec![id];
        let mut visited = HashSet::from([id]);
        let mut current = id;
        while let Some(&next) = self.get(current).and_then(|ps| ps.first()) {
            if !visited.insert(next) {
                break;
            }
            chain.push(next);
            current = next;
        }
        chain
    }

    pub fn stats(&self) -> &ReverseSearchStats {
        &self.stats
    }

    pub fn into_map(self) -> BTreeMap<ObjectId, Vec<ObjectId>> {
        self.parents
    }
}

// ── ReverseSearch ───────────────────────────────────────────────────

pub struct ReverseSearch {
    config: ReverseSearchConfig,
    span: Span,
    cancel: CancelToken,
}

impl ReverseSearch {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            config: config.reverse.clone(),
            span: Span::none(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve parent chains of `targets` through the given `.brf` files.
    ///
    /// The files are rewritten in place while their ranges are made
    /// disjoint; their combined content is unchanged.
    pub fn reverse_search(
        &self,
        reverse_map_paths: &[PathBuf],
        targets: impl IntoIterator<Item = ObjectId>,
    ) -> Result<ParentChains> {
        let started = Instant::now();
        let span = tracing::info_span!(
            parent: &self.span,
            "reverse_search",
            shards = reverse_map_paths.len()
        );
        let _entered = span.enter();

        let mut shards = Vec::with_capacity(reverse_map_paths.len());
        for path in reverse_map_paths {
            self.cancel.check()?;
            shards.push(RangedShard::open(path)?);
        }

        let partition = partition::make_disjoint(
            &mut shards,
            self.config.parallel_overlap_scan,
            &self.cancel,
            &span,
        )?;
        shards.retain(|shard| !shard.is_empty());

        let mut stats = ReverseSearchStats {
            shards: reverse_map_paths.len(),
            merge_passes: partition.passes,
            merges: partition.merges,
            ..ReverseSearchStats::default()
        };
        tracing::info!(
            passes = partition.passes,
            merges = partition.merges,
            live_shards = shards.len(),
            "shard ranges disjoint"
        );

        let parents = walk(&mut shards, targets.into_iter().collect(), &self.cancel, &mut stats)?;
        stats.elapsed = started.elapsed();
        tracing::info!(
            resolved = stats.ids_resolved,
            unresolved = stats.ids_unresolved,
            loads = stats.shard_loads,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "reverse search finished"
        );
        Ok(ParentChains { parents, stats })
    }
}

/// The shard whose range contains `id`, with that range. `shards` must be
/// sorted by range and pairwise disjoint.
fn locate(shards: &[RangedShard], id: ObjectId) -> Option<(usize, KeyRange)> {
    let pos = shards.partition_point(|s| s.range().map_or(true, |r| r.max < id));
    let range = shards.get(pos)?.range()?;
    range.contains(id).then_some((pos, range))
}

fn walk(
    shards: &mut [RangedShard],
    mut pending: BTreeSet<ObjectId>,
    cancel: &CancelToken,
    stats: &mut ReverseSearchStats,
) -> Result<BTreeMap<ObjectId, Vec<ObjectId>>> {
    let mut seen = pending.clone();
    let mut parents = BTreeMap::new();

    while let Some(&next) = pending.first() {
        cancel.check()?;
        let Some((pos, range)) = locate(shards, next) else {
            tracing::debug!(id = next, "no shard covers id");
            pending.remove(&next);
            stats.ids_unresolved += 1;
            continue;
        };

        let shard = &mut shards[pos];
        shard.load()?;
        stats.shard_loads += 1;

        loop {
            let batch: Vec<ObjectId> = pending.range(range.min..=range.max).copied().collect();
            if batch.is_empty() {
                break;
            }
            for id in batch {
                pending.remove(&id);
                let Some(found) = shard.parents(id) else {
                    continue;
                };
                for &parent in found {
                    if seen.insert(parent) {
                        pending.insert(parent);
                    }
                }
                parents.insert(id, found.iter().copied().collect());
                stats.ids_resolved += 1;
            }
        }
        shard.unload();
    }
    Ok(parents)
}
