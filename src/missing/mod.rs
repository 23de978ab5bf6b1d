//! All-pairs missing-object search.
//!
//! Every shard's external-reference set must be reduced against every
//! shard's forward map; whatever survives is referenced but defined
//! nowhere. With F shards that is F² reductions, while only a handful of
//! forward maps fit in memory at once. The sets therefore circulate in laps
//! through R reducer stages, each stage holding one forward map per lap:
//!
//! ```text
//!          ┌─────────────────── pending (unbounded) <──────────────┐
//!          v                                                       │
//! set_initializers ──> stage 0 ──> stage 1 ──> … ──> stage R-1 ──> collector
//!                        ^           ^                  ^
//!                        └───────────┴── maps queue <── map_loaders <── tickets
//! ```
//!
//! A stage claims a map when the first set of a lap reaches it and applies
//! it to exactly F sets. The collector persists every set, records which
//! maps it has met in a [`ReductionMatrix`] and, after each full lap,
//! either finishes or sends all F sets round again. Each lap consumes up to
//! R maps, so the search takes `ceil(F / R)` laps.

pub mod matrix;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::Span;

use crate::config::{AnalysisConfig, MissingSearchConfig};
use crate::error::{AnalysisError, Result};
use crate::pipeline::{queue, CancelToken, WorkTickets, WorkerPool};
use crate::shard::codec::read_adjacency_map;
use crate::shard::{AdjacencyMap, ExternalReferenceSet, ObjectId, ShardCatalog, ShardDescriptor};

pub use matrix::ReductionMatrix;

// ── Result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MissingSearchStats {
    pub shards: usize,
    pub laps: usize,
    /// Set-against-map reductions actually performed.
    pub reductions_applied: usize,
    /// Reductions skipped because the set was already empty.
    pub reductions_skipped: usize,
    pub elapsed: Duration,
}

/// Ids referenced somewhere but defined in no shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MissingObjects {
    ids: BTreeSet<ObjectId>,
    per_shard: BTreeMap<usize, BTreeSet<ObjectId>>,
    stats: MissingSearchStats,
}

impl MissingObjects {
    pub fn ids(&self) -> &BTreeSet<ObjectId> {
        &self.ids
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Missing ids referenced by shard `index`, keyed by shard index.
    pub fn per_shard(&self) -> &BTreeMap<usize, BTreeSet<ObjectId>> {
        &self.per_shard
    }

    pub fn for_shard(&self, index: usize) -> Option<&BTreeSet<ObjectId>> {
        self.per_shard.get(&index)
    }

    pub fn stats(&self) -> &MissingSearchStats {
        &self.stats
    }

    pub fn into_ids(self) -> BTreeSet<ObjectId> {
        self.ids
    }
}

// ── Pipeline items ──────────────────────────────────────────────────

/// A reference set travelling through one lap, with the maps applied to
/// it so far in that lap.
struct InFlight {
    set: ExternalReferenceSet,
    applied: Vec<usize>,
}

impl InFlight {
    fn new(set: ExternalReferenceSet) -> Self {
        Self {
            set,
            applied: Vec::new(),
        }
    }
}

type LoadedMap = (usize, AdjacencyMap);

#[derive(Debug, Default)]
struct StageTally {
    applied: usize,
    skipped: usize,
}

enum WorkerOutput {
    Idle,
    Stage(StageTally),
    Collected {
        sets: Vec<ExternalReferenceSet>,
        laps: usize,
    },
}

// ── MissingObjectSearch ─────────────────────────────────────────────

pub struct MissingObjectSearch {
    config: MissingSearchConfig,
    span: Span,
    cancel: CancelToken,
}

impl MissingObjectSearch {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            config: config.missing.clone(),
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

    /// Find every id referenced by some shard of `catalog` and defined by
    /// none. `reference_set_paths[i]` must be the `.ref` file of shard `i`;
    /// the files are rewritten in place as they shrink.
    pub fn find_missing(
        &self,
        catalog: &ShardCatalog,
        reference_set_paths: &[PathBuf],
    ) -> Result<MissingObjects> {
        let started = Instant::now();
        let shards: Arc<Vec<ShardDescriptor>> = Arc::new(catalog.shards());
        let total = shards.len();
        if reference_set_paths.len() != total {
            return Err(AnalysisError::Config(format!(
                "{} reference sets for {total} shards",
                reference_set_paths.len()
            )));
        }

        let config = self.config.clamped();
        let span = tracing::info_span!(parent: &self.span, "find_missing", shards = total);
        let _entered = span.enter();
        if total == 0 {
            return Ok(MissingObjects::default());
        }
        tracing::info!(
            map_loaders = config.map_loaders,
            set_initializers = config.set_initializers,
            reducer_stages = config.reducer_stages,
            "missing-object search started"
        );

        let capacity = config.queue_capacity.max(1);
        let mut pool = WorkerPool::new(self.cancel.child(), span.clone());

        let (maps_tx, maps_rx) = bounded::<LoadedMap>(capacity);
        let tickets = WorkTickets::new(total);
        for id in 0..config.map_loaders {
            let tickets = tickets.clone();
            let shards = Arc::clone(&shards);
            let maps_tx = maps_tx.clone();
            pool.spawn("map_loader", id, move |cancel| {
                while let Some(ticket) = tickets.claim() {
                    cancel.check()?;
                    let shard = &shards[ticket.index()];
                    let map = read_adjacency_map(&shard.path)?;
                    tracing::debug!(shard = shard.index, keys = map.len(), "forward map loaded");
                    queue::send(&maps_tx, (shard.index, map), cancel)?;
                }
                Ok(WorkerOutput::Idle)
            })?;
        }
        drop(maps_tx);

        let (pending_tx, pending_rx) = unbounded::<InFlight>();
        let (first_tx, mut stage_rx) = bounded::<InFlight>(capacity);

        for id in 0..config.set_initializers {
            let pending_rx = pending_rx.clone();
            let first_tx = first_tx.clone();
            pool.spawn("set_initializer", id, move |cancel| {
                while let Some(mut item) = queue::recv(&pending_rx, cancel)? {
                    item.set.load(true, cancel)?;
                    queue::send(&first_tx, item, cancel)?;
                }
                Ok(WorkerOutput::Idle)
            })?;
        }
        drop(pending_rx);
        drop(first_tx);

        for id in 0..config.reducer_stages {
            let (next_tx, next_rx) = bounded::<InFlight>(capacity);
            let input = std::mem::replace(&mut stage_rx, next_rx);
            let maps_rx = maps_rx.clone();
            pool.spawn("reducer_stage", id, move |cancel| {
                run_stage(total, &input, &next_tx, &maps_rx, cancel).map(WorkerOutput::Stage)
            })?;
        }
        drop(maps_rx);

        let collector_pending = pending_tx.clone();
        pool.spawn("collector", 0, move |cancel| {
            run_collector(total, &stage_rx, &collector_pending, cancel)
        })?;

        for (index, path) in reference_set_paths.iter().enumerate() {
            let set = ExternalReferenceSet::open(index, path);
            // Initializers only hang up after failing; join reports why.
            if pending_tx.send(InFlight::new(set)).is_err() {
                break;
            }
        }
        drop(pending_tx);

        let mut stats = MissingSearchStats {
            shards: total,
            ..MissingSearchStats::default()
        };
        let mut terminal = None;
        for output in pool.join()? {
            match output {
                WorkerOutput::Idle => {}
                WorkerOutput::Stage(tally) => {
                    stats.reductions_applied += tally.applied;
                    stats.reductions_skipped += tally.skipped;
                }
                WorkerOutput::Collected { sets, laps } => {
                    stats.laps = laps;
                    terminal = Some(sets);
                }
            }
        }
        let sets = terminal
            .ok_or_else(|| AnalysisError::Pipeline("collector returned no sets".into()))?;

        let mut missing = assemble(sets, &self.cancel)?;
        stats.elapsed = started.elapsed();
        tracing::info!(
            missing = missing.ids.len(),
            laps = stats.laps,
            reductions = stats.reductions_applied,
            skipped = stats.reductions_skipped,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "missing-object search finished"
        );
        missing.stats = stats;
        Ok(missing)
    }
}

/// One reducer stage: per lap, claim a map (if any remain) and apply it to
/// exactly `total` sets.
fn run_stage(
    total: usize,
    input: &Receiver<InFlight>,
    output: &Sender<InFlight>,
    maps: &Receiver<LoadedMap>,
    cancel: &CancelToken,
) -> Result<StageTally> {
    let mut tally = StageTally::default();
    let mut maps_left = true;

    while let Some(first) = queue::recv(input, cancel)? {
        let current = if maps_left {
            let claimed = queue::recv(maps, cancel)?;
            maps_left = claimed.is_some();
            claimed
        } else {
            None
        };
        if let Some((index, map)) = &current {
            tracing::debug!(map = index, keys = map.len(), "lap map claimed");
        }

        let mut item = first;
        for seen in 1..=total {
            if let Some((index, map)) = &current {
                if item.set.is_known_empty() {
                    tally.skipped += 1;
                } else {
                    item.set.reduce(map);
                    tally.applied += 1;
                }
                item.applied.push(*index);
            }
            queue::send(output, item, cancel)?;
            if seen == total {
                break;
            }
            item = queue::recv_owed(input, cancel)?;
        }
    }
    Ok(tally)
}

/// Persist every set, track the matrix, and loop sets back until every set
/// has met every map.
fn run_collector(
    total: usize,
    input: &Receiver<InFlight>,
    pending: &Sender<InFlight>,
    cancel: &CancelToken,
) -> Result<WorkerOutput> {
    let mut matrix = ReductionMatrix::new(total);
    let mut batch: Vec<ExternalReferenceSet> = Vec::with_capacity(total);
    let mut laps = 0;
    let mut filled_before = 0;

    loop {
        let InFlight { mut set, applied } = queue::recv_owed(input, cancel)?;
        set.store()?;
        set.unload();
        for map in applied {
            matrix.record(set.shard(), map)?;
        }
        batch.push(set);
        if batch.len() < total {
            continue;
        }

        laps += 1;
        tracing::info!(
            lap = laps,
            reduced = matrix.filled(),
            required = total * total,
            "lap complete"
        );
        if matrix.is_full() {
            return Ok(WorkerOutput::Collected { sets: batch, laps });
        }
        if matrix.filled() == filled_before {
            return Err(AnalysisError::Pipeline(format!(
                "lap {laps} reduced nothing with {} of {} reductions outstanding",
                total * total - matrix.filled(),
                total * total
            )));
        }
        filled_before = matrix.filled();

        for set in batch.drain(..) {
            queue::send(pending, InFlight::new(set), cancel)?;
        }
    }
}

/// Re-read every terminal set and union the survivors.
fn assemble(mut sets: Vec<ExternalReferenceSet>, cancel: &CancelToken) -> Result<MissingObjects> {
    sets.sort_by_key(|set| set.shard());
    let mut missing = MissingObjects::default();

    for mut set in sets {
        set.load(false, cancel)?;
        if !set.is_empty() {
            let survivors: BTreeSet<ObjectId> = set.ids().iter().copied().collect();
            for &id in &survivors {
                tracing::warn!(shard = set.shard(), id, "missing object");
            }
            missing.ids.extend(survivors.iter().copied());
            missing.per_shard.insert(set.shard(), survivors);
        }
        set.release();
    }
    Ok(missing)
}
