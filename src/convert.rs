//! Conversion pipeline: raw shards -> `.ref` + `.brf` per shard.
//!
//! ```text
//!                       ┌──> [set queue] ──> set_builders ──> .ref
//! tickets ──> loaders ──┤
//!                       └──> [rev queue] ──> reverse_builders ──> .brf
//! ```
//!
//! Each loaded forward map is shared read-only (`Arc`) by both builder
//! roles. Each builder role draws from its own ticket channel of F tickets,
//! so every role knows exactly how many maps it will receive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use serde::Serialize;
use tracing::Span;

use crate::config::{AnalysisConfig, ConversionConfig, ObjectIdRange};
use crate::error::{AnalysisError, Result};
use crate::pipeline::{queue, CancelToken, WorkTickets, WorkerPool};
use crate::shard::codec::{read_adjacency_map, write_reverse_map};
use crate::shard::{AdjacencyMap, ExternalReferenceSet, ReverseMap, ShardCatalog, ShardDescriptor};

/// Invert a forward map: every referenced id maps to the set of keys
/// referencing it.
pub fn invert(map: &AdjacencyMap) -> ReverseMap {
    let mut reverse = ReverseMap::new();
    for (&key, values) in map {
        for &value in values {
            reverse.entry(value).or_default().insert(key);
        }
    }
    reverse
}

// ── Output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionStats {
    pub shards: usize,
    /// Referenced ids across all forward maps, repeats included.
    pub referenced_ids: usize,
    /// Ids written to reference sets.
    pub external_ids: usize,
    /// Keys written to reverse maps.
    pub reverse_keys: usize,
    pub elapsed: Duration,
}

/// Derived file paths, both ordered by shard index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionOutput {
    pub reference_set_paths: Vec<PathBuf>,
    pub reverse_map_paths: Vec<PathBuf>,
    pub stats: ConversionStats,
}

/// One derived file written by a builder.
#[derive(Debug)]
struct Artifact {
    index: usize,
    path: PathBuf,
    entries: usize,
}

#[derive(Debug)]
enum StageOutput {
    Loaded { referenced_ids: usize },
    ReferenceSets(Vec<Artifact>),
    ReverseMaps(Vec<Artifact>),
}

type SharedMap = (usize, Arc<AdjacencyMap>);

// ── ShardConverter ──────────────────────────────────────────────────

pub struct ShardConverter {
    config: ConversionConfig,
    id_range: ObjectIdRange,
    span: Span,
    cancel: CancelToken,
}

impl ShardConverter {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            config: config.conversion.clone(),
            id_range: config.id_range,
            span: Span::none(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Cancelling `cancel` stops a running conversion.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Convert every shard of `catalog`.
    ///
    /// The first worker failure stops the pipeline and is returned; files
    /// already written stay on disk.
    pub fn convert(&self, catalog: &ShardCatalog) -> Result<ConversionOutput> {
        let started = Instant::now();
        let config = self.config.clamped();
        let shards: Arc<Vec<ShardDescriptor>> = Arc::new(catalog.shards());
        let total = shards.len();

        let span = tracing::info_span!(parent: &self.span, "convert", shards = total);
        let _entered = span.enter();
        tracing::info!(
            loaders = config.loaders,
            set_builders = config.set_builders,
            reverse_builders = config.reverse_builders,
            "conversion started"
        );

        let capacity = config.queue_capacity.max(1);
        let (set_tx, set_rx) = bounded::<SharedMap>(capacity);
        let (rev_tx, rev_rx) = bounded::<SharedMap>(capacity);
        let mut pool = WorkerPool::new(self.cancel.child(), span.clone());

        let load_tickets = WorkTickets::new(total);
        for id in 0..config.loaders {
            let tickets = load_tickets.clone();
            let shards = Arc::clone(&shards);
            let set_tx = set_tx.clone();
            let rev_tx = rev_tx.clone();
            pool.spawn("loader", id, move |cancel| {
                let mut referenced_ids = 0;
                while let Some(ticket) = tickets.claim() {
                    cancel.check()?;
                    let shard = &shards[ticket.index()];
                    let map = Arc::new(read_adjacency_map(&shard.path)?);
                    referenced_ids += map.values().map(Vec::len).sum::<usize>();
                    tracing::debug!(shard = shard.index, keys = map.len(), "forward map loaded");

                    queue::send(&set_tx, (shard.index, Arc::clone(&map)), cancel)?;
                    queue::send(&rev_tx, (shard.index, map), cancel)?;
                }
                Ok(StageOutput::Loaded { referenced_ids })
            })?;
        }
        drop(set_tx);
        drop(rev_tx);

        let set_tickets = WorkTickets::new(total);
        for id in 0..config.set_builders {
            let tickets = set_tickets.clone();
            let shards = Arc::clone(&shards);
            let rx = set_rx.clone();
            let id_range = self.id_range;
            pool.spawn("set_builder", id, move |cancel| {
                let mut built = Vec::new();
                while tickets.claim().is_some() {
                    let (index, map) = queue::recv_owed(&rx, cancel)?;
                    let path = shards[index].reference_set_path();
                    let mut set = ExternalReferenceSet::build(index, &path, &map, &id_range);
                    drop(map);

                    set.store()?;
                    let entries = set.len();
                    set.unload();
                    tracing::debug!(shard = index, external = entries, "reference set written");
                    built.push(Artifact { index, path, entries });
                }
                Ok(StageOutput::ReferenceSets(built))
            })?;
        }

        let rev_tickets = WorkTickets::new(total);
        for id in 0..config.reverse_builders {
            let tickets = rev_tickets.clone();
            let shards = Arc::clone(&shards);
            let rx = rev_rx.clone();
            pool.spawn("reverse_builder", id, move |cancel| {
                let mut built = Vec::new();
                while tickets.claim().is_some() {
                    let (index, map) = queue::recv_owed(&rx, cancel)?;
                    let reverse = invert(&map);
                    drop(map);

                    let path = shards[index].reverse_map_path();
                    write_reverse_map(&path, &reverse)?;
                    tracing::debug!(shard = index, keys = reverse.len(), "reverse map written");
                    built.push(Artifact {
                        index,
                        path,
                        entries: reverse.len(),
                    });
                }
                Ok(StageOutput::ReverseMaps(built))
            })?;
        }
        drop(set_rx);
        drop(rev_rx);

        let outputs = pool.join()?;
        let output = assemble(total, outputs, started.elapsed())?;
        tracing::info!(
            referenced_ids = output.stats.referenced_ids,
            external_ids = output.stats.external_ids,
            reverse_keys = output.stats.reverse_keys,
            elapsed_ms = output.stats.elapsed.as_millis() as u64,
            "conversion finished"
        );
        Ok(output)
    }
}

fn place(slots: &mut [Option<PathBuf>], artifact: Artifact) -> Result<usize> {
    let slot = slots
        .get_mut(artifact.index)
        .filter(|slot| slot.is_none())
        .ok_or_else(|| {
            AnalysisError::Pipeline(format!(
                "shard {} converted twice or out of range",
                artifact.index
            ))
        })?;
    *slot = Some(artifact.path);
    Ok(artifact.entries)
}

fn collect_paths(slots: Vec<Option<PathBuf>>, kind: &str) -> Result<Vec<PathBuf>> {
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| AnalysisError::Pipeline(format!("no {kind} for shard {index}")))
        })
        .collect()
}

fn assemble(total: usize, outputs: Vec<StageOutput>, elapsed: Duration) -> Result<ConversionOutput> {
    let mut sets = vec![None; total];
    let mut reverses = vec![None; total];
    let mut stats = ConversionStats {
        shards: total,
        elapsed,
        ..ConversionStats::default()
    };

    for output in outputs {
        match output {
            StageOutput::Loaded { referenced_ids } => stats.referenced_ids += referenced_ids,
            StageOutput::ReferenceSets(built) => {
                for artifact in built {
                    stats.external_ids += place(&mut sets, artifact)?;
                }
            }
            StageOutput::ReverseMaps(built) => {
                for artifact in built {
                    stats.reverse_keys += place(&mut reverses, artifact)?;
                }
            }
        }
    }

    Ok(ConversionOutput {
        reference_set_paths: collect_paths(sets, "reference set")?,
        reverse_map_paths: collect_paths(reverses, "reverse map")?,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::codec::{read_reverse_map, write_adjacency_map, DEFAULT_WRITE_BUFFER};
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::tempdir;

    fn forward(entries: Vec<(u64, Vec<u64>)>) -> AdjacencyMap {
        entries.into_iter().collect()
    }

    fn write_shard(path: &Path, map: &AdjacencyMap) {
        write_adjacency_map(path, map, DEFAULT_WRITE_BUFFER).unwrap();
    }

    #[test]
    fn test_invert_dedups_parents() {
        let map = forward(vec![(1, vec![5, 5, 6]), (2, vec![5])]);
        let reverse = invert(&map);
        assert_eq!(reverse[&5], BTreeSet::from([1, 2]));
        assert_eq!(reverse[&6], BTreeSet::from([1]));
        assert!(!reverse.contains_key(&1));
    }

    #[test]
    fn test_convert_writes_both_artifacts_in_shard_order() {
        let dir = tempdir().unwrap();
        let mut catalog = ShardCatalog::new();
        for seq in 0..5u64 {
            let path = dir.path().join(format!("s{seq}.fwd"));
            let base = seq * 10 + 1;
            write_shard(&path, &forward(vec![(base, vec![base + 1, 999])]));
            catalog.insert(0, seq, path);
        }

        let config = AnalysisConfig::default();
        let output = ShardConverter::new(&config).convert(&catalog).unwrap();

        assert_eq!(output.reference_set_paths.len(), 5);
        for (seq, path) in output.reference_set_paths.iter().enumerate() {
            assert_eq!(path, &dir.path().join(format!("s{seq}.ref")));
            assert_eq!(std::fs::metadata(path).unwrap().len(), 16);
        }
        for (seq, path) in output.reverse_map_paths.iter().enumerate() {
            assert_eq!(path, &dir.path().join(format!("s{seq}.brf")));
            let reverse = read_reverse_map(path).unwrap();
            assert_eq!(reverse.len(), 2);
        }
        assert_eq!(output.stats.shards, 5);
        assert_eq!(output.stats.referenced_ids, 10);
        assert_eq!(output.stats.external_ids, 10);
        assert_eq!(output.stats.reverse_keys, 10);
    }

    #[test]
    fn test_convert_empty_catalog() {
        let output = ShardConverter::new(&AnalysisConfig::default())
            .convert(&ShardCatalog::new())
            .unwrap();
        assert!(output.reference_set_paths.is_empty());
        assert!(output.reverse_map_paths.is_empty());
    }

    #[test]
    fn test_convert_missing_shard_file_fails() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("a.fwd");
        write_shard(&good, &forward(vec![(1, vec![2])]));
        let catalog = ShardCatalog::new()
            .with_shard(0, 0, good)
            .with_shard(0, 1, dir.path().join("absent.fwd"));

        let err = ShardConverter::new(&AnalysisConfig::default())
            .convert(&catalog)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Io { .. }), "{err}");
    }

    #[test]
    fn test_convert_cancelled_before_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fwd");
        write_shard(&path, &forward(vec![(1, vec![2])]));
        let catalog = ShardCatalog::new().with_shard(0, 0, path);

        let token = CancelToken::new();
        token.cancel();
        let err = ShardConverter::new(&AnalysisConfig::default())
            .with_cancel(token)
            .convert(&catalog)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
