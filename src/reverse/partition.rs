//! Rewriting reverse-map shards into pairwise disjoint key ranges.
//!
//! Range dispatch needs every id to fall inside at most one shard. Shards
//! produced by conversion overlap freely, so each pass sorts the shards by
//! range, collects every overlapping pair and merge-splits it (see
//! [`merge_split`]). Passes repeat until a scan finds no overlap.
//!
//! A merge-split of an overlapping pair leaves two disjoint ranges inside
//! their former union, so the sum of spans over all shards strictly
//! decreases, unless the pair held at most one distinct key between them,
//! in which case one shard ends up empty. Either way the process
//! terminates.

use rayon::prelude::*;
use tracing::Span;

use crate::error::Result;
use crate::pipeline::CancelToken;
use crate::shard::ranged::merge_split;
use crate::shard::{KeyRange, RangedShard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Scans performed, including the final clean one.
    pub passes: usize,
    pub merges: usize,
}

/// Every `(i, j)` with `i < j` whose ranges overlap. Each check is logged.
pub fn overlapping_pairs(ranges: &[Option<KeyRange>], parallel: bool, span: &Span) -> Vec<(usize, usize)> {
    let check = |i: usize, j: usize| -> Option<(usize, usize)> {
        let overlap = match (&ranges[i], &ranges[j]) {
            (Some(a), Some(b)) => a.intersects(b),
            _ => false,
        };
        tracing::debug!(parent: span, first = i, second = j, overlap, "overlap check");
        overlap.then_some((i, j))
    };

    let n = ranges.len();
    let mut pairs: Vec<(usize, usize)> = if parallel {
        (0..n)
            .into_par_iter()
            .flat_map_iter(|i| (i + 1..n).filter_map(move |j| check(i, j)))
            .collect()
    } else {
        (0..n)
            .flat_map(|i| (i + 1..n).filter_map(move |j| check(i, j)))
            .collect()
    };
    pairs.sort_unstable();
    pairs
}

/// Merge-split overlapping shards until all ranges are pairwise disjoint.
///
/// On return `shards` is sorted by range, empty shards first.
pub fn make_disjoint(
    shards: &mut [RangedShard],
    parallel: bool,
    cancel: &CancelToken,
    span: &Span,
) -> Result<PartitionStats> {
    let mut stats = PartitionStats::default();

    loop {
        cancel.check()?;
        shards.sort_by(|a, b| a.cmp_range(b));
        let ranges: Vec<Option<KeyRange>> = shards.iter().map(RangedShard::range).collect();
        let pairs = overlapping_pairs(&ranges, parallel, span);
        stats.passes += 1;
        if pairs.is_empty() {
            break;
        }

        let mut merged = 0;
        for (i, j) in pairs {
            let (left, right) = shards.split_at_mut(j);
            let (first, second) = (&mut left[i], &mut right[0]);
            // Earlier merges in this pass may already have separated them.
            if !first.intersects(second) {
                continue;
            }
            merge_split(first, second)?;
            merged += 1;
        }
        stats.merges += merged;
        tracing::info!(parent: span, pass = stats.passes, merged, "overlap pass");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::codec::write_reverse_map;
    use crate::shard::{ObjectId, ReverseMap};
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::tempdir;

    fn shard_with_keys(dir: &Path, name: &str, keys: &[ObjectId]) -> RangedShard {
        let path = dir.join(name);
        let map: ReverseMap = keys.iter().map(|&k| (k, BTreeSet::from([k + 1000]))).collect();
        write_reverse_map(&path, &map).unwrap();
        RangedShard::open(&path).unwrap()
    }

    fn assert_disjoint(shards: &[RangedShard]) {
        for (i, a) in shards.iter().enumerate() {
            for b in &shards[i + 1..] {
                assert!(!a.intersects(b), "{:?} overlaps {:?}", a.range(), b.range());
            }
        }
    }

    #[test]
    fn test_pairs_found_sequential_and_parallel_agree() {
        let ranges = vec![
            Some(KeyRange::new(0, 10)),
            Some(KeyRange::new(10, 20)),
            Some(KeyRange::new(30, 40)),
            None,
            Some(KeyRange::new(5, 35)),
        ];
        let seq = overlapping_pairs(&ranges, false, &Span::none());
        let par = overlapping_pairs(&ranges, true, &Span::none());
        assert_eq!(seq, vec![(0, 1), (0, 4), (1, 4), (2, 4)]);
        assert_eq!(seq, par);
    }

    #[test]
    fn test_make_disjoint_preserves_keys() {
        let dir = tempdir().unwrap();
        let mut shards = vec![
            shard_with_keys(dir.path(), "a.brf", &[1, 5, 9, 13]),
            shard_with_keys(dir.path(), "b.brf", &[2, 5, 6]),
            shard_with_keys(dir.path(), "c.brf", &[4, 20]),
            shard_with_keys(dir.path(), "d.brf", &[30, 31]),
        ];

        let stats = make_disjoint(&mut shards, true, &CancelToken::new(), &Span::none()).unwrap();
        assert!(stats.merges > 0);
        assert_disjoint(&shards);

        let mut keys = BTreeSet::new();
        for shard in &mut shards {
            shard.load().unwrap();
            keys.extend(shard.map().unwrap().keys().copied());
            shard.unload();
        }
        assert_eq!(keys, BTreeSet::from([1, 2, 4, 5, 6, 9, 13, 20, 30, 31]));
    }

    #[test]
    fn test_already_disjoint_is_single_pass() {
        let dir = tempdir().unwrap();
        let mut shards = vec![
            shard_with_keys(dir.path(), "b.brf", &[20, 29]),
            shard_with_keys(dir.path(), "a.brf", &[1, 10]),
        ];
        let stats = make_disjoint(&mut shards, false, &CancelToken::new(), &Span::none()).unwrap();
        assert_eq!(stats, PartitionStats { passes: 1, merges: 0 });
        assert_eq!(shards[0].range(), Some(KeyRange::new(1, 10)));
    }

    #[test]
    fn test_cancelled_before_pass() {
        let token = CancelToken::new();
        token.cancel();
        let err = make_disjoint(&mut [], false, &token, &Span::none()).unwrap_err();
        assert!(err.is_cancelled());
    }
}
