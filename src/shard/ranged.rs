//! Range-aware shard wrapper for reverse maps.
//!
//! A [`RangedShard`] remembers the closed key range `[min, max]` of its
//! reverse map even while the map itself is unloaded. The reverse-parent
//! search sorts and dispatches on these ranges, so they must describe the
//! on-disk content exactly whenever the map is not resident.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::shard::codec::{read_reverse_map, write_reverse_map};
use crate::shard::types::{ObjectId, ReverseMap};

// ── KeyRange ────────────────────────────────────────────────────────

/// Closed key interval. Orders by `(min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    pub min: ObjectId,
    pub max: ObjectId,
}

impl KeyRange {
    pub fn new(min: ObjectId, max: ObjectId) -> Self {
        debug_assert!(min <= max);
        Self { min, max }
    }

    /// Range spanned by the keys of `map`, `None` when it has none.
    pub fn of<V>(map: &BTreeMap<ObjectId, V>) -> Option<Self> {
        let (&min, _) = map.first_key_value()?;
        let (&max, _) = map.last_key_value()?;
        Some(Self { min, max })
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.min <= id && id <= self.max
    }

    /// Closed-interval overlap; shared endpoints count.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.min <= other.max && self.max >= other.min
    }

    pub fn span(&self) -> u64 {
        self.max - self.min
    }
}

// ── RangedShard ─────────────────────────────────────────────────────

/// Reverse map file plus the key range of its content.
#[derive(Debug)]
pub struct RangedShard {
    path: PathBuf,
    map: Option<ReverseMap>,
    range: Option<KeyRange>,
    len: usize,
    dirty: bool,
}

impl RangedShard {
    /// Read `path` once to learn its range, then drop the content.
    pub fn open(path: &Path) -> Result<Self> {
        let mut shard = Self {
            path: path.to_path_buf(),
            map: None,
            range: None,
            len: 0,
            dirty: false,
        };
        shard.load()?;
        shard.unload();
        Ok(shard)
    }

    /// Wrap an in-memory map that will be stored at `path`.
    pub fn from_map(path: &Path, map: ReverseMap) -> Self {
        let mut shard = Self {
            path: path.to_path_buf(),
            map: Some(map),
            range: None,
            len: 0,
            dirty: false,
        };
        shard.update();
        shard
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key range of the content; `None` for an empty shard.
    pub fn range(&self) -> Option<KeyRange> {
        self.range
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_loaded(&self) -> bool {
        self.map.is_some()
    }

    /// Content differs from what was last stored.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn map(&self) -> Option<&ReverseMap> {
        self.map.as_ref()
    }

    /// Direct parents of `id`, if the shard is loaded and defines it.
    pub fn parents(&self, id: ObjectId) -> Option<&BTreeSet<ObjectId>> {
        self.map.as_ref()?.get(&id)
    }

    /// Whether the remembered range covers `id`.
    pub fn covers(&self, id: ObjectId) -> bool {
        self.range.is_some_and(|r| r.contains(id))
    }

    /// Recompute `len` and the range from the loaded map; marks dirty.
    pub fn update(&mut self) {
        if let Some(map) = &self.map {
            self.len = map.len();
            self.range = KeyRange::of(map);
        }
        self.dirty = true;
    }

    /// Empty shards never intersect anything.
    pub fn intersects(&self, other: &RangedShard) -> bool {
        match (self.range, other.range) {
            (Some(a), Some(b)) => a.intersects(&b),
            _ => false,
        }
    }

    /// Order by `(min, max)`; empty shards first.
    pub fn cmp_range(&self, other: &RangedShard) -> Ordering {
        self.range.cmp(&other.range)
    }

    /// Read the reverse map from disk and refresh the range.
    pub fn load(&mut self) -> Result<()> {
        self.map = Some(read_reverse_map(&self.path)?);
        self.update();
        Ok(())
    }

    /// Load unless already resident.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.map.is_none() {
            self.load()?;
        }
        Ok(())
    }

    /// Write the loaded map with the exact-size codec and clear dirty.
    pub fn store(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            write_reverse_map(&self.path, map)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Drop the map; the range stays.
    pub fn unload(&mut self) {
        self.map = None;
    }

    fn take_map(&mut self) -> ReverseMap {
        self.map.take().unwrap_or_default()
    }
}

/// Merge two overlapping shards and split the union back by entry count.
///
/// Parents of a key present in both are unioned. In key order, the first
/// `ceil(n / 2)` entries stay in `first` and the rest move to `second`, so
/// afterwards the two ranges are disjoint (or one shard is empty). Both
/// files are rewritten and both maps unloaded.
pub fn merge_split(first: &mut RangedShard, second: &mut RangedShard) -> Result<()> {
    first.ensure_loaded()?;
    second.ensure_loaded()?;

    let mut combined = first.take_map();
    for (key, parents) in second.take_map() {
        combined.entry(key).or_default().extend(parents);
    }

    let keep = combined.len().div_ceil(2);
    let tail = match combined.keys().nth(keep).copied() {
        Some(split_key) => combined.split_off(&split_key),
        None => ReverseMap::new(),
    };

    first.map = Some(combined);
    second.map = Some(tail);
    first.update();
    second.update();

    first.store()?;
    second.store()?;
    first.unload();
    second.unload();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reverse(entries: Vec<(ObjectId, Vec<ObjectId>)>) -> ReverseMap {
        entries
            .into_iter()
            .map(|(k, ps)| (k, ps.into_iter().collect()))
            .collect()
    }

    #[test]
    fn test_range_boundary_overlap() {
        let a = KeyRange::new(0, 10);
        let b = KeyRange::new(10, 20);
        let c = KeyRange::new(11, 20);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_update_tracks_range_and_dirty() {
        let shard = RangedShard::from_map(Path::new("x.brf"), reverse(vec![(5, vec![1]), (9, vec![2])]));
        assert_eq!(shard.range(), Some(KeyRange::new(5, 9)));
        assert_eq!(shard.len(), 2);
        assert!(shard.is_dirty());
    }

    #[test]
    fn test_empty_shard_orders_first_and_never_intersects() {
        let empty = RangedShard::from_map(Path::new("e.brf"), ReverseMap::new());
        let full = RangedShard::from_map(Path::new("f.brf"), reverse(vec![(0, vec![1])]));
        assert_eq!(empty.range(), None);
        assert_eq!(empty.cmp_range(&full), Ordering::Less);
        assert!(!empty.intersects(&full));
        assert!(!empty.intersects(&empty));
    }

    #[test]
    fn test_ordering_by_min_then_max() {
        let a = RangedShard::from_map(Path::new("a"), reverse(vec![(1, vec![]), (8, vec![])]));
        let b = RangedShard::from_map(Path::new("b"), reverse(vec![(1, vec![]), (4, vec![])]));
        let c = RangedShard::from_map(Path::new("c"), reverse(vec![(2, vec![])]));
        let mut shards = [a, b, c];
        shards.sort_by(|x, y| x.cmp_range(y));
        let paths: Vec<_> = shards.iter().map(|s| s.path().to_path_buf()).collect();
        assert_eq!(paths, vec![PathBuf::from("b"), PathBuf::from("a"), PathBuf::from("c")]);
    }

    #[test]
    fn test_store_clears_dirty_and_unload_keeps_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.brf");
        let mut shard = RangedShard::from_map(&path, reverse(vec![(3, vec![1, 2])]));
        shard.store().unwrap();
        assert!(!shard.is_dirty());

        shard.unload();
        assert!(!shard.is_loaded());
        assert_eq!(shard.range(), Some(KeyRange::new(3, 3)));
        assert!(shard.covers(3));
        assert!(!shard.covers(4));

        let reopened = RangedShard::open(&path).unwrap();
        assert_eq!(reopened.range(), Some(KeyRange::new(3, 3)));
        assert!(!reopened.is_loaded());
    }

    #[test]
    fn test_merge_split_unions_and_separates() {
        let dir = tempdir().unwrap();
        let mut a = RangedShard::from_map(
            &dir.path().join("a.brf"),
            reverse(vec![(1, vec![100]), (5, vec![101]), (9, vec![102])]),
        );
        let mut b = RangedShard::from_map(
            &dir.path().join("b.brf"),
            reverse(vec![(5, vec![200]), (6, vec![201])]),
        );
        assert!(a.intersects(&b));

        merge_split(&mut a, &mut b).unwrap();

        assert!(!a.intersects(&b));
        assert_eq!(a.range(), Some(KeyRange::new(1, 5)));
        assert_eq!(b.range(), Some(KeyRange::new(6, 9)));
        assert!(!a.is_loaded() && !b.is_loaded());
        assert!(!a.is_dirty() && !b.is_dirty());

        a.load().unwrap();
        b.load().unwrap();
        assert_eq!(
            a.parents(5).unwrap().iter().copied().collect::<Vec<_>>(),
            vec![101, 200]
        );
        assert_eq!(a.len() + b.len(), 4);
    }

    #[test]
    fn test_merge_split_single_key_empties_second() {
        let dir = tempdir().unwrap();
        let mut a = RangedShard::from_map(&dir.path().join("a.brf"), reverse(vec![(7, vec![1])]));
        let mut b = RangedShard::from_map(&dir.path().join("b.brf"), reverse(vec![(7, vec![2])]));

        merge_split(&mut a, &mut b).unwrap();

        assert_eq!(a.range(), Some(KeyRange::new(7, 7)));
        assert!(b.is_empty());
        assert_eq!(b.range(), None);
        assert!(!a.intersects(&b));
    }
}
