//! Bookkeeping for the all-pairs reduction.
//!
//! Cell `(set, map)` is set once reference set `set` has been reduced
//! against the forward map of shard `map`. The search is complete exactly
//! when every cell is set. Stored as a row-major bitset.

use crate::error::{AnalysisError, Result};

const WORD_BITS: usize = 64;

#[derive(Debug, Clone)]
pub struct ReductionMatrix {
    size: usize,
    words: Vec<u64>,
    filled: usize,
}

impl ReductionMatrix {
    /// Empty `size × size` matrix.
    pub fn new(size: usize) -> Self {
        let cells = size * size;
        Self {
            size,
            words: vec![0; cells.div_ceil(WORD_BITS)],
            filled: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn cell(&self, set: usize, map: usize) -> Result<(usize, u64)> {
        if set >= self.size || map >= self.size {
            return Err(AnalysisError::Pipeline(format!(
                "reduction ({set}, {map}) outside {0}x{0} matrix",
                self.size
            )));
        }
        let bit = set * self.size + map;
        Ok((bit / WORD_BITS, 1 << (bit % WORD_BITS)))
    }

    /// Mark `set` as reduced against `map`. Returns `false` if it already was.
    pub fn record(&mut self, set: usize, map: usize) -> Result<bool> {
        let (word, mask) = self.cell(set, map)?;
        if self.words[word] & mask != 0 {
            return Ok(false);
        }
        self.words[word] |= mask;
        self.filled += 1;
        Ok(true)
    }

    pub fn is_reduced(&self, set: usize, map: usize) -> bool {
        match self.cell(set, map) {
            Ok((word, mask)) => self.words[word] & mask != 0,
            Err(_) => false,
        }
    }

    /// Whether `set` has been reduced against every map.
    pub fn row_complete(&self, set: usize) -> bool {
        set < self.size && (0..self.size).all(|map| self.is_reduced(set, map))
    }

    /// Number of cells set.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.size * self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_to_completion() {
        let mut matrix = ReductionMatrix::new(3);
        assert!(!matrix.is_full());
        for set in 0..3 {
            for map in 0..3 {
                assert!(matrix.record(set, map).unwrap());
            }
            assert!(matrix.row_complete(set));
        }
        assert!(matrix.is_full());
        assert_eq!(matrix.filled(), 9);
    }

    #[test]
    fn test_duplicate_record_not_counted() {
        let mut matrix = ReductionMatrix::new(2);
        assert!(matrix.record(1, 0).unwrap());
        assert!(!matrix.record(1, 0).unwrap());
        assert_eq!(matrix.filled(), 1);
        assert!(matrix.is_reduced(1, 0));
        assert!(!matrix.is_reduced(0, 1));
        assert!(!matrix.row_complete(1));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut matrix = ReductionMatrix::new(2);
        assert!(matches!(matrix.record(2, 0), Err(AnalysisError::Pipeline(_))));
        assert!(!matrix.is_reduced(0, 5));
    }

    #[test]
    fn test_spans_word_boundaries() {
        let mut matrix = ReductionMatrix::new(9);
        for set in 0..9 {
            for map in 0..9 {
                matrix.record(set, map).unwrap();
            }
        }
        assert!(matrix.is_full());
    }

    #[test]
    fn test_zero_size_is_full() {
        assert!(ReductionMatrix::new(0).is_full());
    }
}
