use crate::bad_index::BadIndices;
use crate::genome::{Chromosome, GenomicInterval};
use crate::reorder::ColumnGroups;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Sentinel for a bin without a row or column
pub const IGNORE: i32 = -1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChromBinIndex {
    groups: Vec<i32>,
    rows: Vec<i32>,
}

/// Maps each genomic bin to its column group and its global row, and each
/// global row back to its genomic interval.
///
/// A bin has a row iff it has a group. Rows are always the contiguous range
/// `0..num_rows()` and `intervals()[row]` is the interval of that row, so
/// removing rows goes through [`BinIndexMap::remove_rows`], which updates
/// both sides in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinIndexMap {
    resolution: u32,
    per_chrom: Vec<ChromBinIndex>,
    col_ranges: Vec<Range<usize>>,
    row_intervals: Vec<GenomicInterval>,
    num_cols: usize,
}

impl BinIndexMap {
    /// Assign rows and groups to every non-excluded bin of `chromosomes`, in
    /// the given order. Without `groups` every bin is its own column; with
    /// them, each chromosome's local group ids are offset past the previous
    /// chromosome's. `num_chromosomes` sizes the per-chromosome tables so
    /// they can be indexed by handler index.
    pub fn build(
        chromosomes: &[Chromosome],
        num_chromosomes: usize,
        resolution: u32,
        bad: &BadIndices,
        groups: Option<&ColumnGroups>,
    ) -> Self {
        let mut per_chrom = vec![ChromBinIndex::default(); num_chromosomes];
        let mut col_ranges = vec![0..0; num_chromosomes];
        let mut row_intervals = Vec::new();
        let mut next_col = 0usize;

        for chrom in chromosomes {
            let n = chrom.num_bins(resolution);
            let mut index = ChromBinIndex {
                groups: vec![IGNORE; n],
                rows: vec![IGNORE; n],
            };
            let col_start = next_col;
            let local_groups = groups.and_then(|g| g.for_chromosome(chrom.index));

            for bin in 0..n {
                if bad.contains(chrom.index, bin) {
                    continue;
                }
                let group = match local_groups {
                    Some(local) => match local.get(bin).copied().flatten() {
                        Some(g) => col_start + g,
                        None => continue,
                    },
                    None => {
                        next_col += 1;
                        next_col - 1
                    }
                };
                index.groups[bin] = group as i32;
                index.rows[bin] = row_intervals.len() as i32;
                row_intervals.push(chrom.bin_interval(bin, resolution));
            }

            if let Some(local) = local_groups {
                next_col = col_start + ColumnGroups::num_groups(local);
            }
            col_ranges[chrom.index] = col_start..next_col;
            per_chrom[chrom.index] = index;
        }

        Self {
            resolution,
            per_chrom,
            col_ranges,
            row_intervals,
            num_cols: next_col,
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn num_rows(&self) -> usize {
        self.row_intervals.len()
    }

    /// Width of the column space fixed at build time; row removal keeps it
    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn row(&self, chrom: usize, bin: usize) -> Option<usize> {
        let r = *self.per_chrom.get(chrom)?.rows.get(bin)?;
        (r != IGNORE).then_some(r as usize)
    }

    pub fn group(&self, chrom: usize, bin: usize) -> Option<usize> {
        let g = *self.per_chrom.get(chrom)?.groups.get(bin)?;
        (g != IGNORE).then_some(g as usize)
    }

    pub fn interval(&self, row: usize) -> Option<&GenomicInterval> {
        self.row_intervals.get(row)
    }

    pub fn intervals(&self) -> &[GenomicInterval] {
        &self.row_intervals
    }

    /// Columns owned by `chrom`
    pub fn col_range(&self, chrom: usize) -> Range<usize> {
        self.col_ranges.get(chrom).cloned().unwrap_or(0..0)
    }

    /// Owning chromosome of each column
    pub fn column_chromosomes(&self) -> Vec<Option<usize>> {
        let mut owners = vec![None; self.num_cols];
        for (chrom, range) in self.col_ranges.iter().enumerate() {
            for owner in &mut owners[range.clone()] {
                *owner = Some(chrom);
            }
        }
        owners
    }

    /// Rows owned by `chrom` (contiguous because rows follow genome order)
    pub fn row_range(&self, chrom: usize) -> Range<usize> {
        let Some(index) = self.per_chrom.get(chrom) else {
            return 0..0;
        };
        let mut valid = index.rows.iter().filter(|&&r| r != IGNORE);
        match valid.next() {
            Some(&first) => {
                let last = valid.last().copied().unwrap_or(first);
                first as usize..last as usize + 1
            }
            None => 0..0,
        }
    }

    /// Number of bins aggregated into each column
    pub fn column_weights(&self) -> Vec<i32> {
        let mut weights = vec![0; self.num_cols];
        for index in &self.per_chrom {
            for &g in index.groups.iter().filter(|&&g| g != IGNORE) {
                weights[g as usize] += 1;
            }
        }
        weights
    }

    /// Drop the given global rows. Surviving rows shift down so they stay
    /// contiguous, removed bins lose both row and group, and the interval
    /// list shrinks by the same rows. Returns the number of rows removed.
    pub fn remove_rows(&mut self, rows: &[usize]) -> usize {
        let num_rows = self.num_rows();
        let mut removed = vec![false; num_rows];
        for &r in rows.iter().filter(|&&r| r < num_rows) {
            removed[r] = true;
        }

        let mut new_index = vec![IGNORE; num_rows];
        let mut next = 0i32;
        for (old, &is_removed) in removed.iter().enumerate() {
            if !is_removed {
                new_index[old] = next;
                next += 1;
            }
        }

        for index in self.per_chrom.iter_mut() {
            for (row, group) in index.rows.iter_mut().zip(index.groups.iter_mut()) {
                if *row == IGNORE {
                    continue;
                }
                *row = new_index[*row as usize];
                if *row == IGNORE {
                    *group = IGNORE;
                }
            }
        }

        let mut old = 0;
        self.row_intervals.retain(|_| {
            let keep = !removed[old];
            old += 1;
            keep
        });

        num_rows - self.num_rows()
    }

    /// Check that rows and groups agree, rows are exactly `0..num_rows()`
    /// and each row's bin matches its interval
    pub fn is_consistent(&self) -> bool {
        let mut seen = vec![false; self.num_rows()];
        for (chrom, index) in self.per_chrom.iter().enumerate() {
            if index.rows.len() != index.groups.len() {
                return false;
            }
            for (bin, (&row, &group)) in index.rows.iter().zip(&index.groups).enumerate() {
                if (row == IGNORE) != (group == IGNORE) {
                    return false;
                }
                if row == IGNORE {
                    continue;
                }
                let row = row as usize;
                if row >= seen.len() || seen[row] || group as usize >= self.num_cols {
                    return false;
                }
                seen[row] = true;
                let interval = &self.row_intervals[row];
                if interval.chrom != chrom
                    || interval.start != bin as u64 * self.resolution as u64
                {
                    return false;
                }
            }
        }
        seen.iter().all(|&s| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::ChromosomeHandler;

    fn handler() -> ChromosomeHandler {
        ChromosomeHandler::new(vec![("chr1", 500), ("chr2", 300)])
    }

    #[test]
    fn test_build_skips_bad_bins() {
        let handler = handler();
        let mut bad = BadIndices::new(100);
        bad.insert(0, 1);
        bad.insert(1, 0);
        let map = BinIndexMap::build(handler.chromosomes(), handler.len(), 100, &bad, None);

        assert_eq!(map.num_rows(), 6);
        assert_eq!(map.num_cols(), 6);
        assert_eq!(map.row(0, 0), Some(0));
        assert_eq!(map.row(0, 1), None);
        assert_eq!(map.group(0, 1), None);
        assert_eq!(map.row(0, 2), Some(1));
        assert_eq!(map.row(1, 1), Some(4));
        assert_eq!(map.row_range(1), 4..6);
        assert_eq!(map.col_range(0), 0..4);
        assert_eq!(map.interval(4).unwrap().start, 100);
        assert_eq!(map.column_weights(), vec![1; 6]);
        assert!(map.is_consistent());
    }

    #[test]
    fn test_remove_rows_keeps_rows_contiguous() {
        let handler = handler();
        let bad = BadIndices::new(100);
        let mut map = BinIndexMap::build(handler.chromosomes(), handler.len(), 100, &bad, None);
        assert_eq!(map.num_rows(), 8);

        let removed = map.remove_rows(&[1, 5, 5, 42]);
        assert_eq!(removed, 2);
        assert_eq!(map.num_rows(), 6);
        assert_eq!(map.intervals().len(), map.num_rows());
        assert_eq!(map.row(0, 1), None);
        assert_eq!(map.group(0, 1), None);
        assert_eq!(map.row(0, 2), Some(1));
        assert_eq!(map.row(1, 0), None);
        assert_eq!(map.row(1, 1), Some(4));
        assert_eq!(map.row(1, 2), Some(5));
        assert_eq!(map.interval(4).unwrap().start, 100);
        assert_eq!(map.num_cols(), 8);
        assert!(map.is_consistent());
    }

    #[test]
    fn test_compressed_groups_are_offset_per_chromosome() {
        let handler = handler();
        let bad = BadIndices::new(100);
        let mut groups = ColumnGroups::default();
        groups.insert(0, vec![Some(0), Some(0), Some(1), Some(1), Some(2)]);
        groups.insert(1, vec![Some(0), None, Some(0)]);
        let map =
            BinIndexMap::build(handler.chromosomes(), handler.len(), 100, &bad, Some(&groups));

        assert_eq!(map.num_cols(), 4);
        assert_eq!(map.num_rows(), 7);
        assert_eq!(map.group(1, 2), Some(3));
        assert_eq!(map.row(1, 1), None);
        assert_eq!(map.col_range(1), 3..4);
        assert_eq!(map.column_weights(), vec![2, 2, 1, 2]);
        assert_eq!(map.column_chromosomes(), vec![Some(0), Some(0), Some(0), Some(1)]);
        assert!(map.is_consistent());
    }
}
