//! Column reorderer
//!
//! Optional compression of the column space: bins of one chromosome whose
//! observed/expected profiles correlate with a seed bin are merged into a
//! single column group. The grouping is a greedy single pass in scan order,
//! so a different scan order can produce different groups.

use crate::bad_index::BadIndices;
use crate::contacts::{ContactRecord, ContactSource, Normalization};
use crate::expected::oe_matrix;
use crate::genome::Chromosome;
use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Minimum Pearson correlation with the seed for a bin to join its group
pub const MIN_GROUP_CORRELATION: f64 = 0.5;

/// Local column group of every bin, per chromosome. `None` marks a bin that
/// belongs to no group (excluded).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnGroups {
    per_chrom: FxHashMap<usize, Vec<Option<usize>>>,
}

impl ColumnGroups {
    pub fn insert(&mut self, chrom: usize, groups: Vec<Option<usize>>) {
        self.per_chrom.insert(chrom, groups);
    }

    pub fn for_chromosome(&self, chrom: usize) -> Option<&[Option<usize>]> {
        self.per_chrom.get(&chrom).map(|g| g.as_slice())
    }

    /// Number of local groups in `local` (largest id + 1)
    pub fn num_groups(local: &[Option<usize>]) -> usize {
        local.iter().flatten().max().map_or(0, |&g| g + 1)
    }
}

/// Pearson correlation over the coordinates where both profiles are finite.
/// `None` with fewer than two such coordinates or a constant profile.
pub fn pearson(a: &[f32], b: &[f32]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x as f64, y as f64))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Greedy grouping of the bins whose profiles are the columns of `profiles`.
///
/// Bins are visited in `order`. The first unassigned, non-excluded bin seeds
/// a group; every later unassigned bin (in `order`) correlating with the seed
/// at `MIN_GROUP_CORRELATION` or more joins it until the group holds
/// `group_size` bins. Group ids are handed out in seeding order.
pub fn assign_groups_in_order(
    profiles: &DMatrix<f32>,
    excluded: &[bool],
    order: &[usize],
    group_size: usize,
) -> Vec<Option<usize>> {
    let n = profiles.ncols();
    let group_size = group_size.max(1);
    let mut groups: Vec<Option<usize>> = vec![None; n];
    let mut assigned: Vec<bool> = (0..n).map(|i| excluded.get(i).copied().unwrap_or(true)).collect();
    let mut next_group = 0;
    let rows = profiles.nrows();
    let column = |i: usize| &profiles.as_slice()[i * rows..(i + 1) * rows];

    for (pos, &seed) in order.iter().enumerate() {
        if seed >= n || assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        groups[seed] = Some(next_group);
        let mut size = 1;

        let seed_profile = column(seed);
        for &candidate in &order[pos + 1..] {
            if size >= group_size {
                break;
            }
            if candidate >= n || assigned[candidate] {
                continue;
            }
            let corr = pearson(seed_profile, column(candidate));
            if corr.is_some_and(|c| c >= MIN_GROUP_CORRELATION) {
                assigned[candidate] = true;
                groups[candidate] = Some(next_group);
                size += 1;
            }
        }
        next_group += 1;
    }
    groups
}

/// Groups in genomic order
pub fn assign_groups(profiles: &DMatrix<f32>, excluded: &[bool], group_size: usize) -> Vec<Option<usize>> {
    let order: Vec<usize> = (0..profiles.ncols()).collect();
    assign_groups_in_order(profiles, excluded, &order, group_size)
}

pub struct ColumnReorderer<'a, S: ContactSource> {
    source: &'a S,
    bad: &'a BadIndices,
    resolution: u32,
    norm: &'a Normalization,
    group_size: usize,
}

impl<'a, S: ContactSource> ColumnReorderer<'a, S> {
    pub fn new(
        source: &'a S,
        bad: &'a BadIndices,
        resolution: u32,
        norm: &'a Normalization,
        group_size: usize,
    ) -> Self {
        Self {
            source,
            bad,
            resolution,
            norm,
            group_size,
        }
    }

    /// Compute column groups for every chromosome from its intra O/E matrix.
    /// A chromosome without intra data keeps one group per valid bin.
    pub fn compute(&self, chromosomes: &[Chromosome]) -> ColumnGroups {
        let per_chrom: Vec<(&Chromosome, Vec<Option<usize>>)> = chromosomes
            .par_iter()
            .map(|chrom| {
                let n = chrom.num_bins(self.resolution);
                let excluded: Vec<bool> = (0..n).map(|bin| self.bad.contains(chrom.index, bin)).collect();
                let records: Vec<ContactRecord> = match self.source.records(chrom, chrom, self.resolution, self.norm) {
                    Some(records) => records.collect(),
                    None => {
                        debug!("No intra contacts for {}, columns left uncompressed", chrom.name);
                        Vec::new()
                    }
                };
                let groups = if records.is_empty() {
                    let mut next = 0;
                    excluded
                        .iter()
                        .map(|&e| {
                            (!e).then(|| {
                                next += 1;
                                next - 1
                            })
                        })
                        .collect()
                } else {
                    let oe = oe_matrix(&records, n, &excluded);
                    assign_groups(&oe, &excluded, self.group_size)
                };
                (chrom, groups)
            })
            .collect();

        let mut result = ColumnGroups::default();
        for (chrom, groups) in per_chrom {
            info!(
                "Compressed {} valid bins of {} into {} columns",
                groups.iter().flatten().count(),
                chrom.name,
                ColumnGroups::num_groups(&groups)
            );
            result.insert(chrom.index, groups);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::ChromosomeHandler;
    use crate::contacts::InMemoryContacts;

    // Columns: x, x + y, y with x and y uncorrelated, so the middle profile
    // correlates at ~0.707 with both neighbours while they don't correlate
    fn chain_profiles() -> DMatrix<f32> {
        let x = [1.0, -1.0, 1.0, -1.0, 0.0, 0.0];
        let y = [1.0, 1.0, -1.0, -1.0, 0.0, 0.0];
        let mut data = Vec::new();
        data.extend_from_slice(&x);
        data.extend(x.iter().zip(&y).map(|(a, b)| a + b));
        data.extend_from_slice(&y);
        DMatrix::from_column_slice(6, 3, &data)
    }

    #[test]
    fn test_pearson() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
        // Only the first two coordinates are comparable
        assert!(pearson(&[1.0, 2.0, f32::NAN], &[1.0, 3.0, 5.0]).is_some());
        assert_eq!(pearson(&[1.0, f32::NAN], &[1.0, 3.0]), None);
    }

    #[test]
    fn test_scan_order_changes_groups() {
        let profiles = chain_profiles();
        let excluded = vec![false; 3];

        let forward = assign_groups(&profiles, &excluded, 4);
        assert_eq!(forward, vec![Some(0), Some(0), Some(1)]);

        let reverse = assign_groups_in_order(&profiles, &excluded, &[2, 1, 0], 4);
        assert_eq!(reverse, vec![Some(1), Some(0), Some(0)]);

        // The middle bin follows whichever neighbour seeded first
        assert_eq!(forward[1], forward[0]);
        assert_eq!(reverse[1], reverse[2]);
    }

    #[test]
    fn test_group_size_cap_and_excluded_bins() {
        let data: Vec<f32> = (0..4).flat_map(|_| [1.0, 2.0, 3.0, 4.0]).collect();
        let profiles = DMatrix::from_column_slice(4, 4, &data);

        let groups = assign_groups(&profiles, &[false; 4], 2);
        assert_eq!(groups, vec![Some(0), Some(0), Some(1), Some(1)]);

        let groups = assign_groups(&profiles, &[false, true, false, false], 2);
        assert_eq!(groups, vec![Some(0), None, Some(0), Some(1)]);
        assert_eq!(ColumnGroups::num_groups(&groups), 2);
    }

    #[test]
    fn test_reorderer_without_intra_data() {
        let handler = ChromosomeHandler::new(vec![("chr1", 300)]);
        let contacts = InMemoryContacts::new(handler.clone(), 100);
        let mut bad = BadIndices::new(100);
        bad.insert(0, 1);
        let norm = Normalization::None;
        let groups = ColumnReorderer::new(&contacts, &bad, 100, &norm, 3).compute(handler.chromosomes());
        assert_eq!(groups.for_chromosome(0).unwrap(), &[Some(0), None, Some(1)]);
    }
}
