//! Distance-decay statistics of intra-chromosomal contacts

use crate::contacts::ContactRecord;
use crate::stats::RunningStats;
use nalgebra::DMatrix;
use std::ops::Range;

/// Running mean/variance of `ln(1 + count)` per genomic distance
/// (`|binX - binY|`), over records with a positive count whose bins both
/// pass `keep`
pub fn log_distance_stats<'r, I, F>(records: I, num_bins: usize, keep: F) -> Vec<RunningStats>
where
    I: IntoIterator<Item = &'r ContactRecord>,
    F: Fn(usize) -> bool,
{
    let mut stats = vec![RunningStats::new(); num_bins.max(1)];
    for r in records {
        if r.count <= 0.0 || !r.count.is_finite() || !keep(r.bin_x) || !keep(r.bin_y) {
            continue;
        }
        let d = r.bin_x.abs_diff(r.bin_y);
        if d < stats.len() {
            stats[d].push((1.0 + r.count as f64).ln());
        }
    }
    stats
}

/// The contiguous run of distances, starting at the first one with more
/// than `min_observations` observations, over which every distance keeps
/// more than `min_observations`
pub fn valid_distance_range(stats: &[RunningStats], min_observations: usize) -> Option<Range<usize>> {
    let start = stats.iter().position(|s| s.count() > min_observations)?;
    let len = stats[start..]
        .iter()
        .take_while(|s| s.count() > min_observations)
        .count();
    Some(start..start + len)
}

/// Mean contact value per distance over all bin pairs at that distance
/// (zeros included), the usual expected vector
pub fn expected_by_distance(records: &[ContactRecord], num_bins: usize, excluded: &[bool]) -> Vec<f64> {
    let mut sums = vec![0.0; num_bins];
    for r in records {
        if r.bin_x >= num_bins || r.bin_y >= num_bins || excluded[r.bin_x] || excluded[r.bin_y] {
            continue;
        }
        if r.count.is_finite() {
            sums[r.bin_x.abs_diff(r.bin_y)] += r.count as f64;
        }
    }

    // Valid pairs at distance d: i and i + d both kept
    let mut pairs = vec![0usize; num_bins];
    for i in (0..num_bins).filter(|&i| !excluded[i]) {
        for (d, slot) in pairs.iter_mut().enumerate().take(num_bins - i) {
            if !excluded[i + d] {
                *slot += 1;
            }
        }
    }

    sums.iter()
        .zip(&pairs)
        .map(|(&s, &p)| if p > 0 { s / p as f64 } else { 0.0 })
        .collect()
}

/// Dense symmetric observed/expected matrix. Excluded bins and distances
/// with a zero expectation are NaN.
pub fn oe_matrix(records: &[ContactRecord], num_bins: usize, excluded: &[bool]) -> DMatrix<f32> {
    let expected = expected_by_distance(records, num_bins, excluded);
    let mut oe = DMatrix::from_fn(num_bins, num_bins, |i, j| {
        if excluded[i] || excluded[j] || expected[i.abs_diff(j)] <= 0.0 {
            f32::NAN
        } else {
            0.0
        }
    });
    for r in records {
        if r.bin_x >= num_bins || r.bin_y >= num_bins {
            continue;
        }
        let e = expected[r.bin_x.abs_diff(r.bin_y)];
        if excluded[r.bin_x] || excluded[r.bin_y] || e <= 0.0 || !r.count.is_finite() {
            continue;
        }
        let value = (r.count as f64 / e) as f32;
        oe[(r.bin_x, r.bin_y)] += value;
        if r.bin_x != r.bin_y {
            oe[(r.bin_y, r.bin_x)] += value;
        }
    }
    oe
}
