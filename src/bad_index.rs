//! Bad-index finder
//!
//! Flags bins with anomalous coverage before anything is normalized or
//! clustered. Coverage comes either from counting non-zero contact entries
//! per bin (separately for intra and inter contacts) or from a
//! normalization vector. A bin is bad when its coverage falls below a floor
//! or the z-score of its log coverage leaves the configured window.

use crate::config::{BadIndexConfig, CoverageMode};
use crate::contacts::{ContactSource, Normalization};
use crate::genome::Chromosome;
use crate::stats::finite_mean_std;
use log::{debug, info};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Excluded bins per chromosome at one resolution. Shared as an
/// `Arc<BadIndices>` once computed and never modified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadIndices {
    resolution: u32,
    per_chrom: FxHashMap<usize, FxHashSet<usize>>,
}

impl BadIndices {
    pub fn new(resolution: u32) -> Self {
        Self {
            resolution,
            per_chrom: FxHashMap::default(),
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn insert(&mut self, chrom: usize, bin: usize) {
        self.per_chrom.entry(chrom).or_default().insert(bin);
    }

    pub fn contains(&self, chrom: usize, bin: usize) -> bool {
        self.per_chrom
            .get(&chrom)
            .is_some_and(|bins| bins.contains(&bin))
    }

    /// Excluded bins of `chrom` in ascending order
    pub fn bins(&self, chrom: usize) -> Vec<usize> {
        let mut bins: Vec<usize> = self
            .per_chrom
            .get(&chrom)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default();
        bins.sort_unstable();
        bins
    }

    /// Bins of `chrom` that survive exclusion; empty for a fully excluded chromosome
    pub fn valid_bins(&self, chrom: &Chromosome) -> Vec<usize> {
        (0..chrom.num_bins(self.resolution))
            .filter(|&bin| !self.contains(chrom.index, bin))
            .collect()
    }

    pub fn num_excluded(&self, chrom: usize) -> usize {
        self.per_chrom.get(&chrom).map_or(0, |b| b.len())
    }

    pub fn total(&self) -> usize {
        self.per_chrom.values().map(|b| b.len()).sum()
    }
}

/// Z-scores of log coverage over the bins above `floor`; NaN elsewhere.
/// A chromosome with constant coverage gets all-zero scores.
fn log_zscores(coverage: &[f64], floor: f64) -> Vec<f64> {
    let logs: Vec<f64> = coverage
        .iter()
        .map(|&c| if c > floor { c.ln() } else { f64::NAN })
        .collect();
    let Some((mean, std)) = finite_mean_std(logs.iter().copied()) else {
        return vec![f64::NAN; coverage.len()];
    };
    logs.iter()
        .map(|&l| {
            if !l.is_finite() {
                f64::NAN
            } else if std > 0.0 {
                (l - mean) / std
            } else {
                0.0
            }
        })
        .collect()
}

/// Bins to exclude given intra coverage and, when several chromosomes are
/// analysed, inter coverage.
pub fn flag_bad_bins(
    intra: &[f64],
    inter: Option<&[f64]>,
    config: &BadIndexConfig,
) -> FxHashSet<usize> {
    let floor = config.coverage_floor;
    let intra_z = log_zscores(intra, floor);
    let inter_z = inter.map(|cov| log_zscores(cov, floor));

    let mut bad = FxHashSet::default();
    for bin in 0..intra.len() {
        let intra_cov = if intra[bin].is_finite() { intra[bin] } else { 0.0 };
        let mut is_bad = intra_cov < floor || intra_z[bin] < config.intra_lower_z;
        if let (Some(cov), Some(z)) = (inter, inter_z.as_ref()) {
            let inter_cov = cov.get(bin).copied().filter(|c| c.is_finite()).unwrap_or(0.0);
            is_bad |= inter_cov < floor
                || z[bin] < config.inter_lower_z
                || z[bin] > config.inter_upper_z;
        }
        if is_bad {
            bad.insert(bin);
        }
    }
    bad
}

pub struct BadIndexFinder<'a, S: ContactSource> {
    source: &'a S,
    config: &'a BadIndexConfig,
    resolution: u32,
    norm: &'a Normalization,
}

impl<'a, S: ContactSource> BadIndexFinder<'a, S> {
    /// `norm` is the vector consulted in `CoverageMode::NormVector`
    pub fn new(
        source: &'a S,
        config: &'a BadIndexConfig,
        resolution: u32,
        norm: &'a Normalization,
    ) -> Self {
        Self {
            source,
            config,
            resolution,
            norm,
        }
    }

    /// Compute the exclusion set of every chromosome in `chromosomes`.
    /// Chromosomes are processed in parallel; each one only reads its own pairs.
    pub fn find(&self, chromosomes: &[Chromosome]) -> Arc<BadIndices> {
        let per_chrom: Vec<(&Chromosome, FxHashSet<usize>)> = chromosomes
            .par_iter()
            .map(|chrom| {
                let bad = match self.config.coverage {
                    CoverageMode::NonZeroCounts => {
                        let (intra, inter) = self.count_coverage(chrom, chromosomes);
                        let inter = (chromosomes.len() > 1).then_some(inter);
                        flag_bad_bins(&intra, inter.as_deref(), self.config)
                    }
                    CoverageMode::NormVector => {
                        let n = chrom.num_bins(self.resolution);
                        let mut coverage = vec![0.0; n];
                        match self.source.norm_vector(chrom, self.resolution, self.norm) {
                            Some(vector) => {
                                for (c, v) in coverage.iter_mut().zip(vector) {
                                    *c = v;
                                }
                            }
                            None => {
                                debug!("No {} vector for {}, excluding all bins", self.norm, chrom.name)
                            }
                        }
                        flag_bad_bins(&coverage, None, self.config)
                    }
                };
                (chrom, bad)
            })
            .collect();

        let mut indices = BadIndices::new(self.resolution);
        for (chrom, bad) in per_chrom {
            info!(
                "Excluding {} of {} bins on {}",
                bad.len(),
                chrom.num_bins(self.resolution),
                chrom.name
            );
            if !bad.is_empty() {
                indices.per_chrom.insert(chrom.index, bad);
            }
        }
        info!("Excluded {} bins in total", indices.total());
        Arc::new(indices)
    }

    /// Non-zero entry counts per bin of `chrom`: intra contacts, then contacts
    /// with every other chromosome in `chromosomes`
    fn count_coverage(&self, chrom: &Chromosome, chromosomes: &[Chromosome]) -> (Vec<f64>, Vec<f64>) {
        let n = chrom.num_bins(self.resolution);
        let mut intra = vec![0.0; n];
        let mut inter = vec![0.0; n];

        if let Some(records) = self.source.records(chrom, chrom, self.resolution, &Normalization::None) {
            for r in records.filter(|r| r.count > 0.0) {
                if r.bin_x < n {
                    intra[r.bin_x] += 1.0;
                }
                if r.bin_x != r.bin_y && r.bin_y < n {
                    intra[r.bin_y] += 1.0;
                }
            }
        }

        for other in chromosomes.iter().filter(|c| c.index != chrom.index) {
            let chrom_is_first = chrom.index < other.index;
            let (a, b) = if chrom_is_first { (chrom, other) } else { (other, chrom) };
            let Some(records) = self.source.records(a, b, self.resolution, &Normalization::None) else {
                continue;
            };
            for r in records.filter(|r| r.count > 0.0) {
                let bin = if chrom_is_first { r.bin_x } else { r.bin_y };
                if bin < n {
                    inter[bin] += 1.0;
                }
            }
        }
        (intra, inter)
    }
}
