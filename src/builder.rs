//! Matrix builder
//!
//! Assembles the dense genome-wide matrix: one row per valid bin, one column
//! per column group. Inter-chromosomal contacts fill the off-diagonal blocks
//! symmetrically; the intra blocks of that matrix are NaN. When intra scoring
//! is enabled, a companion matrix of the same shape holds observed/expected
//! z-scores in the intra blocks and NaN elsewhere.

use crate::bad_index::BadIndices;
use crate::config::{IntraMode, PipelineConfig};
use crate::contacts::{ContactRecord, ContactSource};
use crate::error::{Result, SubcompError};
use crate::expected::{log_distance_stats, valid_distance_range};
use crate::genome::Chromosome;
use crate::mapping::BinIndexMap;
use crate::reorder::ColumnGroups;
use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::ops::Range;

/// Chromosome pairs (e.g. known translocations) whose inter cells are NaN
/// regardless of the contacts the source holds for them
#[derive(Debug, Clone, Default)]
pub struct IgnoredPairs(FxHashSet<(usize, usize)>);

impl IgnoredPairs {
    pub fn insert(&mut self, a: usize, b: usize) {
        self.0.insert((a.min(b), a.max(b)));
    }

    pub fn contains(&self, a: usize, b: usize) -> bool {
        self.0.contains(&(a.min(b), a.max(b)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Output of the builder: inter matrix, optional intra companion, column
/// weights (bins per column group) and the mapping that produced them
#[derive(Debug, Clone)]
pub struct BuiltMatrix {
    pub matrix: DMatrix<f32>,
    pub intra: Option<DMatrix<f32>>,
    pub weights: Vec<i32>,
    pub mapping: BinIndexMap,
}

enum InterBlock {
    Ignored,
    Absent,
    /// Rows of `a` by columns of `b`, and rows of `b` by columns of `a`
    Filled(DMatrix<f32>, DMatrix<f32>),
}

enum PairBlock<'c> {
    Intra {
        chrom: &'c Chromosome,
        zscores: Option<DMatrix<f32>>,
    },
    Inter {
        a: &'c Chromosome,
        b: &'c Chromosome,
        block: InterBlock,
    },
}

pub struct MatrixBuilder<'a, S: ContactSource> {
    source: &'a S,
    config: &'a PipelineConfig,
    bad: &'a BadIndices,
    groups: Option<&'a ColumnGroups>,
    ignored: Option<&'a IgnoredPairs>,
}

impl<'a, S: ContactSource> MatrixBuilder<'a, S> {
    pub fn new(source: &'a S, config: &'a PipelineConfig, bad: &'a BadIndices) -> Self {
        Self {
            source,
            config,
            bad,
            groups: None,
            ignored: None,
        }
    }

    pub fn with_groups(mut self, groups: &'a ColumnGroups) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_ignored_pairs(mut self, ignored: &'a IgnoredPairs) -> Self {
        self.ignored = Some(ignored);
        self
    }

    /// Build the matrix over every unordered pair of `chromosomes`, self
    /// pairs included. Pair blocks are computed in parallel and written into
    /// the matrix afterwards; each block owns a disjoint region.
    pub fn build(&self, chromosomes: &[Chromosome]) -> Result<BuiltMatrix> {
        let resolution = self.config.resolution;
        if resolution != self.bad.resolution() {
            return Err(SubcompError::InvalidInput(format!(
                "bad indices were computed at {} bp, matrix requested at {} bp",
                self.bad.resolution(),
                resolution
            )));
        }

        let mapping = BinIndexMap::build(
            chromosomes,
            self.source.chromosomes().len(),
            resolution,
            self.bad,
            self.groups,
        );
        let (num_rows, num_cols) = (mapping.num_rows(), mapping.num_cols());
        if num_rows == 0 || num_cols == 0 {
            return Err(SubcompError::EmptyMatrix {
                stage: "matrix builder",
            });
        }
        let weights = mapping.column_weights();

        let mut pairs = Vec::new();
        for (i, a) in chromosomes.iter().enumerate() {
            for b in &chromosomes[i..] {
                pairs.push(if a.index <= b.index { (a, b) } else { (b, a) });
            }
        }
        info!(
            "Building {} x {} matrix over {} chromosome pairs",
            num_rows,
            num_cols,
            pairs.len()
        );

        let blocks: Vec<PairBlock> = pairs
            .par_iter()
            .map(|&(a, b)| {
                if a.index == b.index {
                    let zscores = match self.config.build.intra_mode {
                        IntraMode::OeZScore => self.intra_zscores(a, &mapping, &weights),
                        IntraMode::Skip => None,
                    };
                    PairBlock::Intra { chrom: a, zscores }
                } else {
                    PairBlock::Inter {
                        a,
                        b,
                        block: self.inter_block(a, b, &mapping),
                    }
                }
            })
            .collect();

        let mut matrix = DMatrix::<f32>::zeros(num_rows, num_cols);
        let mut intra = (self.config.build.intra_mode == IntraMode::OeZScore)
            .then(|| DMatrix::from_element(num_rows, num_cols, f32::NAN));
        let (mut absent, mut ignored) = (0usize, 0usize);

        for block in blocks {
            match block {
                PairBlock::Intra { chrom, zscores } => {
                    let rows = mapping.row_range(chrom.index);
                    let cols = mapping.col_range(chrom.index);
                    fill_region(&mut matrix, &rows, &cols, f32::NAN);
                    if let (Some(intra), Some(z)) = (intra.as_mut(), zscores) {
                        copy_region(intra, rows.start, cols.start, &z);
                    }
                }
                PairBlock::Inter { a, b, block } => {
                    let (rows_a, cols_a) = (mapping.row_range(a.index), mapping.col_range(a.index));
                    let (rows_b, cols_b) = (mapping.row_range(b.index), mapping.col_range(b.index));
                    match block {
                        InterBlock::Ignored => {
                            fill_region(&mut matrix, &rows_a, &cols_b, f32::NAN);
                            fill_region(&mut matrix, &rows_b, &cols_a, f32::NAN);
                            ignored += 1;
                        }
                        InterBlock::Absent => {
                            debug!("No contacts between {} and {}", a.name, b.name);
                            absent += 1;
                        }
                        InterBlock::Filled(ab, ba) => {
                            copy_region(&mut matrix, rows_a.start, cols_b.start, &ab);
                            copy_region(&mut matrix, rows_b.start, cols_a.start, &ba);
                        }
                    }
                }
            }
        }

        if absent > 0 {
            info!("{} chromosome pairs without contacts were left at zero", absent);
        }
        if ignored > 0 {
            info!("{} ignored chromosome pairs were set to NaN", ignored);
        }

        Ok(BuiltMatrix {
            matrix,
            intra,
            weights,
            mapping,
        })
    }

    fn inter_block(&self, a: &Chromosome, b: &Chromosome, mapping: &BinIndexMap) -> InterBlock {
        if self.ignored.is_some_and(|ignored| ignored.contains(a.index, b.index)) {
            return InterBlock::Ignored;
        }
        let Some(records) = self
            .source
            .records(a, b, self.config.resolution, &self.config.inter_norm)
        else {
            return InterBlock::Absent;
        };

        let (rows_a, cols_a) = (mapping.row_range(a.index), mapping.col_range(a.index));
        let (rows_b, cols_b) = (mapping.row_range(b.index), mapping.col_range(b.index));
        let mut ab = DMatrix::<f32>::zeros(rows_a.len(), cols_b.len());
        let mut ba = DMatrix::<f32>::zeros(rows_b.len(), cols_a.len());

        for r in records.filter(|r| r.count > 0.0 && r.count.is_finite()) {
            if let (Some(row), Some(col)) = (mapping.row(a.index, r.bin_x), mapping.group(b.index, r.bin_y)) {
                ab[(row - rows_a.start, col - cols_b.start)] += r.count;
            }
            if let (Some(row), Some(col)) = (mapping.row(b.index, r.bin_y), mapping.group(a.index, r.bin_x)) {
                ba[(row - rows_b.start, col - cols_a.start)] += r.count;
            }
        }
        InterBlock::Filled(ab, ba)
    }

    /// Mean O/E z-score per (row, column group) cell of `chrom`'s intra block
    fn intra_zscores(
        &self,
        chrom: &Chromosome,
        mapping: &BinIndexMap,
        weights: &[i32],
    ) -> Option<DMatrix<f32>> {
        let build = &self.config.build;
        let rows = mapping.row_range(chrom.index);
        let cols = mapping.col_range(chrom.index);
        if rows.is_empty() || cols.is_empty() {
            return None;
        }
        let records: Vec<ContactRecord> = self
            .source
            .records(chrom, chrom, self.config.resolution, &self.config.intra_norm)?
            .collect();

        let n = chrom.num_bins(self.config.resolution);
        let stats = log_distance_stats(&records, n, |bin| mapping.row(chrom.index, bin).is_some());
        let Some(valid) = valid_distance_range(&stats, build.min_distance_observations) else {
            debug!(
                "No distance on {} has more than {} observations",
                chrom.name, build.min_distance_observations
            );
            return None;
        };

        let mut sums = DMatrix::<f32>::zeros(rows.len(), cols.len());
        let mut counts = DMatrix::<u32>::zeros(rows.len(), cols.len());
        for r in records.iter().filter(|r| r.count > 0.0 && r.count.is_finite()) {
            let d = r.bin_x.abs_diff(r.bin_y);
            if !valid.contains(&d) {
                continue;
            }
            let sd = stats[d].std_dev();
            if sd <= 0.0 {
                continue;
            }
            let z = ((1.0 + r.count as f64).ln() - stats[d].mean()) / sd;
            if !z.is_finite() || z.abs() >= build.oe_z_cutoff {
                continue;
            }
            let x = (mapping.row(chrom.index, r.bin_x), mapping.group(chrom.index, r.bin_x));
            let y = (mapping.row(chrom.index, r.bin_y), mapping.group(chrom.index, r.bin_y));
            let ((Some(row_x), Some(group_x)), (Some(row_y), Some(group_y))) = (x, y) else {
                continue;
            };
            let cell = (row_x - rows.start, group_y - cols.start);
            sums[cell] += z as f32;
            counts[cell] += 1;
            if r.bin_x != r.bin_y {
                let cell = (row_y - rows.start, group_x - cols.start);
                sums[cell] += z as f32;
                counts[cell] += 1;
            }
        }

        Some(DMatrix::from_fn(rows.len(), cols.len(), |i, j| {
            // A column of w bins can't collect more than w contributions per row
            let weight = weights[cols.start + j].max(1) as usize;
            let needed = build.min_cell_contributions.min(weight).max(1);
            if counts[(i, j)] as usize >= needed {
                sums[(i, j)] / counts[(i, j)] as f32
            } else {
                f32::NAN
            }
        }))
    }
}

fn fill_region(matrix: &mut DMatrix<f32>, rows: &Range<usize>, cols: &Range<usize>, value: f32) {
    if rows.is_empty() || cols.is_empty() {
        return;
    }
    matrix
        .view_mut((rows.start, cols.start), (rows.len(), cols.len()))
        .fill(value);
}

fn copy_region(matrix: &mut DMatrix<f32>, row: usize, col: usize, block: &DMatrix<f32>) {
    if block.is_empty() {
        return;
    }
    matrix
        .view_mut((row, col), (block.nrows(), block.ncols()))
        .copy_from(block);
}
