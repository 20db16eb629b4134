//! Result export
//!
//! Cluster assignments go back to genomic coordinates through the mapping's
//! row intervals and are written as one BED file per K. Matrices, weights,
//! assignments and score tables are dumped as `.npy` arrays.

use crate::cluster::SweepResult;
use crate::error::{Result, SubcompError};
use crate::genome::ChromosomeHandler;
use crate::mapping::{BinIndexMap, IGNORE};
use log::info;
use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use ndarray_npy::write_npy;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const PALETTE: [(u8, u8, u8); 10] = [
    (228, 26, 28),
    (55, 126, 184),
    (77, 175, 74),
    (152, 78, 163),
    (255, 127, 0),
    (255, 255, 51),
    (166, 86, 40),
    (247, 129, 191),
    (153, 153, 153),
    (0, 206, 209),
];

pub fn cluster_color(cluster: usize) -> (u8, u8, u8) {
    PALETTE[cluster % PALETTE.len()]
}

/// A run of consecutive bins with the same cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInterval {
    pub chrom: usize,
    pub start: u64,
    pub end: u64,
    pub cluster: usize,
}

/// Translate per-row assignments to genomic intervals. Adjacent rows on the
/// same chromosome with the same cluster and touching coordinates are merged;
/// unassigned rows are left out.
pub fn assignment_intervals(mapping: &BinIndexMap, assignments: &[Option<usize>]) -> Result<Vec<ClusterInterval>> {
    if assignments.len() != mapping.num_rows() {
        return Err(SubcompError::DimensionMismatch {
            stage: "result mapping",
            expected: mapping.num_rows(),
            found: assignments.len(),
        });
    }
    let mut intervals: Vec<ClusterInterval> = Vec::new();
    for (interval, cluster) in mapping.intervals().iter().zip(assignments) {
        let Some(cluster) = *cluster else { continue };
        match intervals.last_mut() {
            Some(last) if last.chrom == interval.chrom && last.cluster == cluster && last.end == interval.start => {
                last.end = interval.end;
            }
            _ => intervals.push(ClusterInterval {
                chrom: interval.chrom,
                start: interval.start,
                end: interval.end,
                cluster,
            }),
        }
    }
    Ok(intervals)
}

/// `<prefix>_<variant>_k<K>.bed`
pub fn bed_file_name(prefix: &str, variant: &str, k: usize) -> PathBuf {
    PathBuf::from(format!("{}_{}_k{}.bed", prefix, variant, k))
}

/// BED9 with a colour per cluster and `C<id>` as the name
pub fn write_bed(path: &Path, track: &str, handler: &ChromosomeHandler, intervals: &[ClusterInterval]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "track name=\"{}\" itemRgb=\"On\"", track)?;
    for iv in intervals {
        let (r, g, b) = cluster_color(iv.cluster);
        writeln!(
            writer,
            "{}\t{}\t{}\tC{}\t0\t.\t{}\t{}\t{},{},{}",
            handler.name(iv.chrom),
            iv.start,
            iv.end,
            iv.cluster,
            iv.start,
            iv.end,
            r,
            g,
            b
        )?;
    }
    writer.flush()
}

fn npy_error(path: &Path, e: impl std::fmt::Display) -> SubcompError {
    SubcompError::Io(io::Error::other(format!("Failed to write {:?}: {}", path, e)))
}

/// Row-major `f32` array of shape (rows, cols)
pub fn write_matrix_npy(path: &Path, matrix: &DMatrix<f32>) -> Result<()> {
    let array = Array2::from_shape_fn(matrix.shape(), |(i, j)| matrix[(i, j)]);
    write_npy(path, &array).map_err(|e| npy_error(path, e))
}

pub fn write_weights_npy(path: &Path, weights: &[i32]) -> Result<()> {
    let array = Array1::from_vec(weights.to_vec());
    write_npy(path, &array).map_err(|e| npy_error(path, e))
}

/// `i32` cluster per row, `-1` for unassigned rows
pub fn write_assignments_npy(path: &Path, assignments: &[Option<usize>]) -> Result<()> {
    let array: Array1<i32> = assignments
        .iter()
        .map(|a| a.map_or(IGNORE, |c| c as i32))
        .collect();
    write_npy(path, &array).map_err(|e| npy_error(path, e))
}

/// One row per K: `k, wcss, aic, bic` as `f64`
pub fn write_scores_npy(path: &Path, sweep: &SweepResult) -> Result<()> {
    let rows = sweep.results.len();
    let array = Array2::from_shape_fn((rows, 4), |(i, j)| {
        let r = &sweep.results[i];
        match j {
            0 => r.k as f64,
            1 => r.wcss,
            2 => r.aic,
            _ => r.bic,
        }
    });
    write_npy(path, &array).map_err(|e| npy_error(path, e))
}

pub fn write_scores_tsv(path: &Path, sweep: &SweepResult) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "k\twcss\taic\tbic\tattempts\tretries\tskipped")?;
    for r in &sweep.results {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.k, r.wcss, r.aic, r.bic, r.attempts, r.retries, r.skipped_attempts
        )?;
    }
    writer.flush()
}

/// Write the BED file and assignment vector of every K plus the score
/// tables. Returns the BED paths.
pub fn export_sweep(
    prefix: &str,
    variant: &str,
    handler: &ChromosomeHandler,
    mapping: &BinIndexMap,
    sweep: &SweepResult,
) -> Result<Vec<PathBuf>> {
    let mut beds = Vec::with_capacity(sweep.results.len());
    for result in &sweep.results {
        let intervals = assignment_intervals(mapping, &result.assignments)?;
        let bed = bed_file_name(prefix, variant, result.k);
        let track = format!("{} K={}", variant, result.k);
        write_bed(&bed, &track, handler, &intervals)?;
        write_assignments_npy(
            Path::new(&format!("{}_{}_k{}.assignments.npy", prefix, variant, result.k)),
            &result.assignments,
        )?;
        info!("Wrote {} intervals for K={} to {}", intervals.len(), result.k, bed.display());
        beds.push(bed);
    }
    write_scores_npy(Path::new(&format!("{}_{}_scores.npy", prefix, variant)), sweep)?;
    write_scores_tsv(Path::new(&format!("{}_{}_scores.tsv", prefix, variant)), sweep)?;
    Ok(beds)
}
