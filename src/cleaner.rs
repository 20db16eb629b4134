//! Matrix cleaner
//!
//! Turns the assembled matrix into the clustering input. Steps run in a fixed
//! order and each one can be switched off in [`CleanConfig`]:
//!
//! 1. divide every column by its weight
//! 2. balance the matrix (bipartite rows/columns)
//! 3. `ln(x + pseudocount)`
//! 4. global outlier cap (values beyond `cap` standard deviations become NaN)
//! 5. row or column z-scores clamped to `±zscore_clamp`
//! 6. re-expansion with `exp`
//! 7. intra matrix merged into the NaN cells or appended as extra columns
//! 8. columns, then rows, whose NaN fraction is above the threshold are dropped
//!
//! NaN fractions only count cells that can hold data for that row: the
//! inter matrix's own-chromosome block (unless intra values were merged into
//! it) and the other chromosomes' blocks of appended intra columns are NaN by
//! construction and are left out.

use crate::balance::{Balancer, Bipartite};
use crate::builder::BuiltMatrix;
use crate::config::{BalanceConfig, CleanConfig, IntraInclusion, ZScoreAxis};
use crate::error::{Result, SubcompError};
use crate::mapping::BinIndexMap;
use crate::stats::finite_mean_std;
use log::{debug, info, warn};
use nalgebra::DMatrix;

/// Clustering-ready matrix with the weights and mapping of its surviving
/// rows and columns
#[derive(Debug, Clone)]
pub struct CleanedMatrix {
    pub matrix: DMatrix<f32>,
    pub weights: Vec<i32>,
    pub mapping: BinIndexMap,
    /// Source column of each remaining column; appended intra columns are
    /// numbered after the inter ones
    pub columns: Vec<usize>,
}

/// Where a column came from
#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnOrigin {
    Inter(Option<usize>),
    Intra(Option<usize>),
}

impl ColumnOrigin {
    fn informative(&self, row_chrom: usize, merged: bool) -> bool {
        match *self {
            ColumnOrigin::Inter(Some(chrom)) => chrom != row_chrom || merged,
            ColumnOrigin::Intra(Some(chrom)) => chrom == row_chrom,
            _ => true,
        }
    }
}

pub struct MatrixCleaner<'a> {
    config: &'a CleanConfig,
    balance: &'a BalanceConfig,
}

impl<'a> MatrixCleaner<'a> {
    pub fn new(config: &'a CleanConfig, balance: &'a BalanceConfig) -> Self {
        Self { config, balance }
    }

    pub fn clean(&self, built: BuiltMatrix) -> Result<CleanedMatrix> {
        let BuiltMatrix {
            mut matrix,
            intra,
            weights,
            mut mapping,
        } = built;
        let config = self.config;

        if matrix.nrows() != mapping.num_rows() {
            return Err(SubcompError::DimensionMismatch {
                stage: "matrix cleaner (rows vs mapping)",
                expected: mapping.num_rows(),
                found: matrix.nrows(),
            });
        }
        if weights.len() != matrix.ncols() {
            return Err(SubcompError::DimensionMismatch {
                stage: "matrix cleaner (weights)",
                expected: matrix.ncols(),
                found: weights.len(),
            });
        }
        if matrix.is_empty() {
            return Err(SubcompError::EmptyMatrix {
                stage: "matrix cleaner",
            });
        }

        if config.divide_by_weights {
            divide_by_weights(&mut matrix, &weights);
        }
        if config.balance {
            self.balance_matrix(&mut matrix)?;
        }
        if config.log_transform {
            log_transform(&mut matrix, config.pseudocount);
        }
        if let Some(cap) = config.outlier_cap {
            let capped = cap_outliers(&mut matrix, cap);
            info!("Set {} outlier values beyond {} standard deviations to NaN", capped, cap);
        }
        zscore(&mut matrix, config.zscore_axis, config.zscore_clamp);
        if config.expand_after_zscore {
            matrix.apply(|x| *x = x.exp());
        }

        let owners = mapping.column_chromosomes();
        let mut origins: Vec<ColumnOrigin> = owners.iter().map(|&c| ColumnOrigin::Inter(c)).collect();
        let mut weights = weights;
        let mut merged = false;
        match (config.intra_inclusion, intra) {
            (IntraInclusion::None, _) => {}
            (_, None) => {
                return Err(SubcompError::InvalidInput(
                    "intra inclusion requested but no intra matrix was built".to_string(),
                ))
            }
            (IntraInclusion::Merge, Some(intra)) => {
                if intra.shape() != matrix.shape() {
                    return Err(SubcompError::DimensionMismatch {
                        stage: "intra merge",
                        expected: matrix.ncols(),
                        found: intra.ncols(),
                    });
                }
                let mut filled = 0usize;
                for (cell, &z) in matrix.iter_mut().zip(intra.iter()) {
                    if cell.is_nan() && z.is_finite() {
                        *cell = z;
                        filled += 1;
                    }
                }
                merged = true;
                info!("Merged {} intra values into the matrix", filled);
            }
            (IntraInclusion::Append, Some(intra)) => {
                if intra.nrows() != matrix.nrows() {
                    return Err(SubcompError::DimensionMismatch {
                        stage: "intra append",
                        expected: matrix.nrows(),
                        found: intra.nrows(),
                    });
                }
                let cols = matrix.ncols();
                if intra.ncols() != weights.len() {
                    return Err(SubcompError::DimensionMismatch {
                        stage: "intra append (weights)",
                        expected: weights.len(),
                        found: intra.ncols(),
                    });
                }
                matrix = DMatrix::from_fn(matrix.nrows(), cols + intra.ncols(), |i, j| {
                    if j < cols {
                        matrix[(i, j)]
                    } else {
                        intra[(i, j - cols)]
                    }
                });
                weights.extend_from_within(..);
                origins.extend(owners.iter().map(|&c| ColumnOrigin::Intra(c)));
                info!("Appended {} intra columns", cols);
            }
        }

        let row_chroms: Vec<usize> = mapping.intervals().iter().map(|iv| iv.chrom).collect();
        let informative = |i: usize, origin: &ColumnOrigin| origin.informative(row_chroms[i], merged);
        let mut columns: Vec<usize> = (0..matrix.ncols()).collect();

        if let Some(threshold) = config.column_nan_threshold {
            let keep: Vec<usize> = (0..matrix.ncols())
                .filter(|&j| {
                    let cells = (0..matrix.nrows()).filter(|&i| informative(i, &origins[j]));
                    nan_fraction(cells.map(|i| matrix[(i, j)])) <= threshold
                })
                .collect();
            let removed = matrix.ncols() - keep.len();
            if removed > 0 {
                matrix = matrix.select_columns(keep.iter());
                weights = keep.iter().map(|&j| weights[j]).collect();
                origins = keep.iter().map(|&j| origins[j]).collect();
                columns = keep;
            }
            info!("Removed {} columns with more than {} NaN", removed, threshold);
        }

        if let Some(threshold) = config.row_nan_threshold {
            let drop: Vec<usize> = (0..matrix.nrows())
                .filter(|&i| {
                    let cells = (0..matrix.ncols()).filter(|&j| informative(i, &origins[j]));
                    nan_fraction(cells.map(|j| matrix[(i, j)])) > threshold
                })
                .collect();
            if !drop.is_empty() {
                let mut keep = vec![true; matrix.nrows()];
                drop.iter().for_each(|&i| keep[i] = false);
                let kept: Vec<usize> = (0..matrix.nrows()).filter(|&i| keep[i]).collect();
                matrix = matrix.select_rows(kept.iter());
                mapping.remove_rows(&drop);
            }
            info!("Removed {} rows with more than {} NaN", drop.len(), threshold);
        }

        if matrix.is_empty() {
            return Err(SubcompError::EmptyMatrix {
                stage: "matrix cleaner",
            });
        }
        debug!("Cleaned matrix is {} x {}", matrix.nrows(), matrix.ncols());

        Ok(CleanedMatrix {
            matrix,
            weights,
            mapping,
            columns,
        })
    }

    fn balance_matrix(&self, matrix: &mut DMatrix<f32>) -> Result<()> {
        let (rows, cols) = matrix.shape();
        let mut target = vec![1.0; rows];
        target.extend(std::iter::repeat(rows as f64 / cols as f64).take(cols));

        let result = Balancer::new(self.balance).balance(&Bipartite::new(matrix), &target)?;
        if result.converged {
            info!(
                "Balanced matrix in {} iterations over {} rounds, {} rows/columns excluded",
                result.iterations, result.rounds, result.excluded
            );
        } else {
            warn!(
                "Balancing did not converge (row error {:.3e}), using best-effort vector",
                result.row_error
            );
        }

        for j in 0..cols {
            let sc = result.scale[rows + j];
            for i in 0..rows {
                let sr = result.scale[i];
                let cell = &mut matrix[(i, j)];
                *cell = if sr.is_finite() && sc.is_finite() {
                    (*cell as f64 * sr * sc) as f32
                } else {
                    f32::NAN
                };
            }
        }
        Ok(())
    }
}

fn divide_by_weights(matrix: &mut DMatrix<f32>, weights: &[i32]) {
    for (mut column, &w) in matrix.column_iter_mut().zip(weights) {
        if w > 0 {
            column /= w as f32;
        } else {
            column.fill(f32::NAN);
        }
    }
}

/// `ln(x + pseudocount)`; values at or below `-pseudocount` become NaN
fn log_transform(matrix: &mut DMatrix<f32>, pseudocount: f32) {
    matrix.apply(|x| {
        let shifted = *x + pseudocount;
        *x = if shifted > 0.0 { shifted.ln() } else { f32::NAN };
    });
}

/// Replace values more than `cap` standard deviations from the global mean
/// with NaN; returns how many were replaced
fn cap_outliers(matrix: &mut DMatrix<f32>, cap: f32) -> usize {
    let Some((mean, std)) = finite_mean_std(matrix.iter().map(|&x| x as f64)) else {
        return 0;
    };
    if std <= 0.0 {
        return 0;
    }
    let mut capped = 0;
    matrix.apply(|x| {
        if ((*x as f64 - mean) / std).abs() > cap as f64 {
            *x = f32::NAN;
            capped += 1;
        }
    });
    capped
}

fn zscore_slice(values: &mut [f32], clamp: f32) {
    let Some((mean, std)) = finite_mean_std(values.iter().map(|&x| x as f64)) else {
        return;
    };
    for x in values.iter_mut().filter(|x| x.is_finite()) {
        let z = if std > 0.0 { (*x as f64 - mean) / std } else { 0.0 };
        *x = (z as f32).clamp(-clamp, clamp);
    }
}

fn zscore(matrix: &mut DMatrix<f32>, axis: ZScoreAxis, clamp: f32) {
    match axis {
        ZScoreAxis::None => {}
        ZScoreAxis::Columns => {
            for mut column in matrix.column_iter_mut() {
                let mut values: Vec<f32> = column.iter().copied().collect();
                zscore_slice(&mut values, clamp);
                column.iter_mut().zip(values).for_each(|(c, v)| *c = v);
            }
        }
        ZScoreAxis::Rows => {
            for mut row in matrix.row_iter_mut() {
                let mut values: Vec<f32> = row.iter().copied().collect();
                zscore_slice(&mut values, clamp);
                row.iter_mut().zip(values).for_each(|(c, v)| *c = v);
            }
        }
    }
}

fn nan_fraction<I: Iterator<Item = f32>>(values: I) -> f32 {
    let (mut nan, mut total) = (0usize, 0usize);
    for v in values {
        total += 1;
        if !v.is_finite() {
            nan += 1;
        }
    }
    if total == 0 {
        1.0
    } else {
        nan as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bad_index::BadIndices;
    use crate::genome::ChromosomeHandler;

    fn no_op_config() -> CleanConfig {
        CleanConfig {
            divide_by_weights: false,
            balance: false,
            log_transform: false,
            outlier_cap: None,
            zscore_axis: ZScoreAxis::None,
            column_nan_threshold: None,
            row_nan_threshold: None,
            ..CleanConfig::default()
        }
    }

    /// Two chromosomes of `n` bins each with NaN intra blocks and a
    /// constant inter block
    fn built(n: usize) -> BuiltMatrix {
        let handler = ChromosomeHandler::new(vec![("chr1", n as u64 * 10), ("chr2", n as u64 * 10)]);
        let mapping = BinIndexMap::build(handler.chromosomes(), 2, 10, &BadIndices::new(10), None);
        let matrix = DMatrix::from_fn(2 * n, 2 * n, |i, j| {
            if (i < n) == (j < n) {
                f32::NAN
            } else {
                (1 + i + j) as f32
            }
        });
        BuiltMatrix {
            matrix,
            intra: None,
            weights: vec![1; 2 * n],
            mapping,
        }
    }

    #[test]
    fn test_row_with_mostly_nan_is_removed() {
        let mut input = built(10);
        // Row 3 keeps 1 of its 10 informative cells
        for j in 10..19 {
            input.matrix[(3, j)] = f32::NAN;
        }
        let config = CleanConfig {
            row_nan_threshold: Some(0.3),
            ..no_op_config()
        };
        let balance = BalanceConfig::default();
        let cleaned = MatrixCleaner::new(&config, &balance).clean(input).unwrap();

        assert_eq!(cleaned.matrix.nrows(), 19);
        assert_eq!(cleaned.mapping.num_rows(), 19);
        assert_eq!(cleaned.mapping.intervals().len(), 19);
        assert!(cleaned.mapping.row(0, 3).is_none());
        assert_eq!(cleaned.mapping.row(0, 4), Some(3));
        assert!(cleaned.mapping.is_consistent());
        assert_eq!(cleaned.matrix[(3, 10)], (1 + 4 + 10) as f32);
    }

    #[test]
    fn test_column_pass_ignores_structural_nan() {
        let mut input = built(4);
        for i in 0..4 {
            input.matrix[(i, 6)] = f32::NAN;
        }
        let config = CleanConfig {
            column_nan_threshold: Some(0.75),
            row_nan_threshold: Some(0.3),
            ..no_op_config()
        };
        let balance = BalanceConfig::default();
        let cleaned = MatrixCleaner::new(&config, &balance).clean(input).unwrap();
        assert_eq!(cleaned.columns, vec![0, 1, 2, 3, 4, 5, 7]);
        assert_eq!(cleaned.weights.len(), 7);
        // The dropped column no longer counts against the chr1 rows
        assert_eq!(cleaned.matrix.nrows(), 8);
    }

    #[test]
    fn test_weights_log_and_zscore() {
        let mut m = DMatrix::from_row_slice(2, 2, &[2.0, 6.0, 4.0, 12.0]);
        divide_by_weights(&mut m, &[2, 3]);
        assert_eq!(m, DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]));

        log_transform(&mut m, 1.0);
        assert!((m[(0, 0)] - 2f32.ln()).abs() < 1e-6);

        let mut m = DMatrix::from_row_slice(3, 1, &[1.0, f32::NAN, 3.0]);
        zscore(&mut m, ZScoreAxis::Columns, 3.0);
        assert_eq!(m[(0, 0)], -1.0);
        assert!(m[(1, 0)].is_nan());
        assert_eq!(m[(2, 0)], 1.0);

        let mut m = DMatrix::from_row_slice(1, 4, &[0.0, 0.0, 0.0, 100.0]);
        zscore(&mut m, ZScoreAxis::Rows, 1.5);
        assert_eq!(m[(0, 3)], 1.5);
    }

    #[test]
    fn test_outlier_cap() {
        let mut values = vec![1.0f32; 99];
        values.push(1000.0);
        let mut m = DMatrix::from_vec(100, 1, values);
        assert_eq!(cap_outliers(&mut m, 5.0), 1);
        assert!(m[(99, 0)].is_nan());
    }

    #[test]
    fn test_intra_merge_and_append() {
        let mut input = built(2);
        input.intra = Some(DMatrix::from_fn(4, 4, |i, j| {
            if (i < 2) == (j < 2) {
                -1.0
            } else {
                f32::NAN
            }
        }));
        let balance = BalanceConfig::default();

        let config = CleanConfig {
            intra_inclusion: IntraInclusion::Merge,
            ..no_op_config()
        };
        let merged = MatrixCleaner::new(&config, &balance).clean(input.clone()).unwrap();
        assert!(merged.matrix.iter().all(|v| v.is_finite()));
        assert_eq!(merged.matrix[(0, 1)], -1.0);

        let config = CleanConfig {
            intra_inclusion: IntraInclusion::Append,
            column_nan_threshold: Some(0.75),
            row_nan_threshold: Some(0.3),
            ..no_op_config()
        };
        let appended = MatrixCleaner::new(&config, &balance).clean(input.clone()).unwrap();
        assert_eq!(appended.matrix.shape(), (4, 8));
        assert_eq!(appended.weights, vec![1; 8]);
        assert_eq!(appended.matrix[(0, 5)], -1.0);

        input.intra = Some(DMatrix::from_element(3, 4, 0.0));
        let result = MatrixCleaner::new(&config, &balance).clean(input);
        assert!(matches!(result, Err(SubcompError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_balanced_rows_sum_to_one() {
        let mut input = built(3);
        input.matrix.apply(|x| {
            if x.is_nan() {
                *x = 0.0
            }
        });
        let config = CleanConfig {
            balance: true,
            ..no_op_config()
        };
        let balance = BalanceConfig::default();
        let cleaned = MatrixCleaner::new(&config, &balance).clean(input).unwrap();
        for row in cleaned.matrix.row_iter() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-2, "row sum {}", sum);
        }
    }
}
