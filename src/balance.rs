//! Iterative matrix balancing
//!
//! Computes a vector `b` such that `diag(b) * M * diag(b)` has row sums close
//! to a target vector. Rows and columns are rescaled alternately; rows that
//! cannot be balanced (too sparse, trimmed targets, empty after exclusion)
//! are excluded and come back as NaN. When an iterate stalls or its row-sum
//! error regresses, the exclusion thresholds are widened and scaling resumes
//! or restarts. Everything is sequential and deterministic, and the total
//! number of iterations is bounded by `BalanceConfig::total_iterations`.

use crate::config::BalanceConfig;
use crate::contacts::ContactRecord;
use crate::error::{Result, SubcompError};
use crate::stats::percentile;
use log::{debug, warn};
use nalgebra::DMatrix;

/// A symmetric matrix that only needs to support products with a vector
pub trait SymmetricOperator {
    fn dim(&self) -> usize;

    /// `M * x`
    fn multiply(&self, x: &[f64]) -> Vec<f64>;

    /// Number of non-zero entries in each row
    fn nonzero_counts(&self) -> Vec<usize>;
}

/// Symmetric sparse matrix stored as its upper triangle (diagonal included)
#[derive(Debug, Clone, Default)]
pub struct SparseSymmetric {
    dim: usize,
    entries: Vec<(u32, u32, f64)>,
}

impl SparseSymmetric {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
        }
    }

    /// Add a value at `(i, j)`; zero, non-finite and out-of-range values are ignored
    pub fn push(&mut self, i: usize, j: usize, value: f64) {
        if value == 0.0 || !value.is_finite() || i >= self.dim || j >= self.dim {
            return;
        }
        let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
        self.entries.push((lo as u32, hi as u32, value));
    }

    pub fn from_records<I: IntoIterator<Item = ContactRecord>>(dim: usize, records: I) -> Self {
        let mut matrix = Self::new(dim);
        for r in records {
            matrix.push(r.bin_x, r.bin_y, r.count as f64);
        }
        matrix
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

impl SymmetricOperator for SparseSymmetric {
    fn dim(&self) -> usize {
        self.dim
    }

    fn multiply(&self, x: &[f64]) -> Vec<f64> {
        let mut y = vec![0.0; self.dim];
        for &(i, j, v) in &self.entries {
            let (i, j) = (i as usize, j as usize);
            y[i] += v * x[j];
            if i != j {
                y[j] += v * x[i];
            }
        }
        y
    }

    fn nonzero_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.dim];
        for &(i, j, _) in &self.entries {
            counts[i as usize] += 1;
            if i != j {
                counts[j as usize] += 1;
            }
        }
        counts
    }
}

/// The rectangular matrix `A` seen as the symmetric `[[0, A], [Aᵀ, 0]]`.
/// Indices `0..rows` are rows of `A`, `rows..rows + cols` its columns.
/// NaN entries count as zero.
pub struct Bipartite<'a> {
    matrix: &'a DMatrix<f32>,
}

impl<'a> Bipartite<'a> {
    pub fn new(matrix: &'a DMatrix<f32>) -> Self {
        Self { matrix }
    }
}

impl SymmetricOperator for Bipartite<'_> {
    fn dim(&self) -> usize {
        self.matrix.nrows() + self.matrix.ncols()
    }

    fn multiply(&self, x: &[f64]) -> Vec<f64> {
        let rows = self.matrix.nrows();
        let mut y = vec![0.0; self.dim()];
        for (j, column) in self.matrix.column_iter().enumerate() {
            let xc = x[rows + j];
            let mut acc = 0.0;
            for (i, &v) in column.iter().enumerate() {
                if v.is_finite() && v != 0.0 {
                    y[i] += v as f64 * xc;
                    acc += v as f64 * x[i];
                }
            }
            y[rows + j] = acc;
        }
        y
    }

    fn nonzero_counts(&self) -> Vec<usize> {
        let rows = self.matrix.nrows();
        let mut counts = vec![0; self.dim()];
        for (j, column) in self.matrix.column_iter().enumerate() {
            for (i, &v) in column.iter().enumerate() {
                if v.is_finite() && v != 0.0 {
                    counts[i] += 1;
                    counts[rows + j] += 1;
                }
            }
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct BalanceResult {
    /// Scale per row/column, NaN for excluded ones
    pub scale: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub rounds: usize,
    pub excluded: usize,
    /// Max relative row-sum error of the returned vector
    pub row_error: f64,
}

enum RoundOutcome {
    Converged,
    Stalled,
    Regressed,
    Exhausted,
}

struct Exclusion {
    bad: Vec<bool>,
    target: Vec<f64>,
    trimmed: usize,
}

/// Balancing state carried between rounds
struct ScalingState {
    dr: Vec<f64>,
    dc: Vec<f64>,
}

impl ScalingState {
    fn fresh(bad: &[bool]) -> Self {
        let init: Vec<f64> = bad.iter().map(|&b| if b { 0.0 } else { 1.0 }).collect();
        Self {
            dr: init.clone(),
            dc: init,
        }
    }

    fn exclude(&mut self, bad: &[bool]) {
        for (i, &b) in bad.iter().enumerate() {
            if b {
                self.dr[i] = 0.0;
                self.dc[i] = 0.0;
            }
        }
    }

    fn symmetric(&self) -> Vec<f64> {
        self.dr
            .iter()
            .zip(&self.dc)
            .map(|(r, c)| (r * c).sqrt())
            .collect()
    }
}

pub struct Balancer<'c> {
    config: &'c BalanceConfig,
}

impl<'c> Balancer<'c> {
    pub fn new(config: &'c BalanceConfig) -> Self {
        Self { config }
    }

    pub fn balance<M: SymmetricOperator>(&self, matrix: &M, target: &[f64]) -> Result<BalanceResult> {
        let n = matrix.dim();
        if target.len() != n {
            return Err(SubcompError::DimensionMismatch {
                stage: "balancing",
                expected: n,
                found: target.len(),
            });
        }

        let nonzero = matrix.nonzero_counts();
        let mut row_pct = self.config.row_exclusion_percentile;
        let mut trim_pct = self.config.target_trim_percentile;
        let mut exclusion = self.exclusion(&nonzero, target, row_pct, trim_pct);
        let mut state = ScalingState::fresh(&exclusion.bad);

        let mut iterations = 0usize;
        let mut rounds = 0usize;
        let mut round_errors: Vec<f64> = Vec::new();
        let mut best: Option<(f64, Vec<f64>, Vec<bool>)> = None;
        let mut converged = false;

        loop {
            rounds += 1;
            let outcome = self.run_round(matrix, &mut exclusion, &mut state, &mut iterations);
            let b = state.symmetric();
            let err = row_error(matrix, &b, &exclusion.target, &exclusion.bad);
            debug!(
                "Balancing round {}: iterations={} excluded={} error={:.3e}",
                rounds,
                iterations,
                exclusion.bad.iter().filter(|&&b| b).count(),
                err
            );
            let improved = match &best {
                Some((best_err, _, _)) => err < *best_err,
                None => true,
            };
            if improved {
                best = Some((err, b, exclusion.bad.clone()));
            }

            match outcome {
                RoundOutcome::Converged => {
                    converged = true;
                    break;
                }
                RoundOutcome::Stalled | RoundOutcome::Regressed | RoundOutcome::Exhausted => {}
            }
            if iterations >= self.config.total_iterations {
                break;
            }

            row_pct += self.config.row_exclusion_step;
            trim_pct += self.config.target_trim_step;
            let widened = self.exclusion(&nonzero, target, row_pct, trim_pct);
            let excluded_fraction =
                widened.bad.iter().filter(|&&b| b).count() as f64 / n.max(1) as f64;
            let trimmed_fraction = widened.trimmed as f64 / n.max(1) as f64;
            if excluded_fraction > self.config.max_excluded_fraction
                || trimmed_fraction > self.config.max_trimmed_fraction
            {
                warn!(
                    "Balancer giving up after {} rounds: widening would exclude {:.1}% of rows and trim {:.1}% of the target",
                    rounds,
                    excluded_fraction * 100.0,
                    trimmed_fraction * 100.0
                );
                break;
            }

            round_errors.push(err);
            let window = self.config.stall_window;
            exclusion = widened;
            if error_worsened(&round_errors, window) {
                debug!("Balancer error worsened over the last {} rounds, restarting", window);
                state = ScalingState::fresh(&exclusion.bad);
            } else {
                state.exclude(&exclusion.bad);
            }
        }

        let (row_error, mut scale, bad) = match best {
            Some(best) => best,
            None => (f64::INFINITY, vec![f64::NAN; n], vec![true; n]),
        };
        for (s, &b) in scale.iter_mut().zip(&bad) {
            if b || !s.is_finite() || *s <= 0.0 {
                *s = f64::NAN;
            }
        }
        let excluded = scale.iter().filter(|s| s.is_nan()).count();
        if !converged {
            warn!(
                "Balancer did not converge after {} iterations (error {:.3e}); returning best effort",
                iterations, row_error
            );
        }

        Ok(BalanceResult {
            scale,
            converged,
            iterations,
            rounds,
            excluded,
            row_error,
        })
    }

    /// Trim target tails to NaN and exclude rows that are empty, sparser than
    /// the `row_pct` percentile of non-zero counts, or have no usable target.
    /// Excluded rows get a target of 1.
    fn exclusion(&self, nonzero: &[usize], target: &[f64], row_pct: f64, trim_pct: f64) -> Exclusion {
        let mut target = target.to_vec();
        let mut trimmed = 0;
        if trim_pct > 0.0 {
            if let (Some(lo), Some(hi)) = (
                percentile(&target, trim_pct),
                percentile(&target, 100.0 - trim_pct),
            ) {
                for t in target.iter_mut() {
                    if t.is_finite() && (*t < lo || *t > hi) {
                        *t = f64::NAN;
                        trimmed += 1;
                    }
                }
            }
        }

        let positive: Vec<f64> = nonzero
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| c as f64)
            .collect();
        let threshold = percentile(&positive, row_pct).unwrap_or(0.0);

        let mut bad = vec![false; target.len()];
        for i in 0..target.len() {
            if nonzero[i] == 0
                || (nonzero[i] as f64) < threshold
                || !target[i].is_finite()
                || target[i] <= 0.0
            {
                bad[i] = true;
                target[i] = 1.0;
            }
        }

        Exclusion {
            bad,
            target,
            trimmed,
        }
    }

    fn run_round<M: SymmetricOperator>(
        &self,
        matrix: &M,
        exclusion: &mut Exclusion,
        state: &mut ScalingState,
        iterations: &mut usize,
    ) -> RoundOutcome {
        let cfg = self.config;
        let n = matrix.dim();

        let mut row = matrix.multiply(&state.dc);
        for i in 0..n {
            row[i] *= state.dr[i];
        }

        let mut previous = state.symmetric();
        let mut ber_history: Vec<f64> = Vec::new();
        let mut last_error = f64::INFINITY;

        for iter in 1..=cfg.max_iter {
            if *iterations >= cfg.total_iterations {
                return RoundOutcome::Exhausted;
            }
            *iterations += 1;

            self.scale_towards(&mut state.dr, &row, exclusion);
            let mut col = matrix.multiply(&state.dr);
            for i in 0..n {
                col[i] *= state.dc[i];
            }
            state.exclude(&exclusion.bad);

            self.scale_towards(&mut state.dc, &col, exclusion);
            row = matrix.multiply(&state.dc);
            for i in 0..n {
                row[i] *= state.dr[i];
            }
            state.exclude(&exclusion.bad);

            let current = state.symmetric();
            let ber = current
                .iter()
                .zip(&previous)
                .zip(&exclusion.bad)
                .filter(|(_, &b)| !b)
                .map(|((c, p), _)| (c - p).abs())
                .fold(0.0, f64::max);
            previous = current;

            if ber < cfg.tolerance || iter % cfg.error_check_interval == 0 {
                let err = row_error(matrix, &previous, &exclusion.target, &exclusion.bad);
                if ber < cfg.tolerance && err < cfg.tolerance {
                    return RoundOutcome::Converged;
                }
                if iter % cfg.error_check_interval == 0 {
                    if last_error.is_finite() && err > last_error * (1.0 + cfg.error_regression) {
                        return RoundOutcome::Regressed;
                    }
                    last_error = err;
                }
            }

            ber_history.push(ber);
            let len = ber_history.len();
            if ber >= cfg.tolerance
                && len > cfg.stall_window
                && ber >= ber_history[len - 1 - cfg.stall_window]
            {
                return RoundOutcome::Stalled;
            }
        }
        RoundOutcome::Exhausted
    }

    /// `d[i] *= target[i] / sums[i]`; rows whose sum vanished are excluded
    fn scale_towards(&self, d: &mut [f64], sums: &[f64], exclusion: &mut Exclusion) {
        for i in 0..d.len() {
            if exclusion.bad[i] {
                continue;
            }
            if sums[i] > 0.0 && sums[i].is_finite() {
                d[i] *= exclusion.target[i] / sums[i];
            } else {
                exclusion.bad[i] = true;
                exclusion.target[i] = 1.0;
                d[i] = 0.0;
            }
        }
    }
}

/// Whether the latest round error is above the one `window` rounds earlier
fn error_worsened(errors: &[f64], window: usize) -> bool {
    match errors.len().checked_sub(window + 1) {
        Some(earlier) => errors[errors.len() - 1] > errors[earlier],
        None => false,
    }
}

/// Max over kept rows of `|b_i (M b)_i - t_i| / t_i`
fn row_error<M: SymmetricOperator>(matrix: &M, b: &[f64], target: &[f64], bad: &[bool]) -> f64 {
    let masked: Vec<f64> = b
        .iter()
        .zip(bad)
        .map(|(&v, &bad)| if bad || !v.is_finite() { 0.0 } else { v })
        .collect();
    let product = matrix.multiply(&masked);
    let mut err: f64 = 0.0;
    for i in 0..b.len() {
        if bad[i] {
            continue;
        }
        let sum = masked[i] * product[i];
        let e = (sum - target[i]).abs() / target[i];
        err = err.max(if e.is_finite() { e } else { f64::INFINITY });
    }
    err
}
