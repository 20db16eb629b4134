use crate::cluster::distance::Metric;
use crate::cluster::kmeans::{ClusterRun, KMeans, Points};
use crate::config::ClusterConfig;
use crate::error::{Result, SubcompError};
use crate::pool::WorkerPool;
use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Best run for one cluster count
#[derive(Debug, Clone)]
pub struct KResult {
    pub k: usize,
    /// Cluster of each matrix row, `None` when unassigned
    pub assignments: Vec<Option<usize>>,
    pub wcss: f64,
    pub aic: f64,
    pub bic: f64,
    /// Attempts that produced exactly `k` clusters
    pub attempts: usize,
    /// Runs discarded for returning the wrong number of clusters
    pub retries: usize,
    /// Attempt slots given up after `max_retries` wrong-sized runs
    pub skipped_attempts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub results: Vec<KResult>,
    /// Cluster counts for which no attempt produced exactly K clusters
    pub failed: Vec<usize>,
    /// The sweep was stopped by cancellation or timeout
    pub cancelled: bool,
}

impl SweepResult {
    fn best_by(&self, score: impl Fn(&KResult) -> f64) -> Option<&KResult> {
        self.results
            .iter()
            .filter(|r| score(r).is_finite())
            .min_by(|a, b| score(a).total_cmp(&score(b)))
    }

    pub fn best_by_wcss(&self) -> Option<&KResult> {
        self.best_by(|r| r.wcss)
    }

    pub fn best_by_aic(&self) -> Option<&KResult> {
        self.best_by(|r| r.aic)
    }

    pub fn best_by_bic(&self) -> Option<&KResult> {
        self.best_by(|r| r.bic)
    }

    pub fn get(&self, k: usize) -> Option<&KResult> {
        self.results.iter().find(|r| r.k == k)
    }
}

/// AIC and BIC of a clustering with the given WCSS
pub fn information_criteria(wcss: f64, num_rows: usize, num_cols: usize, num_clusters: usize) -> (f64, f64) {
    let params = num_cols as f64 * num_clusters as f64;
    let aic = wcss + 2.0 * params;
    let bic = wcss + 0.5 * params * (num_rows as f64).ln();
    (aic, bic)
}

/// Sweeps K over `config.k_values()`, keeping per K the attempt with the
/// lowest WCSS among those that returned exactly K clusters
pub struct ClusteringEngine<'a> {
    config: &'a ClusterConfig,
    pool: &'a WorkerPool,
}

impl<'a> ClusteringEngine<'a> {
    pub fn new(config: &'a ClusterConfig, pool: &'a WorkerPool) -> Self {
        Self { config, pool }
    }

    pub fn sweep(&self, matrix: &DMatrix<f32>) -> Result<SweepResult> {
        if matrix.is_empty() {
            return Err(SubcompError::EmptyMatrix { stage: "clustering" });
        }
        let points = Points::from_matrix(matrix);
        let metric = Metric::for_method(self.config.method);
        let kmeans = KMeans::new(&points, metric, self.config.max_iter, self.pool);
        let mut sweep = SweepResult::default();

        for k in self.config.k_values() {
            if k == 0 || k > points.len() {
                warn!("Skipping K={}: needs between 1 and {} clusters", k, points.len());
                sweep.failed.push(k);
                continue;
            }
            match self.best_of_attempts(&kmeans, k, points.dim()) {
                Ok(Some(result)) => {
                    info!(
                        "K={} {}: WCSS {:.6} AIC {:.6} BIC {:.6} ({} attempts, {} retries)",
                        k,
                        self.config.method.name(),
                        result.wcss,
                        result.aic,
                        result.bic,
                        result.attempts,
                        result.retries
                    );
                    sweep.results.push(result);
                }
                Ok(None) => {
                    warn!("K={}: no attempt produced {} clusters", k, k);
                    sweep.failed.push(k);
                }
                Err(SubcompError::Cancelled { stage }) => {
                    warn!("Clustering cancelled during {} at K={}", stage, k);
                    sweep.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(best) = sweep.best_by_wcss() {
            info!("Lowest WCSS at K={}", best.k);
        }
        if let Some(best) = sweep.best_by_aic() {
            info!("Lowest AIC at K={}", best.k);
        }
        if let Some(best) = sweep.best_by_bic() {
            info!("Lowest BIC at K={}", best.k);
        }
        Ok(sweep)
    }

    /// Run every attempt for `k`. A run with the wrong number of clusters is
    /// discarded and rerun without using up the attempt, at most
    /// `max_retries` times per attempt.
    fn best_of_attempts(&self, kmeans: &KMeans, k: usize, num_cols: usize) -> Result<Option<KResult>> {
        // One generator per K so each K sees the same seeds whatever ran before
        let mut seeds = StdRng::seed_from_u64(self.config.seed ^ (k as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut best: Option<ClusterRun> = None;
        let (mut attempts, mut retries, mut skipped) = (0, 0, 0);

        for attempt in 0..self.config.attempts {
            let mut tries = 0;
            loop {
                self.pool.check("clustering")?;
                let mut rng = StdRng::seed_from_u64(seeds.gen());
                let run = kmeans.run(k, &mut rng)?;
                if run.num_clusters() == k {
                    attempts += 1;
                    let wcss = run.wcss();
                    debug!("K={} attempt {}: WCSS {:.6} after {} iterations", k, attempt, wcss, run.iterations);
                    if best.as_ref().map_or(true, |b| wcss < b.wcss()) {
                        best = Some(run);
                    }
                    break;
                }
                retries += 1;
                tries += 1;
                debug!(
                    "K={} attempt {}: got {} clusters, retrying",
                    k,
                    attempt,
                    run.num_clusters()
                );
                if tries > self.config.max_retries {
                    warn!(
                        "K={} attempt {}: skipped after {} runs with the wrong cluster count",
                        k, attempt, tries
                    );
                    skipped += 1;
                    break;
                }
            }
        }

        Ok(best.map(|run| {
            let wcss = run.wcss();
            let (aic, bic) = information_criteria(wcss, run.assignments.len(), num_cols, k);
            KResult {
                k,
                assignments: run.assignments,
                wcss,
                aic,
                bic,
                attempts,
                retries,
                skipped_attempts: skipped,
            }
        }))
    }
}
