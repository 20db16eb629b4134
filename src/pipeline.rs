//! End-to-end run: bad indices, optional column compression, matrix
//! assembly, cleaning and the clustering sweep

use crate::bad_index::{BadIndexFinder, BadIndices};
use crate::builder::{BuiltMatrix, IgnoredPairs, MatrixBuilder};
use crate::cleaner::{CleanedMatrix, MatrixCleaner};
use crate::cluster::{ClusteringEngine, SweepResult};
use crate::config::PipelineConfig;
use crate::contacts::{ContactSource, Normalization, ScaleNormalized};
use crate::error::{Result, SubcompError};
use crate::pool::{CancelToken, WorkerPool};
use crate::reorder::ColumnReorderer;
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub bad: Arc<BadIndices>,
    pub cleaned: CleanedMatrix,
    pub sweep: SweepResult,
}

pub struct Pipeline<'a, S: ContactSource> {
    source: &'a S,
    config: &'a PipelineConfig,
    ignored: IgnoredPairs,
    cancel: CancelToken,
}

impl<'a, S: ContactSource> Pipeline<'a, S> {
    pub fn new(source: &'a S, config: &'a PipelineConfig) -> Self {
        Self {
            source,
            config,
            ignored: IgnoredPairs::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_ignored_pairs(mut self, ignored: IgnoredPairs) -> Self {
        self.ignored = ignored;
        self
    }

    /// Token that stops the clustering sweep when cancelled
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn find_bad_indices(&self) -> Arc<BadIndices> {
        BadIndexFinder::new(
            self.source,
            &self.config.bad_index,
            self.config.resolution,
            &self.config.intra_norm,
        )
        .find(self.source.chromosomes().chromosomes())
    }

    pub fn build_matrix(&self, bad: &BadIndices) -> Result<BuiltMatrix> {
        let chromosomes = self.source.chromosomes().chromosomes();
        let builder = MatrixBuilder::new(self.source, self.config, bad).with_ignored_pairs(&self.ignored);
        if self.config.compression > 1 {
            let groups = ColumnReorderer::new(
                self.source,
                bad,
                self.config.resolution,
                &self.config.intra_norm,
                self.config.compression,
            )
            .compute(chromosomes);
            builder.with_groups(&groups).build(chromosomes)
        } else {
            builder.build(chromosomes)
        }
    }

    /// Bad indices and the assembled, uncleaned matrix
    pub fn assemble(&self) -> Result<(Arc<BadIndices>, BuiltMatrix)> {
        check_resolution(self.config)?;
        let bad = self.find_bad_indices();
        let built = self.build_matrix(&bad)?;
        Ok((bad, built))
    }

    pub fn run(&self) -> Result<PipelineOutput> {
        let (bad, built) = self.assemble()?;
        let cleaned = clean(self.config, built)?;
        let sweep = cluster(self.config, &cleaned, self.cancel.clone())?;
        Ok(PipelineOutput { bad, cleaned, sweep })
    }
}

fn check_resolution(config: &PipelineConfig) -> Result<()> {
    if config.resolution == 0 {
        return Err(SubcompError::InvalidInput(
            "resolution must be a positive number of base pairs".to_string(),
        ));
    }
    Ok(())
}

pub fn clean(config: &PipelineConfig, built: BuiltMatrix) -> Result<CleanedMatrix> {
    MatrixCleaner::new(&config.clean, &config.balance).clean(built)
}

/// Sweep K over the cleaned matrix on a dedicated worker pool. Cancelling
/// `cancel`, or passing the configured timeout, ends the sweep early with
/// the results gathered so far.
pub fn cluster(config: &PipelineConfig, cleaned: &CleanedMatrix, cancel: CancelToken) -> Result<SweepResult> {
    let cluster = &config.cluster;
    let mut pool = WorkerPool::new(cluster.num_threads)?.with_cancel_token(cancel);
    if let Some(secs) = cluster.timeout_secs {
        pool = pool.with_timeout(Duration::from_secs(secs));
    }
    info!(
        "Clustering {} x {} matrix with {} on {} threads",
        cleaned.matrix.nrows(),
        cleaned.matrix.ncols(),
        cluster.method.name(),
        pool.num_threads()
    );
    ClusteringEngine::new(cluster, &pool).sweep(&cleaned.matrix)
}

pub fn uses_scale(config: &PipelineConfig) -> bool {
    config.intra_norm == Normalization::Scale || config.inter_norm == Normalization::Scale
}

/// Assemble the matrix, deriving SCALE vectors first when either
/// normalization asks for them
pub fn assemble<S: ContactSource>(
    source: &S,
    config: &PipelineConfig,
    ignored: IgnoredPairs,
) -> Result<(Arc<BadIndices>, BuiltMatrix)> {
    check_resolution(config)?;
    if uses_scale(config) {
        let scaled = ScaleNormalized::new(source, config.resolution, &config.balance);
        Pipeline::new(&scaled, config).with_ignored_pairs(ignored).assemble()
    } else {
        Pipeline::new(source, config).with_ignored_pairs(ignored).assemble()
    }
}

/// Run the whole pipeline, deriving SCALE vectors first when needed
pub fn run<S: ContactSource>(source: &S, config: &PipelineConfig, ignored: IgnoredPairs) -> Result<PipelineOutput> {
    check_resolution(config)?;
    if uses_scale(config) {
        let scaled = ScaleNormalized::new(source, config.resolution, &config.balance);
        Pipeline::new(&scaled, config).with_ignored_pairs(ignored).run()
    } else {
        Pipeline::new(source, config).with_ignored_pairs(ignored).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::contacts::InMemoryContacts;
    use crate::genome::ChromosomeHandler;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Three chromosomes of 12 bins in two alternating compartments
    fn compartments() -> (InMemoryContacts, impl Fn(usize, usize) -> usize) {
        let label = |chrom: usize, bin: usize| (bin / 4 + chrom) % 2;
        let handler = ChromosomeHandler::new(vec![("chr1", 1200), ("chr2", 1200), ("chr3", 1200)]);
        let mut contacts = InMemoryContacts::new(handler, 100);
        let mut rng = StdRng::seed_from_u64(3);
        for ca in 0..3 {
            for cb in ca..3 {
                for x in 0..12 {
                    let from = if ca == cb { x } else { 0 };
                    for y in from..12 {
                        let count = if label(ca, x) == label(cb, y) {
                            20.0 + rng.gen_range(0.0..3.0)
                        } else {
                            2.0 + rng.gen_range(0.0..1.0)
                        };
                        contacts.add(ca, x, cb, y, count);
                    }
                }
            }
        }
        (contacts, label)
    }

    #[test]
    fn test_two_compartments_are_recovered() {
        let (contacts, label) = compartments();
        let config = PipelineConfig {
            resolution: 100,
            cluster: ClusterConfig {
                k_start: 2,
                k_count: 2,
                attempts: 2,
                num_threads: Some(2),
                ..ClusterConfig::default()
            },
            ..PipelineConfig::default()
        };
        let output = run(&contacts, &config, IgnoredPairs::default()).unwrap();
        assert_eq!(output.bad.total(), 0);
        assert_eq!(output.cleaned.matrix.nrows(), 36);

        let k2 = output.sweep.get(2).unwrap();
        let mapping = &output.cleaned.mapping;
        for chrom in 0..3 {
            for bin in 0..12 {
                let row = mapping.row(chrom, bin).unwrap();
                let reference = mapping.row(0, 4).unwrap();
                let same = label(chrom, bin) == label(0, 4);
                assert_eq!(k2.assignments[row] == k2.assignments[reference], same);
            }
        }
    }

    #[test]
    fn test_scale_normalized_run() {
        let (contacts, _) = compartments();
        let config = PipelineConfig {
            resolution: 100,
            intra_norm: Normalization::Scale,
            inter_norm: Normalization::Scale,
            cluster: ClusterConfig {
                k_start: 2,
                k_count: 1,
                attempts: 1,
                num_threads: Some(1),
                ..ClusterConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(uses_scale(&config));
        let output = run(&contacts, &config, IgnoredPairs::default()).unwrap();
        assert_eq!(output.sweep.results.len(), 1);
        assert!(output.cleaned.mapping.is_consistent());
    }

    #[test]
    fn test_zero_resolution_is_rejected() {
        let (contacts, _) = compartments();
        let config = PipelineConfig {
            resolution: 0,
            intra_norm: Normalization::Scale,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            run(&contacts, &config, IgnoredPairs::default()),
            Err(SubcompError::InvalidInput(_))
        ));
        assert!(matches!(
            Pipeline::new(&contacts, &config).assemble(),
            Err(SubcompError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cancelled_token_stops_clustering() {
        let (contacts, _) = compartments();
        let config = PipelineConfig {
            resolution: 100,
            cluster: ClusterConfig {
                k_start: 2,
                k_count: 2,
                num_threads: Some(1),
                ..ClusterConfig::default()
            },
            ..PipelineConfig::default()
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let output = Pipeline::new(&contacts, &config)
            .with_cancel_token(cancel)
            .run()
            .unwrap();
        assert!(output.sweep.cancelled);
        assert!(output.sweep.results.is_empty());
        assert_eq!(output.cleaned.matrix.nrows(), 36);
    }
}
