use crate::contacts::Normalization;
use serde::{Deserialize, Serialize};

/// How per-bin coverage is derived for the bad-index finder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverageMode {
    /// Count non-zero intra and inter contact entries per bin
    NonZeroCounts,
    /// Use the intra normalization vector of each chromosome as coverage
    NormVector,
}

/// Thresholds for the bad-index finder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadIndexConfig {
    pub coverage: CoverageMode,
    pub coverage_floor: f64,
    pub intra_lower_z: f64,
    pub inter_lower_z: f64,
    pub inter_upper_z: f64,
}

impl Default for BadIndexConfig {
    fn default() -> Self {
        BadIndexConfig {
            coverage: CoverageMode::NonZeroCounts,
            coverage_floor: 0.01,
            intra_lower_z: -2.5,
            inter_lower_z: -1.0,
            inter_upper_z: 3.0,
        }
    }
}

/// What the builder writes into the intra (same-chromosome) region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntraMode {
    /// Leave the intra region NaN
    Skip,
    /// Observed/expected z-scores of log(1 + count) per contact distance
    OeZScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub intra_mode: IntraMode,
    /// Observations a distance needs before it is z-scored
    pub min_distance_observations: usize,
    /// Z-scores with an absolute value at or above this are dropped
    pub oe_z_cutoff: f64,
    /// Minimum number of z-scores averaged into an intra cell, below which
    /// the cell is NaN. Capped at the column weight: a group of `w` bins
    /// holds at most `w` contributions per row.
    pub min_cell_contributions: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            intra_mode: IntraMode::Skip,
            min_distance_observations: 50,
            oe_z_cutoff: 5.0,
            min_cell_contributions: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZScoreAxis {
    None,
    Rows,
    Columns,
}

/// How the intra matrix is folded into the inter matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntraInclusion {
    None,
    /// Fill the (NaN) intra cells of the inter matrix in place
    Merge,
    /// Concatenate the intra matrix as extra columns
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanConfig {
    pub divide_by_weights: bool,
    pub balance: bool,
    pub log_transform: bool,
    pub pseudocount: f32,
    /// Global |z| above which a value becomes NaN
    pub outlier_cap: Option<f32>,
    pub zscore_axis: ZScoreAxis,
    pub zscore_clamp: f32,
    pub expand_after_zscore: bool,
    pub intra_inclusion: IntraInclusion,
    pub column_nan_threshold: Option<f32>,
    pub row_nan_threshold: Option<f32>,
}

impl Default for CleanConfig {
    fn default() -> Self {
        CleanConfig {
            divide_by_weights: true,
            balance: false,
            log_transform: true,
            pseudocount: 1.0,
            outlier_cap: Some(5.0),
            zscore_axis: ZScoreAxis::Columns,
            zscore_clamp: 3.0,
            expand_after_zscore: false,
            intra_inclusion: IntraInclusion::None,
            column_nan_threshold: Some(0.75),
            row_nan_threshold: Some(0.3),
        }
    }
}

/// Parameters of the iterative balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    pub tolerance: f64,
    pub max_iter: usize,
    pub total_iterations: usize,
    pub error_check_interval: usize,
    pub stall_window: usize,
    /// Relative increase of the row-sum error that counts as a regression
    pub error_regression: f64,
    /// Percentile (0-100) of per-row non-zero counts below which rows are excluded
    pub row_exclusion_percentile: f64,
    pub row_exclusion_step: f64,
    /// Percentile (0-100) trimmed from each tail of the target vector
    pub target_trim_percentile: f64,
    pub target_trim_step: f64,
    pub max_excluded_fraction: f64,
    pub max_trimmed_fraction: f64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        BalanceConfig {
            tolerance: 5e-4,
            max_iter: 100,
            total_iterations: 300,
            error_check_interval: 10,
            stall_window: 5,
            error_regression: 0.25,
            row_exclusion_percentile: 1.0,
            row_exclusion_step: 1.0,
            target_trim_percentile: 0.0,
            target_trim_step: 0.5,
            max_excluded_fraction: 0.2,
            max_trimmed_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMethod {
    KMeans,
    KMedians,
}

impl ClusterMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterMethod::KMeans => "kmeans",
            ClusterMethod::KMedians => "kmedians",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub method: ClusterMethod,
    /// First cluster count of the sweep
    pub k_start: usize,
    /// Number of cluster counts in the sweep
    pub k_count: usize,
    pub attempts: usize,
    pub seed: u64,
    pub max_iter: usize,
    /// Reruns allowed per attempt when a run returns fewer than K clusters
    pub max_retries: usize,
    pub num_threads: Option<usize>,
    pub timeout_secs: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            method: ClusterMethod::KMeans,
            k_start: 2,
            k_count: 10,
            attempts: 4,
            seed: 0,
            max_iter: 1000,
            max_retries: 50,
            num_threads: None,
            timeout_secs: None,
        }
    }
}

impl ClusterConfig {
    pub fn k_values(&self) -> std::ops::Range<usize> {
        self.k_start..self.k_start + self.k_count
    }
}

/// Complete configuration of a run, passed by reference into each stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub resolution: u32,
    pub intra_norm: Normalization,
    pub inter_norm: Normalization,
    /// Target group size for correlation-based column compression (1 disables it)
    pub compression: usize,
    pub bad_index: BadIndexConfig,
    pub build: BuildConfig,
    pub clean: CleanConfig,
    pub balance: BalanceConfig,
    pub cluster: ClusterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            resolution: 100_000,
            intra_norm: Normalization::None,
            inter_norm: Normalization::None,
            compression: 1,
            bad_index: BadIndexConfig::default(),
            build: BuildConfig::default(),
            clean: CleanConfig::default(),
            balance: BalanceConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}
