use clap::Parser;
use log::{info, warn};
use rayon::ThreadPoolBuilder;
use regex::Regex;
use std::io;
use std::num::NonZeroUsize;
use std::path::Path;
use subcomp::builder::IgnoredPairs;
use subcomp::cache;
use subcomp::cleaner::CleanedMatrix;
use subcomp::cluster::SweepResult;
use subcomp::config::{
    ClusterMethod, CoverageMode, IntraInclusion, IntraMode, PipelineConfig, ZScoreAxis,
};
use subcomp::contacts::{InMemoryContacts, Normalization};
use subcomp::export;
use subcomp::genome::ChromosomeHandler;
use subcomp::pipeline;
use subcomp::pool::CancelToken;

/// Common options shared between all commands
#[derive(Parser, Debug)]
struct CommonOpts {
    /// Number of threads for parallel processing.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(4).unwrap())]
    num_threads: NonZeroUsize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

/// Inputs and options that shape the assembled matrix
#[derive(Parser, Debug)]
struct MatrixOpts {
    /// Chromosome sizes file (`name<TAB>length` per line)
    #[clap(short = 's', long, value_parser)]
    sizes: Option<String>,

    /// Contact file with `chr1 pos1 chr2 pos2 [count]` lines, plain or BGZF
    #[clap(short = 'c', long, value_parser)]
    contacts: Option<String>,

    /// Chromosomes whose names match this regex are left out
    #[clap(long, value_parser, default_value = "^(chr)?(M|MT|Y)$")]
    exclude: String,

    /// Bin size in bp
    #[clap(short = 'r', long, value_parser, default_value_t = 100_000)]
    resolution: u32,

    /// Normalization of intra-chromosomal contacts (NONE, SCALE or a stored vector name)
    #[clap(long, default_value = "NONE")]
    intra_norm: Normalization,

    /// Normalization of inter-chromosomal contacts
    #[clap(long, default_value = "NONE")]
    inter_norm: Normalization,

    /// Group up to this many correlated bins into one column (1 disables grouping)
    #[clap(long, value_parser, default_value_t = 1)]
    compression: usize,

    /// Take bin coverage from the intra normalization vector instead of non-zero counts
    #[clap(long, action)]
    coverage_from_norm: bool,

    /// Fill the intra regions with observed/expected z-scores
    #[clap(long, action)]
    intra_oe: bool,

    /// Chromosome pair whose inter contacts are ignored, as `chrA,chrB` (repeatable)
    #[clap(long, value_parser)]
    ignore_pair: Vec<String>,
}

/// Cleaning options
#[derive(Parser, Debug)]
struct CleanOpts {
    /// Skip the log transform
    #[clap(long, action)]
    no_log: bool,

    /// Balance the matrix before the log transform
    #[clap(long, action)]
    balance: bool,

    /// Z-score axis: rows, columns or none
    #[clap(long, value_parser, default_value = "columns")]
    zscore: String,

    /// Z-scores are clamped to [-clamp, clamp]
    #[clap(long, value_parser, default_value_t = 3.0)]
    zscore_clamp: f32,

    /// Values with a global |z| above this become NaN (0 disables the cap)
    #[clap(long, value_parser, default_value_t = 5.0)]
    outlier_cap: f32,

    /// Exponentiate the matrix again after z-scoring
    #[clap(long, action)]
    expand: bool,

    /// How the intra O/E matrix joins the inter matrix: none, merge or append
    #[clap(long, value_parser, default_value = "none")]
    intra_inclusion: String,

    /// Rows with a larger NaN fraction are removed
    #[clap(long, value_parser, default_value_t = 0.3)]
    row_nan: f32,

    /// Columns with a larger NaN fraction are removed
    #[clap(long, value_parser, default_value_t = 0.75)]
    column_nan: f32,
}

/// Clustering options
#[derive(Parser, Debug)]
struct ClusterOpts {
    /// Smallest number of clusters
    #[clap(short = 'k', long, value_parser, default_value_t = 2)]
    k_start: usize,

    /// Number of cluster counts to try, starting at --k-start
    #[clap(short = 'n', long, value_parser, default_value_t = 10)]
    k_count: usize,

    /// Runs per cluster count; the lowest WCSS is kept
    #[clap(short = 'a', long, value_parser, default_value_t = 4)]
    attempts: usize,

    /// Random seed
    #[clap(long, value_parser, default_value_t = 0)]
    seed: u64,

    /// kmeans or kmedians
    #[clap(short = 'm', long, value_parser, default_value = "kmeans")]
    method: String,

    /// Maximum assignment/update iterations per run
    #[clap(long, value_parser, default_value_t = 1000)]
    max_iter: usize,

    /// Reruns allowed per attempt when a run returns fewer clusters than requested
    #[clap(long, value_parser, default_value_t = 50)]
    max_retries: usize,

    /// Stop clustering after this many seconds and keep what is done
    #[clap(long, value_parser)]
    timeout: Option<u64>,
}

/// Hi-C subcompartment clustering.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_subcommand = true)]
enum Args {
    /// Assemble the genome-wide inter-chromosomal matrix and save it
    Build {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        matrix: MatrixOpts,

        /// Where to write the matrix cache
        #[clap(short = 'o', long, value_parser)]
        output: String,
    },
    /// Clean the matrix and sweep the number of clusters
    Cluster {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        matrix: MatrixOpts,

        /// Use a matrix saved by `build` instead of --sizes/--contacts
        #[clap(long, value_parser)]
        cached_matrix: Option<String>,

        #[clap(flatten)]
        clean: CleanOpts,

        #[clap(flatten)]
        cluster: ClusterOpts,

        /// Prefix of the output files
        #[clap(short = 'o', long, value_parser)]
        output: String,

        /// Also write the cleaned matrix and its column weights as .npy
        #[clap(long, action)]
        dump_matrix: bool,
    },
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    match args {
        Args::Build {
            common,
            matrix,
            output,
        } => {
            initialize(&common)?;
            let mut config = PipelineConfig::default();
            apply_matrix_opts(&mut config, &matrix)?;
            let (handler, contacts) = load_contacts(&matrix)?;
            let ignored = parse_ignored_pairs(&matrix.ignore_pair, &handler)?;

            let (bad, built) = pipeline::assemble(&contacts, &config, ignored)?;
            info!(
                "Assembled {} x {} matrix ({} bins excluded)",
                built.matrix.nrows(),
                built.matrix.ncols(),
                bad.total()
            );
            cache::save(Path::new(&output), &built, &config, &handler)?;
        }
        Args::Cluster {
            common,
            matrix,
            cached_matrix,
            clean,
            cluster,
            output,
            dump_matrix,
        } => {
            initialize(&common)?;
            let mut config = PipelineConfig::default();
            apply_matrix_opts(&mut config, &matrix)?;
            apply_clean_opts(&mut config, &clean)?;
            apply_cluster_opts(&mut config, &cluster, &common)?;

            let (handler, cleaned, sweep) = match cached_matrix {
                Some(path) => {
                    if matrix.contacts.is_some() {
                        warn!("Ignoring --contacts, the matrix is read from {}", path);
                    }
                    let cached = cache::load(Path::new(&path))?;
                    // Matrix shape is fixed by the cache; cleaning and clustering come from the command line
                    config.resolution = cached.config.resolution;
                    config.intra_norm = cached.config.intra_norm;
                    config.inter_norm = cached.config.inter_norm;
                    config.compression = cached.config.compression;
                    config.bad_index = cached.config.bad_index;
                    config.build = cached.config.build;
                    let cleaned = pipeline::clean(&config, cached.built)?;
                    let sweep = pipeline::cluster(&config, &cleaned, CancelToken::new())?;
                    (cached.chromosomes, cleaned, sweep)
                }
                None => {
                    let (handler, contacts) = load_contacts(&matrix)?;
                    let ignored = parse_ignored_pairs(&matrix.ignore_pair, &handler)?;
                    let result = pipeline::run(&contacts, &config, ignored)?;
                    (handler, result.cleaned, result.sweep)
                }
            };

            write_results(&output, &config, &handler, &cleaned, &sweep, dump_matrix)?;
        }
    }

    Ok(())
}

/// Initialize logging and the global thread pool
fn initialize(common: &CommonOpts) -> io::Result<()> {
    env_logger::Builder::new()
        .filter_level(match common.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    ThreadPoolBuilder::new()
        .num_threads(common.num_threads.into())
        .build_global()
        .map_err(|e| io::Error::other(format!("Failed to build thread pool: {}", e)))
}

fn load_contacts(matrix: &MatrixOpts) -> io::Result<(ChromosomeHandler, InMemoryContacts)> {
    let (Some(sizes), Some(contacts)) = (matrix.sizes.as_deref(), matrix.contacts.as_deref()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Both --sizes and --contacts are required unless a cached matrix is given",
        ));
    };
    let exclude = Regex::new(&matrix.exclude).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid --exclude regex '{}': {}", matrix.exclude, e),
        )
    })?;
    let handler = ChromosomeHandler::from_sizes_file(sizes, Some(&exclude))?;
    info!("Using {} chromosomes from {}", handler.len(), sizes);
    let source = InMemoryContacts::from_contact_file(contacts, handler.clone(), matrix.resolution)?;
    Ok((handler, source))
}

/// Parse `chrA,chrB` pairs; pairs naming an unknown chromosome are skipped
fn parse_ignored_pairs(pairs: &[String], handler: &ChromosomeHandler) -> io::Result<IgnoredPairs> {
    let mut ignored = IgnoredPairs::default();
    for pair in pairs {
        let Some((a, b)) = pair.split_once(',') else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid chromosome pair '{}': expected chrA,chrB", pair),
            ));
        };
        match (handler.by_name(a.trim()), handler.by_name(b.trim())) {
            (Some(a), Some(b)) => ignored.insert(a.index, b.index),
            _ => warn!("Ignoring pair '{}': unknown chromosome", pair),
        }
    }
    Ok(ignored)
}

fn apply_matrix_opts(config: &mut PipelineConfig, matrix: &MatrixOpts) -> io::Result<()> {
    if matrix.resolution == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "--resolution must be at least 1 bp",
        ));
    }
    if matrix.coverage_from_norm && matrix.intra_norm == Normalization::None {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "--coverage-from-norm needs an --intra-norm vector other than NONE",
        ));
    }
    config.resolution = matrix.resolution;
    config.intra_norm = matrix.intra_norm.clone();
    config.inter_norm = matrix.inter_norm.clone();
    config.compression = matrix.compression.max(1);
    if matrix.coverage_from_norm {
        config.bad_index.coverage = CoverageMode::NormVector;
    }
    if matrix.intra_oe {
        config.build.intra_mode = IntraMode::OeZScore;
    }
    Ok(())
}

fn apply_clean_opts(config: &mut PipelineConfig, clean: &CleanOpts) -> io::Result<()> {
    let c = &mut config.clean;
    c.log_transform = !clean.no_log;
    c.balance = clean.balance;
    c.zscore_axis = match clean.zscore.to_ascii_lowercase().as_str() {
        "rows" | "row" => ZScoreAxis::Rows,
        "columns" | "column" | "cols" => ZScoreAxis::Columns,
        "none" => ZScoreAxis::None,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid --zscore '{}': expected rows, columns or none", other),
            ))
        }
    };
    c.zscore_clamp = clean.zscore_clamp;
    c.outlier_cap = (clean.outlier_cap > 0.0).then_some(clean.outlier_cap);
    c.expand_after_zscore = clean.expand;
    c.intra_inclusion = match clean.intra_inclusion.to_ascii_lowercase().as_str() {
        "none" => IntraInclusion::None,
        "merge" => IntraInclusion::Merge,
        "append" => IntraInclusion::Append,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid --intra-inclusion '{}': expected none, merge or append", other),
            ))
        }
    };
    if c.intra_inclusion != IntraInclusion::None {
        config.build.intra_mode = IntraMode::OeZScore;
    }
    c.row_nan_threshold = Some(clean.row_nan);
    c.column_nan_threshold = Some(clean.column_nan);
    Ok(())
}

fn apply_cluster_opts(config: &mut PipelineConfig, cluster: &ClusterOpts, common: &CommonOpts) -> io::Result<()> {
    let c = &mut config.cluster;
    c.method = match cluster.method.to_ascii_lowercase().as_str() {
        "kmeans" => ClusterMethod::KMeans,
        "kmedians" => ClusterMethod::KMedians,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid --method '{}': expected kmeans or kmedians", other),
            ))
        }
    };
    c.k_start = cluster.k_start;
    c.k_count = cluster.k_count;
    c.attempts = cluster.attempts;
    c.seed = cluster.seed;
    c.max_iter = cluster.max_iter;
    c.max_retries = cluster.max_retries;
    c.timeout_secs = cluster.timeout;
    c.num_threads = Some(common.num_threads.get());
    Ok(())
}

fn write_results(
    prefix: &str,
    config: &PipelineConfig,
    handler: &ChromosomeHandler,
    cleaned: &CleanedMatrix,
    sweep: &SweepResult,
    dump_matrix: bool,
) -> io::Result<()> {
    if dump_matrix {
        export::write_matrix_npy(Path::new(&format!("{}_matrix.npy", prefix)), &cleaned.matrix)?;
        export::write_weights_npy(Path::new(&format!("{}_weights.npy", prefix)), &cleaned.weights)?;
    }
    let beds = export::export_sweep(
        prefix,
        config.cluster.method.name(),
        handler,
        &cleaned.mapping,
        sweep,
    )?;

    if sweep.cancelled {
        warn!("Clustering stopped early; wrote {} of {} cluster counts", beds.len(), config.cluster.k_count);
    }
    if !sweep.failed.is_empty() {
        warn!("No result for K in {:?}", sweep.failed);
    }
    if let Some(best) = sweep.best_by_bic() {
        info!("Best K by BIC: {}", best.k);
    }
    Ok(())
}
