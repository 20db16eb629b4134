//! Library-level checks of matrix assembly, cleaning and clustering on
//! synthetic Hi-C data

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use subcomp::bad_index::{BadIndexFinder, BadIndices};
use subcomp::builder::{BuiltMatrix, IgnoredPairs};
use subcomp::cleaner::MatrixCleaner;
use subcomp::cluster::ClusteringEngine;
use subcomp::config::{BalanceConfig, CleanConfig, ClusterConfig, PipelineConfig};
use subcomp::contacts::{ContactSource, InMemoryContacts, Normalization};
use subcomp::genome::ChromosomeHandler;
use subcomp::mapping::BinIndexMap;
use subcomp::pipeline::{self, Pipeline};
use subcomp::pool::WorkerPool;

const RES: u32 = 100;

/// Compartment of a bin: blocks of 4 bins alternating between two labels,
/// shifted by one block on odd chromosomes
fn label(chrom: usize, bin: usize) -> usize {
    (bin / 4 + chrom) % 2
}

/// Full contact data over `chroms` (name, bins). Chromosomes listed in
/// `empty` get no contacts at all.
fn synthetic_contacts(chroms: &[(&str, usize)], empty: &[usize], seed: u64) -> InMemoryContacts {
    let handler = ChromosomeHandler::new(
        chroms
            .iter()
            .map(|(name, bins)| (*name, *bins as u64 * RES as u64))
            .collect(),
    );
    let mut contacts = InMemoryContacts::new(handler, RES);
    let mut rng = StdRng::seed_from_u64(seed);
    for ca in 0..chroms.len() {
        for cb in ca..chroms.len() {
            if empty.contains(&ca) || empty.contains(&cb) {
                continue;
            }
            for x in 0..chroms[ca].1 {
                let from = if ca == cb { x } else { 0 };
                for y in from..chroms[cb].1 {
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
    contacts
}

fn config() -> PipelineConfig {
    PipelineConfig {
        resolution: RES,
        cluster: ClusterConfig {
            k_start: 2,
            k_count: 2,
            attempts: 2,
            seed: 7,
            num_threads: Some(2),
            ..ClusterConfig::default()
        },
        ..PipelineConfig::default()
    }
}

#[test]
fn test_empty_chromosome_is_excluded() {
    let contacts = synthetic_contacts(&[("chr1", 10), ("chr2", 10), ("chr3", 8)], &[2], 1);
    let config = config();
    let (bad, built) = Pipeline::new(&contacts, &config).assemble().unwrap();

    assert_eq!(bad.num_excluded(2), 8);
    assert_eq!(bad.total(), 8);
    assert_eq!(built.mapping.num_rows(), 20);
    assert_eq!(built.matrix.shape(), (20, 20));
    assert_eq!(built.mapping.row_range(2), 0..0);
    assert_eq!(built.mapping.col_range(2), 20..20);
    assert!((0..8).all(|bin| built.mapping.row(2, bin).is_none()));
    assert!(built.mapping.is_consistent());
}

#[test]
fn test_bad_index_finder_is_idempotent() {
    let contacts = synthetic_contacts(&[("chr1", 12), ("chr2", 12), ("chr3", 12)], &[2], 2);
    let config = PipelineConfig::default();
    let chromosomes = contacts.chromosomes().chromosomes();
    let finder = BadIndexFinder::new(&contacts, &config.bad_index, RES, &Normalization::None);
    let first = finder.find(chromosomes);
    let second = finder.find(chromosomes);
    assert_eq!(*first, *second);
    assert_eq!(first.num_excluded(2), 12);
}

#[test]
fn test_sparse_row_is_removed_with_its_interval() {
    let handler = ChromosomeHandler::new(vec![("chr1", 1000), ("chr2", 1000), ("chr3", 1000)]);
    let mapping = BinIndexMap::build(handler.chromosomes(), 3, RES, &BadIndices::new(RES), None);
    let mut rng = StdRng::seed_from_u64(4);
    let mut matrix = DMatrix::from_fn(30, 30, |i, j| {
        if i / 10 == j / 10 {
            f32::NAN
        } else {
            rng.gen_range(1.0..50.0)
        }
    });
    // 18 of the 20 inter cells of chr1 bin 3
    for j in 10..28 {
        matrix[(3, j)] = f32::NAN;
    }
    let built = BuiltMatrix {
        matrix,
        intra: None,
        weights: vec![1; 30],
        mapping,
    };
    let clean = CleanConfig {
        outlier_cap: None,
        ..CleanConfig::default()
    };
    let cleaned = MatrixCleaner::new(&clean, &BalanceConfig::default())
        .clean(built)
        .unwrap();

    assert_eq!(cleaned.matrix.shape(), (29, 30));
    assert_eq!(cleaned.mapping.num_rows(), 29);
    assert_eq!(cleaned.mapping.intervals().len(), 29);
    assert_eq!(cleaned.mapping.row(0, 3), None);
    assert_eq!(cleaned.mapping.row(0, 4), Some(3));
    assert!(cleaned.mapping.is_consistent());
}

/// Four blocks of 25 rows around well separated centers in 6 dimensions
fn four_blocks() -> (DMatrix<f32>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(21);
    let labels: Vec<usize> = (0..100).map(|i| i / 25).collect();
    let matrix = DMatrix::from_fn(100, 6, |i, j| {
        let center = if j % 4 == labels[i] { 6.0 } else { 0.0 };
        center + rng.gen_range(-1.0..1.0)
    });
    (matrix, labels)
}

#[test]
fn test_sweep_recovers_four_blocks() {
    let (matrix, labels) = four_blocks();
    let config = ClusterConfig {
        k_start: 2,
        k_count: 3,
        attempts: 2,
        seed: 3,
        ..ClusterConfig::default()
    };
    let pool = WorkerPool::new(Some(4)).unwrap();
    let sweep = ClusteringEngine::new(&config, &pool).sweep(&matrix).unwrap();

    assert_eq!(sweep.results.iter().map(|r| r.k).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_eq!(sweep.best_by_wcss().unwrap().k, 4);

    let k4 = sweep.get(4).unwrap();
    // Majority cluster of each block, then agreement under that mapping
    let mut agree = 0;
    let mut majority = Vec::new();
    for block in 0..4 {
        let mut counts = [0usize; 4];
        for i in (0..100).filter(|&i| labels[i] == block) {
            if let Some(c) = k4.assignments[i] {
                counts[c] += 1;
            }
        }
        let (best, count) = counts.iter().enumerate().max_by_key(|(_, c)| **c).unwrap();
        majority.push(best);
        agree += count;
    }
    majority.sort();
    majority.dedup();
    assert_eq!(majority.len(), 4);
    assert!(agree as f64 / 100.0 >= 0.95);
}

#[test]
fn test_ignored_pair_is_never_filled() {
    let contacts = synthetic_contacts(&[("chr1", 8), ("chr2", 8), ("chr3", 8)], &[], 5);
    let config = config();
    let mut ignored = IgnoredPairs::default();
    ignored.insert(1, 2);
    let (_, built) = Pipeline::new(&contacts, &config)
        .with_ignored_pairs(ignored)
        .assemble()
        .unwrap();
    let m = &built.matrix;
    let map = &built.mapping;

    for (rows, cols) in [(map.row_range(1), map.col_range(2)), (map.row_range(2), map.col_range(1))] {
        for i in rows {
            for j in cols.clone() {
                assert!(m[(i, j)].is_nan());
            }
        }
    }
    for i in map.row_range(0) {
        for j in map.col_range(1).chain(map.col_range(2)) {
            assert!(m[(i, j)] > 0.0);
        }
    }
}

#[test]
fn test_inter_blocks_are_symmetric() {
    let contacts = synthetic_contacts(&[("chr1", 9), ("chr2", 7), ("chr3", 5)], &[], 6);
    let config = config();
    let (_, built) = Pipeline::new(&contacts, &config).assemble().unwrap();
    let chromosomes = contacts.chromosomes().chromosomes();
    let map = &built.mapping;

    for a in chromosomes {
        for b in chromosomes.iter().filter(|b| b.index > a.index) {
            let records = contacts.records(a, b, RES, &Normalization::None).unwrap();
            for r in records.filter(|r| r.count > 0.0) {
                let (Some(rx), Some(gy), Some(ry), Some(gx)) = (
                    map.row(a.index, r.bin_x),
                    map.group(b.index, r.bin_y),
                    map.row(b.index, r.bin_y),
                    map.group(a.index, r.bin_x),
                ) else {
                    continue;
                };
                assert!((built.matrix[(rx, gy)] - built.matrix[(ry, gx)]).abs() < 1e-5);
                assert_eq!(built.matrix[(rx, gy)], r.count);
            }
        }
    }
}

#[test]
fn test_fixed_seed_runs_agree() {
    let contacts = synthetic_contacts(&[("chr1", 12), ("chr2", 12), ("chr3", 12)], &[], 8);
    let config = config();
    let a = pipeline::run(&contacts, &config, IgnoredPairs::default()).unwrap();
    let b = pipeline::run(&contacts, &config, IgnoredPairs::default()).unwrap();

    assert_eq!(a.sweep.results.len(), b.sweep.results.len());
    for (ra, rb) in a.sweep.results.iter().zip(&b.sweep.results) {
        assert_eq!(ra.assignments, rb.assignments);
        assert_eq!(ra.wcss, rb.wcss);
    }
    assert_eq!(a.cleaned.mapping.num_rows(), a.cleaned.matrix.nrows());
    assert!(a.cleaned.mapping.is_consistent());
}

#[test]
fn test_compressed_columns_cover_every_bin() {
    let contacts = synthetic_contacts(&[("chr1", 12), ("chr2", 12), ("chr3", 12)], &[], 9);
    let config = PipelineConfig {
        compression: 3,
        ..config()
    };
    let (_, built) = Pipeline::new(&contacts, &config).assemble().unwrap();

    assert_eq!(built.matrix.nrows(), 36);
    assert!(built.matrix.ncols() < 36);
    assert_eq!(built.weights.iter().sum::<i32>(), 36);
    assert!(built.weights.iter().all(|&w| (1..=3).contains(&w)));
    assert!(built.mapping.is_consistent());
}
