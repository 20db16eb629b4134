//! Snapshot of an assembled matrix
//!
//! Building the matrix dominates a run, so the builder's output can be saved
//! and reloaded. The file is `MAGIC`, then a bincode payload holding a format
//! version, the configuration it was built with, the chromosome set, the
//! matrix data and the mapping.

use crate::builder::BuiltMatrix;
use crate::config::PipelineConfig;
use crate::error::{Result, SubcompError};
use crate::genome::ChromosomeHandler;
use crate::mapping::BinIndexMap;
use log::{debug, info};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"SUBCMAT1";
const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredMatrix {
    rows: usize,
    cols: usize,
    /// Column-major
    data: Vec<f32>,
}

impl From<&DMatrix<f32>> for StoredMatrix {
    fn from(m: &DMatrix<f32>) -> Self {
        Self {
            rows: m.nrows(),
            cols: m.ncols(),
            data: m.as_slice().to_vec(),
        }
    }
}

impl StoredMatrix {
    fn into_matrix(self) -> Result<DMatrix<f32>> {
        if self.data.len() != self.rows * self.cols {
            return Err(SubcompError::Cache(format!(
                "matrix of {} x {} holds {} values",
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        Ok(DMatrix::from_vec(self.rows, self.cols, self.data))
    }
}

#[derive(Serialize, Deserialize)]
struct MatrixCache {
    version: u32,
    config: PipelineConfig,
    chromosomes: ChromosomeHandler,
    matrix: StoredMatrix,
    intra: Option<StoredMatrix>,
    weights: Vec<i32>,
    mapping: BinIndexMap,
}

/// A reloaded snapshot
#[derive(Debug, Clone)]
pub struct CachedMatrix {
    pub built: BuiltMatrix,
    pub config: PipelineConfig,
    pub chromosomes: ChromosomeHandler,
}

pub fn save(
    path: &Path,
    built: &BuiltMatrix,
    config: &PipelineConfig,
    chromosomes: &ChromosomeHandler,
) -> Result<()> {
    let cache = MatrixCache {
        version: VERSION,
        config: config.clone(),
        chromosomes: chromosomes.clone(),
        matrix: StoredMatrix::from(&built.matrix),
        intra: built.intra.as_ref().map(StoredMatrix::from),
        weights: built.weights.clone(),
        mapping: built.mapping.clone(),
    };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    bincode::serde::encode_into_std_write(&cache, &mut writer, bincode::config::standard())
        .map_err(|e| SubcompError::Cache(format!("Failed to serialize {:?}: {}", path, e)))?;
    writer.flush()?;
    info!(
        "Saved {} x {} matrix to {:?}",
        built.matrix.nrows(),
        built.matrix.ncols(),
        path
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<CachedMatrix> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(SubcompError::Cache(format!("Invalid magic bytes in {:?}", path)));
    }

    let cache: MatrixCache =
        bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| SubcompError::Cache(format!("Failed to load {:?}: {}", path, e)))?;
    if cache.version != VERSION {
        return Err(SubcompError::Cache(format!(
            "{:?} has format version {}, expected {}",
            path, cache.version, VERSION
        )));
    }

    let matrix = cache.matrix.into_matrix()?;
    let intra = cache.intra.map(StoredMatrix::into_matrix).transpose()?;
    if matrix.nrows() != cache.mapping.num_rows() || matrix.ncols() != cache.weights.len() {
        return Err(SubcompError::Cache(format!(
            "{:?}: matrix shape {:?} disagrees with its mapping",
            path,
            matrix.shape()
        )));
    }
    debug!("Loaded {} x {} matrix from {:?}", matrix.nrows(), matrix.ncols(), path);

    Ok(CachedMatrix {
        built: BuiltMatrix {
            matrix,
            intra,
            weights: cache.weights,
            mapping: cache.mapping,
        },
        config: cache.config,
        chromosomes: cache.chromosomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bad_index::BadIndices;

    fn handler() -> ChromosomeHandler {
        ChromosomeHandler::new(vec![("chr1", 200), ("chr2", 100)])
    }

    fn built() -> BuiltMatrix {
        let mapping = BinIndexMap::build(handler().chromosomes(), 2, 100, &BadIndices::new(100), None);
        BuiltMatrix {
            matrix: DMatrix::from_row_slice(3, 3, &[f32::NAN, f32::NAN, 1.0, f32::NAN, f32::NAN, 2.0, 1.0, 2.0, f32::NAN]),
            intra: Some(DMatrix::from_element(3, 3, 0.5)),
            weights: vec![1, 1, 1],
            mapping,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.subcomp");
        let config = PipelineConfig {
            resolution: 100,
            ..PipelineConfig::default()
        };
        let original = built();
        save(&path, &original, &config, &handler()).unwrap();

        let cached = load(&path).unwrap();
        assert_eq!(cached.config.resolution, 100);
        assert_eq!(cached.chromosomes.name(1), "chr2");
        let loaded = cached.built;
        assert_eq!(loaded.matrix.shape(), (3, 3));
        assert_eq!(loaded.matrix[(0, 2)], 1.0);
        assert!(loaded.matrix[(0, 0)].is_nan());
        assert_eq!(loaded.intra, original.intra);
        assert_eq!(loaded.weights, original.weights);
        assert_eq!(loaded.mapping.row(1, 0), Some(2));
        assert!(loaded.mapping.is_consistent());
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-cache");
        std::fs::write(&path, b"NOTMAGIC and some bytes").unwrap();
        assert!(matches!(load(&path), Err(SubcompError::Cache(_))));
    }
}
