//! Contact sources
//!
//! The pipeline reads contacts through the [`ContactSource`] trait: per
//! chromosome pair and resolution it yields `(binX, binY, count)` records,
//! raw or normalized, or nothing when the pair has no data. Two sources are
//! provided here: an in-memory store (also used to load whitespace-separated
//! contact files, plain or BGZF) and a wrapper that derives SCALE
//! normalization vectors with the balancer.

use crate::balance::{Balancer, SparseSymmetric};
use crate::config::BalanceConfig;
use crate::genome::{Chromosome, ChromosomeHandler};
use log::{debug, info, warn};
use noodles::bgzf;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::str::FromStr;

/// One aggregated contact between bin `bin_x` of the first chromosome of a
/// pair and bin `bin_y` of the second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactRecord {
    pub bin_x: usize,
    pub bin_y: usize,
    pub count: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Normalization {
    None,
    Scale,
    /// A vector stored by the source under this name
    Named(String),
}

impl FromStr for Normalization {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "NONE" => Normalization::None,
            "SCALE" => Normalization::Scale,
            _ => Normalization::Named(s.to_string()),
        })
    }
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Normalization::None => write!(f, "NONE"),
            Normalization::Scale => write!(f, "SCALE"),
            Normalization::Named(name) => write!(f, "{}", name),
        }
    }
}

pub type RecordIter<'a> = Box<dyn Iterator<Item = ContactRecord> + 'a>;

pub trait ContactSource: Sync {
    fn chromosomes(&self) -> &ChromosomeHandler;

    /// Records of the pair `(a, b)` with `a.index <= b.index`. Self pairs only
    /// report the upper triangle (`bin_x <= bin_y`). `None` means no data.
    fn records(
        &self,
        a: &Chromosome,
        b: &Chromosome,
        resolution: u32,
        norm: &Normalization,
    ) -> Option<RecordIter<'_>>;

    /// Per-bin normalization divisors of `chrom`, if the source has them
    fn norm_vector(
        &self,
        chrom: &Chromosome,
        resolution: u32,
        norm: &Normalization,
    ) -> Option<Vec<f64>>;
}

/// Divide a raw count by the normalization divisors of its two bins.
/// Returns `None` when either divisor is missing, zero or not finite.
fn normalize_count(count: f32, dx: Option<&f64>, dy: Option<&f64>) -> Option<f32> {
    let (dx, dy) = (*dx?, *dy?);
    let denom = dx * dy;
    if !denom.is_finite() || denom <= 0.0 {
        return None;
    }
    let value = count as f64 / denom;
    value.is_finite().then_some(value as f32)
}

/// Contacts held in memory at a single resolution
pub struct InMemoryContacts {
    handler: ChromosomeHandler,
    resolution: u32,
    pairs: FxHashMap<(usize, usize), BTreeMap<(usize, usize), f32>>,
    norm_vectors: FxHashMap<(Normalization, usize), Vec<f64>>,
}

impl InMemoryContacts {
    pub fn new(handler: ChromosomeHandler, resolution: u32) -> Self {
        Self {
            handler,
            resolution,
            pairs: FxHashMap::default(),
            norm_vectors: FxHashMap::default(),
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Add `count` between two bins; duplicates are summed
    pub fn add(&mut self, chrom_a: usize, bin_a: usize, chrom_b: usize, bin_b: usize, count: f32) {
        let (key, bins) = if (chrom_a, bin_a) <= (chrom_b, bin_b) {
            ((chrom_a, chrom_b), (bin_a, bin_b))
        } else {
            ((chrom_b, chrom_a), (bin_b, bin_a))
        };
        *self
            .pairs
            .entry(key)
            .or_default()
            .entry(bins)
            .or_insert(0.0) += count;
    }

    pub fn set_norm_vector(&mut self, norm: Normalization, chrom: usize, vector: Vec<f64>) {
        self.norm_vectors.insert((norm, chrom), vector);
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Load a contact file with lines `chr1 pos1 chr2 pos2 [count]`.
    /// Positions are binned at `resolution`; a missing count means 1.
    /// Files ending in `.gz` or `.bgz` are read as BGZF.
    pub fn from_contact_file(
        path: &str,
        handler: ChromosomeHandler,
        resolution: u32,
    ) -> io::Result<Self> {
        if resolution == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Resolution must be a positive number of base pairs",
            ));
        }
        let file = File::open(path).map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Failed to open contact file '{}': {}", path, e),
            )
        })?;
        let reader: Box<dyn BufRead> = if [".gz", ".bgz"].iter().any(|ext| path.ends_with(ext)) {
            Box::new(BufReader::new(bgzf::io::Reader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut contacts = InMemoryContacts::new(handler, resolution);
        let mut unknown = 0usize;
        let mut loaded = 0usize;
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Invalid contact at line {}: expected at least 4 fields, found {}",
                        line_num + 1,
                        fields.len()
                    ),
                ));
            }
            let parse_pos = |field: &str| -> io::Result<u64> {
                field.parse().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Invalid position '{}' at line {}: {}", field, line_num + 1, e),
                    )
                })
            };
            let pos_a = parse_pos(fields[1])?;
            let pos_b = parse_pos(fields[3])?;
            let count: f32 = match fields.get(4) {
                Some(field) => field.parse().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Invalid count '{}' at line {}: {}", field, line_num + 1, e),
                    )
                })?,
                None => 1.0,
            };
            if count < 0.0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Negative count at line {}", line_num + 1),
                ));
            }

            let (Some(chrom_a), Some(chrom_b)) = (
                contacts.handler.by_name(fields[0]).map(|c| c.index),
                contacts.handler.by_name(fields[2]).map(|c| c.index),
            ) else {
                unknown += 1;
                continue;
            };
            let bin_a = (pos_a / resolution as u64) as usize;
            let bin_b = (pos_b / resolution as u64) as usize;
            contacts.add(chrom_a, bin_a, chrom_b, bin_b, count);
            loaded += 1;
        }

        if unknown > 0 {
            debug!("Skipped {} contacts on chromosomes outside the sizes file", unknown);
        }
        info!(
            "Loaded {} contacts over {} chromosome pairs from {}",
            loaded,
            contacts.pairs.len(),
            path
        );
        Ok(contacts)
    }
}

impl ContactSource for InMemoryContacts {
    fn chromosomes(&self) -> &ChromosomeHandler {
        &self.handler
    }

    fn records(
        &self,
        a: &Chromosome,
        b: &Chromosome,
        resolution: u32,
        norm: &Normalization,
    ) -> Option<RecordIter<'_>> {
        if resolution != self.resolution {
            return None;
        }
        let entries = self.pairs.get(&(a.index, b.index))?;
        let raw = entries.iter().map(|(&(bin_x, bin_y), &count)| ContactRecord {
            bin_x,
            bin_y,
            count,
        });
        match norm {
            Normalization::None => Some(Box::new(raw)),
            _ => {
                let va = self.norm_vectors.get(&(norm.clone(), a.index))?;
                let vb = self.norm_vectors.get(&(norm.clone(), b.index))?;
                Some(Box::new(raw.filter_map(move |r| {
                    normalize_count(r.count, va.get(r.bin_x), vb.get(r.bin_y))
                        .map(|count| ContactRecord { count, ..r })
                })))
            }
        }
    }

    fn norm_vector(
        &self,
        chrom: &Chromosome,
        resolution: u32,
        norm: &Normalization,
    ) -> Option<Vec<f64>> {
        if resolution != self.resolution {
            return None;
        }
        self.norm_vectors.get(&(norm.clone(), chrom.index)).cloned()
    }
}

/// Serves `Normalization::Scale` from vectors computed by balancing each
/// chromosome's raw intra contacts; every other request goes to `inner`.
pub struct ScaleNormalized<'a, S: ContactSource> {
    inner: &'a S,
    resolution: u32,
    vectors: FxHashMap<usize, Vec<f64>>,
}

impl<'a, S: ContactSource> ScaleNormalized<'a, S> {
    pub fn new(inner: &'a S, resolution: u32, config: &BalanceConfig) -> Self {
        let vectors: FxHashMap<usize, Vec<f64>> = inner
            .chromosomes()
            .chromosomes()
            .par_iter()
            .filter_map(|chrom| {
                if let Some(stored) = inner.norm_vector(chrom, resolution, &Normalization::Scale) {
                    return Some((chrom.index, stored));
                }
                let n = chrom.num_bins(resolution);
                let records = inner.records(chrom, chrom, resolution, &Normalization::None)?;
                let matrix = SparseSymmetric::from_records(n, records);
                let target = vec![1.0; n];
                let result = match Balancer::new(config).balance(&matrix, &target) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Skipping SCALE vector for {}: {}", chrom.name, e);
                        return None;
                    }
                };
                debug!(
                    "SCALE vector for {}: converged={} excluded={} iterations={}",
                    chrom.name, result.converged, result.excluded, result.iterations
                );
                // Balancing multiplies; normalization vectors divide
                let divisors = result.scale.iter().map(|&b| 1.0 / b).collect();
                Some((chrom.index, divisors))
            })
            .collect();

        let missing = inner.chromosomes().len() - vectors.len();
        if missing > 0 {
            warn!("No SCALE vector for {} chromosomes without intra contacts", missing);
        }

        Self {
            inner,
            resolution,
            vectors,
        }
    }
}

impl<S: ContactSource> ContactSource for ScaleNormalized<'_, S> {
    fn chromosomes(&self) -> &ChromosomeHandler {
        self.inner.chromosomes()
    }

    fn records(
        &self,
        a: &Chromosome,
        b: &Chromosome,
        resolution: u32,
        norm: &Normalization,
    ) -> Option<RecordIter<'_>> {
        if *norm != Normalization::Scale || resolution != self.resolution {
            return self.inner.records(a, b, resolution, norm);
        }
        let va = self.vectors.get(&a.index)?;
        let vb = self.vectors.get(&b.index)?;
        let raw = self.inner.records(a, b, resolution, &Normalization::None)?;
        Some(Box::new(raw.filter_map(move |r| {
            normalize_count(r.count, va.get(r.bin_x), vb.get(r.bin_y))
                .map(|count| ContactRecord { count, ..r })
        })))
    }

    fn norm_vector(
        &self,
        chrom: &Chromosome,
        resolution: u32,
        norm: &Normalization,
    ) -> Option<Vec<f64>> {
        if *norm == Normalization::Scale && resolution == self.resolution {
            self.vectors.get(&chrom.index).cloned()
        } else {
            self.inner.norm_vector(chrom, resolution, norm)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn two_chromosomes() -> ChromosomeHandler {
        ChromosomeHandler::new(vec![("chr1", 1000), ("chr2", 500)])
    }

    #[test]
    fn test_add_canonicalizes_pair_order() {
        let mut contacts = InMemoryContacts::new(two_chromosomes(), 100);
        contacts.add(1, 3, 0, 7, 2.0);
        contacts.add(0, 7, 1, 3, 1.0);

        let handler = two_chromosomes();
        let a = handler.get(0).unwrap();
        let b = handler.get(1).unwrap();
        let records: Vec<ContactRecord> = contacts
            .records(a, b, 100, &Normalization::None)
            .unwrap()
            .collect();
        assert_eq!(
            records,
            vec![ContactRecord {
                bin_x: 7,
                bin_y: 3,
                count: 3.0
            }]
        );
        assert!(contacts.records(a, b, 50, &Normalization::None).is_none());
        assert!(contacts.records(a, a, 100, &Normalization::None).is_none());
    }

    #[test]
    fn test_named_normalization_divides_and_drops_nan() {
        let handler = two_chromosomes();
        let mut contacts = InMemoryContacts::new(handler.clone(), 100);
        contacts.add(0, 0, 0, 1, 8.0);
        contacts.add(0, 1, 0, 2, 8.0);
        let mut vector = vec![2.0; 10];
        vector[2] = f64::NAN;
        let kr = Normalization::Named("KR".to_string());
        contacts.set_norm_vector(kr.clone(), 0, vector);

        let chr1 = handler.get(0).unwrap();
        let records: Vec<ContactRecord> = contacts.records(chr1, chr1, 100, &kr).unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2.0);
    }

    #[test]
    fn test_normalization_from_str() {
        assert_eq!("none".parse::<Normalization>().unwrap(), Normalization::None);
        assert_eq!("SCALE".parse::<Normalization>().unwrap(), Normalization::Scale);
        assert_eq!(
            "VC_SQRT".parse::<Normalization>().unwrap(),
            Normalization::Named("VC_SQRT".to_string())
        );
    }

    #[test]
    fn test_contact_file_binning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "# chr1 pos1 chr2 pos2 count").unwrap();
        writeln!(file, "chr1\t150\tchr2\t20\t4").unwrap();
        writeln!(file, "chr2\t99\tchr1\t101").unwrap();
        writeln!(file, "chrUn\t5\tchr1\t5\t9").unwrap();

        let contacts =
            InMemoryContacts::from_contact_file(path.to_str().unwrap(), two_chromosomes(), 100)
                .unwrap();
        let handler = two_chromosomes();
        let records: Vec<ContactRecord> = contacts
            .records(handler.get(0).unwrap(), handler.get(1).unwrap(), 100, &Normalization::None)
            .unwrap()
            .collect();
        assert_eq!(
            records,
            vec![ContactRecord {
                bin_x: 1,
                bin_y: 0,
                count: 5.0
            }]
        );
    }

    #[test]
    fn test_contact_file_rejects_zero_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "chr1\t150\tchr2\t20\t4").unwrap();

        let err = InMemoryContacts::from_contact_file(path.to_str().unwrap(), two_chromosomes(), 0)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_scale_vectors_flatten_uniform_chromosome() {
        let handler = ChromosomeHandler::new(vec![("chr1", 400)]);
        let mut contacts = InMemoryContacts::new(handler.clone(), 100);
        for i in 0..4 {
            for j in i..4 {
                contacts.add(0, i, 0, j, 10.0);
            }
        }
        let scaled = ScaleNormalized::new(&contacts, 100, &BalanceConfig::default());
        let chr1 = handler.get(0).unwrap();
        let vector = scaled.norm_vector(chr1, 100, &Normalization::Scale).unwrap();
        assert_eq!(vector.len(), 4);
        for v in &vector {
            assert!((v - vector[0]).abs() < 1e-6);
        }

        let mut row_sums = vec![0.0f64; 4];
        for r in scaled.records(chr1, chr1, 100, &Normalization::Scale).unwrap() {
            row_sums[r.bin_x] += r.count as f64;
            if r.bin_x != r.bin_y {
                row_sums[r.bin_y] += r.count as f64;
            }
        }
        for sum in row_sums {
            assert!((sum - 1.0).abs() < 1e-3, "row sum {}", sum);
        }
    }
}
