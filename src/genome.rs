use log::debug;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chromosome {
    pub index: usize,
    pub name: String,
    pub length: u64,
}

impl Chromosome {
    /// Number of bins at `resolution`, the last one possibly shorter
    pub fn num_bins(&self, resolution: u32) -> usize {
        let res = resolution as u64;
        self.length.div_ceil(res) as usize
    }

    pub fn bin_interval(&self, bin: usize, resolution: u32) -> GenomicInterval {
        let start = bin as u64 * resolution as u64;
        GenomicInterval {
            chrom: self.index,
            start,
            end: (start + resolution as u64).min(self.length),
        }
    }
}

/// Half-open genomic interval on the chromosome with handler index `chrom`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenomicInterval {
    pub chrom: usize,
    pub start: u64,
    pub end: u64,
}

/// Ordered chromosome set. Indices are positions in this set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromosomeHandler {
    chromosomes: Vec<Chromosome>,
    name_to_index: FxHashMap<String, usize>,
}

impl ChromosomeHandler {
    pub fn new<S: Into<String>>(sizes: Vec<(S, u64)>) -> Self {
        let chromosomes: Vec<Chromosome> = sizes
            .into_iter()
            .enumerate()
            .map(|(index, (name, length))| Chromosome {
                index,
                name: name.into(),
                length,
            })
            .collect();
        let name_to_index = chromosomes
            .iter()
            .map(|c| (c.name.clone(), c.index))
            .collect();
        Self {
            chromosomes,
            name_to_index,
        }
    }

    /// Load `name<TAB>length` lines, naturally sorted by name.
    /// Names matching `exclude` are dropped.
    pub fn from_sizes_file(path: &str, exclude: Option<&Regex>) -> io::Result<Self> {
        let file = File::open(path).map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Failed to open chromosome sizes file '{}': {}", path, e),
            )
        })?;
        let reader = BufReader::new(file);

        let mut sizes: Vec<(String, u64)> = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(name), Some(length)) = (fields.next(), fields.next()) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Expected 'name length' at line {} of {}", line_num + 1, path),
                ));
            };
            let length: u64 = length.parse().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid length at line {} of {}: {}", line_num + 1, path, e),
                )
            })?;
            if exclude.is_some_and(|re| re.is_match(name)) {
                debug!("Excluding chromosome {}", name);
                continue;
            }
            sizes.push((name.to_string(), length));
        }

        if sizes.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("No chromosomes left in {}", path),
            ));
        }

        sizes.sort_by(|a, b| natord::compare(&a.0, &b.0));
        Ok(Self::new(sizes))
    }

    pub fn len(&self) -> usize {
        self.chromosomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chromosomes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Chromosome> {
        self.chromosomes.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Chromosome> {
        self.name_to_index
            .get(name)
            .map(|&index| &self.chromosomes[index])
    }

    pub fn name(&self, index: usize) -> &str {
        &self.chromosomes[index].name
    }

    pub fn chromosomes(&self) -> &[Chromosome] {
        &self.chromosomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bin_intervals_clip_to_chromosome_end() {
        let chrom = Chromosome {
            index: 0,
            name: "chr1".to_string(),
            length: 250,
        };
        assert_eq!(chrom.num_bins(100), 3);
        assert_eq!(
            chrom.bin_interval(2, 100),
            GenomicInterval {
                chrom: 0,
                start: 200,
                end: 250
            }
        );
    }

    #[test]
    fn test_sizes_file_natural_order_and_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizes.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "chr10\t1000").unwrap();
        writeln!(file, "chr2\t2000").unwrap();
        writeln!(file, "chrM\t16").unwrap();
        writeln!(file, "chr1\t3000").unwrap();

        let exclude = Regex::new("^chrM$").unwrap();
        let handler =
            ChromosomeHandler::from_sizes_file(path.to_str().unwrap(), Some(&exclude)).unwrap();
        let names: Vec<&str> = handler.chromosomes().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["chr1", "chr2", "chr10"]);
        assert_eq!(handler.by_name("chr2").unwrap().index, 1);
        assert!(handler.by_name("chrM").is_none());
    }
}
