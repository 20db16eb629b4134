use crate::cluster::distance::Metric;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::stats::finite_median;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::Rng;

/// Matrix rows stored contiguously, one point per row
#[derive(Debug, Clone)]
pub struct Points {
    len: usize,
    dim: usize,
    data: Vec<f32>,
}

impl Points {
    pub fn from_matrix(matrix: &DMatrix<f32>) -> Self {
        // Column-major storage of the transpose is the row-major matrix
        let transposed = matrix.transpose();
        Self {
            len: matrix.nrows(),
            dim: matrix.ncols(),
            data: transposed.as_slice().to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn point(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

/// Outcome of one seeded run
#[derive(Debug, Clone)]
pub struct ClusterRun {
    /// Cluster of each point (ids `0..num_clusters()`); `None` for points
    /// with no coordinate comparable to any center
    pub assignments: Vec<Option<usize>>,
    pub centers: Vec<Vec<f32>>,
    /// Distance of each point to its center, NaN when unassigned
    pub distances: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl ClusterRun {
    pub fn num_clusters(&self) -> usize {
        self.centers.len()
    }

    /// Sum of point-to-center distances divided by the number of clusters
    pub fn wcss(&self) -> f64 {
        if self.centers.is_empty() {
            return f64::INFINITY;
        }
        let total: f64 = self.distances.iter().filter(|d| d.is_finite()).sum();
        total / self.num_clusters() as f64
    }
}

/// K-means (Euclidean, mean centers) or k-medians (Manhattan, median
/// centers) over a shared, read-only set of points
pub struct KMeans<'a> {
    points: &'a Points,
    metric: Metric,
    max_iter: usize,
    pool: &'a WorkerPool,
}

impl<'a> KMeans<'a> {
    pub fn new(points: &'a Points, metric: Metric, max_iter: usize, pool: &'a WorkerPool) -> Self {
        Self {
            points,
            metric,
            max_iter,
            pool,
        }
    }

    /// Cluster into at most `k` groups. Centers that lose all their members
    /// are dropped for the rest of the run, so fewer than `k` clusters can
    /// come back.
    pub fn run(&self, k: usize, rng: &mut StdRng) -> Result<ClusterRun> {
        let n = self.points.len();
        if n == 0 || k == 0 {
            return Ok(ClusterRun {
                assignments: vec![None; n],
                centers: Vec::new(),
                distances: vec![f64::NAN; n],
                iterations: 0,
                converged: true,
            });
        }

        let mut centers: Vec<Option<Vec<f32>>> = self.seed_centers(k, rng)?.into_iter().map(Some).collect();
        let mut assignments: Vec<Option<usize>> = vec![None; n];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iter {
            iterations += 1;
            let next = self
                .pool
                .map_rows("cluster assignment", n, |i| self.nearest(&centers, self.points.point(i)))?;
            let changes = next.iter().zip(&assignments).filter(|(a, b)| a != b).count();
            assignments = next;
            if changes == 0 {
                converged = true;
                break;
            }
            self.update_centers(&mut centers, &assignments)?;
        }

        let distances = self.pool.map_rows("cluster distances", n, |i| {
            assignments[i]
                .and_then(|c| centers[c].as_ref())
                .map_or(f64::NAN, |center| self.metric.distance(self.points.point(i), center))
        })?;

        // Compact ids over the centers that still have members
        let mut members = vec![0usize; centers.len()];
        for c in assignments.iter().flatten() {
            members[*c] += 1;
        }
        let mut remap = vec![None; centers.len()];
        let mut kept = Vec::new();
        for (c, center) in centers.into_iter().enumerate() {
            if let Some(center) = center.filter(|_| members[c] > 0) {
                remap[c] = Some(kept.len());
                kept.push(center);
            }
        }
        let assignments = assignments.iter().map(|a| a.and_then(|c| remap[c])).collect();

        Ok(ClusterRun {
            assignments,
            centers: kept,
            distances,
            iterations,
            converged,
        })
    }

    /// Farthest-point seeding: a random first center among the points with
    /// any finite coordinate, then repeatedly the point farthest from its
    /// nearest center. Stops early when no point is at a positive distance
    /// from the chosen ones.
    fn seed_centers(&self, k: usize, rng: &mut StdRng) -> Result<Vec<Vec<f32>>> {
        let n = self.points.len();
        let candidates: Vec<usize> = (0..n)
            .filter(|&i| self.points.point(i).iter().any(|v| v.is_finite()))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let first = candidates[rng.gen_range(0..candidates.len())];
        let mut chosen = vec![first];
        let mut nearest = self.pool.map_rows("cluster seeding", n, |i| {
            self.metric.distance(self.points.point(i), self.points.point(first))
        })?;

        while chosen.len() < k {
            let farthest = nearest
                .iter()
                .enumerate()
                .filter(|(_, d)| d.is_finite() && **d > 0.0)
                .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)));
            let Some((next, _)) = farthest else {
                break;
            };
            chosen.push(next);
            let to_next = self.pool.map_rows("cluster seeding", n, |i| {
                self.metric.distance(self.points.point(i), self.points.point(next))
            })?;
            for (d, new) in nearest.iter_mut().zip(to_next) {
                if new.is_finite() && (d.is_nan() || new < *d) {
                    *d = new;
                }
            }
        }
        Ok(chosen.iter().map(|&i| self.points.point(i).to_vec()).collect())
    }

    fn nearest(&self, centers: &[Option<Vec<f32>>], point: &[f32]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (c, center) in centers.iter().enumerate() {
            let Some(center) = center else { continue };
            let d = self.metric.distance(point, center);
            if d.is_nan() {
                continue;
            }
            match best {
                Some((_, best_d)) if best_d <= d => {}
                _ => best = Some((c, d)),
            }
        }
        best.map(|(c, _)| c)
    }

    /// Runs only after a complete assignment pass
    fn update_centers(&self, centers: &mut [Option<Vec<f32>>], assignments: &[Option<usize>]) -> Result<()> {
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); centers.len()];
        for (i, c) in assignments.iter().enumerate() {
            if let Some(c) = c {
                members[*c].push(i);
            }
        }
        let updated = self.pool.map_rows("cluster center update", centers.len(), |c| {
            (centers[c].is_some() && !members[c].is_empty()).then(|| self.center_of(&members[c]))
        })?;
        for (center, new) in centers.iter_mut().zip(updated) {
            *center = new;
        }
        Ok(())
    }

    /// Coordinate-wise mean or median of the members' finite values
    fn center_of(&self, members: &[usize]) -> Vec<f32> {
        let mut values = Vec::with_capacity(members.len());
        (0..self.points.dim())
            .map(|j| {
                values.clear();
                values.extend(
                    members
                        .iter()
                        .map(|&i| self.points.point(i)[j])
                        .filter(|v| v.is_finite()),
                );
                match self.metric {
                    Metric::Euclidean if values.is_empty() => f32::NAN,
                    Metric::Euclidean => {
                        (values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64) as f32
                    }
                    Metric::Manhattan => finite_median(&mut values).unwrap_or(f32::NAN),
                }
            })
            .collect()
    }
}
