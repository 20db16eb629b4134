use crate::config::ClusterMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Mean squared difference over comparable coordinates
    Euclidean,
    /// Mean absolute difference over comparable coordinates
    Manhattan,
}

impl Metric {
    pub fn for_method(method: ClusterMethod) -> Self {
        match method {
            ClusterMethod::KMeans => Metric::Euclidean,
            ClusterMethod::KMedians => Metric::Manhattan,
        }
    }

    /// Distance between two points, skipping coordinates where either one is
    /// NaN and dividing by the number of coordinates compared. NaN when no
    /// coordinate is comparable.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        let mut sum = 0.0;
        let mut compared = 0usize;
        for (&x, &y) in a.iter().zip(b) {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            let diff = (x - y) as f64;
            sum += match self {
                Metric::Euclidean => diff * diff,
                Metric::Manhattan => diff.abs(),
            };
            compared += 1;
        }
        if compared == 0 {
            f64::NAN
        } else {
            sum / compared as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_coordinates_are_skipped() {
        let a = [1.0, f32::NAN, 3.0, 0.0];
        let b = [2.0, 5.0, 1.0, f32::NAN];
        assert_eq!(Metric::Euclidean.distance(&a, &b), 2.5);
        assert_eq!(Metric::Manhattan.distance(&a, &b), 1.5);
    }

    #[test]
    fn test_no_comparable_coordinates() {
        let a = [f32::NAN, 1.0];
        let b = [2.0, f32::NAN];
        assert!(Metric::Euclidean.distance(&a, &b).is_nan());
        assert!(Metric::Manhattan.distance(&[], &[]).is_nan());
    }

    #[test]
    fn test_metric_for_method() {
        assert_eq!(Metric::for_method(ClusterMethod::KMeans), Metric::Euclidean);
        assert_eq!(Metric::for_method(ClusterMethod::KMedians), Metric::Manhattan);
    }
}
