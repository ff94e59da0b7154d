//! Host-side golden models and result comparison.

use crate::kernels::kmeans::EmptyClusterPolicy;

/// Accepted deviation between a result and its golden value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

impl Tolerance {
    pub const EXACT: Self = Self { abs: 0.0, rel: 0.0 };

    pub fn abs(abs: f64) -> Self {
        Self { abs, rel: 0.0 }
    }

    pub fn rel(rel: f64) -> Self {
        Self { abs: 0.0, rel }
    }

    /// Whether `actual` is close enough to `golden`. NaN is never accepted.
    pub fn accepts(&self, actual: f64, golden: f64) -> bool {
        if actual == golden {
            return true;
        }
        let diff = (actual - golden).abs();
        diff <= self.abs || diff <= self.rel * golden.abs()
    }
}

/// Number of elements outside `tol`. Missing or extra elements count too.
pub fn count_mismatches(actual: &[f64], golden: &[f64], tol: Tolerance) -> usize {
    let mut errors = actual.len().abs_diff(golden.len());
    for (i, (&a, &g)) in actual.iter().zip(golden).enumerate() {
        if !tol.accepts(a, g) {
            if errors < 8 {
                log::debug!("mismatch at {}: got {}, expected {}", i, a, g);
            }
            errors += 1;
        }
    }
    errors
}

pub fn axpy_golden(a: f64, x: &[f64], y: &[f64]) -> Vec<f64> {
    x.iter().zip(y).map(|(&xi, &yi)| a * xi + yi).collect()
}

/// `alpha * op(A) * op(B) + beta * C` in row-major order.
///
/// With `transa` A is stored K x M, with `transb` B is stored N x K.
/// `beta == 0` ignores `c` entirely.
#[allow(clippy::too_many_arguments)]
pub fn gemm_golden(
    m: usize,
    n: usize,
    k: usize,
    alpha: f64,
    a: &[f64],
    transa: bool,
    b: &[f64],
    transb: bool,
    beta: f64,
    c: &[f64],
) -> Vec<f64> {
    let a_at = |i: usize, kk: usize| if transa { a[kk * m + i] } else { a[i * k + kk] };
    let b_at = |kk: usize, j: usize| if transb { b[j * k + kk] } else { b[kk * n + j] };
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let acc: f64 = (0..k).map(|kk| a_at(i, kk) * b_at(kk, j)).sum();
            let old = if beta != 0.0 { beta * c[i * n + j] } else { 0.0 };
            out[i * n + j] = alpha * acc + old;
        }
    }
    out
}

/// `Z = X * W`, or `Z = Z + X * W` when `z` is non-empty, in single
/// precision. X is M x N, W is N x K.
pub fn hwpe_matmul_golden(x: &[f32], w: &[f32], z: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * k];
    for i in 0..m {
        for j in 0..k {
            let mut acc = z.get(i * k + j).copied().unwrap_or(0.0);
            for p in 0..n {
                acc += x[i * n + p] * w[p * k + j];
            }
            out[i * k + j] = acc;
        }
    }
    out
}

/// Result of [`kmeans_golden`].
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansGolden {
    pub centroids: Vec<f64>,
    pub counts: Vec<u32>,
}

/// Lloyd's algorithm on the host with the same tie-breaking as the kernel:
/// the first centroid at minimal distance wins.
pub fn kmeans_golden(
    samples: &[f64],
    n_features: usize,
    initial: &[f64],
    n_iter: usize,
    policy: EmptyClusterPolicy,
) -> KMeansGolden {
    let f = n_features;
    let k = initial.len() / f;
    let mut centroids = initial.to_vec();
    let mut counts = vec![0u32; k];
    for _ in 0..n_iter {
        let mut sums = vec![0.0; k * f];
        counts.iter_mut().for_each(|c| *c = 0);
        for sample in samples.chunks_exact(f) {
            let mut best = 0;
            let mut min_dist = f64::INFINITY;
            for (c, centroid) in centroids.chunks_exact(f).enumerate() {
                let dist: f64 = sample.iter().zip(centroid).map(|(x, y)| (x - y) * (x - y)).sum();
                if dist < min_dist {
                    min_dist = dist;
                    best = c;
                }
            }
            counts[best] += 1;
            for (acc, x) in sums[best * f..(best + 1) * f].iter_mut().zip(sample) {
                *acc += x;
            }
        }
        for (c, &count) in counts.iter().enumerate() {
            let centroid = &mut centroids[c * f..(c + 1) * f];
            if count == 0 && policy == EmptyClusterPolicy::KeepPrevious {
                continue;
            }
            for (dst, sum) in centroid.iter_mut().zip(&sums[c * f..(c + 1) * f]) {
                *dst = sum / count as f64;
            }
        }
    }
    KMeansGolden { centroids, counts }
}

/// Verification summary of one application run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppOutcome {
    pub errors: usize,
    pub checked: usize,
}

impl AppOutcome {
    pub fn new(errors: usize, checked: usize) -> Self {
        Self { errors, checked }
    }

    pub fn passed(&self) -> bool {
        self.errors == 0
    }

    /// Process exit code: 0 on pass, 1 on failure.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.passed())
    }
}

impl std::ops::Add for AppOutcome {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.errors + rhs.errors, self.checked + rhs.checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance() {
        assert!(Tolerance::EXACT.accepts(1.0, 1.0));
        assert!(!Tolerance::EXACT.accepts(1.0, 1.0 + f64::EPSILON));
        assert!(Tolerance::abs(1e-9).accepts(1.0, 1.0 + 1e-12));
        assert!(Tolerance::rel(1e-10).accepts(1e6, 1e6 + 1e-5));
        assert!(!Tolerance::rel(1e-10).accepts(f64::NAN, 1.0));
    }

    #[test]
    fn test_count_mismatches() {
        assert_eq!(count_mismatches(&[1.0, 2.0, 3.0], &[1.0, 2.5, 3.0], Tolerance::EXACT), 1);
        assert_eq!(count_mismatches(&[1.0], &[1.0, 2.0], Tolerance::EXACT), 1);
    }

    #[test]
    fn test_gemm_golden_transposes_agree() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2 x 3
        let at = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]; // 3 x 2
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0]; // 3 x 2
        let bt = [1.0, 0.0, 1.0, 0.0, 1.0, 1.0]; // 2 x 3
        let plain = gemm_golden(2, 2, 3, 1.0, &a, false, &b, false, 0.0, &[]);
        assert_eq!(plain, vec![4.0, 5.0, 10.0, 11.0]);
        assert_eq!(gemm_golden(2, 2, 3, 1.0, &at, true, &bt, true, 0.0, &[]), plain);
        let acc = gemm_golden(2, 2, 3, 2.0, &a, false, &b, false, 1.0, &[1.0; 4]);
        assert_eq!(acc, vec![9.0, 11.0, 21.0, 23.0]);
    }

    #[test]
    fn test_kmeans_golden_two_points() {
        let samples = [0.0, 0.0, 0.0, 1.0, 10.0, 10.0, 10.0, 11.0];
        let g = kmeans_golden(&samples, 2, &[0.0, 0.0, 9.0, 9.0], 3, EmptyClusterPolicy::KeepPrevious);
        assert_eq!(g.counts, vec![2, 2]);
        assert_eq!(g.centroids, vec![0.0, 0.5, 10.0, 10.5]);
    }

    #[test]
    fn test_kmeans_golden_empty_cluster() {
        let samples = [0.0, 1.0];
        let keep = kmeans_golden(&samples, 1, &[0.5, 100.0], 1, EmptyClusterPolicy::KeepPrevious);
        assert_eq!(keep.centroids, vec![0.5, 100.0]);
        let nan = kmeans_golden(&samples, 1, &[0.5, 100.0], 1, EmptyClusterPolicy::Propagate);
        assert!(nan.centroids[1].is_nan());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppOutcome::new(0, 10).exit_code(), 0);
        assert_eq!((AppOutcome::new(0, 10) + AppOutcome::new(2, 5)).exit_code(), 1);
    }
}
