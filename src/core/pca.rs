//! Variance spectrum of recorded layer activity.
//!
//! Used as a periodic diagnostic of how many dimensions a hidden layer's
//! representation actually spans. Eigenvalues come from cyclic Jacobi
//! rotations on the (small, dense) covariance matrix.

use crate::stats::Stats;

/// Eigenvalues below this count as weak components.
pub const STRONG_THRESHOLD: f64 = 0.01;

const MAX_SWEEPS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcaSummary {
    /// Eigenvalues, largest first.
    pub values: Vec<f64>,
    pub n_strong: usize,
    pub top5: f64,
    pub next5: f64,
    pub rest: f64,
}

impl PcaSummary {
    pub fn write_to(&self, stats: &mut Stats, layer: &str) {
        stats.set_float(&format!("{layer}_PCA_NStrong"), self.n_strong as f64);
        stats.set_float(&format!("{layer}_PCA_Top5"), self.top5);
        stats.set_float(&format!("{layer}_PCA_Next5"), self.next5);
        stats.set_float(&format!("{layer}_PCA_Rest"), self.rest);
    }
}

/// Sample covariance of `samples` (rows are observations).
pub fn covariance(samples: &[Vec<f32>]) -> Vec<Vec<f64>> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    let d = first.len();
    let n = samples.len() as f64;

    let mut mean = vec![0.0f64; d];
    for row in samples {
        for (m, &x) in mean.iter_mut().zip(row) {
            *m += x as f64;
        }
    }
    for m in &mut mean {
        *m /= n;
    }

    let mut cov = vec![vec![0.0f64; d]; d];
    for row in samples {
        for i in 0..d {
            let di = row[i] as f64 - mean[i];
            if di == 0.0 {
                continue;
            }
            for j in i..d {
                cov[i][j] += di * (row[j] as f64 - mean[j]);
            }
        }
    }
    for i in 0..d {
        for j in i..d {
            cov[i][j] /= n;
            cov[j][i] = cov[i][j];
        }
    }
    cov
}

/// Eigenvalues of a symmetric matrix, largest first.
pub fn symmetric_eigenvalues(mut a: Vec<Vec<f64>>) -> Vec<f64> {
    let n = a.len();
    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        if off < 1e-18 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p][q];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
            }
        }
    }
    let mut values: Vec<f64> = (0..n).map(|i| a[i][i]).collect();
    values.sort_by(|x, y| y.partial_cmp(x).unwrap_or(core::cmp::Ordering::Equal));
    values
}

/// Spectrum summary of the covariance of `samples`.
pub fn summarize(samples: &[Vec<f32>]) -> PcaSummary {
    let values = symmetric_eigenvalues(covariance(samples));
    let n_strong = values
        .iter()
        .position(|&v| v < STRONG_THRESHOLD)
        .unwrap_or(values.len());

    let mean_of = |range: core::ops::Range<usize>| -> f64 {
        let range = range.start.min(values.len())..range.end.min(values.len());
        if range.is_empty() {
            return 0.0;
        }
        let len = range.len() as f64;
        values[range].iter().sum::<f64>() / len
    };

    PcaSummary {
        top5: mean_of(0..5),
        next5: mean_of(5..10),
        rest: mean_of(10..values.len()),
        n_strong,
        values,
    }
}
