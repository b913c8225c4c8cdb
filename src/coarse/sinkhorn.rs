//! Log-domain optimal transport with a dustbin row and column.

use crate::util::math::log_sum_exp;
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};

/// Runs `iters` Sinkhorn iterations on `scores` `(M, N)` augmented with a
/// dustbin filled with `bin_score`.
///
/// Returns the `(M + 1, N + 1)` log assignment, shifted so that a perfect
/// one-to-one assignment has entries near zero.
pub fn log_optimal_transport(
    scores: ArrayView2<'_, f32>,
    bin_score: f32,
    iters: usize,
) -> Array2<f32> {
    let (m, n) = scores.dim();
    let mut couplings = Array2::from_elem((m + 1, n + 1), bin_score);
    couplings.slice_mut(s![..m, ..n]).assign(&scores);

    let norm = -((m + n) as f32).ln();
    let mut log_mu = vec![norm; m + 1];
    log_mu[m] = (n as f32).ln() + norm;
    let mut log_nu = vec![norm; n + 1];
    log_nu[n] = (m as f32).ln() + norm;

    let mut u = vec![0.0f32; m + 1];
    let mut v = vec![0.0f32; n + 1];
    for _ in 0..iters {
        for (r, row) in couplings.axis_iter(Axis(0)).enumerate() {
            u[r] = log_mu[r] - log_sum_exp(row.iter().zip(&v).map(|(&z, &vc)| z + vc));
        }
        for (c, col) in couplings.axis_iter(Axis(1)).enumerate() {
            v[c] = log_nu[c] - log_sum_exp(col.iter().zip(&u).map(|(&z, &ur)| z + ur));
        }
    }

    Array2::from_shape_fn((m + 1, n + 1), |(r, c)| couplings[[r, c]] + u[r] + v[c] - norm)
}

fn argmax(lane: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in lane.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = idx;
        }
    }
    best
}

/// Assignment probabilities without the dustbin, `(M, N)`.
///
/// With `prefilter`, rows whose best assignment is the dustbin column and
/// columns whose best assignment is the dustbin row are zeroed.
pub fn sinkhorn_confidence(
    scores: ArrayView2<'_, f32>,
    bin_score: f32,
    iters: usize,
    prefilter: bool,
) -> Array2<f32> {
    let (m, n) = scores.dim();
    let assign = log_optimal_transport(scores, bin_score, iters).mapv(f32::exp);
    let mut conf = assign.slice(s![..m, ..n]).to_owned();
    if prefilter {
        for r in 0..m {
            if argmax(assign.row(r)) == n {
                conf.row_mut(r).fill(0.0);
            }
        }
        for c in 0..n {
            if argmax(assign.column(c)) == m {
                conf.column_mut(c).fill(0.0);
            }
        }
    }
    conf
}

#[cfg(test)]
mod tests {
    use super::{log_optimal_transport, sinkhorn_confidence};
    use ndarray::{arr2, Array2, Axis};

    #[test]
    fn converged_marginals_match_targets() {
        let scores = arr2(&[[4.0f32, 0.0, 0.0], [0.0, 4.0, 0.0]]);
        let z = log_optimal_transport(scores.view(), 1.0, 100).mapv(f32::exp);
        // Scaled back by (M + N): real rows and columns carry unit mass.
        let rows = z.sum_axis(Axis(1));
        let cols = z.sum_axis(Axis(0));
        for r in 0..2 {
            assert!((rows[r] - 1.0).abs() < 1e-3);
        }
        for c in 0..3 {
            assert!((cols[c] - 1.0).abs() < 1e-3);
        }
        assert!((rows[2] - 3.0).abs() < 1e-3);
        assert!((cols[3] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn confidence_is_finite_and_non_negative() {
        let scores = Array2::from_shape_fn((4, 5), |(i, j)| (i as f32 - j as f32).sin() * 3.0);
        let conf = sinkhorn_confidence(scores.view(), 0.5, 3, false);
        assert_eq!(conf.dim(), (4, 5));
        assert!(conf.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn prefilter_zeroes_rows_that_prefer_the_dustbin() {
        let scores = arr2(&[[5.0f32, -5.0], [-5.0, -5.0]]);
        let conf = sinkhorn_confidence(scores.view(), 2.0, 20, true);
        assert!(conf[[0, 0]] > 0.5);
        assert_eq!(conf[[1, 0]], 0.0);
        assert_eq!(conf[[1, 1]], 0.0);
    }
}
