//! Numeric helpers shared by the attention, coarse and fine stages.

use ndarray::ArrayViewMut1;

/// Value written into excluded score entries before a softmax.
///
/// Finite so that a lane where every entry is excluded still normalizes to a
/// uniform distribution instead of producing NaN.
pub(crate) const MASK_FILL: f32 = -1e9;

/// Normalizes a lane in place with a numerically stable softmax.
pub(crate) fn softmax_inplace(mut lane: ArrayViewMut1<'_, f32>) {
    let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0f32;
    lane.mapv_inplace(|v| {
        let e = (v - max).exp();
        sum += e;
        e
    });
    if sum > 0.0 {
        lane.mapv_inplace(|v| v / sum);
    }
}

/// Computes `ln(sum(exp(v)))` over an iterator without overflow.
pub(crate) fn log_sum_exp<I>(values: I) -> f32
where
    I: IntoIterator<Item = f32> + Clone,
{
    let max = values
        .clone()
        .into_iter()
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values.into_iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// `elu(x) + 1`, the positive feature map used by linear attention.
#[inline]
pub(crate) fn elu_plus_one(x: f32) -> f32 {
    if x > 0.0 {
        x + 1.0
    } else {
        x.exp()
    }
}

/// Evenly spaced coordinates on `[-1, 1]` for a window of `size` cells.
pub(crate) fn normalized_grid(size: usize) -> Vec<f32> {
    if size <= 1 {
        return vec![0.0; size];
    }
    let step = 2.0 / (size - 1) as f32;
    (0..size).map(|i| -1.0 + step * i as f32).collect()
}
