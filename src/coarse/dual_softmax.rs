//! Dual-softmax confidence.

use crate::util::math::softmax_inplace;
use ndarray::{Array2, ArrayView2, Axis};

/// Product of the row-wise and the column-wise softmax of `sim`.
///
/// Every entry lies in `[0, 1]`; an entry is close to one only when it
/// dominates both its row and its column.
pub fn dual_softmax(sim: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut by_row = sim.to_owned();
    for lane in by_row.lanes_mut(Axis(1)) {
        softmax_inplace(lane);
    }
    let mut by_col = sim.to_owned();
    for lane in by_col.lanes_mut(Axis(0)) {
        softmax_inplace(lane);
    }
    by_row * by_col
}

#[cfg(test)]
mod tests {
    use super::dual_softmax;
    use ndarray::{arr2, Axis};

    #[test]
    fn entries_are_probabilities() {
        let sim = arr2(&[[10.0f32, 0.0, -3.0], [0.0, 12.0, 1.0]]);
        let conf = dual_softmax(sim.view());
        assert!(conf.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(conf[[0, 0]] > 0.99);
        assert!(conf[[1, 1]] > 0.99);
        assert!(conf.sum_axis(Axis(1)).iter().all(|&s| s <= 1.0 + 1e-6));
    }
}
