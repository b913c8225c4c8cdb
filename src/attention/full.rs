//! Softmax ("full") attention.

use crate::attention::Attention;
use crate::util::math::{softmax_inplace, MASK_FILL};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Scaled dot-product attention with quadratic cost in the token count.
///
/// When a key mask is given, entries where either the query or the key is
/// padding are filled with a large negative score before the softmax.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullAttention;

impl Attention for FullAttention {
    fn attend_head(
        &self,
        q: ArrayView2<'_, f32>,
        k: ArrayView2<'_, f32>,
        v: ArrayView2<'_, f32>,
        q_mask: Option<ArrayView1<'_, bool>>,
        kv_mask: Option<ArrayView1<'_, bool>>,
    ) -> Array2<f32> {
        let temp = 1.0 / (q.ncols().max(1) as f32).sqrt();
        let mut scores = q.dot(&k.t());
        scores.mapv_inplace(|s| s * temp);

        if let Some(kv_mask) = kv_mask {
            for (li, mut row) in scores.outer_iter_mut().enumerate() {
                let q_valid = q_mask.map_or(true, |m| m[li]);
                for (score, &k_valid) in row.iter_mut().zip(kv_mask.iter()) {
                    if !(q_valid && k_valid) {
                        *score = MASK_FILL;
                    }
                }
            }
        }

        for row in scores.axis_iter_mut(Axis(0)) {
            softmax_inplace(row);
        }
        scores.dot(&v)
    }
}
