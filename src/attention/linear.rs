//! Kernelized ("linear") attention.

use crate::attention::Attention;
use crate::util::math::elu_plus_one;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Attention with the `elu(x) + 1` feature map, linear in the token count.
///
/// `out_l = phi(q_l) (phi(K)^T V) / (phi(q_l) . sum_s phi(k_s) + eps)`.
/// Masked queries, keys and values are zeroed. Values are divided by their
/// length before aggregation and multiplied back afterwards to keep the
/// intermediate sums small.
#[derive(Clone, Copy, Debug)]
pub struct LinearAttention {
    eps: f32,
}

impl Default for LinearAttention {
    fn default() -> Self {
        Self { eps: 1e-6 }
    }
}

fn zero_masked_rows(x: &mut Array2<f32>, mask: ArrayView1<'_, bool>) {
    for (mut row, &valid) in x.axis_iter_mut(Axis(0)).zip(mask.iter()) {
        if !valid {
            row.fill(0.0);
        }
    }
}

impl Attention for LinearAttention {
    fn attend_head(
        &self,
        q: ArrayView2<'_, f32>,
        k: ArrayView2<'_, f32>,
        v: ArrayView2<'_, f32>,
        q_mask: Option<ArrayView1<'_, bool>>,
        kv_mask: Option<ArrayView1<'_, bool>>,
    ) -> Array2<f32> {
        let mut q = q.mapv(elu_plus_one);
        let mut k = k.mapv(elu_plus_one);
        let mut v = v.to_owned();
        if let Some(mask) = q_mask {
            zero_masked_rows(&mut q, mask);
        }
        if let Some(mask) = kv_mask {
            zero_masked_rows(&mut k, mask);
            zero_masked_rows(&mut v, mask);
        }

        let v_len = v.nrows().max(1) as f32;
        v.mapv_inplace(|x| x / v_len);

        let kv = k.t().dot(&v);
        let k_sum = k.sum_axis(Axis(0));
        let z = q.dot(&k_sum);

        let mut out = q.dot(&kv);
        for (mut row, &zl) in out.axis_iter_mut(Axis(0)).zip(z.iter()) {
            let scale = v_len / (zl + self.eps);
            row.mapv_inplace(|x| x * scale);
        }
        out
    }
}
