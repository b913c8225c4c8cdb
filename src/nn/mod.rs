//! Minimal inference-time layers over token sequences.
//!
//! Weights follow the PyTorch layout (`weight` is `(out, in)`), so state
//! dictionaries exported from trained checkpoints load without transposes.

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

/// Affine projection over the channel axis.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl Linear {
    /// Creates a layer from a `(out, in)` weight and optional bias.
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Applies the projection to `(rows, in)` and returns `(rows, out)`.
    pub fn forward_2d(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = x.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }

    /// Applies the projection to `(batch, tokens, in)`.
    pub fn forward(&self, x: ArrayView3<'_, f32>) -> Array3<f32> {
        let (n, l, _) = x.dim();
        let mut out = Array3::<f32>::zeros((n, l, self.out_features()));
        for (src, mut dst) in x.outer_iter().zip(out.outer_iter_mut()) {
            dst.assign(&self.forward_2d(src));
        }
        out
    }
}

/// Layer normalization over the channel axis.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    /// Creates a normalization with learned scale and shift.
    pub fn new(gamma: Array1<f32>, beta: Array1<f32>) -> Self {
        Self {
            gamma,
            beta,
            eps: 1e-5,
        }
    }

    /// Normalizes every token of `(batch, tokens, channels)`.
    pub fn forward(&self, x: ArrayView3<'_, f32>) -> Array3<f32> {
        let mut out = x.to_owned();
        let c = x.dim().2 as f32;
        Zip::from(out.lanes_mut(Axis(2))).for_each(|mut lane| {
            let mean = lane.sum() / c;
            let var = lane.fold(0.0f32, |acc, &v| acc + (v - mean) * (v - mean)) / c;
            let inv = 1.0 / (var + self.eps).sqrt();
            Zip::from(&mut lane)
                .and(&self.gamma)
                .and(&self.beta)
                .for_each(|v, &g, &b| *v = (*v - mean) * inv * g + b);
        });
        out
    }
}

/// Rectified linear unit, in place.
pub fn relu_inplace(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

#[cfg(test)]
mod tests {
    use super::{LayerNorm, Linear};
    use ndarray::{arr1, arr2, Array1, Array3};

    #[test]
    fn linear_uses_out_by_in_layout() {
        let layer = Linear::new(
            arr2(&[[1.0f32, 2.0], [0.0, -1.0], [1.0, 1.0]]),
            Some(arr1(&[0.5, 0.0, 0.0])),
        );
        let x = Array3::from_shape_vec((1, 1, 2), vec![3.0f32, 4.0]).unwrap();
        let y = layer.forward(x.view());
        assert_eq!(y.dim(), (1, 1, 3));
        assert!((y[[0, 0, 0]] - 11.5).abs() < 1e-6);
        assert!((y[[0, 0, 1]] + 4.0).abs() < 1e-6);
        assert!((y[[0, 0, 2]] - 7.0).abs() < 1e-6);
    }

    #[test]
    fn layer_norm_centers_and_scales() {
        let norm = LayerNorm::new(Array1::ones(4), Array1::zeros(4));
        let x = Array3::from_shape_vec((1, 1, 4), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let y = norm.forward(x.view());
        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        let var: f32 = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn layer_norm_of_constant_token_is_bias() {
        let norm = LayerNorm::new(Array1::ones(3), arr1(&[0.1f32, 0.2, 0.3]));
        let x = Array3::from_elem((1, 1, 3), 7.0f32);
        let y = norm.forward(x.view());
        assert!((y[[0, 0, 2]] - 0.3).abs() < 1e-6);
    }
}
