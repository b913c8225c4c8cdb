//! Fixed 2D sinusoidal positional encoding for coarse feature maps.
//!
//! For every group of four channels `4k..4k+4` the table holds
//! `sin(x * f_k), cos(x * f_k), sin(y * f_k), cos(y * f_k)` with 1-based
//! `x`/`y`. The table is built once for `max_shape` and sliced per call.

use crate::feature::FeatureMap;
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{s, Array3, ArrayView3, Axis, Zip};

/// Precomputed sinusoidal encoding table.
#[derive(Clone, Debug)]
pub struct PositionEncodingSine {
    d_model: usize,
    max_shape: (usize, usize),
    table: Array3<f32>,
}

/// Frequencies `f_k` for `k in 0..d_model / 4`.
///
/// `temp_bug_fix = false` reproduces the legacy normalization, where the
/// exponent step was floor-divided by two instead of divided by
/// `d_model / 2`; checkpoints trained with it need it to stay that way.
pub fn frequencies(d_model: usize, temp_bug_fix: bool) -> Vec<f64> {
    let log_base = 10000.0f64.ln();
    let step = if temp_bug_fix {
        -log_base / (d_model / 2) as f64
    } else {
        ((-log_base / d_model as f64) / 2.0).floor()
    };
    (0..d_model / 4)
        .map(|k| ((2 * k) as f64 * step).exp())
        .collect()
}

impl PositionEncodingSine {
    /// Builds the table for grids up to `max_shape = (height, width)`.
    pub fn new(
        d_model: usize,
        max_shape: (usize, usize),
        temp_bug_fix: bool,
    ) -> DenseMatchResult<Self> {
        if d_model == 0 || d_model % 4 != 0 {
            return Err(DenseMatchError::config(format!(
                "positional encoding needs d_model divisible by 4, got {d_model}"
            )));
        }
        let (max_h, max_w) = max_shape;
        if max_h == 0 || max_w == 0 {
            return Err(DenseMatchError::config(
                "positional encoding max_shape must be positive",
            ));
        }

        let freqs = frequencies(d_model, temp_bug_fix);
        let mut table = Array3::<f32>::zeros((d_model, max_h, max_w));
        for (k, &f) in freqs.iter().enumerate() {
            for y in 0..max_h {
                let py = (y + 1) as f64 * f;
                for x in 0..max_w {
                    let px = (x + 1) as f64 * f;
                    table[[4 * k, y, x]] = px.sin() as f32;
                    table[[4 * k + 1, y, x]] = px.cos() as f32;
                    table[[4 * k + 2, y, x]] = py.sin() as f32;
                    table[[4 * k + 3, y, x]] = py.cos() as f32;
                }
            }
        }

        Ok(Self {
            d_model,
            max_shape,
            table,
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn max_shape(&self) -> (usize, usize) {
        self.max_shape
    }

    /// The encoding of an `height x width` grid as `(d_model, height, width)`.
    pub fn table(&self, height: usize, width: usize) -> DenseMatchResult<ArrayView3<'_, f32>> {
        let (max_h, max_w) = self.max_shape;
        if height > max_h || width > max_w {
            return Err(DenseMatchError::ExceedsMaxShape {
                height,
                width,
                max_height: max_h,
                max_width: max_w,
            });
        }
        Ok(self.table.slice(s![.., ..height, ..width]))
    }

    /// Returns `features + encoding` for every sample of the batch.
    pub fn encode(&self, features: &FeatureMap) -> DenseMatchResult<FeatureMap> {
        if features.channels() != self.d_model {
            return Err(DenseMatchError::config(format!(
                "coarse features have {} channels but coarse.d_model is {}",
                features.channels(),
                self.d_model
            )));
        }
        let pe = self.table(features.height(), features.width())?;
        let mut out = features.view().to_owned();
        for mut sample in out.axis_iter_mut(Axis(0)) {
            Zip::from(&mut sample).and(&pe).for_each(|v, &p| *v += p);
        }
        FeatureMap::new(out)
    }
}
