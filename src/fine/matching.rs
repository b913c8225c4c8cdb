//! Sub-pixel refinement by soft-argmax over the fine window.

use crate::trace::trace_span;
use crate::util::math::{normalized_grid, softmax_inplace, MASK_FILL};
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Expected offset and spread of every window.
///
/// `offsets` is `(M, 2)` holding `(dx, dy)` in normalized window units
/// `[-1, 1]`; `std` is `(M,)`, the sum over both axes of the heatmap's
/// standard deviation.
#[derive(Clone, Debug, PartialEq)]
pub struct FineOffsets {
    pub offsets: Array2<f32>,
    pub std: Array1<f32>,
}

impl FineOffsets {
    pub fn len(&self) -> usize {
        self.std.len()
    }

    pub fn is_empty(&self) -> bool {
        self.std.is_empty()
    }
}

/// Correlates the centre token of window0 with window1 and takes the
/// expectation of the resulting heatmap.
#[derive(Clone, Debug)]
pub struct FineMatcher {
    window_size: usize,
    parallel: bool,
}

impl FineMatcher {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Refines every window pair.
    ///
    /// `win0`/`win1` are `(M, W*W, C)` after the fine attention stack;
    /// `valid1` `(M, W*W)` marks window1 positions inside the fine map.
    pub fn forward(
        &self,
        win0: ArrayView3<'_, f32>,
        win1: ArrayView3<'_, f32>,
        valid1: ArrayView2<'_, bool>,
    ) -> DenseMatchResult<FineOffsets> {
        let ww = self.window_size * self.window_size;
        let (m, l0, c) = win0.dim();
        if l0 != ww {
            return Err(DenseMatchError::shape("fine_matching", "window0 tokens", &[ww], &[l0]));
        }
        let (m1, l1, c1) = win1.dim();
        if (m1, l1, c1) != (m, ww, c) {
            return Err(DenseMatchError::shape(
                "fine_matching",
                "window1 tokens",
                &[m, ww, c],
                &[m1, l1, c1],
            ));
        }
        if valid1.dim() != (m, ww) {
            return Err(DenseMatchError::shape(
                "fine_matching",
                "window validity",
                &[m, ww],
                &[valid1.dim().0, valid1.dim().1],
            ));
        }

        let _span = trace_span!("fine_matching", windows = m).entered();
        let grid = normalized_grid(self.window_size);
        let refine = |k: usize| {
            self.refine_one(
                win0.index_axis(Axis(0), k).row(ww / 2),
                win1.index_axis(Axis(0), k),
                valid1.row(k),
                &grid,
            )
        };

        #[cfg(feature = "rayon")]
        let per_window: Vec<[f32; 3]> = if self.parallel {
            (0..m).into_par_iter().map(refine).collect()
        } else {
            (0..m).map(refine).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let per_window: Vec<[f32; 3]> = (0..m).map(refine).collect();

        let mut offsets = Array2::<f32>::zeros((m, 2));
        let mut std = Array1::<f32>::zeros(m);
        for (k, [dx, dy, s]) in per_window.into_iter().enumerate() {
            offsets[[k, 0]] = dx;
            offsets[[k, 1]] = dy;
            std[k] = s;
        }
        Ok(FineOffsets { offsets, std })
    }

    /// Returns `[dx, dy, std]` for one window pair.
    fn refine_one(
        &self,
        center: ArrayView1<'_, f32>,
        window: ArrayView2<'_, f32>,
        valid: ArrayView1<'_, bool>,
        grid: &[f32],
    ) -> [f32; 3] {
        let temp = 1.0 / (center.len().max(1) as f32).sqrt();
        let mut heat = window.dot(&center);
        for (v, &ok) in heat.iter_mut().zip(valid.iter()) {
            *v = if ok { *v * temp } else { MASK_FILL };
        }
        softmax_inplace(heat.view_mut());

        let w = self.window_size;
        let (mut ex, mut ey, mut ex2, mut ey2) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for (k, &p) in heat.iter().enumerate() {
            let gx = grid[k % w];
            let gy = grid[k / w];
            ex += p * gx;
            ey += p * gy;
            ex2 += p * gx * gx;
            ey2 += p * gy * gy;
        }
        let std = (ex2 - ex * ex).max(1e-10).sqrt() + (ey2 - ey * ey).max(1e-10).sqrt();
        [ex.clamp(-1.0, 1.0), ey.clamp(-1.0, 1.0), std]
    }
}
