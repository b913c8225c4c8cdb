//! Feature maps, token sequences and padding masks.
//!
//! A `FeatureMap` is an owned `(batch, channels, height, width)` tensor. The
//! attention stages work on flattened token sequences `(batch, height *
//! width, channels)` laid out row-major over `(height, width)`; coarse match
//! indices are decoded back into grid cells with the same convention, see
//! [`GridShape::cell`].

use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};

/// Height and width of a spatial grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridShape {
    pub height: usize,
    pub width: usize,
}

impl GridShape {
    /// Creates a grid shape.
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Number of cells (tokens).
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    /// Returns true when the grid has no cells.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes a row-major token index into `(row, col)`.
    #[inline]
    pub fn cell(&self, index: usize) -> (usize, usize) {
        (index / self.width, index % self.width)
    }

    /// Encodes `(row, col)` into a row-major token index.
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }
}

/// Owned `(batch, channels, height, width)` feature tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    data: Array4<f32>,
}

impl FeatureMap {
    /// Wraps an array, rejecting empty dimensions.
    pub fn new(data: Array4<f32>) -> DenseMatchResult<Self> {
        let (n, c, h, w) = data.dim();
        if n == 0 || c == 0 {
            return Err(DenseMatchError::shape(
                "feature",
                "batch and channels",
                &[1, 1],
                &[n, c],
            ));
        }
        if h == 0 || w == 0 {
            return Err(DenseMatchError::InvalidDimensions {
                width: w,
                height: h,
            });
        }
        Ok(Self { data })
    }

    /// Builds a feature map from a closure over `(b, c, y, x)`.
    pub fn from_fn<F>(dims: (usize, usize, usize, usize), f: F) -> DenseMatchResult<Self>
    where
        F: FnMut((usize, usize, usize, usize)) -> f32,
    {
        Self::new(Array4::from_shape_fn(dims, f))
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    pub fn channels(&self) -> usize {
        self.data.dim().1
    }

    pub fn height(&self) -> usize {
        self.data.dim().2
    }

    pub fn width(&self) -> usize {
        self.data.dim().3
    }

    /// Spatial grid of the map.
    pub fn grid(&self) -> GridShape {
        GridShape::new(self.height(), self.width())
    }

    /// Borrowed view of the underlying tensor.
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// Consumes the map and returns the tensor.
    pub fn into_array(self) -> Array4<f32> {
        self.data
    }

    /// Flattens the map into a `(batch, height * width, channels)` sequence.
    pub fn to_tokens(&self) -> Array3<f32> {
        let (n, c, h, w) = self.data.dim();
        let mut tokens = Array3::<f32>::zeros((n, h * w, c));
        for b in 0..n {
            for ch in 0..c {
                let plane = self.data.index_axis(Axis(0), b);
                let plane = plane.index_axis(Axis(0), ch);
                for (idx, &value) in plane.iter().enumerate() {
                    tokens[[b, idx, ch]] = value;
                }
            }
        }
        tokens
    }
}

/// Validity grid `(batch, height, width)`; `true` marks a real position.
#[derive(Clone, Debug, PartialEq)]
pub struct PaddingMask {
    data: Array3<bool>,
}

impl PaddingMask {
    /// Wraps a boolean array.
    pub fn new(data: Array3<bool>) -> DenseMatchResult<Self> {
        let (n, h, w) = data.dim();
        if n == 0 || h == 0 || w == 0 {
            return Err(DenseMatchError::InvalidDimensions {
                width: w,
                height: h,
            });
        }
        Ok(Self { data })
    }

    /// A mask with every position valid.
    pub fn all_valid(batch: usize, grid: GridShape) -> DenseMatchResult<Self> {
        Self::new(Array3::from_elem((batch, grid.height, grid.width), true))
    }

    /// Marks the top-left `valid` region of each sample as real, the rest as padding.
    pub fn from_valid_extents(grid: GridShape, valid: &[GridShape]) -> DenseMatchResult<Self> {
        let data = Array3::from_shape_fn((valid.len(), grid.height, grid.width), |(b, y, x)| {
            y < valid[b].height && x < valid[b].width
        });
        Self::new(data)
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    /// Spatial grid of the mask.
    pub fn grid(&self) -> GridShape {
        let (_, h, w) = self.data.dim();
        GridShape::new(h, w)
    }

    /// Borrowed view of the underlying grid.
    pub fn view(&self) -> ndarray::ArrayView3<'_, bool> {
        self.data.view()
    }

    /// Flattens into `(batch, height * width)` in token order.
    pub fn flatten(&self) -> Array2<bool> {
        let (n, h, w) = self.data.dim();
        Array2::from_shape_fn((n, h * w), |(b, idx)| self.data[[b, idx / w, idx % w]])
    }

    /// Valid extent of sample `b` as `(rows, cols)`.
    ///
    /// Rows is the largest count of valid cells in any column and cols the
    /// largest count of valid cells in any row.
    pub fn valid_extent(&self, b: usize) -> (usize, usize) {
        let sample = self.data.index_axis(Axis(0), b);
        let rows = sample
            .axis_iter(Axis(1))
            .map(|col| col.iter().filter(|&&v| v).count())
            .max()
            .unwrap_or(0);
        let cols = sample
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|&&v| v).count())
            .max()
            .unwrap_or(0);
        (rows, cols)
    }

    /// Checks the mask against the batch size and grid of a feature map.
    pub(crate) fn check_against(
        &self,
        stage: &'static str,
        batch: usize,
        grid: GridShape,
    ) -> DenseMatchResult<()> {
        let (n, h, w) = self.data.dim();
        if n != batch || h != grid.height || w != grid.width {
            return Err(DenseMatchError::shape(
                stage,
                "padding mask",
                &[batch, grid.height, grid.width],
                &[n, h, w],
            ));
        }
        Ok(())
    }
}

/// Checks a flattened `(batch, tokens)` mask against a token sequence.
pub(crate) fn check_token_mask(
    stage: &'static str,
    mask: Option<ArrayView2<'_, bool>>,
    batch: usize,
    tokens: usize,
) -> DenseMatchResult<()> {
    if let Some(mask) = mask {
        let (n, l) = mask.dim();
        if n != batch || l != tokens {
            return Err(DenseMatchError::shape(
                stage,
                "token mask",
                &[batch, tokens],
                &[n, l],
            ));
        }
    }
    Ok(())
}

/// Coarse and fine feature maps produced by a backbone for one image batch.
#[derive(Clone, Debug)]
pub struct BackboneFeatures {
    pub coarse: FeatureMap,
    pub fine: FeatureMap,
}

impl BackboneFeatures {
    /// Pairs coarse and fine maps, checking that their batch sizes agree.
    pub fn new(coarse: FeatureMap, fine: FeatureMap) -> DenseMatchResult<Self> {
        if coarse.batch() != fine.batch() {
            return Err(DenseMatchError::shape(
                "backbone",
                "fine batch",
                &[coarse.batch()],
                &[fine.batch()],
            ));
        }
        Ok(Self { coarse, fine })
    }
}
