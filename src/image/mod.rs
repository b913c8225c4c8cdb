//! Grayscale image input.
//!
//! `ImageView` is a borrowed 2D view into a 1D buffer with an explicit stride.
//! The stride counts elements between the starts of consecutive rows, so a
//! stride larger than the width represents padded rows. `ImageBatch` turns
//! one or more views into the `(batch, height, width)` `f32` tensor consumed
//! by a backbone, scaled to `[0, 1]`.

use crate::feature::{GridShape, PaddingMask};
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};

#[cfg(feature = "image-io")]
pub mod io;

/// Borrowed 2D image view with an explicit stride.
#[derive(Copy, Clone)]
pub struct ImageView<'a, T> {
    data: &'a [T],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a, T> ImageView<'a, T> {
    /// Creates a contiguous view with `stride == width`.
    pub fn from_slice(data: &'a [T], width: usize, height: usize) -> DenseMatchResult<Self> {
        Self::new(data, width, height, width)
    }

    /// Creates a view with an explicit stride.
    pub fn new(
        data: &'a [T],
        width: usize,
        height: usize,
        stride: usize,
    ) -> DenseMatchResult<Self> {
        let needed = required_len(width, height, stride)?;
        if data.len() < needed {
            return Err(DenseMatchError::BufferTooSmall {
                needed,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns the stride in elements between row starts.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns the element at `(x, y)` if it is within bounds.
    pub fn get(&self, x: usize, y: usize) -> Option<&'a T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y.checked_mul(self.stride)?.checked_add(x)?;
        self.data.get(idx)
    }

    /// Returns a contiguous slice for row `y` with length `width`.
    pub fn row(&self, y: usize) -> Option<&'a [T]> {
        if y >= self.height {
            return None;
        }
        let start = y.checked_mul(self.stride)?;
        let end = start.checked_add(self.width)?;
        self.data.get(start..end)
    }
}

fn required_len(width: usize, height: usize, stride: usize) -> DenseMatchResult<usize> {
    if width == 0 || height == 0 {
        return Err(DenseMatchError::InvalidDimensions { width, height });
    }
    if stride < width {
        return Err(DenseMatchError::InvalidStride { width, stride });
    }
    (height - 1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(width))
        .ok_or(DenseMatchError::InvalidDimensions { width, height })
}

/// Owned contiguous 8-bit grayscale image.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnedImage {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl OwnedImage {
    /// Wraps a row-major buffer of exactly `width * height` pixels.
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> DenseMatchResult<Self> {
        let needed = required_len(width, height, width)?;
        if data.len() != needed {
            return Err(DenseMatchError::BufferTooSmall {
                needed,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Copies a (possibly strided) view into a contiguous buffer.
    pub fn from_view(view: ImageView<'_, u8>) -> DenseMatchResult<Self> {
        let mut data = Vec::with_capacity(view.width() * view.height());
        for y in 0..view.height() {
            let row = view.row(y).ok_or(DenseMatchError::BufferTooSmall {
                needed: (y + 1) * view.stride(),
                got: view.data.len(),
            })?;
            data.extend_from_slice(row);
        }
        Self::new(data, view.width(), view.height())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn view(&self) -> ImageView<'_, u8> {
        ImageView {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.width,
        }
    }
}

/// A batch of grayscale images as `(batch, height, width)` in `[0, 1]`.
///
/// Images smaller than the batch size are padded at the bottom and right;
/// `valid` keeps the original size of each image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageBatch {
    data: Array3<f32>,
    valid: Vec<GridShape>,
}

impl ImageBatch {
    /// Stacks equally sized images.
    pub fn from_views(views: &[ImageView<'_, u8>]) -> DenseMatchResult<Self> {
        let first = views.first().ok_or(DenseMatchError::InvalidDimensions {
            width: 0,
            height: 0,
        })?;
        if let Some(v) = views
            .iter()
            .find(|v| v.width() != first.width() || v.height() != first.height())
        {
            return Err(DenseMatchError::shape(
                "image",
                "image size",
                &[first.height(), first.width()],
                &[v.height(), v.width()],
            ));
        }
        Self::padded(views, first.height(), first.width())
    }

    /// Stacks images into a `height x width` canvas, zero-padding each one.
    pub fn padded(
        views: &[ImageView<'_, u8>],
        height: usize,
        width: usize,
    ) -> DenseMatchResult<Self> {
        if views.is_empty() || height == 0 || width == 0 {
            return Err(DenseMatchError::InvalidDimensions { width, height });
        }
        let mut data = Array3::<f32>::zeros((views.len(), height, width));
        let mut valid = Vec::with_capacity(views.len());
        for (view, mut dst) in views.iter().zip(data.axis_iter_mut(Axis(0))) {
            if view.height() > height || view.width() > width {
                return Err(DenseMatchError::shape(
                    "image",
                    "padded canvas",
                    &[height, width],
                    &[view.height(), view.width()],
                ));
            }
            for y in 0..view.height() {
                if let Some(row) = view.row(y) {
                    for (x, &p) in row.iter().enumerate() {
                        dst[[y, x]] = f32::from(p) / 255.0;
                    }
                }
            }
            valid.push(GridShape::new(view.height(), view.width()));
        }
        Ok(Self { data, valid })
    }

    /// Wraps an already normalized tensor; every pixel is valid.
    pub fn from_array(data: Array3<f32>) -> DenseMatchResult<Self> {
        let (n, h, w) = data.dim();
        if n == 0 || h == 0 || w == 0 {
            return Err(DenseMatchError::InvalidDimensions {
                width: w,
                height: h,
            });
        }
        Ok(Self {
            data,
            valid: vec![GridShape::new(h, w); n],
        })
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn image(&self, b: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), b)
    }

    /// Unpadded size of every image.
    pub fn valid_sizes(&self) -> &[GridShape] {
        &self.valid
    }

    /// True when some image is smaller than the canvas.
    pub fn is_padded(&self) -> bool {
        let full = GridShape::new(self.height(), self.width());
        self.valid.iter().any(|v| *v != full)
    }

    /// Padding mask at a `1 / factor` resolution.
    ///
    /// A coarse cell is valid when its top-left pixel is valid, matching a
    /// nearest-neighbour downsample of the pixel mask.
    pub fn mask_at(&self, factor: usize) -> DenseMatchResult<PaddingMask> {
        if factor == 0 {
            return Err(DenseMatchError::config("mask downsample factor must be positive"));
        }
        let grid = GridShape::new(self.height() / factor, self.width() / factor);
        let valid: Vec<GridShape> = self
            .valid
            .iter()
            .map(|v| {
                GridShape::new(
                    v.height.div_ceil(factor).min(grid.height),
                    v.width.div_ceil(factor).min(grid.width),
                )
            })
            .collect();
        PaddingMask::from_valid_extents(grid, &valid)
    }
}
