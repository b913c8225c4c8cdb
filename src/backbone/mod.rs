//! Feature extraction seam.
//!
//! A [`Backbone`] turns an [`ImageBatch`] into coarse and fine feature maps.
//! Learned convolutional backbones live outside this crate; [`PatchBackbone`]
//! is a non-learned reference that describes each cell by its normalized
//! pixel neighbourhood, enough to drive the pipeline without weights.

use crate::feature::{BackboneFeatures, FeatureMap};
use crate::image::ImageBatch;
use crate::trace::trace_span;
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{s, Array4, ArrayView2, ArrayViewMut1, Axis};

/// Produces coarse and fine feature maps for a batch of images.
pub trait Backbone {
    /// Downsampling factors `(coarse, fine)` relative to the input image.
    fn resolution(&self) -> (usize, usize);

    fn forward(&self, images: &ImageBatch) -> DenseMatchResult<BackboneFeatures>;
}

/// Reference backbone built from raw pixel patches.
///
/// Coarse cell `(r, c)` is described by the `s x s` block it covers
/// (`s = resolution.0`, `s^2` channels). Fine pixel `(r, c)` is described by
/// the `2f x 2f` neighbourhood centred on its `f x f` block (`f =
/// resolution.1`), clamped at the image edge. Every descriptor is made
/// zero-mean, L2-normalized and multiplied by `gain`.
#[derive(Clone, Debug)]
pub struct PatchBackbone {
    resolution: (usize, usize),
    gain: f32,
}

impl PatchBackbone {
    pub fn new(resolution: (usize, usize), gain: f32) -> DenseMatchResult<Self> {
        let (coarse, fine) = resolution;
        if coarse == 0 || fine == 0 || coarse % fine != 0 {
            return Err(DenseMatchError::config(format!(
                "backbone resolution ({coarse}, {fine}) must be positive with an integer ratio"
            )));
        }
        if !(gain.is_finite() && gain > 0.0) {
            return Err(DenseMatchError::config("backbone gain must be positive"));
        }
        Ok(Self { resolution, gain })
    }

    /// Channel counts `(coarse, fine)` of the produced maps.
    pub fn channels(&self) -> (usize, usize) {
        let (coarse, fine) = self.resolution;
        (coarse * coarse, 4 * fine * fine)
    }

    fn normalize(&self, mut v: ArrayViewMut1<'_, f32>) {
        let mean = v.mean().unwrap_or(0.0);
        v.mapv_inplace(|x| x - mean);
        let norm = v.dot(&v).sqrt();
        let scale = self.gain / (norm + 1e-6);
        v.mapv_inplace(|x| x * scale);
    }

    fn coarse_features(&self, image: ArrayView2<'_, f32>, out: &mut Array4<f32>, b: usize) {
        let s = self.resolution.0;
        let (_, _, hc, wc) = out.dim();
        for r in 0..hc {
            for c in 0..wc {
                let mut desc = out.slice_mut(s![b, .., r, c]);
                for py in 0..s {
                    for px in 0..s {
                        desc[py * s + px] = image[[r * s + py, c * s + px]];
                    }
                }
                self.normalize(desc);
            }
        }
    }

    fn fine_features(&self, image: ArrayView2<'_, f32>, out: &mut Array4<f32>, b: usize) {
        let f = self.resolution.1;
        let side = 2 * f;
        let (h, w) = image.dim();
        let (_, _, hf, wf) = out.dim();
        let clamp = |v: isize, len: usize| v.clamp(0, len as isize - 1) as usize;
        for r in 0..hf {
            for c in 0..wf {
                let y0 = (r * f) as isize - (f / 2) as isize;
                let x0 = (c * f) as isize - (f / 2) as isize;
                let mut desc = out.slice_mut(s![b, .., r, c]);
                for py in 0..side {
                    let y = clamp(y0 + py as isize, h);
                    for px in 0..side {
                        let x = clamp(x0 + px as isize, w);
                        desc[py * side + px] = image[[y, x]];
                    }
                }
                self.normalize(desc);
            }
        }
    }
}

impl Backbone for PatchBackbone {
    fn resolution(&self) -> (usize, usize) {
        self.resolution
    }

    fn forward(&self, images: &ImageBatch) -> DenseMatchResult<BackboneFeatures> {
        let (coarse, fine) = self.resolution;
        let (h, w) = (images.height(), images.width());
        if h % coarse != 0 || w % coarse != 0 || h < coarse || w < coarse {
            return Err(DenseMatchError::config(format!(
                "image size {h}x{w} is not a positive multiple of the coarse resolution {coarse}"
            )));
        }
        let _span = trace_span!("patch_backbone", batch = images.batch(), height = h, width = w)
            .entered();
        let (cc, cf) = self.channels();
        let n = images.batch();
        let mut coarse_map = Array4::<f32>::zeros((n, cc, h / coarse, w / coarse));
        let mut fine_map = Array4::<f32>::zeros((n, cf, h / fine, w / fine));
        for (b, image) in images.view().axis_iter(Axis(0)).enumerate() {
            self.coarse_features(image, &mut coarse_map, b);
            self.fine_features(image, &mut fine_map, b);
        }
        BackboneFeatures::new(FeatureMap::new(coarse_map)?, FeatureMap::new(fine_map)?)
    }
}
