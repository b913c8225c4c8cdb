//! Coarse correspondence: confidence matrix and match selection.
//!
//! The confidence matrix scores every pair of coarse cells between the two
//! images. Selection keeps pairs that beat the threshold, stay clear of the
//! (valid) border, are mutual nearest neighbours and are valid in both
//! padding masks. During training the selection is additionally capped and
//! padded with ground-truth pairs, see [`RunPhase`].

mod dual_softmax;
mod select;
mod sinkhorn;

pub use dual_softmax::dual_softmax;
pub use select::mutual_nearest_filter;
pub use sinkhorn::{log_optimal_transport, sinkhorn_confidence};

use crate::config::{CoarseMatchConfig, CoarseMatchMode};
use crate::feature::check_token_mask;
use crate::params::{Init, ParamLoader, ParamSpec};
use crate::trace::trace_span;
use crate::util::math::MASK_FILL;
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Name of the learned dustbin score in a state dictionary.
pub const BIN_SCORE_PARAM: &str = "coarse_matching.bin_score";

/// Pairwise coarse confidences `(batch, L, S)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfidenceMatrix {
    data: Array3<f32>,
}

impl ConfidenceMatrix {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    /// Number of image0 cells (`L`).
    pub fn rows(&self) -> usize {
        self.data.dim().1
    }

    /// Number of image1 cells (`S`).
    pub fn cols(&self) -> usize {
        self.data.dim().2
    }

    pub fn get(&self, b: usize, i: usize, j: usize) -> f32 {
        self.data[[b, i, j]]
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Confidences of one sample, `(L, S)`.
    pub fn sample(&self, b: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), b)
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }
}

/// One coarse correspondence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoarseMatch {
    pub batch: usize,
    /// Token index in image0.
    pub i: usize,
    /// Token index in image1.
    pub j: usize,
    pub confidence: f32,
    /// Padded in from supervision rather than predicted.
    pub ground_truth: bool,
}

/// Selected coarse matches stored as parallel arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoarseMatches {
    batch: Vec<usize>,
    i: Vec<usize>,
    j: Vec<usize>,
    confidence: Vec<f32>,
    ground_truth: Vec<bool>,
}

impl CoarseMatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            batch: Vec::with_capacity(capacity),
            i: Vec::with_capacity(capacity),
            j: Vec::with_capacity(capacity),
            confidence: Vec::with_capacity(capacity),
            ground_truth: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, m: CoarseMatch) {
        self.batch.push(m.batch);
        self.i.push(m.i);
        self.j.push(m.j);
        self.confidence.push(m.confidence);
        self.ground_truth.push(m.ground_truth);
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn get(&self, k: usize) -> Option<CoarseMatch> {
        Some(CoarseMatch {
            batch: *self.batch.get(k)?,
            i: self.i[k],
            j: self.j[k],
            confidence: self.confidence[k],
            ground_truth: self.ground_truth[k],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = CoarseMatch> + '_ {
        (0..self.len()).filter_map(move |k| self.get(k))
    }

    pub fn batch_ids(&self) -> &[usize] {
        &self.batch
    }

    pub fn i_ids(&self) -> &[usize] {
        &self.i
    }

    pub fn j_ids(&self) -> &[usize] {
        &self.j
    }

    pub fn confidences(&self) -> &[f32] {
        &self.confidence
    }

    pub fn ground_truth_flags(&self) -> &[bool] {
        &self.ground_truth
    }

    /// Number of matches belonging to sample `b`.
    pub fn count_in_sample(&self, b: usize) -> usize {
        self.batch.iter().filter(|&&x| x == b).count()
    }
}

impl FromIterator<CoarseMatch> for CoarseMatches {
    fn from_iter<T: IntoIterator<Item = CoarseMatch>>(iter: T) -> Self {
        let mut out = Self::new();
        for m in iter {
            out.push(m);
        }
        out
    }
}

/// A supervised coarse pair `(batch, i, j)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoarsePair {
    pub batch: usize,
    pub i: usize,
    pub j: usize,
}

/// Inputs that only exist while training.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingInputs {
    /// Ground-truth coarse pairs used to pad the selection.
    pub ground_truth: Vec<CoarsePair>,
    /// Seed of the sampling RNG.
    pub seed: u64,
}

/// Whether the matcher runs for inference or for a training step.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RunPhase {
    #[default]
    Inference,
    Training(TrainingInputs),
}

impl RunPhase {
    pub fn is_training(&self) -> bool {
        matches!(self, Self::Training(_))
    }
}

/// Computes coarse confidences and selects coarse matches.
#[derive(Clone, Debug)]
pub struct CoarseMatcher {
    config: CoarseMatchConfig,
    bin_score: Option<f32>,
    parallel: bool,
}

impl CoarseMatcher {
    /// Learned parameters: the dustbin score in Sinkhorn mode, nothing otherwise.
    pub fn param_specs(config: &CoarseMatchConfig) -> Vec<ParamSpec> {
        match config.mode {
            CoarseMatchMode::Sinkhorn => vec![ParamSpec::new(
                BIN_SCORE_PARAM,
                &[],
                Init::Constant(config.skh_init_bin_score),
            )],
            CoarseMatchMode::DualSoftmax => Vec::new(),
        }
    }

    pub fn load(
        loader: &mut ParamLoader<'_>,
        config: &CoarseMatchConfig,
    ) -> DenseMatchResult<Self> {
        let bin_score = match config.mode {
            CoarseMatchMode::Sinkhorn => Some(loader.scalar(BIN_SCORE_PARAM)?),
            CoarseMatchMode::DualSoftmax => None,
        };
        Ok(Self {
            config: config.clone(),
            bin_score,
            parallel: false,
        })
    }

    /// Builds a matcher without a checkpoint; Sinkhorn starts from `skh_init_bin_score`.
    pub fn from_config(config: &CoarseMatchConfig) -> Self {
        let bin_score = match config.mode {
            CoarseMatchMode::Sinkhorn => Some(config.skh_init_bin_score),
            CoarseMatchMode::DualSoftmax => None,
        };
        Self {
            config: config.clone(),
            bin_score,
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn config(&self) -> &CoarseMatchConfig {
        &self.config
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Confidence matrix of enhanced coarse tokens `(N, L, C)` and `(N, S, C)`.
    ///
    /// Masks are flattened `(N, L)` / `(N, S)` validity; a missing mask means
    /// every token is valid.
    pub fn confidence(
        &self,
        feat0: ArrayView3<'_, f32>,
        feat1: ArrayView3<'_, f32>,
        mask0: Option<ArrayView2<'_, bool>>,
        mask1: Option<ArrayView2<'_, bool>>,
        phase: &RunPhase,
    ) -> DenseMatchResult<ConfidenceMatrix> {
        let (n0, l, c0) = feat0.dim();
        let (n1, s, c1) = feat1.dim();
        if n0 != n1 {
            return Err(DenseMatchError::shape("coarse_matching", "batch size", &[n0], &[n1]));
        }
        if c0 != c1 {
            return Err(DenseMatchError::shape("coarse_matching", "channels", &[c0], &[c1]));
        }
        check_token_mask("coarse_matching", mask0, n0, l)?;
        check_token_mask("coarse_matching", mask1, n1, s)?;

        let _span = trace_span!("coarse_confidence", batch = n0, rows = l, cols = s).entered();
        let prefilter = self.config.skh_prefilter && !phase.is_training();
        let sample = |b: usize| {
            self.sample_confidence(
                feat0.index_axis(Axis(0), b),
                feat1.index_axis(Axis(0), b),
                mask0.map(|m| m.index_axis_move(Axis(0), b)),
                mask1.map(|m| m.index_axis_move(Axis(0), b)),
                prefilter,
            )
        };

        #[cfg(feature = "rayon")]
        let per_sample: Vec<Array2<f32>> = if self.parallel {
            (0..n0).into_par_iter().map(sample).collect()
        } else {
            (0..n0).map(sample).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let per_sample: Vec<Array2<f32>> = (0..n0).map(sample).collect();

        let mut data = Array3::<f32>::zeros((n0, l, s));
        for (mut dst, src) in data.outer_iter_mut().zip(per_sample.iter()) {
            dst.assign(src);
        }
        Ok(ConfidenceMatrix::new(data))
    }

    fn sample_confidence(
        &self,
        feat0: ArrayView2<'_, f32>,
        feat1: ArrayView2<'_, f32>,
        mask0: Option<ArrayView1<'_, bool>>,
        mask1: Option<ArrayView1<'_, bool>>,
        prefilter: bool,
    ) -> Array2<f32> {
        // Scaling both sides by 1/sqrt(C) scales the product by 1/C.
        let inv_c = 1.0 / feat0.ncols().max(1) as f32;
        let mut sim = feat0.dot(&feat1.t());
        let scale = match self.config.mode {
            CoarseMatchMode::DualSoftmax => inv_c / self.config.dsmax_temperature,
            CoarseMatchMode::Sinkhorn => inv_c,
        };
        sim.mapv_inplace(|v| v * scale);

        if mask0.is_some() || mask1.is_some() {
            for (i, mut row) in sim.axis_iter_mut(Axis(0)).enumerate() {
                let valid0 = mask0.map_or(true, |m| m[i]);
                for (j, v) in row.iter_mut().enumerate() {
                    if !(valid0 && mask1.map_or(true, |m| m[j])) {
                        *v = MASK_FILL;
                    }
                }
            }
        }

        match (self.config.mode, self.bin_score) {
            (CoarseMatchMode::Sinkhorn, Some(bin_score)) => {
                sinkhorn_confidence(sim.view(), bin_score, self.config.skh_iters, prefilter)
            }
            _ => dual_softmax(sim.view()),
        }
    }
}
