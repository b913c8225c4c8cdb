//! Coarse-to-fine matching of two feature batches.
//!
//! [`DenseMatcher`] owns the learned stages and runs them in order:
//! positional encoding, coarse attention, coarse matching, window cropping,
//! fine attention and fine refinement. Each stage hands a value to the next;
//! nothing is cached on the matcher between calls.

mod output;

pub use output::{Match, MatchOutput, MatchSet};

use crate::attention::AttentionStack;
use crate::backbone::Backbone;
use crate::coarse::{CoarseMatcher, CoarseMatches, ConfidenceMatrix, RunPhase};
use crate::config::MatcherConfig;
use crate::feature::{BackboneFeatures, FeatureMap, GridShape, PaddingMask};
use crate::fine::{FineMatcher, FineOffsets, FinePreprocess, FineWindows};
use crate::image::ImageBatch;
use crate::params::{ParamLoader, ParamSpec, StateDict};
use crate::position::PositionEncodingSine;
use crate::trace::{trace_event, trace_span};
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array1, Array2, Array3};

const COARSE_STACK_PREFIX: &str = "loftr_coarse";
const FINE_STACK_PREFIX: &str = "loftr_fine";

/// Per-call options.
#[derive(Clone, Debug, Default)]
pub struct MatchOptions {
    pub phase: RunPhase,
    /// Return the coarse confidence matrix with the matches.
    pub return_confidence: bool,
}

/// Output of the coarse stage, consumed by the fine stage.
#[derive(Clone, Debug)]
pub struct CoarseContext {
    /// Enhanced coarse tokens `(N, L, C)` of image0.
    pub tokens0: Array3<f32>,
    /// Enhanced coarse tokens `(N, S, C)` of image1.
    pub tokens1: Array3<f32>,
    pub grid0: GridShape,
    pub grid1: GridShape,
    pub confidence: ConfidenceMatrix,
    pub matches: CoarseMatches,
}

/// The full matcher with loaded weights.
#[derive(Clone, Debug)]
pub struct DenseMatcher {
    config: MatcherConfig,
    pos_encoding: PositionEncodingSine,
    coarse_stack: AttentionStack,
    coarse_matcher: CoarseMatcher,
    fine_preprocess: FinePreprocess,
    fine_stack: AttentionStack,
    fine_matcher: FineMatcher,
}

impl DenseMatcher {
    /// Every learned parameter of a matcher built from `config`.
    pub fn param_specs(config: &MatcherConfig) -> Vec<ParamSpec> {
        let mut specs = AttentionStack::param_specs(COARSE_STACK_PREFIX, &config.coarse.stack());
        specs.extend(CoarseMatcher::param_specs(&config.match_coarse));
        specs.extend(FinePreprocess::param_specs(config));
        specs.extend(AttentionStack::param_specs(FINE_STACK_PREFIX, &config.fine.stack()));
        specs
    }

    /// A freshly initialized state dictionary for `config`.
    pub fn initial_state_dict(config: &MatcherConfig, seed: u64) -> DenseMatchResult<StateDict> {
        config.validate()?;
        Ok(StateDict::initialize(&Self::param_specs(config), seed))
    }

    /// Builds the matcher from trained weights.
    ///
    /// Keys carrying the historical `matcher.` prefix are accepted. Missing,
    /// mis-shaped and unexpected matcher parameters are errors; `backbone.`
    /// keys are ignored.
    pub fn from_state_dict(config: MatcherConfig, dict: StateDict) -> DenseMatchResult<Self> {
        config.validate()?;
        let dict = dict.strip_legacy_prefix();
        let mut loader = ParamLoader::new(&dict);
        let coarse_stack = AttentionStack::load(
            &mut loader,
            COARSE_STACK_PREFIX,
            "coarse",
            &config.coarse.stack(),
        )?;
        let coarse_matcher = CoarseMatcher::load(&mut loader, &config.match_coarse)?;
        let fine_preprocess = FinePreprocess::load(&mut loader, &config)?;
        let fine_stack =
            AttentionStack::load(&mut loader, FINE_STACK_PREFIX, "fine", &config.fine.stack())?;
        loader.finish()?;

        let pos_encoding = PositionEncodingSine::new(
            config.coarse.d_model,
            config.coarse.max_shape,
            config.coarse.temp_bug_fix,
        )?;
        let parallel = config.parallel;
        Ok(Self {
            pos_encoding,
            coarse_stack: coarse_stack.with_parallel(parallel),
            coarse_matcher: coarse_matcher.with_parallel(parallel),
            fine_preprocess: fine_preprocess.with_parallel(parallel),
            fine_stack: fine_stack.with_parallel(parallel),
            fine_matcher: FineMatcher::new(config.fine.window_size).with_parallel(parallel),
            config,
        })
    }

    /// Builds the matcher with seeded random weights.
    pub fn with_random_weights(config: MatcherConfig, seed: u64) -> DenseMatchResult<Self> {
        let dict = Self::initial_state_dict(&config, seed)?;
        Self::from_state_dict(config, dict)
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Runs the backbone on both image batches and matches the result.
    ///
    /// Padded image batches produce coarse padding masks automatically.
    pub fn match_images(
        &self,
        backbone: &dyn Backbone,
        images0: &ImageBatch,
        images1: &ImageBatch,
        options: &MatchOptions,
    ) -> DenseMatchResult<MatchOutput> {
        if backbone.resolution() != self.config.resolution {
            return Err(DenseMatchError::config(format!(
                "backbone resolution {:?} differs from the configured {:?}",
                backbone.resolution(),
                self.config.resolution
            )));
        }
        let feats0 = backbone.forward(images0)?;
        let feats1 = backbone.forward(images1)?;
        let coarse_res = self.config.resolution.0;
        let mask0 = if images0.is_padded() {
            Some(images0.mask_at(coarse_res)?)
        } else {
            None
        };
        let mask1 = if images1.is_padded() {
            Some(images1.mask_at(coarse_res)?)
        } else {
            None
        };
        self.match_features(&feats0, &feats1, mask0.as_ref(), mask1.as_ref(), options)
    }

    /// Matches precomputed backbone features.
    pub fn match_features(
        &self,
        feats0: &BackboneFeatures,
        feats1: &BackboneFeatures,
        mask0: Option<&PaddingMask>,
        mask1: Option<&PaddingMask>,
        options: &MatchOptions,
    ) -> DenseMatchResult<MatchOutput> {
        self.check_features(feats0, "image0")?;
        self.check_features(feats1, "image1")?;
        let n = feats0.coarse.batch();
        if feats1.coarse.batch() != n {
            return Err(DenseMatchError::shape(
                "dense_match",
                "batch size",
                &[n],
                &[feats1.coarse.batch()],
            ));
        }

        let _span = trace_span!("dense_match", batch = n).entered();
        let ctx = self.coarse_stage(&feats0.coarse, &feats1.coarse, mask0, mask1, &options.phase)?;
        let (windows, offsets) = self.fine_stage(&ctx, &feats0.fine, &feats1.fine)?;
        let matches = self.assemble(&ctx, &windows, &offsets);
        trace_event!("fine_matches", count = matches.len());

        let confidence = if options.return_confidence || options.phase.is_training() {
            Some(ctx.confidence)
        } else {
            None
        };
        Ok(MatchOutput {
            matches,
            confidence,
        })
    }

    /// Positional encoding, coarse attention and coarse match selection.
    pub fn coarse_stage(
        &self,
        coarse0: &FeatureMap,
        coarse1: &FeatureMap,
        mask0: Option<&PaddingMask>,
        mask1: Option<&PaddingMask>,
        phase: &RunPhase,
    ) -> DenseMatchResult<CoarseContext> {
        let grid0 = coarse0.grid();
        let grid1 = coarse1.grid();
        if let Some(mask) = mask0 {
            mask.check_against("dense_match", coarse0.batch(), grid0)?;
        }
        if let Some(mask) = mask1 {
            mask.check_against("dense_match", coarse1.batch(), grid1)?;
        }

        let tokens0 = self.pos_encoding.encode(coarse0)?.to_tokens();
        let tokens1 = self.pos_encoding.encode(coarse1)?.to_tokens();
        let flat0: Option<Array2<bool>> = mask0.map(PaddingMask::flatten);
        let flat1: Option<Array2<bool>> = mask1.map(PaddingMask::flatten);
        let (tokens0, tokens1) = self.coarse_stack.forward(
            tokens0,
            tokens1,
            flat0.as_ref().map(|m| m.view()),
            flat1.as_ref().map(|m| m.view()),
        )?;

        let confidence = self.coarse_matcher.confidence(
            tokens0.view(),
            tokens1.view(),
            flat0.as_ref().map(|m| m.view()),
            flat1.as_ref().map(|m| m.view()),
            phase,
        )?;
        let matches = self
            .coarse_matcher
            .select(&confidence, grid0, grid1, mask0, mask1, phase)?;

        Ok(CoarseContext {
            tokens0,
            tokens1,
            grid0,
            grid1,
            confidence,
            matches,
        })
    }

    /// Window cropping, fine attention and soft-argmax refinement.
    pub fn fine_stage(
        &self,
        ctx: &CoarseContext,
        fine0: &FeatureMap,
        fine1: &FeatureMap,
    ) -> DenseMatchResult<(FineWindows, FineOffsets)> {
        let mut windows = self.fine_preprocess.forward(
            fine0,
            fine1,
            ctx.tokens0.view(),
            ctx.tokens1.view(),
            ctx.grid0,
            ctx.grid1,
            &ctx.matches,
        )?;
        if windows.is_empty() {
            let offsets = FineOffsets {
                offsets: Array2::zeros((0, 2)),
                std: Array1::zeros(0),
            };
            return Ok((windows, offsets));
        }

        let win0 = std::mem::take(&mut windows.win0);
        let win1 = std::mem::take(&mut windows.win1);
        let (win0, win1) = self.fine_stack.forward(win0, win1, None, None)?;
        let offsets = self
            .fine_matcher
            .forward(win0.view(), win1.view(), windows.valid1.view())?;
        windows.win0 = win0;
        windows.win1 = win1;
        Ok((windows, offsets))
    }

    fn assemble(&self, ctx: &CoarseContext, windows: &FineWindows, fine: &FineOffsets) -> MatchSet {
        let coarse_scale = self.config.resolution.0 as f32;
        let fine_scale = self.config.resolution.1 as f32;
        let half = (windows.window_size / 2) as f32;
        let mut out = MatchSet::with_capacity(ctx.matches.len());
        for (k, m) in ctx.matches.iter().enumerate() {
            let (r0, c0) = ctx.grid0.cell(m.i);
            let (r1, c1) = ctx.grid1.cell(m.j);
            let dx = fine.offsets[[k, 0]];
            let dy = fine.offsets[[k, 1]];
            out.push(Match {
                batch: m.batch,
                i: m.i,
                j: m.j,
                confidence: m.confidence,
                offset0: [0.0, 0.0],
                offset1: [dx, dy],
                point0: [c0 as f32 * coarse_scale, r0 as f32 * coarse_scale],
                point1: [
                    c1 as f32 * coarse_scale + dx * half * fine_scale,
                    r1 as f32 * coarse_scale + dy * half * fine_scale,
                ],
                std: fine.std[k],
                ground_truth: m.ground_truth,
            });
        }
        out
    }

    fn check_features(&self, feats: &BackboneFeatures, image: &str) -> DenseMatchResult<()> {
        let cfg = &self.config;
        if feats.coarse.channels() != cfg.coarse.d_model {
            return Err(DenseMatchError::config(format!(
                "{image}: coarse features have {} channels, coarse.d_model is {}",
                feats.coarse.channels(),
                cfg.coarse.d_model
            )));
        }
        if feats.fine.channels() != cfg.fine.d_model {
            return Err(DenseMatchError::config(format!(
                "{image}: fine features have {} channels, fine.d_model is {}",
                feats.fine.channels(),
                cfg.fine.d_model
            )));
        }
        let stride = cfg.coarse_to_fine_stride();
        let (hc, wc) = (feats.coarse.height(), feats.coarse.width());
        let (hf, wf) = (feats.fine.height(), feats.fine.width());
        if hf != hc * stride || wf != wc * stride {
            return Err(DenseMatchError::config(format!(
                "{image}: fine map {hf}x{wf} is not {stride}x the coarse map {hc}x{wc}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DenseMatcher, MatchOptions};
    use crate::config::{AttentionVariant, LayerKind, MatcherConfig};
    use crate::feature::{BackboneFeatures, FeatureMap};
    use crate::DenseMatchError;

    fn small_config() -> MatcherConfig {
        let mut cfg = MatcherConfig::default();
        cfg.coarse.d_model = 8;
        cfg.coarse.nhead = 2;
        cfg.coarse.layer_order = vec![LayerKind::SelfAttention, LayerKind::CrossAttention];
        cfg.coarse.attention_variant = AttentionVariant::Full;
        cfg.fine.d_model = 4;
        cfg.fine.nhead = 2;
        cfg.fine.window_size = 3;
        cfg
    }

    fn features(cfg: &MatcherConfig, hc: usize, wc: usize) -> BackboneFeatures {
        let stride = cfg.coarse_to_fine_stride();
        let coarse = FeatureMap::from_fn((1, cfg.coarse.d_model, hc, wc), |(_, c, y, x)| {
            ((c * 7 + y * 3 + x) % 5) as f32 - 2.0
        })
        .unwrap();
        let fine = FeatureMap::from_fn(
            (1, cfg.fine.d_model, hc * stride, wc * stride),
            |(_, c, y, x)| ((c + y * 5 + x * 3) % 7) as f32 - 3.0,
        )
        .unwrap();
        BackboneFeatures::new(coarse, fine).unwrap()
    }

    #[test]
    fn param_names_follow_the_checkpoint_layout() {
        let specs = DenseMatcher::param_specs(&small_config());
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"loftr_coarse.layers.1.mlp.2.weight"));
        assert!(names.contains(&"fine_preprocess.merge_feat.bias"));
        assert!(names.contains(&"loftr_fine.layers.0.norm2.bias"));
    }

    #[test]
    fn channel_mismatch_is_a_config_error() {
        let cfg = small_config();
        let matcher = DenseMatcher::with_random_weights(cfg.clone(), 1).unwrap();
        let mut other = cfg.clone();
        other.coarse.d_model = 12;
        let feats0 = features(&cfg, 6, 6);
        let feats1 = features(&other, 6, 6);
        let err = matcher
            .match_features(&feats0, &feats1, None, None, &MatchOptions::default())
            .unwrap_err();
        assert!(matches!(err, DenseMatchError::InvalidConfig { .. }));
    }

    #[test]
    fn matches_stay_inside_both_images() {
        let cfg = small_config();
        let matcher = DenseMatcher::with_random_weights(cfg.clone(), 3).unwrap();
        let feats = features(&cfg, 6, 7);
        let options = MatchOptions {
            return_confidence: true,
            ..MatchOptions::default()
        };
        let out = matcher
            .match_features(&feats, &feats, None, None, &options)
            .unwrap();
        assert_eq!(out.confidence.map(|c| c.rows()), Some(42));
        let (w, h) = (7.0 * 8.0, 6.0 * 8.0);
        for m in out.matches.iter() {
            assert!(m.point0[0] < w && m.point0[1] < h);
            assert!(m.offset1.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }
}
