//! Ordered self/cross layer stack shared by the coarse and fine stages.

use crate::attention::EncoderLayer;
use crate::config::{LayerKind, StackConfig};
use crate::feature::check_token_mask;
use crate::params::{ParamLoader, ParamSpec};
use crate::trace::trace_span;
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array3, ArrayView2};

/// A sequence of encoder layers transforming two token sequences jointly.
///
/// Layer `i` is stored under `{prefix}.layers.{i}`. Self layers update each
/// sequence from itself; cross layers update `feat0` from `feat1` and then
/// `feat1` from the already updated `feat0`.
#[derive(Clone, Debug)]
pub struct AttentionStack {
    stage: &'static str,
    d_model: usize,
    layers: Vec<(LayerKind, EncoderLayer)>,
}

impl AttentionStack {
    /// Parameter specs of a stack stored under `prefix`.
    pub fn param_specs(prefix: &str, cfg: &StackConfig) -> Vec<ParamSpec> {
        (0..cfg.layer_order.len())
            .flat_map(|i| EncoderLayer::param_specs(&format!("{prefix}.layers.{i}"), cfg.d_model))
            .collect()
    }

    /// Loads a stack stored under `prefix`; `stage` names it in errors.
    pub fn load(
        loader: &mut ParamLoader<'_>,
        prefix: &str,
        stage: &'static str,
        cfg: &StackConfig,
    ) -> DenseMatchResult<Self> {
        cfg.validate(stage)?;
        let layers = cfg
            .layer_order
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let layer = EncoderLayer::load(
                    loader,
                    &format!("{prefix}.layers.{i}"),
                    cfg.d_model,
                    cfg.nhead,
                    cfg.attention_variant,
                )?;
                Ok((kind, layer))
            })
            .collect::<DenseMatchResult<Vec<_>>>()?;
        Ok(Self {
            stage,
            d_model: cfg.d_model,
            layers,
        })
    }

    /// Enables rayon for the per-sample attention of every layer.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.layers = self
            .layers
            .into_iter()
            .map(|(kind, layer)| (kind, layer.with_parallel(parallel)))
            .collect();
        self
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs the stack on `feat0` `(N, L, C)` and `feat1` `(N, S, C)`.
    ///
    /// Masks are `(N, L)` and `(N, S)` with `true` for real tokens. Output
    /// shapes equal input shapes.
    pub fn forward(
        &self,
        feat0: Array3<f32>,
        feat1: Array3<f32>,
        mask0: Option<ArrayView2<'_, bool>>,
        mask1: Option<ArrayView2<'_, bool>>,
    ) -> DenseMatchResult<(Array3<f32>, Array3<f32>)> {
        let (n0, l, c0) = feat0.dim();
        let (n1, s, c1) = feat1.dim();
        if c0 != self.d_model || c1 != self.d_model {
            return Err(DenseMatchError::shape(
                self.stage,
                "feature channels",
                &[self.d_model, self.d_model],
                &[c0, c1],
            ));
        }
        if n0 != n1 {
            return Err(DenseMatchError::shape(self.stage, "batch size", &[n0], &[n1]));
        }
        check_token_mask(self.stage, mask0, n0, l)?;
        check_token_mask(self.stage, mask1, n1, s)?;

        let _span = trace_span!("attention_stack", stage = self.stage, layers = self.layers.len())
            .entered();
        let mut feat0 = feat0;
        let mut feat1 = feat1;
        for (kind, layer) in &self.layers {
            match kind {
                LayerKind::SelfAttention => {
                    feat0 = layer.forward(feat0.view(), feat0.view(), mask0, mask0);
                    feat1 = layer.forward(feat1.view(), feat1.view(), mask1, mask1);
                }
                LayerKind::CrossAttention => {
                    feat0 = layer.forward(feat0.view(), feat1.view(), mask0, mask1);
                    feat1 = layer.forward(feat1.view(), feat0.view(), mask1, mask0);
                }
            }
        }
        Ok((feat0, feat1))
    }
}

#[cfg(test)]
mod tests {
    use super::AttentionStack;
    use crate::config::{AttentionVariant, LayerKind, StackConfig};
    use crate::params::{ParamLoader, StateDict};
    use crate::DenseMatchError;
    use ndarray::{Array2, Array3};

    fn config(variant: AttentionVariant) -> StackConfig {
        StackConfig {
            d_model: 8,
            nhead: 2,
            layer_order: vec![LayerKind::SelfAttention, LayerKind::CrossAttention],
            attention_variant: variant,
        }
    }

    fn stack(cfg: &StackConfig) -> AttentionStack {
        let dict = StateDict::initialize(&AttentionStack::param_specs("s", cfg), 11);
        let mut loader = ParamLoader::new(&dict);
        let stack = AttentionStack::load(&mut loader, "s", "test", cfg).unwrap();
        loader.finish().unwrap();
        stack
    }

    #[test]
    fn param_names_follow_layer_index() {
        let specs = AttentionStack::param_specs("loftr_coarse", &config(AttentionVariant::Linear));
        assert!(specs
            .iter()
            .any(|s| s.name == "loftr_coarse.layers.1.mlp.2.weight" && s.shape == vec![8, 16]));
        assert!(specs.iter().all(|s| !s.name.contains("layers.2")));
    }

    #[test]
    fn channel_mismatch_is_a_shape_error() {
        let stack = stack(&config(AttentionVariant::Full));
        let err = stack
            .forward(Array3::zeros((1, 4, 8)), Array3::zeros((1, 4, 6)), None, None)
            .unwrap_err();
        assert!(matches!(err, DenseMatchError::ShapeMismatch { .. }));
    }

    #[test]
    fn mask_length_is_checked() {
        let stack = stack(&config(AttentionVariant::Linear));
        let mask = Array2::from_elem((1, 3), true);
        let err = stack
            .forward(
                Array3::zeros((1, 4, 8)),
                Array3::zeros((1, 5, 8)),
                Some(mask.view()),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, DenseMatchError::ShapeMismatch { .. }));
    }
}
