//! One attention encoder layer.

use crate::attention::{multi_head, AttentionBackend};
use crate::config::AttentionVariant;
use crate::nn::{relu_inplace, LayerNorm, Linear};
use crate::params::{ParamLoader, ParamSpec};
use crate::util::DenseMatchResult;
use ndarray::{s, Array3, ArrayView2, ArrayView3};

/// Multi-head attention followed by a two-layer feed-forward merge.
///
/// `forward(x, source)` returns
/// `x + norm2(mlp([x, norm1(merge(attention(q(x), k(source), v(source))))]))`.
/// Self layers pass the same tensor as `x` and `source`.
#[derive(Clone, Debug)]
pub struct EncoderLayer {
    nhead: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    merge: Linear,
    mlp_in: Linear,
    mlp_out: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    attention: AttentionBackend,
    parallel: bool,
}

impl EncoderLayer {
    /// Parameter names and shapes of a layer named `prefix`.
    pub fn param_specs(prefix: &str, d_model: usize) -> Vec<ParamSpec> {
        let c = d_model;
        let mut specs = Vec::new();
        for proj in ["q_proj", "k_proj", "v_proj", "merge"] {
            specs.extend(ParamSpec::linear(&format!("{prefix}.{proj}"), c, c, false));
        }
        specs.extend(ParamSpec::linear(&format!("{prefix}.mlp.0"), 2 * c, 2 * c, false));
        specs.extend(ParamSpec::linear(&format!("{prefix}.mlp.2"), 2 * c, c, false));
        specs.extend(ParamSpec::layer_norm(&format!("{prefix}.norm1"), c));
        specs.extend(ParamSpec::layer_norm(&format!("{prefix}.norm2"), c));
        specs
    }

    /// Loads a layer named `prefix`.
    pub fn load(
        loader: &mut ParamLoader<'_>,
        prefix: &str,
        d_model: usize,
        nhead: usize,
        variant: AttentionVariant,
    ) -> DenseMatchResult<Self> {
        let c = d_model;
        Ok(Self {
            nhead,
            q_proj: loader.linear(&format!("{prefix}.q_proj"), c, c, false)?,
            k_proj: loader.linear(&format!("{prefix}.k_proj"), c, c, false)?,
            v_proj: loader.linear(&format!("{prefix}.v_proj"), c, c, false)?,
            merge: loader.linear(&format!("{prefix}.merge"), c, c, false)?,
            mlp_in: loader.linear(&format!("{prefix}.mlp.0"), 2 * c, 2 * c, false)?,
            mlp_out: loader.linear(&format!("{prefix}.mlp.2"), 2 * c, c, false)?,
            norm1: loader.layer_norm(&format!("{prefix}.norm1"), c)?,
            norm2: loader.layer_norm(&format!("{prefix}.norm2"), c)?,
            attention: AttentionBackend::from_variant(variant),
            parallel: false,
        })
    }

    /// Spreads the per-sample attention over the rayon pool when enabled.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Updates `x` `(N, L, C)` with a message aggregated from `source` `(N, S, C)`.
    pub fn forward(
        &self,
        x: ArrayView3<'_, f32>,
        source: ArrayView3<'_, f32>,
        x_mask: Option<ArrayView2<'_, bool>>,
        source_mask: Option<ArrayView2<'_, bool>>,
    ) -> Array3<f32> {
        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(source);
        let v = self.v_proj.forward(source);
        let message = self.attend(q.view(), k.view(), v.view(), x_mask, source_mask);
        let message = self.norm1.forward(self.merge.forward(message.view()).view());

        let (n, l, c) = x.dim();
        let mut cat = Array3::<f32>::zeros((n, l, 2 * c));
        cat.slice_mut(s![.., .., ..c]).assign(&x);
        cat.slice_mut(s![.., .., c..]).assign(&message);

        let mut hidden = self.mlp_in.forward(cat.view());
        relu_inplace(&mut hidden);
        let message = self.norm2.forward(self.mlp_out.forward(hidden.view()).view());
        &x + &message
    }

    fn attend(
        &self,
        q: ArrayView3<'_, f32>,
        k: ArrayView3<'_, f32>,
        v: ArrayView3<'_, f32>,
        q_mask: Option<ArrayView2<'_, bool>>,
        kv_mask: Option<ArrayView2<'_, bool>>,
    ) -> Array3<f32> {
        if self.parallel {
            #[cfg(feature = "rayon")]
            return crate::attention::multi_head_par(
                &self.attention,
                q,
                k,
                v,
                self.nhead,
                q_mask,
                kv_mask,
            );
        }
        multi_head(&self.attention, q, k, v, self.nhead, q_mask, kv_mask)
    }
}
