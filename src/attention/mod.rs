//! Self/cross attention stacks over flattened feature tokens.
//!
//! An [`AttentionStack`] is a sequence of [`EncoderLayer`]s tagged `self` or
//! `cross`. The aggregation inside each layer is pluggable through the
//! [`Attention`] trait; [`LinearAttention`] and [`FullAttention`] are
//! interchangeable in shape and usage.

mod full;
mod layer;
mod linear;
mod stack;

pub use full::FullAttention;
pub use layer::EncoderLayer;
pub use linear::LinearAttention;
pub use stack::AttentionStack;

use crate::config::AttentionVariant;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Single-head attention aggregation.
///
/// `q` is `(L, D)`, `k` and `v` are `(S, D)`; the result is `(L, D)`. Masks
/// mark valid query and key positions. Implementations must keep shapes
/// static: masked positions are suppressed numerically, never removed.
pub trait Attention {
    fn attend_head(
        &self,
        q: ArrayView2<'_, f32>,
        k: ArrayView2<'_, f32>,
        v: ArrayView2<'_, f32>,
        q_mask: Option<ArrayView1<'_, bool>>,
        kv_mask: Option<ArrayView1<'_, bool>>,
    ) -> Array2<f32>;
}

/// Attention implementation selected by configuration.
#[derive(Clone, Debug)]
pub enum AttentionBackend {
    Linear(LinearAttention),
    Full(FullAttention),
}

impl AttentionBackend {
    pub fn from_variant(variant: AttentionVariant) -> Self {
        match variant {
            AttentionVariant::Linear => Self::Linear(LinearAttention::default()),
            AttentionVariant::Full => Self::Full(FullAttention),
        }
    }
}

impl Attention for AttentionBackend {
    fn attend_head(
        &self,
        q: ArrayView2<'_, f32>,
        k: ArrayView2<'_, f32>,
        v: ArrayView2<'_, f32>,
        q_mask: Option<ArrayView1<'_, bool>>,
        kv_mask: Option<ArrayView1<'_, bool>>,
    ) -> Array2<f32> {
        match self {
            Self::Linear(attn) => attn.attend_head(q, k, v, q_mask, kv_mask),
            Self::Full(attn) => attn.attend_head(q, k, v, q_mask, kv_mask),
        }
    }
}

/// Runs `attn` per head on one sample and returns `(L, C)`.
fn attend_sample<A: Attention + ?Sized>(
    attn: &A,
    q: ArrayView2<'_, f32>,
    k: ArrayView2<'_, f32>,
    v: ArrayView2<'_, f32>,
    nhead: usize,
    q_mask: Option<ArrayView1<'_, bool>>,
    kv_mask: Option<ArrayView1<'_, bool>>,
) -> Array2<f32> {
    let (l, c) = q.dim();
    let d = c / nhead;
    let mut out = Array2::<f32>::zeros((l, c));
    for h in 0..nhead {
        let cols = h * d..(h + 1) * d;
        let msg = attn.attend_head(
            q.slice(s![.., cols.clone()]),
            k.slice(s![.., cols.clone()]),
            v.slice(s![.., cols.clone()]),
            q_mask,
            kv_mask,
        );
        out.slice_mut(s![.., cols]).assign(&msg);
    }
    out
}

/// Multi-head attention over `(batch, tokens, channels)` inputs.
///
/// Channels are split into `nhead` contiguous groups of `C / nhead`.
pub fn multi_head<A: Attention + ?Sized>(
    attn: &A,
    q: ArrayView3<'_, f32>,
    k: ArrayView3<'_, f32>,
    v: ArrayView3<'_, f32>,
    nhead: usize,
    q_mask: Option<ArrayView2<'_, bool>>,
    kv_mask: Option<ArrayView2<'_, bool>>,
) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(q.dim());
    for (b, mut dst) in out.outer_iter_mut().enumerate() {
        let msg = attend_sample(
            attn,
            q.index_axis(Axis(0), b),
            k.index_axis(Axis(0), b),
            v.index_axis(Axis(0), b),
            nhead,
            q_mask.map(|m| m.index_axis_move(Axis(0), b)),
            kv_mask.map(|m| m.index_axis_move(Axis(0), b)),
        );
        dst.assign(&msg);
    }
    out
}

/// Batch-parallel variant of [`multi_head`] (rayon).
#[cfg(feature = "rayon")]
pub fn multi_head_par<A: Attention + Sync + ?Sized>(
    attn: &A,
    q: ArrayView3<'_, f32>,
    k: ArrayView3<'_, f32>,
    v: ArrayView3<'_, f32>,
    nhead: usize,
    q_mask: Option<ArrayView2<'_, bool>>,
    kv_mask: Option<ArrayView2<'_, bool>>,
) -> Array3<f32> {
    let n = q.dim().0;
    let messages: Vec<Array2<f32>> = (0..n)
        .into_par_iter()
        .map(|b| {
            attend_sample(
                attn,
                q.index_axis(Axis(0), b),
                k.index_axis(Axis(0), b),
                v.index_axis(Axis(0), b),
                nhead,
                q_mask.map(|m| m.index_axis_move(Axis(0), b)),
                kv_mask.map(|m| m.index_axis_move(Axis(0), b)),
            )
        })
        .collect();

    let mut out = Array3::<f32>::zeros(q.dim());
    for (mut dst, msg) in out.outer_iter_mut().zip(messages.iter()) {
        dst.assign(msg);
    }
    out
}
