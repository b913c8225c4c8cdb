//! DenseMatch is a CPU implementation of detector-free, coarse-to-fine
//! dense image matching.
//!
//! Coarse feature maps of two images are enhanced by interleaved self and
//! cross attention, matched through a dual-softmax or Sinkhorn confidence
//! matrix, and every selected coarse match is refined to sub-pixel accuracy
//! by a soft-argmax over a local window of fine features. Parallelism is
//! available through the `rayon` feature, stage tracing through `tracing`,
//! and image loading through `image-io`.

pub mod attention;
pub mod backbone;
pub mod coarse;
pub mod config;
pub mod feature;
pub mod fine;
pub mod image;
pub mod nn;
pub mod params;
pub mod pipeline;
pub mod position;
mod trace;
pub mod util;

pub use attention::{AttentionStack, EncoderLayer, FullAttention, LinearAttention};
pub use backbone::{Backbone, PatchBackbone};
pub use coarse::{
    mutual_nearest_filter, CoarseMatch, CoarseMatcher, CoarseMatches, CoarsePair,
    ConfidenceMatrix, RunPhase, TrainingInputs,
};
pub use config::{
    AttentionVariant, CoarseConfig, CoarseMatchConfig, CoarseMatchMode, FineConfig, LayerKind,
    MatcherConfig,
};
pub use feature::{BackboneFeatures, FeatureMap, GridShape, PaddingMask};
pub use fine::{FineMatcher, FineOffsets, FinePreprocess, FineWindows};
pub use crate::image::{ImageBatch, ImageView, OwnedImage};
pub use params::StateDict;
pub use pipeline::{CoarseContext, DenseMatcher, Match, MatchOptions, MatchOutput, MatchSet};
pub use position::PositionEncodingSine;
pub use util::{DenseMatchError, DenseMatchResult};

#[cfg(feature = "image-io")]
pub use crate::image::io;
