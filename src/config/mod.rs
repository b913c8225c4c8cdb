//! Matcher configuration.
//!
//! The configuration mirrors the sectioned layout used by trained LoFTR-style
//! checkpoints (`coarse`, `match_coarse`, `fine`). It is deserialized with
//! `serde`; unknown keys are rejected and the keys that select the model
//! architecture have no defaults, so a config written for a different model
//! fails loudly instead of silently running with the wrong shapes.

use crate::util::{DenseMatchError, DenseMatchResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Kind of an attention layer in a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Each image attends to itself.
    #[serde(rename = "self")]
    SelfAttention,
    /// Each image attends to the other image.
    #[serde(rename = "cross")]
    CrossAttention,
}

/// Attention aggregation used inside every encoder layer of a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionVariant {
    /// Kernelized attention, linear in the token count.
    Linear,
    /// Softmax attention, quadratic in the token count.
    Full,
}

/// Normalization producing the coarse confidence matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseMatchMode {
    /// Row softmax times column softmax.
    DualSoftmax,
    /// Log-domain Sinkhorn balancing with a learned dustbin score.
    #[serde(alias = "optimal_transport")]
    Sinkhorn,
}

/// Coarse attention stack and positional encoding settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoarseConfig {
    /// Channel count of the coarse feature maps.
    pub d_model: usize,
    /// Selects the corrected positional-encoding frequencies.
    pub temp_bug_fix: bool,
    /// Ordered layer kinds of the coarse stack.
    pub layer_order: Vec<LayerKind>,
    /// Attention aggregation of the coarse stack.
    pub attention_variant: AttentionVariant,
    /// Number of attention heads.
    #[serde(default = "default_nhead")]
    pub nhead: usize,
    /// Largest coarse grid `(height, width)` the positional encoding covers.
    #[serde(default = "default_max_shape")]
    pub max_shape: (usize, usize),
}

/// Coarse match selection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoarseMatchConfig {
    /// Confidence normalization.
    pub mode: CoarseMatchMode,
    /// Minimum confidence for a coarse match (exclusive).
    pub threshold: f32,
    /// Cells within this distance of the grid edge are never matched.
    #[serde(default = "default_border_rm")]
    pub border_rm: usize,
    /// Softmax temperature of the dual-softmax mode.
    #[serde(default = "default_dsmax_temperature")]
    pub dsmax_temperature: f32,
    /// Sinkhorn iterations.
    #[serde(default = "default_skh_iters")]
    pub skh_iters: usize,
    /// Initial dustbin score used when weights are initialized from scratch.
    #[serde(default = "default_skh_init_bin_score")]
    pub skh_init_bin_score: f32,
    /// Drop rows and columns whose best assignment is the dustbin.
    #[serde(default)]
    pub skh_prefilter: bool,
    /// Fraction of `batch * max(L, S)` kept as coarse matches in training.
    #[serde(default = "default_train_coarse_percent")]
    pub train_coarse_percent: f32,
    /// Minimum number of ground-truth pairs padded in during training.
    #[serde(default = "default_train_pad_num_gt_min")]
    pub train_pad_num_gt_min: usize,
}

/// Fine stack and window settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FineConfig {
    /// Channel count of the fine feature maps.
    pub d_model: usize,
    /// Side length of the square refinement window, in fine pixels.
    pub window_size: usize,
    /// Number of attention heads.
    #[serde(default = "default_nhead")]
    pub nhead: usize,
    /// Ordered layer kinds of the fine stack.
    #[serde(default = "default_fine_layer_order")]
    pub layer_order: Vec<LayerKind>,
    /// Attention aggregation of the fine stack.
    #[serde(default = "default_attention_variant")]
    pub attention_variant: AttentionVariant,
    /// Fuse the coarse token of each match into its fine window.
    #[serde(default = "default_true")]
    pub concat_coarse_feat: bool,
}

/// Top-level matcher configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatcherConfig {
    /// Downsampling factors `(coarse, fine)` relative to the input image.
    #[serde(default = "default_resolution")]
    pub resolution: (usize, usize),
    pub coarse: CoarseConfig,
    pub match_coarse: CoarseMatchConfig,
    pub fine: FineConfig,
    /// Use the rayon pool for per-sample and per-match work.
    #[serde(default)]
    pub parallel: bool,
}

/// Shape-defining settings shared by both attention stacks.
#[derive(Clone, Debug, PartialEq)]
pub struct StackConfig {
    pub d_model: usize,
    pub nhead: usize,
    pub layer_order: Vec<LayerKind>,
    pub attention_variant: AttentionVariant,
}

fn default_nhead() -> usize {
    8
}

fn default_max_shape() -> (usize, usize) {
    (256, 256)
}

fn default_border_rm() -> usize {
    2
}

fn default_dsmax_temperature() -> f32 {
    0.1
}

fn default_skh_iters() -> usize {
    3
}

fn default_skh_init_bin_score() -> f32 {
    1.0
}

fn default_train_coarse_percent() -> f32 {
    0.2
}

fn default_train_pad_num_gt_min() -> usize {
    200
}

fn default_fine_layer_order() -> Vec<LayerKind> {
    vec![LayerKind::SelfAttention, LayerKind::CrossAttention]
}

fn default_attention_variant() -> AttentionVariant {
    AttentionVariant::Linear
}

fn default_true() -> bool {
    true
}

fn default_resolution() -> (usize, usize) {
    (8, 2)
}

impl Default for CoarseConfig {
    fn default() -> Self {
        let mut layer_order = Vec::with_capacity(8);
        for _ in 0..4 {
            layer_order.push(LayerKind::SelfAttention);
            layer_order.push(LayerKind::CrossAttention);
        }
        Self {
            d_model: 256,
            temp_bug_fix: true,
            layer_order,
            attention_variant: AttentionVariant::Linear,
            nhead: default_nhead(),
            max_shape: default_max_shape(),
        }
    }
}

impl Default for CoarseMatchConfig {
    fn default() -> Self {
        Self {
            mode: CoarseMatchMode::DualSoftmax,
            threshold: 0.2,
            border_rm: default_border_rm(),
            dsmax_temperature: default_dsmax_temperature(),
            skh_iters: default_skh_iters(),
            skh_init_bin_score: default_skh_init_bin_score(),
            skh_prefilter: false,
            train_coarse_percent: default_train_coarse_percent(),
            train_pad_num_gt_min: default_train_pad_num_gt_min(),
        }
    }
}

impl Default for FineConfig {
    fn default() -> Self {
        Self {
            d_model: 128,
            window_size: 5,
            nhead: default_nhead(),
            layer_order: default_fine_layer_order(),
            attention_variant: default_attention_variant(),
            concat_coarse_feat: true,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            coarse: CoarseConfig::default(),
            match_coarse: CoarseMatchConfig::default(),
            fine: FineConfig::default(),
            parallel: false,
        }
    }
}

impl CoarseConfig {
    /// Returns the stack settings of the coarse attention stack.
    pub fn stack(&self) -> StackConfig {
        StackConfig {
            d_model: self.d_model,
            nhead: self.nhead,
            layer_order: self.layer_order.clone(),
            attention_variant: self.attention_variant,
        }
    }
}

impl FineConfig {
    /// Returns the stack settings of the fine attention stack.
    pub fn stack(&self) -> StackConfig {
        StackConfig {
            d_model: self.d_model,
            nhead: self.nhead,
            layer_order: self.layer_order.clone(),
            attention_variant: self.attention_variant,
        }
    }
}

impl StackConfig {
    /// Checks head divisibility and that the stack is non-empty.
    pub fn validate(&self, section: &str) -> DenseMatchResult<()> {
        if self.d_model == 0 || self.nhead == 0 {
            return Err(DenseMatchError::config(format!(
                "{section}: d_model and nhead must be positive"
            )));
        }
        if self.d_model % self.nhead != 0 {
            return Err(DenseMatchError::config(format!(
                "{section}: d_model {} is not divisible by nhead {}",
                self.d_model, self.nhead
            )));
        }
        if self.layer_order.is_empty() {
            return Err(DenseMatchError::config(format!(
                "{section}: layer_order must not be empty"
            )));
        }
        Ok(())
    }
}

impl MatcherConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(text: &str) -> DenseMatchResult<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|err| DenseMatchError::config(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> DenseMatchResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            DenseMatchError::config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Ratio between fine and coarse feature resolution.
    pub fn coarse_to_fine_stride(&self) -> usize {
        self.resolution.0 / self.resolution.1.max(1)
    }

    /// Rejects internally inconsistent settings.
    pub fn validate(&self) -> DenseMatchResult<()> {
        let (coarse_res, fine_res) = self.resolution;
        if coarse_res == 0 || fine_res == 0 || coarse_res < fine_res || coarse_res % fine_res != 0 {
            return Err(DenseMatchError::config(format!(
                "resolution ({coarse_res}, {fine_res}) must be positive with an integer coarse/fine ratio"
            )));
        }

        self.coarse.stack().validate("coarse")?;
        if self.coarse.d_model % 4 != 0 {
            return Err(DenseMatchError::config(format!(
                "coarse: d_model {} must be a multiple of 4 for the positional encoding",
                self.coarse.d_model
            )));
        }
        if self.coarse.max_shape.0 == 0 || self.coarse.max_shape.1 == 0 {
            return Err(DenseMatchError::config("coarse: max_shape must be positive"));
        }

        let m = &self.match_coarse;
        if !(0.0..=1.0).contains(&m.threshold) {
            return Err(DenseMatchError::config(format!(
                "match_coarse: threshold {} is outside [0, 1]",
                m.threshold
            )));
        }
        if !(m.dsmax_temperature > 0.0) {
            return Err(DenseMatchError::config(
                "match_coarse: dsmax_temperature must be positive",
            ));
        }
        if m.mode == CoarseMatchMode::Sinkhorn && m.skh_iters == 0 {
            return Err(DenseMatchError::config(
                "match_coarse: skh_iters must be at least 1",
            ));
        }
        if !(m.train_coarse_percent > 0.0 && m.train_coarse_percent <= 1.0) {
            return Err(DenseMatchError::config(format!(
                "match_coarse: train_coarse_percent {} is outside (0, 1]",
                m.train_coarse_percent
            )));
        }

        self.fine.stack().validate("fine")?;
        let w = self.fine.window_size;
        if w < 3 || w % 2 == 0 {
            return Err(DenseMatchError::config(format!(
                "fine: window_size {w} must be odd and at least 3"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{AttentionVariant, CoarseMatchMode, LayerKind, MatcherConfig};
    use crate::DenseMatchError;

    const MINIMAL: &str = r#"{
        "coarse": {
            "d_model": 64,
            "temp_bug_fix": false,
            "layer_order": ["self", "cross"],
            "attention_variant": "full"
        },
        "match_coarse": { "mode": "optimal_transport", "threshold": 0.3 },
        "fine": { "d_model": 16, "window_size": 5 }
    }"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = MatcherConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(cfg.resolution, (8, 2));
        assert_eq!(cfg.coarse.nhead, 8);
        assert_eq!(
            cfg.coarse.layer_order,
            vec![LayerKind::SelfAttention, LayerKind::CrossAttention]
        );
        assert_eq!(cfg.coarse.attention_variant, AttentionVariant::Full);
        assert_eq!(cfg.match_coarse.mode, CoarseMatchMode::Sinkhorn);
        assert_eq!(cfg.match_coarse.border_rm, 2);
        assert_eq!(cfg.fine.layer_order.len(), 2);
        assert!(cfg.fine.concat_coarse_feat);
        assert_eq!(cfg.coarse_to_fine_stride(), 4);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let text = MINIMAL.replace("\"window_size\": 5", "\"window_size\": 5, \"stride\": 4");
        let err = MatcherConfig::from_json_str(&text).unwrap_err();
        assert!(matches!(err, DenseMatchError::InvalidConfig { .. }));
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let text = MINIMAL.replace("\"temp_bug_fix\": false,", "");
        let err = MatcherConfig::from_json_str(&text).unwrap_err();
        assert!(matches!(err, DenseMatchError::InvalidConfig { .. }));
    }

    #[test]
    fn even_window_is_rejected() {
        let mut cfg = MatcherConfig::default();
        cfg.fine.window_size = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn head_divisibility_is_checked() {
        let mut cfg = MatcherConfig::default();
        cfg.coarse.nhead = 7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        MatcherConfig::default().validate().unwrap();
    }
}
