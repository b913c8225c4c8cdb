//! Error types for densematch.

use thiserror::Error;

/// Result alias for densematch operations.
pub type DenseMatchResult<T> = std::result::Result<T, DenseMatchError>;

/// Errors that can occur when building or running the matching pipeline.
///
/// Degenerate data (no matches, fully padded samples, windows clipped at the
/// image border) is never reported through this type.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DenseMatchError {
    /// The configuration is malformed or internally inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    /// A tensor handed to a stage does not have the shape the stage requires.
    #[error("{stage}: shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        stage: &'static str,
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A feature map is larger than the precomputed positional encoding.
    #[error(
        "feature map {height}x{width} exceeds the positional encoding maximum {max_height}x{max_width}"
    )]
    ExceedsMaxShape {
        height: usize,
        width: usize,
        max_height: usize,
        max_width: usize,
    },
    /// A required parameter is absent from the state dictionary.
    #[error("missing parameter `{name}`")]
    MissingParameter { name: String },
    /// A parameter exists but has the wrong shape.
    #[error("parameter `{name}` has shape {got:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// The state dictionary carries a key no module consumes.
    #[error("unexpected parameter `{name}`")]
    UnexpectedParameter { name: String },
    /// Image dimensions are zero or overflow.
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
    /// The provided buffer is too small for the requested view.
    #[error("buffer too small: needed {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },
    /// The stride is smaller than the row width.
    #[error("invalid stride: width {width}, stride {stride}")]
    InvalidStride { width: usize, stride: usize },
    /// Image decoding or loading failed.
    #[error("image io: {reason}")]
    ImageIo { reason: String },
}

impl DenseMatchError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(
        stage: &'static str,
        what: &'static str,
        expected: &[usize],
        got: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            stage,
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
