//! Named parameter storage and strict checkpoint loading.
//!
//! A `StateDict` maps PyTorch-style parameter names (for example
//! `loftr_coarse.layers.0.q_proj.weight`) to dense `f32` arrays. Turning a
//! checkpoint file into a `StateDict` is the caller's job; this module only
//! handles name normalization, shape checking and strictness.

use crate::nn::{LayerNorm, Linear};
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Historical prefix carried by checkpoints saved from a wrapping module.
pub const LEGACY_PREFIX: &str = "matcher.";

/// Parameters owned by the backbone; the matcher leaves them alone.
pub const BACKBONE_PREFIX: &str = "backbone.";

/// Named parameter tensors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl StateDict {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Returns the tensor stored under `name`.
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Mutable access to the tensor stored under `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterates over parameter names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Returns a copy where every key is prefixed with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v.clone()))
            .collect();
        Self { tensors }
    }

    /// Strips the historical `matcher.` prefix from every key that starts with it.
    pub fn strip_legacy_prefix(self) -> Self {
        let tensors = self
            .tensors
            .into_iter()
            .map(|(k, v)| match k.strip_prefix(LEGACY_PREFIX) {
                Some(stripped) => (stripped.to_owned(), v),
                None => (k, v),
            })
            .collect();
        Self { tensors }
    }

    /// Builds a freshly initialized dictionary for the given parameter specs.
    ///
    /// Matrices use Xavier-uniform initialization, biases a fan-in scaled
    /// uniform; normalization scales start at one. The same seed always
    /// produces the same dictionary.
    pub fn initialize(specs: &[ParamSpec], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut dict = Self::new();
        for spec in specs {
            let shape = IxDyn(&spec.shape);
            let tensor = match spec.init {
                Init::XavierUniform => {
                    let fan_out = spec.shape.first().copied().unwrap_or(1);
                    let fan_in = spec.shape.get(1).copied().unwrap_or(1);
                    let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
                    ArrayD::from_shape_fn(shape, |_| rng.random_range(-bound..bound))
                }
                Init::FanInUniform { fan_in } => {
                    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                    ArrayD::from_shape_fn(shape, |_| rng.random_range(-bound..bound))
                }
                Init::Constant(value) => ArrayD::from_elem(shape, value),
            };
            dict.insert(spec.name.clone(), tensor);
        }
        dict
    }
}

/// Initialization rule for a parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Init {
    XavierUniform,
    FanInUniform { fan_in: usize },
    Constant(f32),
}

/// Name, shape and initialization of one parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], init: Init) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            init,
        }
    }

    /// Specs of a Linear layer named `prefix`.
    pub fn linear(prefix: &str, in_features: usize, out_features: usize, bias: bool) -> Vec<Self> {
        let mut out = vec![Self::new(
            format!("{prefix}.weight"),
            &[out_features, in_features],
            Init::XavierUniform,
        )];
        if bias {
            out.push(Self::new(
                format!("{prefix}.bias"),
                &[out_features],
                Init::FanInUniform {
                    fan_in: in_features,
                },
            ));
        }
        out
    }

    /// Specs of a LayerNorm named `prefix`.
    pub fn layer_norm(prefix: &str, features: usize) -> Vec<Self> {
        vec![
            Self::new(format!("{prefix}.weight"), &[features], Init::Constant(1.0)),
            Self::new(format!("{prefix}.bias"), &[features], Init::Constant(0.0)),
        ]
    }
}

/// Reads parameters out of a `StateDict`, remembering what was consumed.
pub struct ParamLoader<'a> {
    dict: &'a StateDict,
    consumed: BTreeSet<String>,
}

impl<'a> ParamLoader<'a> {
    pub fn new(dict: &'a StateDict) -> Self {
        Self {
            dict,
            consumed: BTreeSet::new(),
        }
    }

    /// Fetches a tensor and checks its shape.
    pub fn tensor(&mut self, name: &str, shape: &[usize]) -> DenseMatchResult<ArrayD<f32>> {
        let tensor = self
            .dict
            .get(name)
            .ok_or_else(|| DenseMatchError::MissingParameter {
                name: name.to_owned(),
            })?;
        if tensor.shape() != shape {
            return Err(DenseMatchError::ParameterShape {
                name: name.to_owned(),
                expected: shape.to_vec(),
                got: tensor.shape().to_vec(),
            });
        }
        self.consumed.insert(name.to_owned());
        Ok(tensor.clone())
    }

    pub fn matrix(
        &mut self,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> DenseMatchResult<Array2<f32>> {
        let tensor = self.tensor(name, &[rows, cols])?;
        tensor
            .into_dimensionality()
            .map_err(|_| DenseMatchError::ParameterShape {
                name: name.to_owned(),
                expected: vec![rows, cols],
                got: Vec::new(),
            })
    }

    pub fn vector(&mut self, name: &str, len: usize) -> DenseMatchResult<Array1<f32>> {
        let tensor = self.tensor(name, &[len])?;
        tensor
            .into_dimensionality()
            .map_err(|_| DenseMatchError::ParameterShape {
                name: name.to_owned(),
                expected: vec![len],
                got: Vec::new(),
            })
    }

    /// Fetches a 0-d scalar parameter.
    pub fn scalar(&mut self, name: &str) -> DenseMatchResult<f32> {
        let tensor = self.tensor(name, &[])?;
        tensor
            .iter()
            .next()
            .copied()
            .ok_or_else(|| DenseMatchError::MissingParameter {
                name: name.to_owned(),
            })
    }

    /// Loads a Linear layer named `prefix`.
    pub fn linear(
        &mut self,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
    ) -> DenseMatchResult<Linear> {
        let weight = self.matrix(&format!("{prefix}.weight"), out_features, in_features)?;
        let bias = if bias {
            Some(self.vector(&format!("{prefix}.bias"), out_features)?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }

    /// Loads a LayerNorm named `prefix`.
    pub fn layer_norm(&mut self, prefix: &str, features: usize) -> DenseMatchResult<LayerNorm> {
        let gamma = self.vector(&format!("{prefix}.weight"), features)?;
        let beta = self.vector(&format!("{prefix}.bias"), features)?;
        Ok(LayerNorm::new(gamma, beta))
    }

    /// Fails on the first key that nothing consumed, ignoring backbone keys.
    pub fn finish(self) -> DenseMatchResult<()> {
        for name in self.dict.names() {
            if name.starts_with(BACKBONE_PREFIX) || self.consumed.contains(name) {
                continue;
            }
            return Err(DenseMatchError::UnexpectedParameter {
                name: name.to_owned(),
            });
        }
        Ok(())
    }
}
