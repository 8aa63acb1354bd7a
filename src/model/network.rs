//! Rating-conditioned policy/value network.
//!
//! The flattened board goes through a dense layer; embeddings of the two
//! rating buckets are appended, normalised and mixed by a second dense layer.
//! Three heads read the trunk: move probabilities, auxiliary side-info logits
//! and a win probability.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::{Backend, Evaluator, EvaluatorInputs, ForwardError, Heads, Mode};
use crate::encoder::{BOARD_CHANNELS, BOARD_FEATURES, RATING_BUCKETS};
use crate::graph::Op;
use crate::tensor::{DType, Tensor};
use crate::vocab::VOCAB_SIZE;

pub const BOARD_FC_WEIGHT: &str = "board_fc.weight";
pub const BOARD_FC_BIAS: &str = "board_fc.bias";
pub const ELO_EMBEDDING: &str = "elo_embedding.weight";
pub const TRUNK_NORM_WEIGHT: &str = "trunk_norm.weight";
pub const TRUNK_NORM_BIAS: &str = "trunk_norm.bias";
pub const TRUNK_FC_WEIGHT: &str = "trunk_fc.weight";
pub const TRUNK_FC_BIAS: &str = "trunk_fc.bias";
pub const MOVE_HEAD_WEIGHT: &str = "move_head.weight";
pub const MOVE_HEAD_BIAS: &str = "move_head.bias";
pub const SIDE_INFO_WEIGHT: &str = "side_info_head.weight";
pub const SIDE_INFO_BIAS: &str = "side_info_head.bias";
pub const VALUE_HEAD_WEIGHT: &str = "value_head.weight";
pub const VALUE_HEAD_BIAS: &str = "value_head.bias";

/// Auxiliary logits: 6 + 6 piece-type flags, 1 check flag, 64 + 64 square
/// flags for the move's origin and destination.
pub const SIDE_INFO_SIZE: usize = 141;

const NORM_EPSILON: f32 = 1e-5;

/// A named tensor set that does not describe a network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("missing tensor '{name}'")]
    Missing { name: String },
    #[error("tensor '{name}' must be a matrix, found shape {found:?}")]
    NotMatrix { name: String, found: Vec<usize> },
    #[error("unexpected tensor '{name}'")]
    Unexpected { name: String },
    #[error("tensor '{name}' must be f32, found {found}")]
    NotF32 { name: String, found: DType },
    #[error("tensor '{name}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkConfig {
    /// Width of the trunk
    pub hidden: usize,
    /// Width of each rating embedding
    pub elo_dim: usize,
    /// Number of move logits
    pub vocab_size: usize,
    pub side_info: bool,
    pub dropout: f32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            hidden: 256,
            elo_dim: 32,
            vocab_size: VOCAB_SIZE,
            side_info: true,
            dropout: 0.1,
        }
    }
}

impl NetworkConfig {
    fn trunk_input(&self) -> usize {
        self.hidden + 2 * self.elo_dim
    }

    /// Every parameter with its `[in, out]` shape.
    #[must_use]
    pub fn parameter_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        let mut shapes = vec![
            (BOARD_FC_WEIGHT, vec![BOARD_FEATURES, self.hidden]),
            (BOARD_FC_BIAS, vec![self.hidden]),
            (ELO_EMBEDDING, vec![RATING_BUCKETS, self.elo_dim]),
            (TRUNK_NORM_WEIGHT, vec![self.trunk_input()]),
            (TRUNK_NORM_BIAS, vec![self.trunk_input()]),
            (TRUNK_FC_WEIGHT, vec![self.trunk_input(), self.hidden]),
            (TRUNK_FC_BIAS, vec![self.hidden]),
            (MOVE_HEAD_WEIGHT, vec![self.hidden, self.vocab_size]),
            (MOVE_HEAD_BIAS, vec![self.vocab_size]),
        ];
        if self.side_info {
            shapes.push((SIDE_INFO_WEIGHT, vec![self.hidden, SIDE_INFO_SIZE]));
            shapes.push((SIDE_INFO_BIAS, vec![SIDE_INFO_SIZE]));
        }
        shapes.push((VALUE_HEAD_WEIGHT, vec![self.hidden, 1]));
        shapes.push((VALUE_HEAD_BIAS, vec![1]));
        shapes
    }
}

#[derive(Clone, Debug)]
pub struct RatingPolicyNet {
    config: NetworkConfig,
    params: BTreeMap<String, Tensor>,
}

impl RatingPolicyNet {
    /// Xavier-uniform weights, zero biases, unit norm scale. Reproducible
    /// from `seed`.
    #[must_use]
    pub fn random(config: NetworkConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = BTreeMap::new();
        for (name, shape) in config.parameter_shapes() {
            let tensor = match name {
                TRUNK_NORM_WEIGHT => Tensor::from_fn(shape, |_| 1.0),
                _ if name.ends_with(".bias") => Tensor::zeros(shape),
                _ => {
                    let bound = (6.0 / (shape[0] + shape[1]) as f32).sqrt();
                    Tensor::from_fn(shape, |_| rng.gen_range(-bound..bound))
                }
            };
            params.insert(name.to_string(), tensor);
        }
        RatingPolicyNet { config, params }
    }

    /// Build from named tensors, inferring the layer widths from their shapes.
    ///
    /// Every expected tensor must be present as f32 with the right shape and
    /// nothing else may be; the error names the offending tensor.
    pub fn from_parameters(params: BTreeMap<String, Tensor>, dropout: f32) -> Result<Self, ParameterError> {
        let board_fc = matrix_shape(&params, BOARD_FC_WEIGHT)?;
        let elo = matrix_shape(&params, ELO_EMBEDDING)?;
        let move_head = matrix_shape(&params, MOVE_HEAD_WEIGHT)?;
        let config = NetworkConfig {
            hidden: board_fc[1],
            elo_dim: elo[1],
            vocab_size: move_head[1],
            side_info: params.contains_key(SIDE_INFO_WEIGHT),
            dropout,
        };

        let expected = config.parameter_shapes();
        for (name, shape) in &expected {
            let tensor = params.get(*name).ok_or_else(|| ParameterError::Missing {
                name: name.to_string(),
            })?;
            if tensor.as_f32().is_err() {
                return Err(ParameterError::NotF32 {
                    name: name.to_string(),
                    found: tensor.dtype(),
                });
            }
            if tensor.shape() != shape.as_slice() {
                return Err(ParameterError::ShapeMismatch {
                    name: name.to_string(),
                    expected: shape.clone(),
                    found: tensor.shape().to_vec(),
                });
            }
        }
        let extra = params
            .keys()
            .find(|k| !expected.iter().any(|(n, _)| *n == k.as_str()));
        if let Some(extra) = extra {
            return Err(ParameterError::Unexpected { name: extra.clone() });
        }
        Ok(RatingPolicyNet { config, params })
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, Tensor> {
        &self.params
    }

    fn param<B: Backend>(&self, backend: &mut B, name: &'static str) -> Result<B::Value, ForwardError> {
        let tensor = self
            .params
            .get(name)
            .ok_or_else(|| ForwardError::MissingParameter {
                name: name.to_string(),
            })?;
        backend.parameter(name, tensor)
    }

    fn dense<B: Backend>(
        &self,
        backend: &mut B,
        x: &B::Value,
        weight: &'static str,
        bias: &'static str,
    ) -> Result<B::Value, ForwardError> {
        let w = self.param(backend, weight)?;
        let b = self.param(backend, bias)?;
        backend.apply(Op::Gemm, &[x, &w, &b])
    }
}

/// Shape of a weight matrix the layer widths are read from.
fn matrix_shape<'a>(params: &'a BTreeMap<String, Tensor>, name: &str) -> Result<&'a [usize], ParameterError> {
    let shape = params.get(name).map(Tensor::shape).ok_or_else(|| ParameterError::Missing {
        name: name.to_string(),
    })?;
    if shape.len() != 2 {
        return Err(ParameterError::NotMatrix {
            name: name.to_string(),
            found: shape.to_vec(),
        });
    }
    Ok(shape)
}

impl Evaluator for RatingPolicyNet {
    fn forward<B: Backend>(
        &self,
        backend: &mut B,
        inputs: EvaluatorInputs<B::Value>,
        mode: Mode,
    ) -> Result<Heads<B::Value>, ForwardError> {
        let flat = backend.apply(Op::Flatten { axis: 1 }, &[&inputs.board])?;
        let board = self.dense(backend, &flat, BOARD_FC_WEIGHT, BOARD_FC_BIAS)?;
        let board = backend.apply(Op::Relu, &[&board])?;

        let table = self.param(backend, ELO_EMBEDDING)?;
        let elo_self = backend.apply(Op::Gather, &[&table, &inputs.elo_self])?;
        let elo_oppo = backend.apply(Op::Gather, &[&table, &inputs.elo_oppo])?;
        let trunk = backend.apply(Op::Concat { axis: 1 }, &[&board, &elo_self, &elo_oppo])?;

        let gamma = self.param(backend, TRUNK_NORM_WEIGHT)?;
        let beta = self.param(backend, TRUNK_NORM_BIAS)?;
        let mut trunk = backend.apply(
            Op::LayerNormalization {
                epsilon: NORM_EPSILON,
            },
            &[&trunk, &gamma, &beta],
        )?;
        if mode == Mode::Train {
            trunk = backend.apply(
                Op::Dropout {
                    ratio: self.config.dropout,
                    training: true,
                },
                &[&trunk],
            )?;
        }
        let w = self.param(backend, TRUNK_FC_WEIGHT)?;
        let b = self.param(backend, TRUNK_FC_BIAS)?;
        let trunk = backend.apply(Op::MatMul, &[&trunk, &w])?;
        let trunk = backend.apply(Op::Add, &[&trunk, &b])?;
        let trunk = backend.apply(Op::Relu, &[&trunk])?;

        let logits = self.dense(backend, &trunk, MOVE_HEAD_WEIGHT, MOVE_HEAD_BIAS)?;
        let move_probs = backend.apply(Op::Softmax { axis: 1 }, &[&logits])?;

        let side_info_logits = if self.config.side_info {
            Some(self.dense(backend, &trunk, SIDE_INFO_WEIGHT, SIDE_INFO_BIAS)?)
        } else {
            None
        };

        // win_prob = clip(value / 2 + 1/2, 0, 1)
        let value = self.dense(backend, &trunk, VALUE_HEAD_WEIGHT, VALUE_HEAD_BIAS)?;
        let value = backend.apply(Op::Reshape { shape: vec![-1] }, &[&value])?;
        let half = backend.parameter("value_head.half", &Tensor::scalar(0.5))?;
        let value = backend.apply(Op::Mul, &[&value, &half])?;
        let value = backend.apply(Op::Add, &[&value, &half])?;
        let win_prob = backend.apply(Op::Clip { min: 0.0, max: 1.0 }, &[&value])?;

        Ok(Heads {
            move_probs,
            side_info_logits,
            win_prob,
        })
    }

    fn move_vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn parameter_count(&self) -> usize {
        self.params.values().map(Tensor::numel).sum()
    }
}
