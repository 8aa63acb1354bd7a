//! Position evaluators.
//!
//! An [`Evaluator`] writes its forward pass once against the [`Backend`]
//! trait. Running it on the [`Eager`] backend computes the heads directly;
//! running it on the export tracer records the same operations as a graph.

pub mod checkpoint;
pub mod eager;
pub mod network;

use thiserror::Error;

use crate::graph::{Op, OpKind, ShapeError, MOVE_PROBS, SIDE_INFO_LOGITS, WIN_PROB};
use crate::ops::OpError;
use crate::tensor::Tensor;

pub use checkpoint::{load, Device, ModelKind};
pub use eager::{evaluate, Eager};
pub use network::{NetworkConfig, ParameterError, RatingPolicyNet};

/// Forward-pass mode. Training enables dropout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Inference,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Op(#[from] OpError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("'{value}' depends on the graph inputs and cannot be read while tracing")]
    DataDependent { value: String },
    #[error("{op} is stochastic in training mode")]
    StochasticOp { op: OpKind },
    #[error("{op} produced shape {concrete:?} but its symbolic shape is {symbolic}")]
    ShapeDivergence {
        op: OpKind,
        concrete: Vec<usize>,
        symbolic: String,
    },
    #[error("{op} needs opset {since}, exporting at opset {opset}")]
    OpsetTooOld { op: OpKind, since: u32, opset: u32 },
    #[error("output '{name}' has no dynamic batch axis")]
    StaticOutput { name: String },
    #[error("no parameter named '{name}'")]
    MissingParameter { name: String },
    #[error("parameter '{name}' registered twice with different values")]
    ParameterConflict { name: String },
}

/// Execution strategy for an evaluator's forward code.
pub trait Backend {
    type Value: Clone;

    /// A named weight. Tracing backends turn these into initializers.
    fn parameter(&mut self, name: &str, tensor: &Tensor) -> Result<Self::Value, ForwardError>;

    fn apply(&mut self, op: Op, inputs: &[&Self::Value]) -> Result<Self::Value, ForwardError>;

    /// Read a value back as a concrete tensor.
    fn concrete(&mut self, value: &Self::Value) -> Result<Tensor, ForwardError>;
}

/// The three evaluator inputs, batch-major.
#[derive(Clone, Debug)]
pub struct EvaluatorInputs<V> {
    pub board: V,
    pub elo_self: V,
    pub elo_oppo: V,
}

/// Evaluator outputs.
#[derive(Clone, Debug)]
pub struct Heads<V> {
    /// `[batch, vocab]`, each row sums to 1
    pub move_probs: V,
    /// `[batch, side_info]`, present when the model has the auxiliary head
    pub side_info_logits: Option<V>,
    /// `[batch]` in `[0, 1]`
    pub win_prob: V,
}

impl Heads<Tensor> {
    /// Heads paired with their canonical output names.
    #[must_use]
    pub fn named(&self) -> Vec<(&'static str, &Tensor)> {
        let mut heads = vec![(MOVE_PROBS, &self.move_probs)];
        if let Some(side) = &self.side_info_logits {
            heads.push((SIDE_INFO_LOGITS, side));
        }
        heads.push((WIN_PROB, &self.win_prob));
        heads
    }
}

/// A network mapping a board and two rating buckets to move probabilities
/// and a win estimate.
pub trait Evaluator {
    fn forward<B: Backend>(
        &self,
        backend: &mut B,
        inputs: EvaluatorInputs<B::Value>,
        mode: Mode,
    ) -> Result<Heads<B::Value>, ForwardError>;

    /// Trailing dimension of `move_probs`
    fn move_vocab_size(&self) -> usize;

    fn parameter_count(&self) -> usize;
}
