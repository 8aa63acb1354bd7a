//! Portable inference graph.
//!
//! A [`Graph`] is an immutable description of the evaluator's forward pass:
//! declared inputs and outputs, topologically ordered [`Node`]s and named
//! weight initializers. Only axis 0 of inputs and outputs may be dynamic
//! ([`Dim::Batch`]); every other axis is fixed at export time.

pub mod registry;
pub mod serialize;
pub mod session;
pub mod shape;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::tensor::{DType, Tensor};

pub use registry::{OpSpec, MAX_OPSET, MIN_OPSET};
pub use serialize::{read_graph, write_graph, FORMAT_TAG};
pub use session::{Outputs, RuntimeError, Session};
pub use shape::{ShapeError, TypeInfo};
pub use validate::{validate, validate_graph, StructuralError};

/// Position tensor input, `f32[batch, 18, 8, 8]`
pub const BOARD_INPUT: &str = "board_input";
/// Self rating bucket input, `i64[batch]`
pub const ELO_SELF: &str = "elo_self";
/// Opponent rating bucket input, `i64[batch]`
pub const ELO_OPPO: &str = "elo_oppo";
/// Move distribution output, `f32[batch, vocab]`
pub const MOVE_PROBS: &str = "move_probs";
/// Auxiliary logits output, `f32[batch, side_info]`
pub const SIDE_INFO_LOGITS: &str = "side_info_logits";
/// Win probability output in `[0, 1]`, `f32[batch]`
pub const WIN_PROB: &str = "win_prob";

/// Input names every artifact must declare, in order.
pub const INPUT_NAMES: [&str; 3] = [BOARD_INPUT, ELO_SELF, ELO_OPPO];
/// Output names every artifact must declare.
pub const REQUIRED_OUTPUTS: [&str; 2] = [MOVE_PROBS, WIN_PROB];

/// One tensor axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dim {
    /// The dynamic batch axis
    Batch,
    /// An axis fixed at export time
    Fixed(usize),
}

impl Dim {
    /// Concrete size once the batch size is known
    #[inline]
    #[must_use]
    pub fn resolve(self, batch: usize) -> usize {
        match self {
            Dim::Batch => batch,
            Dim::Fixed(n) => n,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Batch => f.write_str("batch"),
            Dim::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// Operator kinds understood by the registry, kernels and quantizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    MatMul,
    Gemm,
    Add,
    Mul,
    Relu,
    Sigmoid,
    Softmax,
    Gather,
    Concat,
    Flatten,
    Reshape,
    LayerNormalization,
    Clip,
    Dropout,
    Identity,
    DequantizeLinear,
}

impl OpKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OpKind::MatMul => "MatMul",
            OpKind::Gemm => "Gemm",
            OpKind::Add => "Add",
            OpKind::Mul => "Mul",
            OpKind::Relu => "Relu",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Softmax => "Softmax",
            OpKind::Gather => "Gather",
            OpKind::Concat => "Concat",
            OpKind::Flatten => "Flatten",
            OpKind::Reshape => "Reshape",
            OpKind::LayerNormalization => "LayerNormalization",
            OpKind::Clip => "Clip",
            OpKind::Dropout => "Dropout",
            OpKind::Identity => "Identity",
            OpKind::DequantizeLinear => "DequantizeLinear",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        registry::lookup(s)
            .map(|spec| spec.kind)
            .ok_or_else(|| format!("unknown operator '{s}'"))
    }
}

/// An operator together with its attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op_type")]
pub enum Op {
    /// `[m, k] x [k, n] -> [m, n]`
    MatMul,
    /// Fully connected layer: `x[m, k] * w[k, n] + b[n]`
    Gemm,
    /// Elementwise add; the right operand broadcasts over leading axes
    Add,
    /// Elementwise multiply; the right operand broadcasts over leading axes
    Mul,
    Relu,
    Sigmoid,
    /// Normalised exponential over the last axis
    Softmax { axis: usize },
    /// Embedding lookup: `table[v, e]` indexed by `i64` ids
    Gather,
    Concat { axis: usize },
    /// Collapse to 2-D around `axis`
    Flatten { axis: usize },
    /// `0` copies the input axis, `-1` is inferred
    Reshape { shape: Vec<i64> },
    /// Normalise over the last axis, then scale and shift
    LayerNormalization { epsilon: f32 },
    Clip { min: f32, max: f32 },
    Dropout { ratio: f32, training: bool },
    Identity,
    /// `(q - zero_point) * scale`, per tensor or per `axis` channel
    DequantizeLinear { axis: Option<usize> },
}

impl Op {
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        match self {
            Op::MatMul => OpKind::MatMul,
            Op::Gemm => OpKind::Gemm,
            Op::Add => OpKind::Add,
            Op::Mul => OpKind::Mul,
            Op::Relu => OpKind::Relu,
            Op::Sigmoid => OpKind::Sigmoid,
            Op::Softmax { .. } => OpKind::Softmax,
            Op::Gather => OpKind::Gather,
            Op::Concat { .. } => OpKind::Concat,
            Op::Flatten { .. } => OpKind::Flatten,
            Op::Reshape { .. } => OpKind::Reshape,
            Op::LayerNormalization { .. } => OpKind::LayerNormalization,
            Op::Clip { .. } => OpKind::Clip,
            Op::Dropout { .. } => OpKind::Dropout,
            Op::Identity => OpKind::Identity,
            Op::DequantizeLinear { .. } => OpKind::DequantizeLinear,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().name())
    }
}

/// A declared graph input or output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<Dim>,
}

impl ValueInfo {
    #[must_use]
    pub fn type_info(&self) -> TypeInfo {
        TypeInfo {
            dtype: self.dtype,
            dims: self.dims.clone(),
        }
    }
}

/// One operator application. Every node produces exactly one value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<String>,
    pub output: String,
}

/// An exported computation graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    pub opset: u32,
    pub producer: String,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub nodes: Vec<Node>,
    pub initializers: BTreeMap<String, Tensor>,
}

impl Graph {
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&ValueInfo> {
        self.inputs.iter().find(|v| v.name == name)
    }

    #[must_use]
    pub fn output(&self, name: &str) -> Option<&ValueInfo> {
        self.outputs.iter().find(|v| v.name == name)
    }

    #[must_use]
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|v| v.name.as_str()).collect()
    }

    /// The node producing `value`, if any.
    #[must_use]
    pub fn producer_of(&self, value: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.output == value)
    }

    /// Indices of nodes reading `value`.
    #[must_use]
    pub fn consumers_of(&self, value: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == value))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Total bytes of initializer payload.
    #[must_use]
    pub fn initializer_bytes(&self) -> usize {
        self.initializers.values().map(Tensor::byte_len).sum()
    }

    /// Number of nodes of the given kind.
    #[must_use]
    pub fn count_ops(&self, kind: OpKind) -> usize {
        self.nodes.iter().filter(|n| n.op.kind() == kind).count()
    }

    /// A copy of this graph with initializer `name` replaced by `tensor`.
    ///
    /// The replacement must keep the dtype and shape of the original.
    pub fn with_initializer(&self, name: &str, tensor: Tensor) -> Result<Graph, StructuralError> {
        let existing = self
            .initializers
            .get(name)
            .ok_or_else(|| StructuralError::UnknownInitializer {
                name: name.to_string(),
            })?;
        if existing.dtype() != tensor.dtype() || existing.shape() != tensor.shape() {
            return Err(StructuralError::InitializerMismatch {
                name: name.to_string(),
                expected: format!("{}{:?}", existing.dtype(), existing.shape()),
                found: format!("{}{:?}", tensor.dtype(), tensor.shape()),
            });
        }
        let mut graph = self.clone();
        graph.initializers.insert(name.to_string(), tensor);
        Ok(graph)
    }
}
