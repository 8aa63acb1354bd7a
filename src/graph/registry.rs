//! Operator registry: which operators exist, how many inputs they take and
//! from which opset version they are available.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use super::OpKind;

/// Oldest opset an artifact may declare
pub const MIN_OPSET: u32 = 13;
/// Newest opset this runtime implements
pub const MAX_OPSET: u32 = 21;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpSpec {
    pub kind: OpKind,
    /// First opset version the operator is available in
    pub since: u32,
    /// Number of inputs the operator takes
    pub arity: usize,
}

const OPERATORS: [OpSpec; 16] = [
    OpSpec { kind: OpKind::MatMul, since: 1, arity: 2 },
    OpSpec { kind: OpKind::Gemm, since: 1, arity: 3 },
    OpSpec { kind: OpKind::Add, since: 1, arity: 2 },
    OpSpec { kind: OpKind::Mul, since: 1, arity: 2 },
    OpSpec { kind: OpKind::Relu, since: 1, arity: 1 },
    OpSpec { kind: OpKind::Sigmoid, since: 1, arity: 1 },
    OpSpec { kind: OpKind::Softmax, since: 1, arity: 1 },
    OpSpec { kind: OpKind::Gather, since: 1, arity: 2 },
    OpSpec { kind: OpKind::Concat, since: 4, arity: 0 },
    OpSpec { kind: OpKind::Flatten, since: 1, arity: 1 },
    OpSpec { kind: OpKind::Reshape, since: 5, arity: 1 },
    OpSpec { kind: OpKind::LayerNormalization, since: 17, arity: 3 },
    OpSpec { kind: OpKind::Clip, since: 6, arity: 1 },
    OpSpec { kind: OpKind::Dropout, since: 1, arity: 1 },
    OpSpec { kind: OpKind::Identity, since: 1, arity: 1 },
    OpSpec { kind: OpKind::DequantizeLinear, since: 10, arity: 3 },
];

static BY_NAME: Lazy<HashMap<&'static str, OpSpec>> = Lazy::new(|| {
    OPERATORS
        .iter()
        .map(|spec| (spec.kind.name(), *spec))
        .collect()
});

/// Look an operator up by its serialized name.
#[must_use]
pub fn lookup(name: &str) -> Option<OpSpec> {
    BY_NAME.get(name).copied()
}

/// Registry entry for a kind. Every [`OpKind`] is registered.
#[must_use]
pub fn spec(kind: OpKind) -> OpSpec {
    OPERATORS
        .iter()
        .copied()
        .find(|s| s.kind == kind)
        .unwrap_or(OpSpec {
            kind,
            since: u32::MAX,
            arity: 0,
        })
}

/// Whether `kind` takes a variable number of inputs (Concat).
#[must_use]
pub fn is_variadic(kind: OpKind) -> bool {
    kind == OpKind::Concat
}
