//! Symbolic type and shape inference over [`Dim`]s.
//!
//! Used by the tracer while recording the forward pass and by the validator
//! when re-checking a loaded artifact, so both agree on what every node
//! produces for an arbitrary batch size.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Dim, Op, OpKind};
use crate::tensor::DType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub dtype: DType,
    pub dims: Vec<Dim>,
}

impl TypeInfo {
    #[must_use]
    pub fn new(dtype: DType, dims: Vec<Dim>) -> Self {
        TypeInfo { dtype, dims }
    }

    /// All-fixed type for a concrete shape.
    #[must_use]
    pub fn fixed(dtype: DType, shape: &[usize]) -> Self {
        TypeInfo {
            dtype,
            dims: shape.iter().map(|&n| Dim::Fixed(n)).collect(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Concrete shape for the given batch size.
    #[must_use]
    pub fn instantiate(&self, batch: usize) -> Vec<usize> {
        self.dims.iter().map(|d| d.resolve(batch)).collect()
    }

    #[must_use]
    pub fn has_batch(&self) -> bool {
        self.dims.contains(&Dim::Batch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{op} takes {expected} inputs, got {found}")]
    Arity {
        op: OpKind,
        expected: usize,
        found: usize,
    },
    #[error("{op} input {input} must be {expected}, found {found}")]
    DType {
        op: OpKind,
        input: usize,
        expected: DType,
        found: DType,
    },
    #[error("{op} input {input} must have rank {expected}, found {found}")]
    Rank {
        op: OpKind,
        input: usize,
        expected: usize,
        found: usize,
    },
    #[error("{op} axis {axis} is out of range for rank {rank}")]
    Axis { op: OpKind, axis: usize, rank: usize },
    #[error("{op}: {detail}")]
    Mismatch { op: OpKind, detail: String },
    #[error("{op} would fold the dynamic batch axis into a fixed axis")]
    BatchFolded { op: OpKind },
}

fn expect_arity(op: OpKind, inputs: &[&TypeInfo], expected: usize) -> Result<(), ShapeError> {
    if inputs.len() != expected {
        return Err(ShapeError::Arity {
            op,
            expected,
            found: inputs.len(),
        });
    }
    Ok(())
}

fn expect_dtype(op: OpKind, inputs: &[&TypeInfo], input: usize, expected: DType) -> Result<(), ShapeError> {
    let found = inputs[input].dtype;
    if found != expected {
        return Err(ShapeError::DType {
            op,
            input,
            expected,
            found,
        });
    }
    Ok(())
}

fn expect_rank(op: OpKind, inputs: &[&TypeInfo], input: usize, expected: usize) -> Result<(), ShapeError> {
    let found = inputs[input].rank();
    if found != expected {
        return Err(ShapeError::Rank {
            op,
            input,
            expected,
            found,
        });
    }
    Ok(())
}

fn mismatch(op: OpKind, detail: String) -> ShapeError {
    ShapeError::Mismatch { op, detail }
}

/// Product of a run of dims. At most one batch axis may take part, and only
/// when every fixed axis beside it has size 1.
fn collapse(op: OpKind, dims: &[Dim]) -> Result<Dim, ShapeError> {
    let fixed: usize = dims
        .iter()
        .map(|d| match d {
            Dim::Fixed(n) => *n,
            Dim::Batch => 1,
        })
        .product();
    match dims.iter().filter(|d| **d == Dim::Batch).count() {
        0 => Ok(Dim::Fixed(fixed)),
        1 if fixed == 1 => Ok(Dim::Batch),
        _ => Err(ShapeError::BatchFolded { op }),
    }
}

/// Infer the output type of `op` applied to `inputs`.
pub fn infer(op: &Op, inputs: &[&TypeInfo]) -> Result<TypeInfo, ShapeError> {
    let kind = op.kind();
    match op {
        Op::MatMul => {
            expect_arity(kind, inputs, 2)?;
            expect_dtype(kind, inputs, 0, DType::F32)?;
            expect_dtype(kind, inputs, 1, DType::F32)?;
            expect_rank(kind, inputs, 0, 2)?;
            expect_rank(kind, inputs, 1, 2)?;
            let (a, b) = (&inputs[0].dims, &inputs[1].dims);
            if a[1] != b[0] {
                return Err(mismatch(kind, format!("inner dims {} and {} differ", a[1], b[0])));
            }
            Ok(TypeInfo::new(DType::F32, vec![a[0], b[1]]))
        }
        Op::Gemm => {
            expect_arity(kind, inputs, 3)?;
            for i in 0..3 {
                expect_dtype(kind, inputs, i, DType::F32)?;
            }
            expect_rank(kind, inputs, 0, 2)?;
            expect_rank(kind, inputs, 1, 2)?;
            expect_rank(kind, inputs, 2, 1)?;
            let (x, w, b) = (&inputs[0].dims, &inputs[1].dims, &inputs[2].dims);
            if x[1] != w[0] {
                return Err(mismatch(kind, format!("inner dims {} and {} differ", x[1], w[0])));
            }
            if b[0] != w[1] {
                return Err(mismatch(kind, format!("bias has {} entries, expected {}", b[0], w[1])));
            }
            Ok(TypeInfo::new(DType::F32, vec![x[0], w[1]]))
        }
        Op::Add | Op::Mul => {
            expect_arity(kind, inputs, 2)?;
            expect_dtype(kind, inputs, 0, DType::F32)?;
            expect_dtype(kind, inputs, 1, DType::F32)?;
            let (lhs, rhs) = (&inputs[0].dims, &inputs[1].dims);
            if rhs.len() > lhs.len() || lhs[lhs.len() - rhs.len()..] != rhs[..] {
                return Err(mismatch(
                    kind,
                    format!("cannot broadcast {rhs:?} onto {lhs:?}"),
                ));
            }
            Ok(inputs[0].clone())
        }
        Op::Relu | Op::Sigmoid | Op::Clip { .. } | Op::Dropout { .. } => {
            expect_arity(kind, inputs, 1)?;
            expect_dtype(kind, inputs, 0, DType::F32)?;
            Ok(inputs[0].clone())
        }
        Op::Identity => {
            expect_arity(kind, inputs, 1)?;
            Ok(inputs[0].clone())
        }
        Op::Softmax { axis } => {
            expect_arity(kind, inputs, 1)?;
            expect_dtype(kind, inputs, 0, DType::F32)?;
            let rank = inputs[0].rank();
            if rank == 0 || *axis != rank - 1 {
                return Err(ShapeError::Axis {
                    op: kind,
                    axis: *axis,
                    rank,
                });
            }
            Ok(inputs[0].clone())
        }
        Op::Gather => {
            expect_arity(kind, inputs, 2)?;
            expect_dtype(kind, inputs, 0, DType::F32)?;
            expect_dtype(kind, inputs, 1, DType::I64)?;
            expect_rank(kind, inputs, 0, 2)?;
            if inputs[0].has_batch() {
                return Err(mismatch(kind, "embedding table must be fixed".to_string()));
            }
            let mut dims = inputs[1].dims.clone();
            dims.push(inputs[0].dims[1]);
            Ok(TypeInfo::new(DType::F32, dims))
        }
        Op::Concat { axis } => {
            if inputs.is_empty() {
                return Err(ShapeError::Arity {
                    op: kind,
                    expected: 1,
                    found: 0,
                });
            }
            let first = inputs[0];
            if *axis >= first.rank() {
                return Err(ShapeError::Axis {
                    op: kind,
                    axis: *axis,
                    rank: first.rank(),
                });
            }
            let mut total = 0;
            for (i, info) in inputs.iter().enumerate() {
                expect_dtype(kind, inputs, i, first.dtype)?;
                expect_rank(kind, inputs, i, first.rank())?;
                for (d, (a, b)) in first.dims.iter().zip(&info.dims).enumerate() {
                    if d != *axis && a != b {
                        return Err(mismatch(kind, format!("input {i} axis {d} is {b}, expected {a}")));
                    }
                }
                match info.dims[*axis] {
                    Dim::Fixed(n) => total += n,
                    Dim::Batch => return Err(ShapeError::BatchFolded { op: kind }),
                }
            }
            let mut dims = first.dims.clone();
            dims[*axis] = Dim::Fixed(total);
            Ok(TypeInfo::new(first.dtype, dims))
        }
        Op::Flatten { axis } => {
            expect_arity(kind, inputs, 1)?;
            let dims = &inputs[0].dims;
            if *axis > dims.len() {
                return Err(ShapeError::Axis {
                    op: kind,
                    axis: *axis,
                    rank: dims.len(),
                });
            }
            let outer = collapse(kind, &dims[..*axis])?;
            let inner = collapse(kind, &dims[*axis..])?;
            Ok(TypeInfo::new(inputs[0].dtype, vec![outer, inner]))
        }
        Op::Reshape { shape } => {
            expect_arity(kind, inputs, 1)?;
            infer_reshape(kind, inputs[0], shape)
        }
        Op::LayerNormalization { .. } => {
            expect_arity(kind, inputs, 3)?;
            for i in 0..3 {
                expect_dtype(kind, inputs, i, DType::F32)?;
            }
            expect_rank(kind, inputs, 1, 1)?;
            expect_rank(kind, inputs, 2, 1)?;
            let last = inputs[0].dims.last().copied();
            match last {
                Some(Dim::Fixed(d)) if inputs[1].dims[0] == Dim::Fixed(d) && inputs[2].dims[0] == Dim::Fixed(d) => {
                    Ok(inputs[0].clone())
                }
                _ => Err(mismatch(kind, "scale and bias must match the fixed last axis".to_string())),
            }
        }
        Op::DequantizeLinear { axis } => {
            expect_arity(kind, inputs, 3)?;
            let q = inputs[0];
            if !matches!(q.dtype, DType::I8 | DType::U8) {
                return Err(ShapeError::DType {
                    op: kind,
                    input: 0,
                    expected: DType::I8,
                    found: q.dtype,
                });
            }
            expect_dtype(kind, inputs, 1, DType::F32)?;
            expect_dtype(kind, inputs, 2, q.dtype)?;
            let expected_scale = match axis {
                None => Vec::new(),
                Some(a) if *a < q.rank() => vec![q.dims[*a]],
                Some(a) => {
                    return Err(ShapeError::Axis {
                        op: kind,
                        axis: *a,
                        rank: q.rank(),
                    })
                }
            };
            if inputs[1].dims != expected_scale || inputs[2].dims != expected_scale {
                return Err(mismatch(
                    kind,
                    format!("scale and zero point must have shape {expected_scale:?}"),
                ));
            }
            Ok(TypeInfo::new(DType::F32, q.dims.clone()))
        }
    }
}

fn infer_reshape(kind: OpKind, input: &TypeInfo, spec: &[i64]) -> Result<TypeInfo, ShapeError> {
    let input_fixed: usize = input
        .dims
        .iter()
        .map(|d| match d {
            Dim::Fixed(n) => *n,
            Dim::Batch => 1,
        })
        .product();
    let mut dims = Vec::with_capacity(spec.len());
    let mut inferred_at = None;
    let mut batch_copied = false;
    let mut out_fixed = 1usize;
    for (i, &s) in spec.iter().enumerate() {
        match s {
            0 => {
                let d = *input.dims.get(i).ok_or(ShapeError::Axis {
                    op: kind,
                    axis: i,
                    rank: input.rank(),
                })?;
                if let Dim::Fixed(n) = d {
                    out_fixed *= n;
                } else {
                    batch_copied = true;
                }
                dims.push(d);
            }
            -1 if inferred_at.is_none() => {
                inferred_at = Some(i);
                dims.push(Dim::Fixed(0));
            }
            n if n > 0 => {
                out_fixed *= n as usize;
                dims.push(Dim::Fixed(n as usize));
            }
            _ => return Err(mismatch(kind, format!("invalid target shape {spec:?}"))),
        }
    }

    let batch_in = input.has_batch();
    match inferred_at {
        Some(i) => {
            if out_fixed == 0 || input_fixed % out_fixed != 0 {
                return Err(mismatch(kind, format!("cannot infer -1 in {spec:?}")));
            }
            let ratio = input_fixed / out_fixed;
            dims[i] = if batch_in && !batch_copied {
                if ratio != 1 {
                    return Err(ShapeError::BatchFolded { op: kind });
                }
                Dim::Batch
            } else {
                Dim::Fixed(ratio)
            };
        }
        None => {
            if batch_in && !batch_copied {
                return Err(ShapeError::BatchFolded { op: kind });
            }
            if out_fixed != input_fixed {
                return Err(mismatch(
                    kind,
                    format!("{spec:?} does not preserve {input_fixed} elements"),
                ));
            }
        }
    }
    Ok(TypeInfo::new(input.dtype, dims))
}
