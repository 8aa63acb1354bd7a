//! Reference kernels for every graph operator.
//!
//! The eager backend, the tracer's shadow execution and the graph runtime all
//! dispatch through [`execute`], so a graph that faithfully records the
//! forward pass reproduces it bit for bit.

use thiserror::Error;

use crate::graph::{Op, OpKind};
use crate::tensor::{DType, Tensor, TensorData, TensorError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("{op} takes {expected} inputs, got {found}")]
    Arity {
        op: OpKind,
        expected: usize,
        found: usize,
    },
    #[error("{op}: {detail}")]
    Shape { op: OpKind, detail: String },
    #[error("{op}: {source}")]
    Tensor {
        op: OpKind,
        #[source]
        source: TensorError,
    },
    #[error("{op}: index {index} out of range for {size} rows")]
    IndexOutOfRange { op: OpKind, index: i64, size: usize },
    #[error("{op} in training mode needs a random source")]
    Stochastic { op: OpKind },
}

fn arity(op: OpKind, inputs: &[&Tensor], expected: usize) -> Result<(), OpError> {
    if inputs.len() != expected {
        return Err(OpError::Arity {
            op,
            expected,
            found: inputs.len(),
        });
    }
    Ok(())
}

fn f32s(op: OpKind, t: &Tensor) -> Result<&[f32], OpError> {
    t.as_f32().map_err(|source| OpError::Tensor { op, source })
}

fn build(op: OpKind, shape: Vec<usize>, data: Vec<f32>) -> Result<Tensor, OpError> {
    Tensor::from_f32(shape, data).map_err(|source| OpError::Tensor { op, source })
}

fn shape_err(op: OpKind, detail: String) -> OpError {
    OpError::Shape { op, detail }
}

/// Apply `op` to concrete inputs.
pub fn execute(op: &Op, inputs: &[&Tensor]) -> Result<Tensor, OpError> {
    let kind = op.kind();
    match op {
        Op::MatMul => {
            arity(kind, inputs, 2)?;
            matmul(kind, inputs[0], inputs[1], None)
        }
        Op::Gemm => {
            arity(kind, inputs, 3)?;
            matmul(kind, inputs[0], inputs[1], Some(inputs[2]))
        }
        Op::Add => {
            arity(kind, inputs, 2)?;
            broadcast(kind, inputs[0], inputs[1], |a, b| a + b)
        }
        Op::Mul => {
            arity(kind, inputs, 2)?;
            broadcast(kind, inputs[0], inputs[1], |a, b| a * b)
        }
        Op::Relu => unary(kind, inputs, |x| x.max(0.0)),
        Op::Sigmoid => unary(kind, inputs, |x| 1.0 / (1.0 + (-x).exp())),
        Op::Clip { min, max } => unary(kind, inputs, |x| x.max(*min).min(*max)),
        Op::Softmax { axis } => {
            arity(kind, inputs, 1)?;
            softmax(kind, inputs[0], *axis)
        }
        Op::Gather => {
            arity(kind, inputs, 2)?;
            gather(kind, inputs[0], inputs[1])
        }
        Op::Concat { axis } => concat(kind, inputs, *axis),
        Op::Flatten { axis } => {
            arity(kind, inputs, 1)?;
            let shape = inputs[0].shape();
            if *axis > shape.len() {
                return Err(shape_err(kind, format!("axis {axis} out of range")));
            }
            let outer = shape[..*axis].iter().product();
            let inner = shape[*axis..].iter().product();
            inputs[0]
                .clone()
                .reshape(vec![outer, inner])
                .map_err(|source| OpError::Tensor { op: kind, source })
        }
        Op::Reshape { shape } => {
            arity(kind, inputs, 1)?;
            reshape(kind, inputs[0], shape)
        }
        Op::LayerNormalization { epsilon } => {
            arity(kind, inputs, 3)?;
            layer_norm(kind, inputs[0], inputs[1], inputs[2], *epsilon)
        }
        Op::Dropout { training, .. } => {
            arity(kind, inputs, 1)?;
            if *training {
                return Err(OpError::Stochastic { op: kind });
            }
            Ok(inputs[0].clone())
        }
        Op::Identity => {
            arity(kind, inputs, 1)?;
            Ok(inputs[0].clone())
        }
        Op::DequantizeLinear { axis } => {
            arity(kind, inputs, 3)?;
            dequantize(kind, inputs[0], inputs[1], inputs[2], *axis)
        }
    }
}

fn unary(kind: OpKind, inputs: &[&Tensor], f: impl Fn(f32) -> f32) -> Result<Tensor, OpError> {
    arity(kind, inputs, 1)?;
    let x = f32s(kind, inputs[0])?;
    build(kind, inputs[0].shape().to_vec(), x.iter().map(|&v| f(v)).collect())
}

fn matmul(kind: OpKind, a: &Tensor, b: &Tensor, bias: Option<&Tensor>) -> Result<Tensor, OpError> {
    let (sa, sb) = (a.shape(), b.shape());
    if sa.len() != 2 || sb.len() != 2 || sa[1] != sb[0] {
        return Err(shape_err(kind, format!("cannot multiply {sa:?} by {sb:?}")));
    }
    let (m, k, n) = (sa[0], sa[1], sb[1]);
    let (x, w) = (f32s(kind, a)?, f32s(kind, b)?);
    let mut out = match bias {
        Some(bias) => {
            let bv = f32s(kind, bias)?;
            if bv.len() != n {
                return Err(shape_err(kind, format!("bias has {} entries, expected {n}", bv.len())));
            }
            bv.repeat(m)
        }
        None => vec![0.0; m * n],
    };
    for i in 0..m {
        let row = &x[i * k..(i + 1) * k];
        let acc = &mut out[i * n..(i + 1) * n];
        for (p, &xv) in row.iter().enumerate() {
            let w_row = &w[p * n..(p + 1) * n];
            for (o, &wv) in acc.iter_mut().zip(w_row) {
                *o += xv * wv;
            }
        }
    }
    build(kind, vec![m, n], out)
}

fn broadcast(kind: OpKind, lhs: &Tensor, rhs: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor, OpError> {
    let (sl, sr) = (lhs.shape(), rhs.shape());
    if sr.len() > sl.len() || sl[sl.len() - sr.len()..] != *sr {
        return Err(shape_err(kind, format!("cannot broadcast {sr:?} onto {sl:?}")));
    }
    let (a, b) = (f32s(kind, lhs)?, f32s(kind, rhs)?);
    let out = a
        .iter()
        .enumerate()
        .map(|(i, &x)| f(x, b[i % b.len()]))
        .collect();
    build(kind, sl.to_vec(), out)
}

fn softmax(kind: OpKind, x: &Tensor, axis: usize) -> Result<Tensor, OpError> {
    let shape = x.shape();
    if shape.is_empty() || axis != shape.len() - 1 {
        return Err(shape_err(kind, format!("axis {axis} must be the last axis")));
    }
    let width = shape[axis];
    let data = f32s(kind, x)?;
    let mut out = Vec::with_capacity(data.len());
    for row in data.chunks_exact(width.max(1)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        out.extend(exps.iter().map(|&e| e / sum));
    }
    build(kind, shape.to_vec(), out)
}

fn gather(kind: OpKind, table: &Tensor, ids: &Tensor) -> Result<Tensor, OpError> {
    let ts = table.shape();
    if ts.len() != 2 {
        return Err(shape_err(kind, format!("table must be 2-D, got {ts:?}")));
    }
    let (rows, width) = (ts[0], ts[1]);
    let values = f32s(kind, table)?;
    let idx = ids
        .as_i64()
        .map_err(|source| OpError::Tensor { op: kind, source })?;
    let mut out = Vec::with_capacity(idx.len() * width);
    for &i in idx {
        if i < 0 || i as usize >= rows {
            return Err(OpError::IndexOutOfRange {
                op: kind,
                index: i,
                size: rows,
            });
        }
        let start = i as usize * width;
        out.extend_from_slice(&values[start..start + width]);
    }
    let mut shape = ids.shape().to_vec();
    shape.push(width);
    build(kind, shape, out)
}

fn concat(kind: OpKind, inputs: &[&Tensor], axis: usize) -> Result<Tensor, OpError> {
    let first = inputs
        .first()
        .ok_or_else(|| shape_err(kind, "no inputs".to_string()))?;
    let rank = first.shape().len();
    if axis >= rank {
        return Err(shape_err(kind, format!("axis {axis} out of range")));
    }
    let outer: usize = first.shape()[..axis].iter().product();
    let mut total = 0;
    for t in inputs {
        let s = t.shape();
        if s.len() != rank || s[..axis] != first.shape()[..axis] || s[axis + 1..] != first.shape()[axis + 1..] {
            return Err(shape_err(kind, format!("cannot concatenate {s:?} with {:?}", first.shape())));
        }
        total += s[axis];
    }
    let slices: Vec<(&[f32], usize)> = inputs
        .iter()
        .map(|t| {
            let chunk: usize = t.shape()[axis..].iter().product();
            f32s(kind, t).map(|d| (d, chunk))
        })
        .collect::<Result<_, _>>()?;
    let mut out = Vec::with_capacity(slices.iter().map(|(d, _)| d.len()).sum());
    for o in 0..outer {
        for (data, chunk) in &slices {
            out.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
        }
    }
    let mut shape = first.shape().to_vec();
    shape[axis] = total;
    build(kind, shape, out)
}

fn reshape(kind: OpKind, x: &Tensor, spec: &[i64]) -> Result<Tensor, OpError> {
    let mut shape = Vec::with_capacity(spec.len());
    let mut inferred = None;
    for (i, &s) in spec.iter().enumerate() {
        match s {
            0 => shape.push(
                *x.shape()
                    .get(i)
                    .ok_or_else(|| shape_err(kind, format!("no axis {i} to copy")))?,
            ),
            -1 => {
                inferred = Some(i);
                shape.push(1);
            }
            n if n > 0 => shape.push(n as usize),
            _ => return Err(shape_err(kind, format!("invalid target shape {spec:?}"))),
        }
    }
    if let Some(i) = inferred {
        let known: usize = shape.iter().product();
        if known == 0 || x.numel() % known != 0 {
            return Err(shape_err(kind, format!("cannot infer -1 in {spec:?}")));
        }
        shape[i] = x.numel() / known;
    }
    x.clone()
        .reshape(shape)
        .map_err(|source| OpError::Tensor { op: kind, source })
}

fn layer_norm(kind: OpKind, x: &Tensor, gamma: &Tensor, beta: &Tensor, epsilon: f32) -> Result<Tensor, OpError> {
    let width = *x
        .shape()
        .last()
        .ok_or_else(|| shape_err(kind, "input must have at least one axis".to_string()))?;
    let (g, b) = (f32s(kind, gamma)?, f32s(kind, beta)?);
    if g.len() != width || b.len() != width {
        return Err(shape_err(kind, format!("scale and bias must have {width} entries")));
    }
    let data = f32s(kind, x)?;
    let mut out = Vec::with_capacity(data.len());
    for row in data.chunks_exact(width.max(1)) {
        let mean = row.iter().sum::<f32>() / width as f32;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / width as f32;
        let inv = 1.0 / (var + epsilon).sqrt();
        out.extend(
            row.iter()
                .zip(g.iter().zip(b))
                .map(|(&v, (&gv, &bv))| (v - mean) * inv * gv + bv),
        );
    }
    build(kind, x.shape().to_vec(), out)
}

fn dequantize(
    kind: OpKind,
    q: &Tensor,
    scale: &Tensor,
    zero_point: &Tensor,
    axis: Option<usize>,
) -> Result<Tensor, OpError> {
    let scales = f32s(kind, scale)?;
    let shape = q.shape();
    let (channels, inner) = match axis {
        Some(a) if a < shape.len() => (shape[a], shape[a + 1..].iter().product::<usize>()),
        Some(a) => return Err(shape_err(kind, format!("axis {a} out of range"))),
        None => (1, 1),
    };
    if scales.len() != channels || zero_point.numel() != channels {
        return Err(shape_err(
            kind,
            format!("expected {channels} scales and zero points"),
        ));
    }
    let channel_of = |i: usize| (i / inner) % channels;
    let out: Vec<f32> = match (q.data(), zero_point.data()) {
        (TensorData::I8(values), TensorData::I8(zps)) => values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = channel_of(i);
                (f32::from(v) - f32::from(zps[c])) * scales[c]
            })
            .collect(),
        (TensorData::U8(values), TensorData::U8(zps)) => values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = channel_of(i);
                (f32::from(v) - f32::from(zps[c])) * scales[c]
            })
            .collect(),
        _ => {
            return Err(OpError::Tensor {
                op: kind,
                source: TensorError::DTypeMismatch {
                    expected: DType::I8,
                    found: q.dtype(),
                },
            })
        }
    };
    build(kind, shape.to_vec(), out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: &[usize], data: &[f32]) -> Tensor {
        Tensor::from_f32(shape.to_vec(), data.to_vec()).unwrap()
    }

    #[test]
    fn test_gemm_adds_bias_per_column() {
        let x = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let w = t(&[2, 3], &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
        let b = t(&[3], &[0.5, -0.5, 0.0]);
        let y = execute(&Op::Gemm, &[&x, &w, &b]).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.as_f32().unwrap(), &[1.5, 1.5, 3.0, 3.5, 3.5, 7.0]);
    }

    #[test]
    fn test_matmul_rejects_inner_mismatch() {
        let x = t(&[1, 3], &[1.0, 2.0, 3.0]);
        let w = t(&[2, 2], &[1.0; 4]);
        assert!(matches!(
            execute(&Op::MatMul, &[&x, &w]),
            Err(OpError::Shape { .. })
        ));
    }

    #[test]
    fn test_matmul_keeps_non_finite_weights_behind_zero_inputs() {
        // Board planes are mostly zero; 0 * inf must still surface as NaN
        let x = t(&[1, 2], &[0.0, 1.0]);
        let w = t(&[2, 2], &[f32::INFINITY, 1.0, 2.0, 3.0]);
        let y = execute(&Op::MatMul, &[&x, &w]).unwrap();
        let v = y.as_f32().unwrap();
        assert!(v[0].is_nan());
        assert_eq!(v[1], 3.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = t(&[2, 3], &[1.0, 2.0, 3.0, -1000.0, 0.0, 1000.0]);
        let y = execute(&Op::Softmax { axis: 1 }, &[&x]).unwrap();
        let v = y.as_f32().unwrap();
        for row in v.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(v[2] > v[1] && v[1] > v[0]);
        assert!((v[5] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gather_looks_up_rows() {
        let table = t(&[3, 2], &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let ids = Tensor::from_i64(vec![2], vec![2, 0]).unwrap();
        let y = execute(&Op::Gather, &[&table, &ids]).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.as_f32().unwrap(), &[20.0, 21.0, 0.0, 1.0]);

        let bad = Tensor::from_i64(vec![1], vec![3]).unwrap();
        assert!(matches!(
            execute(&Op::Gather, &[&table, &bad]),
            Err(OpError::IndexOutOfRange { index: 3, size: 3, .. })
        ));
    }

    #[test]
    fn test_concat_along_features() {
        let a = t(&[2, 1], &[1.0, 2.0]);
        let b = t(&[2, 2], &[3.0, 4.0, 5.0, 6.0]);
        let y = execute(&Op::Concat { axis: 1 }, &[&a, &b]).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.as_f32().unwrap(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_layer_norm_normalises_rows() {
        let x = t(&[1, 4], &[1.0, 2.0, 3.0, 4.0]);
        let g = t(&[4], &[1.0; 4]);
        let b = t(&[4], &[0.0; 4]);
        let y = execute(&Op::LayerNormalization { epsilon: 1e-5 }, &[&x, &g, &b]).unwrap();
        let v = y.as_f32().unwrap();
        let mean: f32 = v.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!(v[0] < 0.0 && v[3] > 0.0);
    }

    #[test]
    fn test_reshape_infers_axis() {
        let x = t(&[3, 1], &[1.0, 2.0, 3.0]);
        let y = execute(&Op::Reshape { shape: vec![-1] }, &[&x]).unwrap();
        assert_eq!(y.shape(), &[3]);
    }

    #[test]
    fn test_clip_and_affine_map_into_unit_interval() {
        let x = t(&[3], &[-3.0, 0.0, 3.0]);
        let half = Tensor::scalar(0.5);
        let scaled = execute(&Op::Mul, &[&x, &half]).unwrap();
        let shifted = execute(&Op::Add, &[&scaled, &half]).unwrap();
        let y = execute(&Op::Clip { min: 0.0, max: 1.0 }, &[&shifted]).unwrap();
        assert_eq!(y.as_f32().unwrap(), &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_training_dropout_is_rejected() {
        let x = t(&[1], &[1.0]);
        let op = Op::Dropout {
            ratio: 0.1,
            training: true,
        };
        assert!(matches!(execute(&op, &[&x]), Err(OpError::Stochastic { .. })));
        let inference = Op::Dropout {
            ratio: 0.1,
            training: false,
        };
        assert_eq!(execute(&inference, &[&x]).unwrap(), x);
    }

    #[test]
    fn test_dequantize_per_channel() {
        let q = Tensor::from_i8(vec![2, 2], vec![10, -20, -10, 20]).unwrap();
        let scale = t(&[2], &[0.5, 0.25]);
        let zp = Tensor::from_i8(vec![2], vec![0, 0]).unwrap();
        let y = execute(&Op::DequantizeLinear { axis: Some(1) }, &[&q, &scale, &zp]).unwrap();
        assert_eq!(y.as_f32().unwrap(), &[5.0, -5.0, -5.0, 5.0]);
    }

    #[test]
    fn test_dequantize_uint8_with_zero_point() {
        let q = Tensor::from_u8(vec![3], vec![0, 128, 255]).unwrap();
        let scale = Tensor::scalar(0.5);
        let zp = Tensor::from_u8(vec![], vec![128]).unwrap();
        let y = execute(&Op::DequantizeLinear { axis: None }, &[&q, &scale, &zp]).unwrap();
        assert_eq!(y.as_f32().unwrap(), &[-64.0, 0.0, 63.5]);
    }
}
