//! Weight-only 8-bit quantization.
//!
//! The second input of every selected `MatMul`/`Gemm` node is replaced by a
//! `DequantizeLinear` of an 8-bit initializer. Activations, biases and every
//! other operator keep full precision, so the input/output contract of the
//! graph is unchanged.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::graph::{
    read_graph, registry, validate_graph, write_graph, Graph, Node, Op, OpKind, StructuralError, MIN_OPSET,
};
use crate::tensor::{DType, Tensor, TensorError};

/// Operators whose weights may be quantized
pub const ELIGIBLE_OPS: [OpKind; 2] = [OpKind::MatMul, OpKind::Gemm];

/// Position of the weight among a node's inputs
const WEIGHT_INPUT: usize = 1;
/// Output-column axis of a `[in, out]` weight
const CHANNEL_AXIS: usize = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    /// Symmetric signed, zero point 0, range -127..=127
    #[default]
    Int8,
    /// Asymmetric unsigned with a zero point
    UInt8,
}

impl fmt::Display for WeightPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightPrecision::Int8 => f.write_str("int8"),
            WeightPrecision::UInt8 => f.write_str("uint8"),
        }
    }
}

impl FromStr for WeightPrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int8" | "qint8" => Ok(WeightPrecision::Int8),
            "uint8" | "quint8" => Ok(WeightPrecision::UInt8),
            other => Err(format!("unknown weight type '{other}' (expected int8 or uint8)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizeOptions {
    pub op_kinds: Vec<OpKind>,
    pub weight_precision: WeightPrecision,
    /// One scale per output column instead of one per tensor
    pub per_channel: bool,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        QuantizeOptions {
            op_kinds: ELIGIBLE_OPS.to_vec(),
            weight_precision: WeightPrecision::Int8,
            per_channel: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantizeError {
    #[error("{op} weights cannot be quantized (only MatMul and Gemm)")]
    IneligibleOp { op: OpKind },
    #[error("weight '{name}' contains non-finite values")]
    NonFiniteWeight { name: String },
    #[error("value name '{name}' is already taken")]
    NameTaken { name: String },
    #[error("quantized tensor for '{name}': {source}")]
    Tensor {
        name: String,
        #[source]
        source: TensorError,
    },
    #[error("quantized graph is invalid: {0}")]
    Structural(#[from] StructuralError),
}

/// What a quantization pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuantizeSummary {
    /// Names of the original weights that were converted
    pub weights: Vec<String>,
    pub original_bytes: usize,
    pub quantized_bytes: usize,
}

impl QuantizeSummary {
    /// Initializer size reduction in percent.
    #[must_use]
    pub fn reduction_percent(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        100.0 * (1.0 - self.quantized_bytes as f64 / self.original_bytes as f64)
    }
}

struct Quantized {
    values: Tensor,
    scale: Tensor,
    zero_point: Tensor,
}

/// Scale and zero point mapping `[lo, hi]` onto the target range.
fn params_for(precision: WeightPrecision, lo: f32, hi: f32) -> (f32, i32) {
    match precision {
        WeightPrecision::Int8 => {
            let max = lo.abs().max(hi.abs());
            let scale = if max > 0.0 { max / 127.0 } else { 1.0 };
            (scale, 0)
        }
        WeightPrecision::UInt8 => {
            let (lo, hi) = (lo.min(0.0), hi.max(0.0));
            let scale = if hi > lo { (hi - lo) / 255.0 } else { 1.0 };
            let zp = (-lo / scale).round().clamp(0.0, 255.0) as i32;
            (scale, zp)
        }
    }
}

fn quantize_weight(name: &str, weight: &Tensor, opts: &QuantizeOptions) -> Result<Quantized, QuantizeError> {
    let tensor_err = |source| QuantizeError::Tensor {
        name: name.to_string(),
        source,
    };
    let data = weight.as_f32().map_err(tensor_err)?;
    if data.iter().any(|v| !v.is_finite()) {
        return Err(QuantizeError::NonFiniteWeight { name: name.to_string() });
    }
    let shape = weight.shape().to_vec();
    let columns = if opts.per_channel { shape[CHANNEL_AXIS] } else { 1 };
    let channel_of = |i: usize| if opts.per_channel { i % columns } else { 0 };

    let mut ranges = vec![(0.0f32, 0.0f32); columns];
    for (i, &v) in data.iter().enumerate() {
        let r = &mut ranges[channel_of(i)];
        *r = (r.0.min(v), r.1.max(v));
    }
    let params: Vec<(f32, i32)> = ranges
        .iter()
        .map(|&(lo, hi)| params_for(opts.weight_precision, lo, hi))
        .collect();
    let scale_shape = if opts.per_channel { vec![columns] } else { Vec::new() };
    let scale = Tensor::from_f32(scale_shape.clone(), params.iter().map(|p| p.0).collect()).map_err(tensor_err)?;

    let level = |i: usize, v: f32| {
        let (s, zp) = params[channel_of(i)];
        (v / s).round() + zp as f32
    };
    let (values, zero_point) = match opts.weight_precision {
        WeightPrecision::Int8 => {
            let q = data
                .iter()
                .enumerate()
                .map(|(i, &v)| level(i, v).clamp(-127.0, 127.0) as i8)
                .collect();
            (
                Tensor::from_i8(shape, q).map_err(tensor_err)?,
                Tensor::from_i8(scale_shape, vec![0; columns]).map_err(tensor_err)?,
            )
        }
        WeightPrecision::UInt8 => {
            let q = data
                .iter()
                .enumerate()
                .map(|(i, &v)| level(i, v).clamp(0.0, 255.0) as u8)
                .collect();
            let zps = params.iter().map(|p| p.1 as u8).collect();
            (
                Tensor::from_u8(shape, q).map_err(tensor_err)?,
                Tensor::from_u8(scale_shape, zps).map_err(tensor_err)?,
            )
        }
    };
    Ok(Quantized {
        values,
        scale,
        zero_point,
    })
}

/// Quantize the weights of the selected operator kinds.
pub fn quantize(graph: &Graph, opts: &QuantizeOptions) -> Result<(Graph, QuantizeSummary), QuantizeError> {
    if let Some(&op) = opts.op_kinds.iter().find(|k| !ELIGIBLE_OPS.contains(k)) {
        return Err(QuantizeError::IneligibleOp { op });
    }

    let mut out = graph.clone();
    let mut dequantize_nodes = Vec::new();
    let mut replaced: HashMap<String, String> = HashMap::new();
    let mut weights = Vec::new();

    for node in &mut out.nodes {
        if !opts.op_kinds.contains(&node.op.kind()) {
            continue;
        }
        let Some(weight_name) = node.inputs.get(WEIGHT_INPUT).cloned() else {
            continue;
        };
        if let Some(dequantized) = replaced.get(&weight_name) {
            node.inputs[WEIGHT_INPUT] = dequantized.clone();
            continue;
        }
        let Some(weight) = graph.initializers.get(&weight_name) else {
            continue;
        };
        if weight.dtype() != DType::F32 || weight.shape().len() != 2 {
            continue;
        }

        let q = quantize_weight(&weight_name, weight, opts)?;
        let names = [
            format!("{weight_name}_quantized"),
            format!("{weight_name}_scale"),
            format!("{weight_name}_zero_point"),
            format!("{weight_name}_dequantized"),
        ];
        for name in &names {
            if graph.initializers.contains_key(name) || graph.nodes.iter().any(|n| &n.output == name) {
                return Err(QuantizeError::NameTaken { name: name.clone() });
            }
        }
        let [quantized, scale, zero_point, dequantized] = names;
        out.initializers.insert(quantized.clone(), q.values);
        out.initializers.insert(scale.clone(), q.scale);
        out.initializers.insert(zero_point.clone(), q.zero_point);
        dequantize_nodes.push(Node {
            name: format!("{weight_name}_dequantize"),
            op: Op::DequantizeLinear {
                axis: opts.per_channel.then_some(CHANNEL_AXIS),
            },
            inputs: vec![quantized, scale, zero_point],
            output: dequantized.clone(),
        });
        node.inputs[WEIGHT_INPUT] = dequantized.clone();
        replaced.insert(weight_name.clone(), dequantized);
        weights.push(weight_name);
    }

    for name in &weights {
        if out.consumers_of(name).is_empty() {
            out.initializers.remove(name);
        }
    }
    // Dequantize nodes only read initializers, so they can lead the graph
    dequantize_nodes.append(&mut out.nodes);
    out.nodes = dequantize_nodes;
    let needed = registry::spec(OpKind::DequantizeLinear).since.max(MIN_OPSET);
    out.opset = out.opset.max(needed);

    validate_graph(&out)?;
    let summary = QuantizeSummary {
        weights,
        original_bytes: graph.initializer_bytes(),
        quantized_bytes: out.initializer_bytes(),
    };
    debug!(
        "quantized {} weights to {}, initializers {} -> {} bytes",
        summary.weights.len(),
        opts.weight_precision,
        summary.original_bytes,
        summary.quantized_bytes
    );
    Ok((out, summary))
}

/// Quantize the artifact at `src` and write the result to `dst`.
pub fn quantize_artifact(src: &Path, dst: &Path, opts: &QuantizeOptions) -> Result<QuantizeSummary, PipelineError> {
    let graph = read_graph(src)?;
    let (quantized, summary) = quantize(&graph, opts)?;
    write_graph(&quantized, dst)?;
    info!(
        "quantized {} weights ({}{}), weights {:.1}% smaller, written to {}",
        summary.weights.len(),
        opts.weight_precision,
        if opts.per_channel { ", per channel" } else { "" },
        summary.reduction_percent(),
        dst.display()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dim, ValueInfo, BOARD_INPUT, ELO_OPPO, ELO_SELF, MOVE_PROBS, WIN_PROB};
    use std::collections::BTreeMap;

    fn weight(rows: usize, cols: usize) -> Tensor {
        Tensor::from_fn(vec![rows, cols], |i| ((i * 37 % 23) as f32 - 11.0) / 10.0)
    }

    fn info(name: &str, dtype: DType, rest: &[usize]) -> ValueInfo {
        let mut dims = vec![Dim::Batch];
        dims.extend(rest.iter().map(|&n| Dim::Fixed(n)));
        ValueInfo {
            name: name.to_string(),
            dtype,
            dims,
        }
    }

    /// Both heads read the same shared projection.
    fn graph() -> Graph {
        let node = |name: &str, op: Op, inputs: &[&str], output: &str| Node {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: output.to_string(),
        };
        let mut initializers = BTreeMap::new();
        initializers.insert("proj".to_string(), weight(1152, 8));
        initializers.insert("head_w".to_string(), weight(8, 4));
        initializers.insert("head_b".to_string(), Tensor::zeros(vec![4]));
        initializers.insert("value_w".to_string(), weight(8, 1));
        initializers.insert("value_b".to_string(), Tensor::zeros(vec![1]));
        Graph {
            opset: 17,
            producer: "test".to_string(),
            inputs: vec![
                info(BOARD_INPUT, DType::F32, &[18, 8, 8]),
                info(ELO_SELF, DType::I64, &[]),
                info(ELO_OPPO, DType::I64, &[]),
            ],
            outputs: vec![info(MOVE_PROBS, DType::F32, &[4]), info(WIN_PROB, DType::F32, &[])],
            nodes: vec![
                node("flat", Op::Flatten { axis: 1 }, &[BOARD_INPUT], "flat"),
                node("trunk", Op::MatMul, &["flat", "proj"], "trunk"),
                node("logits", Op::Gemm, &["trunk", "head_w", "head_b"], "logits"),
                node("probs", Op::Softmax { axis: 1 }, &["logits"], MOVE_PROBS),
                node("value", Op::Gemm, &["trunk", "value_w", "value_b"], "value"),
                node("flat_value", Op::Reshape { shape: vec![-1] }, &["value"], "flat_value"),
                node("win", Op::Sigmoid, &["flat_value"], WIN_PROB),
            ],
            initializers,
        }
    }

    #[test]
    fn test_contract_is_preserved() {
        let original = graph();
        let (q, summary) = quantize(&original, &QuantizeOptions::default()).unwrap();
        assert_eq!(q.inputs, original.inputs);
        assert_eq!(q.outputs, original.outputs);
        assert_eq!(summary.weights, vec!["proj", "head_w", "value_w"]);
        assert_eq!(q.count_ops(OpKind::DequantizeLinear), 3);
        assert!(!q.initializers.contains_key("proj"));
        assert_eq!(q.initializers["proj_quantized"].dtype(), DType::I8);
        assert_eq!(q.initializers["head_b"].dtype(), DType::F32);
        assert!(summary.quantized_bytes < summary.original_bytes);
        assert!(summary.reduction_percent() > 70.0);
    }

    #[test]
    fn test_ineligible_kind_is_rejected() {
        let opts = QuantizeOptions {
            op_kinds: vec![OpKind::MatMul, OpKind::Softmax],
            ..QuantizeOptions::default()
        };
        assert_eq!(
            quantize(&graph(), &opts).unwrap_err(),
            QuantizeError::IneligibleOp { op: OpKind::Softmax }
        );
    }

    #[test]
    fn test_only_selected_kinds_are_touched() {
        let opts = QuantizeOptions {
            op_kinds: vec![OpKind::MatMul],
            ..QuantizeOptions::default()
        };
        let (q, summary) = quantize(&graph(), &opts).unwrap();
        assert_eq!(summary.weights, vec!["proj"]);
        assert_eq!(q.initializers["head_w"].dtype(), DType::F32);
    }

    #[test]
    fn test_shared_weight_is_quantized_once() {
        let mut g = graph();
        g.nodes[4].inputs[1] = "head_w".to_string();
        g.nodes[4].inputs[2] = "head_b".to_string();
        g.outputs[1] = info(WIN_PROB, DType::F32, &[4]);
        g.nodes.truncate(5);
        g.nodes[4].output = WIN_PROB.to_string();
        g.initializers.remove("value_w");
        g.initializers.remove("value_b");
        let (q, summary) = quantize(&g, &QuantizeOptions::default()).unwrap();
        assert_eq!(summary.weights, vec!["proj", "head_w"]);
        // Two dequantize nodes lead, then flat, trunk, logits, probs, value
        assert_eq!(q.count_ops(OpKind::DequantizeLinear), 2);
        assert_eq!(q.nodes[4].inputs[1], "head_w_dequantized");
        assert_eq!(q.nodes[6].inputs[1], "head_w_dequantized");
    }

    #[test]
    fn test_dequantized_weights_are_close() {
        for precision in [WeightPrecision::Int8, WeightPrecision::UInt8] {
            for per_channel in [false, true] {
                let opts = QuantizeOptions {
                    weight_precision: precision,
                    per_channel,
                    ..QuantizeOptions::default()
                };
                let w = weight(8, 4);
                let q = quantize_weight("w", &w, &opts).unwrap();
                let deq = crate::ops::execute(
                    &Op::DequantizeLinear {
                        axis: per_channel.then_some(CHANNEL_AXIS),
                    },
                    &[&q.values, &q.scale, &q.zero_point],
                )
                .unwrap();
                let max_err = w
                    .as_f32()
                    .unwrap()
                    .iter()
                    .zip(deq.as_f32().unwrap())
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0f32, f32::max);
                assert!(max_err < 0.01, "{precision} per_channel={per_channel}: {max_err}");
            }
        }
    }

    #[test]
    fn test_non_finite_weight() {
        let mut g = graph();
        g.initializers
            .insert("head_w".to_string(), Tensor::from_fn(vec![8, 4], |_| f32::INFINITY));
        assert_eq!(
            quantize(&g, &QuantizeOptions::default()).unwrap_err(),
            QuantizeError::NonFiniteWeight {
                name: "head_w".to_string()
            }
        );
    }

    #[test]
    fn test_opset_is_raised() {
        let mut g = graph();
        g.opset = MIN_OPSET;
        let (q, _) = quantize(&g, &QuantizeOptions::default()).unwrap();
        assert!(q.opset >= MIN_OPSET);
        assert_eq!(q.opset, MIN_OPSET);
    }

    #[test]
    fn test_weight_type_parsing() {
        assert_eq!("QInt8".parse::<WeightPrecision>(), Ok(WeightPrecision::Int8));
        assert_eq!("uint8".parse::<WeightPrecision>(), Ok(WeightPrecision::UInt8));
        assert!("fp16".parse::<WeightPrecision>().is_err());
    }

    #[test]
    fn test_quantize_artifact_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("model.graph");
        let dst = dir.path().join("model_quantized.graph");
        write_graph(&graph(), &src).unwrap();
        let summary = quantize_artifact(&src, &dst, &QuantizeOptions::default()).unwrap();
        assert_eq!(summary.weights.len(), 3);
        let q = read_graph(&dst).unwrap();
        assert_eq!(q.output_names(), vec![MOVE_PROBS, WIN_PROB]);
    }
}
