//! Recording backend.
//!
//! The tracer runs the forward pass on real sample values while recording
//! every operation as a graph node. Each value carries its symbolic type
//! (batch axis kept dynamic) next to its concrete tensor, and the two must
//! agree at every step; a mismatch means the recorded graph would only be
//! correct for the sample batch size.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use log::debug;

use crate::graph::shape::infer;
use crate::graph::{registry, Dim, Graph, Node, Op, OpKind, TypeInfo, ValueInfo};
use crate::model::{Backend, ForwardError};
use crate::ops;
use crate::tensor::Tensor;

/// A value seen by the tracer.
#[derive(Clone, Debug)]
pub struct Traced {
    name: String,
    info: TypeInfo,
    value: Rc<Tensor>,
    constant: bool,
}

impl Traced {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn info(&self) -> &TypeInfo {
        &self.info
    }

    /// Whether the value is independent of the graph inputs.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.constant
    }
}

pub struct Tracer {
    opset: u32,
    batch: usize,
    inputs: Vec<ValueInfo>,
    nodes: Vec<Node>,
    initializers: BTreeMap<String, Tensor>,
    counts: HashMap<OpKind, usize>,
    folded: usize,
}

impl Tracer {
    /// A tracer recording at `opset` for sample batches of `batch` rows.
    #[must_use]
    pub fn new(opset: u32, batch: usize) -> Self {
        Tracer {
            opset,
            batch,
            inputs: Vec::new(),
            nodes: Vec::new(),
            initializers: BTreeMap::new(),
            counts: HashMap::new(),
            folded: 0,
        }
    }

    /// Declare a graph input. Axis 0 becomes the dynamic batch axis.
    pub fn input(&mut self, name: &str, sample: &Tensor) -> Result<Traced, ForwardError> {
        let shape = sample.shape();
        let mut dims = vec![Dim::Batch];
        dims.extend(shape.iter().skip(1).map(|&n| Dim::Fixed(n)));
        let info = TypeInfo::new(sample.dtype(), dims);
        if shape.first() != Some(&self.batch) {
            return Err(self.divergence(OpKind::Identity, shape, &info));
        }
        self.inputs.push(ValueInfo {
            name: name.to_string(),
            dtype: info.dtype,
            dims: info.dims.clone(),
        });
        Ok(Traced {
            name: name.to_string(),
            info,
            value: Rc::new(sample.clone()),
            constant: false,
        })
    }

    fn divergence(&self, op: OpKind, concrete: &[usize], info: &TypeInfo) -> ForwardError {
        let dims: Vec<String> = info.dims.iter().map(ToString::to_string).collect();
        ForwardError::ShapeDivergence {
            op,
            concrete: concrete.to_vec(),
            symbolic: format!("[{}]", dims.join(", ")),
        }
    }

    fn fresh_name(&mut self, kind: OpKind) -> String {
        let count = self.counts.entry(kind).or_insert(0);
        let name = format!("{}_{}", kind.name(), count);
        *count += 1;
        name
    }

    /// Finish recording. `outputs` are renamed to the given names; an
    /// `Identity` node is added where renaming in place is not possible.
    pub fn finish(mut self, outputs: Vec<(&str, Traced)>, producer: &str) -> Result<Graph, ForwardError> {
        let mut declared = Vec::with_capacity(outputs.len());
        let mut renamed: HashMap<String, String> = HashMap::new();
        for (name, traced) in outputs {
            if traced.constant || traced.info.dims.first() != Some(&Dim::Batch) {
                return Err(ForwardError::StaticOutput {
                    name: name.to_string(),
                });
            }
            let current = renamed.get(&traced.name).cloned().unwrap_or_else(|| traced.name.clone());
            let producer_idx = self.nodes.iter().position(|n| n.output == current);
            match producer_idx {
                Some(idx) if !renamed.contains_key(&traced.name) => {
                    for node in &mut self.nodes {
                        for input in &mut node.inputs {
                            if *input == current {
                                *input = name.to_string();
                            }
                        }
                    }
                    self.nodes[idx].output = name.to_string();
                    renamed.insert(traced.name.clone(), name.to_string());
                }
                _ => {
                    let node_name = self.fresh_name(OpKind::Identity);
                    self.nodes.push(Node {
                        name: node_name,
                        op: Op::Identity,
                        inputs: vec![current],
                        output: name.to_string(),
                    });
                }
            }
            declared.push(ValueInfo {
                name: name.to_string(),
                dtype: traced.info.dtype,
                dims: traced.info.dims,
            });
        }

        let used: BTreeSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().map(String::as_str))
            .collect();
        let unused: Vec<String> = self
            .initializers
            .keys()
            .filter(|k| !used.contains(k.as_str()))
            .cloned()
            .collect();
        for name in unused {
            self.initializers.remove(&name);
        }
        debug!(
            "traced {} nodes, {} initializers, {} folded constants",
            self.nodes.len(),
            self.initializers.len(),
            self.folded
        );

        Ok(Graph {
            opset: self.opset,
            producer: producer.to_string(),
            inputs: self.inputs,
            outputs: declared,
            nodes: self.nodes,
            initializers: self.initializers,
        })
    }
}

impl Backend for Tracer {
    type Value = Traced;

    fn parameter(&mut self, name: &str, tensor: &Tensor) -> Result<Traced, ForwardError> {
        match self.initializers.get(name) {
            Some(existing) if existing != tensor => {
                return Err(ForwardError::ParameterConflict {
                    name: name.to_string(),
                })
            }
            Some(_) => {}
            None => {
                self.initializers.insert(name.to_string(), tensor.clone());
            }
        }
        Ok(Traced {
            name: name.to_string(),
            info: TypeInfo::fixed(tensor.dtype(), tensor.shape()),
            value: Rc::new(tensor.clone()),
            constant: true,
        })
    }

    fn apply(&mut self, op: Op, inputs: &[&Traced]) -> Result<Traced, ForwardError> {
        let kind = op.kind();
        let spec = registry::spec(kind);
        if spec.since > self.opset {
            return Err(ForwardError::OpsetTooOld {
                op: kind,
                since: spec.since,
                opset: self.opset,
            });
        }
        if let Op::Dropout { training: true, .. } = op {
            return Err(ForwardError::StochasticOp { op: kind });
        }

        let infos: Vec<&TypeInfo> = inputs.iter().map(|t| &t.info).collect();
        let info = infer(&op, &infos)?;
        let values: Vec<&Tensor> = inputs.iter().map(|t| t.value.as_ref()).collect();
        let value = ops::execute(&op, &values)?;
        if value.shape() != info.instantiate(self.batch).as_slice() {
            return Err(self.divergence(kind, value.shape(), &info));
        }

        if !inputs.is_empty() && inputs.iter().all(|t| t.constant) {
            let name = format!("folded_{}_{}", kind.name(), self.folded);
            self.folded += 1;
            self.initializers.insert(name.clone(), value.clone());
            return Ok(Traced {
                name,
                info,
                value: Rc::new(value),
                constant: true,
            });
        }

        let output = self.fresh_name(kind);
        self.nodes.push(Node {
            name: format!("{output}_node"),
            op,
            inputs: inputs.iter().map(|t| t.name.clone()).collect(),
            output: output.clone(),
        });
        Ok(Traced {
            name: output,
            info,
            value: Rc::new(value),
            constant: false,
        })
    }

    fn concrete(&mut self, value: &Traced) -> Result<Tensor, ForwardError> {
        if value.constant {
            Ok(value.value.as_ref().clone())
        } else {
            Err(ForwardError::DataDependent {
                value: value.name.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ShapeError;
    use crate::tensor::DType;

    fn sample(n: usize) -> Tensor {
        Tensor::from_fn(vec![n, 3], |i| i as f32)
    }

    #[test]
    fn test_records_nodes_with_batch_axis() {
        let mut tracer = Tracer::new(17, 2);
        let x = tracer.input("x", &sample(2)).unwrap();
        let w = tracer.parameter("w", &Tensor::zeros(vec![3, 4])).unwrap();
        let y = tracer.apply(Op::MatMul, &[&x, &w]).unwrap();
        assert_eq!(y.info().dims, vec![Dim::Batch, Dim::Fixed(4)]);
        assert!(!y.is_constant());

        let graph = tracer.finish(vec![("out", y)], "test").unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].output, "out");
        assert_eq!(graph.outputs[0].dims, vec![Dim::Batch, Dim::Fixed(4)]);
        assert_eq!(graph.inputs[0].dims, vec![Dim::Batch, Dim::Fixed(3)]);
    }

    #[test]
    fn test_constant_subgraphs_are_folded() {
        let mut tracer = Tracer::new(17, 2);
        let x = tracer.input("x", &sample(2)).unwrap();
        let a = tracer.parameter("a", &Tensor::scalar(2.0)).unwrap();
        let b = tracer.parameter("b", &Tensor::scalar(3.0)).unwrap();
        let ab = tracer.apply(Op::Mul, &[&a, &b]).unwrap();
        assert!(ab.is_constant());
        assert_eq!(tracer.concrete(&ab).unwrap(), Tensor::scalar(6.0));

        let y = tracer.apply(Op::Mul, &[&x, &ab]).unwrap();
        let graph = tracer.finish(vec![("out", y)], "test").unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.count_ops(OpKind::Mul), 1);
        // Only the folded product survives as an initializer
        assert_eq!(graph.initializers.len(), 1);
        assert_eq!(graph.initializers.values().next(), Some(&Tensor::scalar(6.0)));
    }

    #[test]
    fn test_reading_traced_values_fails() {
        let mut tracer = Tracer::new(17, 1);
        let x = tracer.input("x", &sample(1)).unwrap();
        let y = tracer.apply(Op::Relu, &[&x]).unwrap();
        assert_eq!(
            tracer.concrete(&y).unwrap_err(),
            ForwardError::DataDependent {
                value: y.name().to_string()
            }
        );
    }

    #[test]
    fn test_training_dropout_fails() {
        let mut tracer = Tracer::new(17, 1);
        let x = tracer.input("x", &sample(1)).unwrap();
        let err = tracer
            .apply(
                Op::Dropout {
                    ratio: 0.1,
                    training: true,
                },
                &[&x],
            )
            .unwrap_err();
        assert_eq!(err, ForwardError::StochasticOp { op: OpKind::Dropout });
    }

    #[test]
    fn test_batch_folding_reshape_fails() {
        let mut tracer = Tracer::new(17, 2);
        let x = tracer.input("x", &sample(2)).unwrap();
        let err = tracer.apply(Op::Reshape { shape: vec![6] }, &[&x]).unwrap_err();
        assert_eq!(err, ForwardError::Shape(ShapeError::BatchFolded { op: OpKind::Reshape }));
    }

    #[test]
    fn test_operator_newer_than_opset_fails() {
        let mut tracer = Tracer::new(13, 1);
        let x = tracer.input("x", &sample(1)).unwrap();
        let g = tracer.parameter("g", &Tensor::zeros(vec![3])).unwrap();
        let b = tracer.parameter("b", &Tensor::zeros(vec![3])).unwrap();
        assert!(matches!(
            tracer.apply(Op::LayerNormalization { epsilon: 1e-5 }, &[&x, &g, &b]),
            Err(ForwardError::OpsetTooOld { since: 17, opset: 13, .. })
        ));
    }

    #[test]
    fn test_outputs_must_keep_batch_axis() {
        let mut tracer = Tracer::new(17, 1);
        let c = tracer.parameter("c", &Tensor::zeros(vec![1, 2])).unwrap();
        let err = tracer.finish(vec![("out", c)], "test").unwrap_err();
        assert_eq!(
            err,
            ForwardError::StaticOutput {
                name: "out".to_string()
            }
        );
    }

    #[test]
    fn test_same_value_for_two_outputs_gets_identity() {
        let mut tracer = Tracer::new(17, 1);
        let x = tracer.input("x", &sample(1)).unwrap();
        let y = tracer.apply(Op::Relu, &[&x]).unwrap();
        let graph = tracer
            .finish(vec![("first", y.clone()), ("second", y)], "test")
            .unwrap();
        assert_eq!(graph.count_ops(OpKind::Identity), 1);
        let identity = graph.producer_of("second").unwrap();
        assert_eq!(identity.inputs, vec!["first".to_string()]);
    }

    #[test]
    fn test_input_gets_identity_output() {
        let mut tracer = Tracer::new(17, 1);
        let x = tracer.input("x", &sample(1)).unwrap();
        let graph = tracer.finish(vec![("out", x)], "test").unwrap();
        assert_eq!(graph.nodes[0].op, Op::Identity);
        assert_eq!(graph.outputs[0].dtype, DType::F32);
    }

    #[test]
    fn test_conflicting_parameters() {
        let mut tracer = Tracer::new(17, 1);
        tracer.parameter("w", &Tensor::scalar(1.0)).unwrap();
        assert!(tracer.parameter("w", &Tensor::scalar(1.0)).is_ok());
        assert_eq!(
            tracer.parameter("w", &Tensor::scalar(2.0)).unwrap_err(),
            ForwardError::ParameterConflict {
                name: "w".to_string()
            }
        );
    }
}
