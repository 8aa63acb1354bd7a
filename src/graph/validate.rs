//! Structural checks run on every artifact before it is trusted: topology,
//! operator availability, declared types and the input/output contract.
//! No numerics are executed here.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

use super::shape::{infer, ShapeError, TypeInfo};
use super::{read_graph, registry, Dim, Graph, OpKind, INPUT_NAMES, MAX_OPSET, MIN_OPSET, REQUIRED_OUTPUTS};
use super::{MOVE_PROBS, SIDE_INFO_LOGITS, WIN_PROB};
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("malformed artifact: {reason}")]
    Malformed { reason: String },
    #[error("opset {opset} is outside the supported range {min}..={max}")]
    OpsetOutOfRange { opset: u32, min: u32, max: u32 },
    #[error("operator '{name}' is not supported")]
    UnknownOperator { name: String },
    #[error("node '{node}': {op} needs opset {since}, artifact declares {opset}")]
    OperatorTooNew {
        node: String,
        op: OpKind,
        since: u32,
        opset: u32,
    },
    #[error("node '{node}': {op} takes {expected} inputs, got {found}")]
    Arity {
        node: String,
        op: OpKind,
        expected: usize,
        found: usize,
    },
    #[error("value '{name}' is defined more than once")]
    DuplicateValue { name: String },
    #[error("node '{node}' reads '{input}' before it is defined")]
    UndefinedInput { node: String, input: String },
    #[error("declared output '{name}' is never produced")]
    OutputNotProduced { name: String },
    #[error("initializer '{name}' shadows a graph input")]
    InitializerShadowsInput { name: String },
    #[error("'{name}' axis {axis} is dynamic; only axis 0 may be")]
    DynamicAxis { name: String, axis: usize },
    #[error("'{name}' must have a dynamic batch axis 0")]
    MissingBatchAxis { name: String },
    #[error("node '{node}': {source}")]
    Shape {
        node: String,
        #[source]
        source: ShapeError,
    },
    #[error("output '{name}' is declared {declared} but the graph produces {inferred}")]
    OutputTypeMismatch {
        name: String,
        declared: String,
        inferred: String,
    },
    #[error("inputs must be exactly {expected:?}, found {found:?}")]
    InputContract {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("required output '{name}' is missing")]
    MissingOutput { name: String },
    #[error("output '{name}' is not part of the contract")]
    UnexpectedOutput { name: String },
    #[error("no initializer named '{name}'")]
    UnknownInitializer { name: String },
    #[error("initializer '{name}' must stay {expected}, got {found}")]
    InitializerMismatch {
        name: String,
        expected: String,
        found: String,
    },
}

fn describe(info: &TypeInfo) -> String {
    let dims: Vec<String> = info.dims.iter().map(ToString::to_string).collect();
    format!("{}[{}]", info.dtype, dims.join(", "))
}

fn check_batch_axes(name: &str, dims: &[Dim]) -> Result<(), StructuralError> {
    if dims.first() != Some(&Dim::Batch) {
        return Err(StructuralError::MissingBatchAxis {
            name: name.to_string(),
        });
    }
    if let Some(axis) = dims.iter().skip(1).position(|d| *d == Dim::Batch) {
        return Err(StructuralError::DynamicAxis {
            name: name.to_string(),
            axis: axis + 1,
        });
    }
    Ok(())
}

fn check_contract(graph: &Graph) -> Result<(), StructuralError> {
    let found: Vec<String> = graph.inputs.iter().map(|v| v.name.clone()).collect();
    if found != INPUT_NAMES {
        return Err(StructuralError::InputContract {
            expected: INPUT_NAMES.iter().map(ToString::to_string).collect(),
            found,
        });
    }
    for name in REQUIRED_OUTPUTS {
        if graph.output(name).is_none() {
            return Err(StructuralError::MissingOutput {
                name: name.to_string(),
            });
        }
    }
    let mut seen = HashSet::new();
    for out in &graph.outputs {
        if ![MOVE_PROBS, SIDE_INFO_LOGITS, WIN_PROB].contains(&out.name.as_str()) {
            return Err(StructuralError::UnexpectedOutput {
                name: out.name.clone(),
            });
        }
        if !seen.insert(out.name.as_str()) {
            return Err(StructuralError::DuplicateValue {
                name: out.name.clone(),
            });
        }
    }
    Ok(())
}

/// Check an in-memory graph.
pub fn validate_graph(graph: &Graph) -> Result<(), StructuralError> {
    if !(MIN_OPSET..=MAX_OPSET).contains(&graph.opset) {
        return Err(StructuralError::OpsetOutOfRange {
            opset: graph.opset,
            min: MIN_OPSET,
            max: MAX_OPSET,
        });
    }
    check_contract(graph)?;

    let mut types: HashMap<&str, TypeInfo> = HashMap::new();
    for input in &graph.inputs {
        check_batch_axes(&input.name, &input.dims)?;
        if types.insert(&input.name, input.type_info()).is_some() {
            return Err(StructuralError::DuplicateValue {
                name: input.name.clone(),
            });
        }
    }
    for (name, tensor) in &graph.initializers {
        if types.contains_key(name.as_str()) {
            return Err(StructuralError::InitializerShadowsInput { name: name.clone() });
        }
        types.insert(name, TypeInfo::fixed(tensor.dtype(), tensor.shape()));
    }

    let mut node_names = HashSet::new();
    for node in &graph.nodes {
        if !node_names.insert(node.name.as_str()) {
            return Err(StructuralError::DuplicateValue {
                name: node.name.clone(),
            });
        }
        let kind = node.op.kind();
        let spec = registry::spec(kind);
        if spec.since > graph.opset {
            return Err(StructuralError::OperatorTooNew {
                node: node.name.clone(),
                op: kind,
                since: spec.since,
                opset: graph.opset,
            });
        }
        let arity_ok = if registry::is_variadic(kind) {
            !node.inputs.is_empty()
        } else {
            node.inputs.len() == spec.arity
        };
        if !arity_ok {
            return Err(StructuralError::Arity {
                node: node.name.clone(),
                op: kind,
                expected: spec.arity.max(1),
                found: node.inputs.len(),
            });
        }

        let mut input_types = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let info = types
                .get(input.as_str())
                .ok_or_else(|| StructuralError::UndefinedInput {
                    node: node.name.clone(),
                    input: input.clone(),
                })?;
            input_types.push(info);
        }
        let inferred = infer(&node.op, &input_types).map_err(|source| StructuralError::Shape {
            node: node.name.clone(),
            source,
        })?;
        if types.contains_key(node.output.as_str()) {
            return Err(StructuralError::DuplicateValue {
                name: node.output.clone(),
            });
        }
        types.insert(&node.output, inferred);
    }

    for output in &graph.outputs {
        check_batch_axes(&output.name, &output.dims)?;
        let produced = graph
            .producer_of(&output.name)
            .and_then(|node| types.get(node.output.as_str()))
            .ok_or_else(|| StructuralError::OutputNotProduced {
                name: output.name.clone(),
            })?;
        let declared = output.type_info();
        if *produced != declared {
            return Err(StructuralError::OutputTypeMismatch {
                name: output.name.clone(),
                declared: describe(&declared),
                inferred: describe(produced),
            });
        }
    }
    Ok(())
}

/// Load the artifact at `path` and check it.
pub fn validate(path: &Path) -> Result<Graph, PipelineError> {
    let graph = read_graph(path)?;
    validate_graph(&graph)?;
    log::debug!(
        "validated {} ({} nodes, {} initializers, opset {})",
        path.display(),
        graph.nodes.len(),
        graph.initializers.len(),
        graph.opset
    );
    Ok(graph)
}
