//! Artifact container.
//!
//! An artifact is a safetensors file: every initializer is stored as a named
//! tensor and the graph header (opset, producer, declared inputs and outputs,
//! nodes) travels as JSON in the `graph` metadata entry.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use super::{registry, Graph, Node, ValueInfo};
use crate::error::PipelineError;
use crate::graph::StructuralError;
use crate::tensor::{DType, Tensor};

/// Value of the `format` metadata entry
pub const FORMAT_TAG: &str = "rated-policy-graph/1";

const GRAPH_KEY: &str = "graph";
const FORMAT_KEY: &str = "format";

#[derive(Serialize, Deserialize)]
struct Header {
    opset: u32,
    producer: String,
    inputs: Vec<ValueInfo>,
    outputs: Vec<ValueInfo>,
    nodes: Vec<Node>,
}

fn malformed(reason: impl Into<String>) -> StructuralError {
    StructuralError::Malformed {
        reason: reason.into(),
    }
}

fn to_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::I64 => Dtype::I64,
        DType::I8 => Dtype::I8,
        DType::U8 => Dtype::U8,
    }
}

fn from_dtype(dtype: Dtype) -> Option<DType> {
    match dtype {
        Dtype::F32 => Some(DType::F32),
        Dtype::I64 => Some(DType::I64),
        Dtype::I8 => Some(DType::I8),
        Dtype::U8 => Some(DType::U8),
        _ => None,
    }
}

/// Encode a graph into artifact bytes.
pub fn to_bytes(graph: &Graph) -> Result<Vec<u8>, StructuralError> {
    let header = Header {
        opset: graph.opset,
        producer: graph.producer.clone(),
        inputs: graph.inputs.clone(),
        outputs: graph.outputs.clone(),
        nodes: graph.nodes.clone(),
    };
    let header = serde_json::to_string(&header).map_err(|e| malformed(e.to_string()))?;

    let metadata: HashMap<String, String> = [
        (GRAPH_KEY.to_string(), header),
        (FORMAT_KEY.to_string(), FORMAT_TAG.to_string()),
    ]
    .into_iter()
    .collect();
    encode_tensors(&graph.initializers, Some(metadata)).map_err(malformed)
}

/// Named tensors as a safetensors buffer.
pub(crate) fn encode_tensors(
    tensors: &BTreeMap<String, Tensor>,
    metadata: Option<HashMap<String, String>>,
) -> Result<Vec<u8>, String> {
    let payloads: Vec<(&String, &Tensor, Vec<u8>)> = tensors
        .iter()
        .map(|(name, t)| (name, t, t.to_le_bytes()))
        .collect();
    let mut views: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
    for (name, tensor, bytes) in &payloads {
        let view = TensorView::new(to_dtype(tensor.dtype()), tensor.shape().to_vec(), bytes)
            .map_err(|e| format!("tensor '{name}': {e}"))?;
        views.insert((*name).clone(), view);
    }
    safetensors::serialize(&views, &metadata).map_err(|e| e.to_string())
}

/// Every tensor in a safetensors buffer.
pub(crate) fn decode_tensors(bytes: &[u8]) -> Result<BTreeMap<String, Tensor>, String> {
    let st = SafeTensors::deserialize(bytes).map_err(|e| e.to_string())?;
    let mut tensors = BTreeMap::new();
    for (name, view) in st.tensors() {
        let dtype = from_dtype(view.dtype())
            .ok_or_else(|| format!("tensor '{name}' has unsupported dtype {:?}", view.dtype()))?;
        let tensor = Tensor::from_le_bytes(dtype, view.shape().to_vec(), view.data())
            .map_err(|e| format!("tensor '{name}': {e}"))?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Decode artifact bytes.
///
/// Operator names are checked against the registry before the header is
/// deserialized, so an unsupported operator is reported by name rather than
/// as a generic parse failure.
pub fn from_bytes(bytes: &[u8]) -> Result<Graph, StructuralError> {
    let (_, meta) = SafeTensors::read_metadata(bytes).map_err(|e| malformed(e.to_string()))?;
    let entries = meta
        .metadata()
        .as_ref()
        .ok_or_else(|| malformed("no metadata"))?;
    match entries.get(FORMAT_KEY) {
        Some(tag) if tag == FORMAT_TAG => {}
        Some(tag) => return Err(malformed(format!("unsupported format '{tag}'"))),
        None => return Err(malformed("missing format tag")),
    }
    let raw = entries
        .get(GRAPH_KEY)
        .ok_or_else(|| malformed("missing graph header"))?;

    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    if let Some(nodes) = value.get("nodes").and_then(|n| n.as_array()) {
        for node in nodes {
            if let Some(name) = node.pointer("/op/op_type").and_then(|v| v.as_str()) {
                if registry::lookup(name).is_none() {
                    return Err(StructuralError::UnknownOperator {
                        name: name.to_string(),
                    });
                }
            }
        }
    }
    let header: Header = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

    let initializers = decode_tensors(bytes).map_err(malformed)?;

    Ok(Graph {
        opset: header.opset,
        producer: header.producer,
        inputs: header.inputs,
        outputs: header.outputs,
        nodes: header.nodes,
        initializers,
    })
}

/// Write `graph` to `path` in one piece, creating parent directories and
/// replacing any existing file.
pub fn write_graph(graph: &Graph, path: &Path) -> Result<(), PipelineError> {
    let bytes = to_bytes(graph)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PipelineError::io(parent, source))?;
    }
    fs::write(path, bytes).map_err(|source| PipelineError::io(path, source))
}

/// Read an artifact without validating it.
pub fn read_graph(path: &Path) -> Result<Graph, PipelineError> {
    let bytes = fs::read(path).map_err(|source| PipelineError::io(path, source))?;
    Ok(from_bytes(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dim, Op};

    fn tiny() -> Graph {
        let mut initializers = BTreeMap::new();
        initializers.insert(
            "w".to_string(),
            Tensor::from_f32(vec![2, 1], vec![0.5, -1.5]).unwrap(),
        );
        initializers.insert(
            "q".to_string(),
            Tensor::from_i8(vec![2], vec![-127, 3]).unwrap(),
        );
        Graph {
            opset: 17,
            producer: "test".to_string(),
            inputs: vec![ValueInfo {
                name: "x".to_string(),
                dtype: DType::F32,
                dims: vec![Dim::Batch, Dim::Fixed(2)],
            }],
            outputs: vec![ValueInfo {
                name: "y".to_string(),
                dtype: DType::F32,
                dims: vec![Dim::Batch, Dim::Fixed(1)],
            }],
            nodes: vec![Node {
                name: "mm".to_string(),
                op: Op::MatMul,
                inputs: vec!["x".to_string(), "w".to_string()],
                output: "y".to_string(),
            }],
            initializers,
        }
    }

    #[test]
    fn test_bytes_preserve_graph() {
        let graph = tiny();
        let back = from_bytes(&to_bytes(&graph).unwrap()).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn test_format_tag_is_recorded() {
        let bytes = to_bytes(&tiny()).unwrap();
        let (_, meta) = SafeTensors::read_metadata(&bytes).unwrap();
        let entries = meta.metadata().as_ref().unwrap();
        assert_eq!(entries.get("format").map(String::as_str), Some(FORMAT_TAG));
    }

    #[test]
    fn test_unknown_operator_is_named() {
        let graph = tiny();
        let bytes = to_bytes(&graph).unwrap();
        let (_, meta) = SafeTensors::read_metadata(&bytes).unwrap();
        let header = meta.metadata().as_ref().unwrap()["graph"].replace("\"MatMul\"", "\"Conv\"");
        let metadata: HashMap<String, String> = [
            ("graph".to_string(), header),
            ("format".to_string(), FORMAT_TAG.to_string()),
        ]
        .into_iter()
        .collect();
        let empty: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
        let bytes = safetensors::serialize(&empty, &Some(metadata)).unwrap();
        assert_eq!(
            from_bytes(&bytes).unwrap_err(),
            StructuralError::UnknownOperator {
                name: "Conv".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_non_artifact() {
        assert!(matches!(
            from_bytes(b"definitely not an artifact"),
            Err(StructuralError::Malformed { .. })
        ));
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.graph");
        write_graph(&tiny(), &path).unwrap();
        assert_eq!(read_graph(&path).unwrap(), tiny());
    }
}
