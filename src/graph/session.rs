//! Interpreter for validated graphs.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use super::{validate, validate_graph, Dim, Graph, StructuralError, ValueInfo};
use crate::error::PipelineError;
use crate::ops::{self, OpError};
use crate::tensor::{DType, Tensor};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("missing feed for input '{name}'")]
    MissingFeed { name: String },
    #[error("'{name}' is not an input of this graph")]
    UnexpectedFeed { name: String },
    #[error("input '{name}' must be {expected}, got {found}")]
    FeedDType {
        name: String,
        expected: DType,
        found: DType,
    },
    #[error("input '{name}' has shape {found:?}, expected {expected}")]
    FeedShape {
        name: String,
        expected: String,
        found: Vec<usize>,
    },
    #[error("input '{name}' has batch size {found}, other inputs have {expected}")]
    BatchMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("node '{node}' reads unknown value '{value}'")]
    UndefinedValue { node: String, value: String },
    #[error("output '{name}' is empty")]
    EmptyOutput { name: String },
    #[error("node '{node}': {source}")]
    Kernel {
        node: String,
        #[source]
        source: OpError,
    },
}

/// Named output tensors in declared order.
#[derive(Clone, Debug, PartialEq)]
pub struct Outputs {
    values: Vec<(String, Tensor)>,
}

impl Outputs {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.values.iter().map(|(n, t)| (n.as_str(), t))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A loaded, validated graph ready to run. Immutable and shareable across
/// threads.
#[derive(Debug)]
pub struct Session {
    graph: Graph,
}

impl Session {
    /// Validate `graph` and wrap it.
    pub fn new(graph: Graph) -> Result<Self, StructuralError> {
        validate_graph(&graph)?;
        Ok(Session { graph })
    }

    /// Read and validate the artifact at `path`.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let graph = validate(path)?;
        Ok(Session { graph })
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn check_feeds<'f>(&self, feeds: &[(&str, &'f Tensor)]) -> Result<HashMap<&str, &'f Tensor>, RuntimeError> {
        for (name, _) in feeds {
            if self.graph.input(name).is_none() {
                return Err(RuntimeError::UnexpectedFeed {
                    name: (*name).to_string(),
                });
            }
        }
        let mut checked = HashMap::with_capacity(feeds.len());
        let mut batch = None;
        for info in &self.graph.inputs {
            let tensor = feeds
                .iter()
                .find(|(n, _)| *n == info.name)
                .map(|(_, t)| *t)
                .ok_or_else(|| RuntimeError::MissingFeed {
                    name: info.name.clone(),
                })?;
            let size = check_feed(info, tensor)?;
            match batch {
                None => batch = Some(size),
                Some(expected) if expected != size => {
                    return Err(RuntimeError::BatchMismatch {
                        name: info.name.clone(),
                        expected,
                        found: size,
                    })
                }
                Some(_) => {}
            }
            checked.insert(info.name.as_str(), tensor);
        }
        Ok(checked)
    }

    /// Run the graph on `feeds`, given as `(input name, tensor)` pairs.
    pub fn run(&self, feeds: &[(&str, &Tensor)]) -> Result<Outputs, RuntimeError> {
        let feeds = self.check_feeds(feeds)?;
        let mut values: HashMap<&str, Tensor> = HashMap::with_capacity(self.graph.nodes.len());
        for node in &self.graph.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|name| {
                    values
                        .get(name.as_str())
                        .or_else(|| feeds.get(name.as_str()).copied())
                        .or_else(|| self.graph.initializers.get(name))
                        .ok_or_else(|| RuntimeError::UndefinedValue {
                            node: node.name.clone(),
                            value: name.clone(),
                        })
                })
                .collect::<Result<Vec<&Tensor>, _>>()?;
            let out = ops::execute(&node.op, &inputs).map_err(|source| RuntimeError::Kernel {
                node: node.name.clone(),
                source,
            })?;
            values.insert(node.output.as_str(), out);
        }

        let mut outputs = Vec::with_capacity(self.graph.outputs.len());
        for info in &self.graph.outputs {
            let tensor = values
                .remove(info.name.as_str())
                .ok_or_else(|| RuntimeError::UndefinedValue {
                    node: "<outputs>".to_string(),
                    value: info.name.clone(),
                })?;
            outputs.push((info.name.clone(), tensor));
        }
        Ok(Outputs { values: outputs })
    }
}

/// Check one feed against its declaration and return its batch size.
fn check_feed(info: &ValueInfo, tensor: &Tensor) -> Result<usize, RuntimeError> {
    if tensor.dtype() != info.dtype {
        return Err(RuntimeError::FeedDType {
            name: info.name.clone(),
            expected: info.dtype,
            found: tensor.dtype(),
        });
    }
    let shape = tensor.shape();
    let fits = shape.len() == info.dims.len()
        && info.dims.iter().zip(shape).all(|(d, &n)| match d {
            Dim::Batch => true,
            Dim::Fixed(f) => *f == n,
        });
    if !fits {
        let dims: Vec<String> = info.dims.iter().map(ToString::to_string).collect();
        return Err(RuntimeError::FeedShape {
            name: info.name.clone(),
            expected: format!("[{}]", dims.join(", ")),
            found: shape.to_vec(),
        });
    }
    Ok(shape.first().copied().unwrap_or(1))
}
