//! Graph export.
//!
//! The evaluator's forward pass is traced on a sample batch and written out
//! as a graph artifact whose batch axis stays dynamic.

pub mod tracer;

use std::path::Path;

use log::{debug, info};

use crate::encoder::SampleBatch;
use crate::error::PipelineError;
use crate::graph::{
    validate_graph, write_graph, Graph, StructuralError, BOARD_INPUT, ELO_OPPO, ELO_SELF, MAX_OPSET, MIN_OPSET,
    MOVE_PROBS, SIDE_INFO_LOGITS, WIN_PROB,
};
use crate::model::{Evaluator, EvaluatorInputs, Mode};

pub use tracer::{Traced, Tracer};

/// Opset used when none is requested
pub const DEFAULT_OPSET: u32 = 17;

/// Producer string recorded in every artifact
pub const PRODUCER: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// Trace `evaluator` on `batch` without touching the filesystem.
pub fn trace<E: Evaluator>(evaluator: &E, batch: &SampleBatch, opset: u32) -> Result<Graph, PipelineError> {
    if !(MIN_OPSET..=MAX_OPSET).contains(&opset) {
        return Err(StructuralError::OpsetOutOfRange {
            opset,
            min: MIN_OPSET,
            max: MAX_OPSET,
        }
        .into());
    }

    let mut tracer = Tracer::new(opset, batch.len());
    let inputs = EvaluatorInputs {
        board: tracer.input(BOARD_INPUT, batch.board())?,
        elo_self: tracer.input(ELO_SELF, batch.elo_self())?,
        elo_oppo: tracer.input(ELO_OPPO, batch.elo_oppo())?,
    };
    let heads = evaluator.forward(&mut tracer, inputs, Mode::Inference)?;

    let mut outputs = vec![(MOVE_PROBS, heads.move_probs)];
    if let Some(side) = heads.side_info_logits {
        outputs.push((SIDE_INFO_LOGITS, side));
    }
    outputs.push((WIN_PROB, heads.win_prob));
    let graph = tracer.finish(outputs, PRODUCER)?;

    validate_graph(&graph)?;
    Ok(graph)
}

/// Trace, validate and write the artifact to `output_path`.
pub fn export<E: Evaluator>(
    evaluator: &E,
    batch: &SampleBatch,
    output_path: &Path,
    opset: u32,
) -> Result<Graph, PipelineError> {
    debug!("tracing on {} sample positions at opset {}", batch.len(), opset);
    let graph = trace(evaluator, batch, opset)?;
    write_graph(&graph, output_path)?;
    info!(
        "exported {} nodes and {} initializers ({} bytes of weights) to {}",
        graph.nodes.len(),
        graph.initializers.len(),
        graph.initializer_bytes(),
        output_path.display()
    );
    Ok(graph)
}
