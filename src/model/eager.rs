//! Direct execution backend.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Backend, Evaluator, EvaluatorInputs, ForwardError, Heads, Mode};
use crate::graph::Op;
use crate::ops;
use crate::tensor::Tensor;

/// Runs every operation immediately with the shared kernels.
///
/// Training-mode dropout needs a random source; backends built with
/// [`Eager::new`] reject it.
#[derive(Debug, Default)]
pub struct Eager {
    rng: Option<StdRng>,
}

impl Eager {
    #[must_use]
    pub fn new() -> Self {
        Eager { rng: None }
    }

    /// A backend able to sample dropout masks, reproducible from `seed`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Eager {
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Backend for Eager {
    type Value = Tensor;

    fn parameter(&mut self, _name: &str, tensor: &Tensor) -> Result<Tensor, ForwardError> {
        Ok(tensor.clone())
    }

    fn apply(&mut self, op: Op, inputs: &[&Tensor]) -> Result<Tensor, ForwardError> {
        if let Op::Dropout { ratio, training: true } = op {
            let rng = self
                .rng
                .as_mut()
                .ok_or(ForwardError::StochasticOp { op: op.kind() })?;
            let x = inputs.first().copied().ok_or(ops::OpError::Arity {
                op: op.kind(),
                expected: 1,
                found: 0,
            })?;
            let keep = 1.0 - ratio;
            let data: Vec<f32> = x
                .as_f32()
                .map_err(|source| ops::OpError::Tensor { op: op.kind(), source })?
                .iter()
                .map(|&v| if rng.gen::<f32>() < ratio { 0.0 } else { v / keep })
                .collect();
            return Tensor::from_f32(x.shape().to_vec(), data)
                .map_err(|source| ForwardError::Op(ops::OpError::Tensor { op: op.kind(), source }));
        }
        Ok(ops::execute(&op, inputs)?)
    }

    fn concrete(&mut self, value: &Tensor) -> Result<Tensor, ForwardError> {
        Ok(value.clone())
    }
}

/// Run `evaluator` eagerly in inference mode.
pub fn evaluate<E: Evaluator>(
    evaluator: &E,
    board: &Tensor,
    elo_self: &Tensor,
    elo_oppo: &Tensor,
) -> Result<Heads<Tensor>, ForwardError> {
    let inputs = EvaluatorInputs {
        board: board.clone(),
        elo_self: elo_self.clone(),
        elo_oppo: elo_oppo.clone(),
    };
    evaluator.forward(&mut Eager::new(), inputs, Mode::Inference)
}
