//! Numerical parity between an evaluator and its exported artifact.
//!
//! Each head is compared on its own by maximum absolute elementwise
//! difference. A NaN difference never counts as within tolerance.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};
use thiserror::Error;

use crate::encoder::SampleBatch;
use crate::error::PipelineError;
use crate::graph::Session;
use crate::model::{evaluate, Evaluator};
use crate::tensor::Tensor;

/// Full-precision default
pub const DEFAULT_TOLERANCE: f32 = 1e-4;
/// Default for weight-quantized artifacts
pub const QUANTIZED_TOLERANCE: f32 = 5e-2;

/// Allowed absolute deviation, with optional per-head overrides.
#[derive(Clone, Debug, PartialEq)]
pub struct Tolerance {
    pub default: f32,
    pub per_head: BTreeMap<String, f32>,
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::uniform(DEFAULT_TOLERANCE)
    }
}

impl Tolerance {
    #[must_use]
    pub fn uniform(default: f32) -> Self {
        Tolerance {
            default,
            per_head: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_head(mut self, head: &str, tolerance: f32) -> Self {
        self.per_head.insert(head.to_string(), tolerance);
        self
    }

    #[must_use]
    pub fn for_head(&self, head: &str) -> f32 {
        self.per_head.get(head).copied().unwrap_or(self.default)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HeadOutcome {
    Within { max_abs_diff: f32, tolerance: f32 },
    Exceeded { max_abs_diff: f32, tolerance: f32 },
    ShapeMismatch { reference: Vec<usize>, artifact: Vec<usize> },
    /// The artifact does not produce this head
    Missing,
}

impl HeadOutcome {
    #[must_use]
    pub fn is_within(&self) -> bool {
        matches!(self, HeadOutcome::Within { .. })
    }
}

impl fmt::Display for HeadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadOutcome::Within {
                max_abs_diff,
                tolerance,
            } => write!(f, "max abs diff {max_abs_diff:.3e} within {tolerance:.1e}"),
            HeadOutcome::Exceeded {
                max_abs_diff,
                tolerance,
            } => write!(f, "max abs diff {max_abs_diff:.3e} exceeds {tolerance:.1e}"),
            HeadOutcome::ShapeMismatch { reference, artifact } => {
                write!(f, "shape {artifact:?} differs from reference {reference:?}")
            }
            HeadOutcome::Missing => f.write_str("not produced by the artifact"),
        }
    }
}

/// Per-head outcomes, in the evaluator's head order.
#[derive(Clone, Debug, PartialEq)]
pub struct ParityReport {
    pub heads: Vec<(String, HeadOutcome)>,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("parity check failed on {samples} positions: {}", describe(.failures))]
pub struct ParityError {
    pub failures: Vec<(String, HeadOutcome)>,
    pub samples: usize,
}

fn describe(failures: &[(String, HeadOutcome)]) -> String {
    failures
        .iter()
        .map(|(head, outcome)| format!("{head}: {outcome}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ParityReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.heads.iter().all(|(_, outcome)| outcome.is_within())
    }

    #[must_use]
    pub fn outcome(&self, head: &str) -> Option<&HeadOutcome> {
        self.heads.iter().find(|(name, _)| name == head).map(|(_, o)| o)
    }

    pub fn ensure_passed(&self) -> Result<(), ParityError> {
        let failures: Vec<_> = self
            .heads
            .iter()
            .filter(|(_, outcome)| !outcome.is_within())
            .cloned()
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ParityError {
                failures,
                samples: self.samples,
            })
        }
    }
}

/// Largest absolute elementwise difference; NaN if any element pair differs
/// by NaN.
fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |acc, (x, y)| {
        let d = (x - y).abs();
        if d.is_nan() || acc.is_nan() {
            f32::NAN
        } else {
            acc.max(d)
        }
    })
}

/// Compare one reference head against the artifact's value.
#[must_use]
pub fn compare_head(reference: &Tensor, artifact: Option<&Tensor>, tolerance: f32) -> HeadOutcome {
    let Some(artifact) = artifact else {
        return HeadOutcome::Missing;
    };
    if reference.shape() != artifact.shape() {
        return HeadOutcome::ShapeMismatch {
            reference: reference.shape().to_vec(),
            artifact: artifact.shape().to_vec(),
        };
    }
    let (Ok(r), Ok(a)) = (reference.as_f32(), artifact.as_f32()) else {
        return HeadOutcome::Exceeded {
            max_abs_diff: f32::NAN,
            tolerance,
        };
    };
    let max_abs_diff = max_abs_diff(r, a);
    if max_abs_diff <= tolerance {
        HeadOutcome::Within {
            max_abs_diff,
            tolerance,
        }
    } else {
        HeadOutcome::Exceeded {
            max_abs_diff,
            tolerance,
        }
    }
}

/// Run `batch` through `evaluator` and `session` and compare every head.
pub fn verify<E: Evaluator>(
    evaluator: &E,
    session: &Session,
    batch: &SampleBatch,
    tolerance: &Tolerance,
) -> Result<ParityReport, PipelineError> {
    if batch.len() < 2 {
        warn!(
            "verifying on {} position; a single sample cannot catch batch-axis mistakes",
            batch.len()
        );
    }
    let reference = evaluate(evaluator, batch.board(), batch.elo_self(), batch.elo_oppo())
        .map_err(PipelineError::Evaluation)?;
    let outputs = session.run(&batch.feeds())?;

    let heads: Vec<(String, HeadOutcome)> = reference
        .named()
        .into_iter()
        .map(|(name, tensor)| {
            let outcome = compare_head(tensor, outputs.get(name), tolerance.for_head(name));
            debug!("{name}: {outcome}");
            (name.to_string(), outcome)
        })
        .collect();
    Ok(ParityReport {
        heads,
        samples: batch.len(),
    })
}
