//! Serving handle for exported artifacts.
//!
//! A [`ModelHandle`] is cheap to build; the artifact and vocabulary are
//! loaded and validated on first use, exactly once. A failed load is
//! reported to the caller and retried on the next call.

use std::path::{Path, PathBuf};

use log::info;
use once_cell::sync::OnceCell;

use crate::board::Position;
use crate::encoder::{EncodingError, Sample, SampleBatch};
use crate::error::PipelineError;
use crate::graph::{Dim, Outputs, RuntimeError, Session, StructuralError, MOVE_PROBS, WIN_PROB};
use crate::vocab::{mirror_uci, MoveVocabulary};

/// One candidate move.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveProbability {
    /// UCI move from the real side to move's point of view
    pub uci: String,
    /// Index in the vocabulary
    pub index: usize,
    pub probability: f32,
}

/// Result of one forward pass, candidates in vocabulary order.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub moves: Vec<MoveProbability>,
    pub win_prob: f32,
}

impl Prediction {
    /// Most probable move. Among equal probabilities the move earliest in
    /// vocabulary order wins.
    #[must_use]
    pub fn best_move(&self) -> Option<&MoveProbability> {
        self.moves.iter().fold(None, |best: Option<&MoveProbability>, m| match best {
            Some(b) if b.probability >= m.probability => Some(b),
            _ => Some(m),
        })
    }

    /// The `k` most probable moves, ties kept in vocabulary order.
    #[must_use]
    pub fn top(&self, k: usize) -> Vec<&MoveProbability> {
        let mut sorted: Vec<&MoveProbability> = self.moves.iter().collect();
        sorted.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        sorted.truncate(k);
        sorted
    }
}

fn head<'a>(outputs: &'a Outputs, name: &str) -> Result<&'a [f32], PipelineError> {
    let tensor = outputs.get(name).ok_or_else(|| StructuralError::MissingOutput {
        name: name.to_string(),
    })?;
    tensor.as_f32().map_err(|_| {
        StructuralError::OutputTypeMismatch {
            name: name.to_string(),
            declared: "f32".to_string(),
            inferred: tensor.dtype().to_string(),
        }
        .into()
    })
}

/// First entry of a head; batch-of-one heads carry exactly one row.
fn first(name: &str, values: &[f32]) -> Result<f32, PipelineError> {
    values.first().copied().ok_or_else(|| {
        RuntimeError::EmptyOutput {
            name: name.to_string(),
        }
        .into()
    })
}

/// A validated session together with the vocabulary indexing its moves.
#[derive(Debug)]
pub struct LoadedModel {
    session: Session,
    vocab: MoveVocabulary,
}

impl LoadedModel {
    /// Pair a session with a vocabulary of matching size.
    pub fn new(session: Session, vocab: MoveVocabulary) -> Result<Self, PipelineError> {
        let width = match session.graph().output(MOVE_PROBS).and_then(|v| v.dims.get(1)) {
            Some(Dim::Fixed(n)) => *n,
            _ => 0,
        };
        vocab.ensure_size(width)?;
        Ok(LoadedModel { session, vocab })
    }

    /// Load an artifact and a vocabulary file, or the standard vocabulary.
    pub fn load(artifact: &Path, vocab: Option<&Path>) -> Result<Self, PipelineError> {
        let session = Session::load(artifact)?;
        let vocab = match vocab {
            Some(path) => MoveVocabulary::load(path)?,
            None => MoveVocabulary::standard().clone(),
        };
        info!(
            "loaded {} ({} nodes, {} moves)",
            artifact.display(),
            session.graph().nodes.len(),
            vocab.len()
        );
        Self::new(session, vocab)
    }

    #[must_use]
    pub fn vocab(&self) -> &MoveVocabulary {
        &self.vocab
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Evaluate one position.
    ///
    /// With `legal`, only those moves are reported and their probabilities
    /// are renormalised to sum to one. Moves missing from the vocabulary
    /// are ignored.
    pub fn predict(
        &self,
        fen: &str,
        elo_self: i64,
        elo_oppo: i64,
        legal: Option<&[String]>,
    ) -> Result<Prediction, PipelineError> {
        let position = Position::try_from_fen(fen).map_err(|source| EncodingError::Fen {
            fen: fen.to_string(),
            source,
        })?;
        let batch = SampleBatch::from_samples(&[Sample {
            fen: fen.to_string(),
            elo_self,
            elo_oppo,
        }])?;
        let outputs = self.session.run(&batch.feeds())?;
        let probs = head(&outputs, MOVE_PROBS)?;
        let win_prob = first(WIN_PROB, head(&outputs, WIN_PROB)?)?;

        // The network sees the side to move as white
        let mirrored = !position.white_to_move();
        let flip = |uci: &str| if mirrored { mirror_uci(uci) } else { uci.to_string() };

        let mut moves: Vec<MoveProbability> = match legal {
            None => self
                .vocab
                .iter()
                .zip(probs)
                .enumerate()
                .map(|(index, (uci, &probability))| MoveProbability {
                    uci: flip(uci),
                    index,
                    probability,
                })
                .collect(),
            Some(legal) => {
                let mut found: Vec<MoveProbability> = legal
                    .iter()
                    .filter_map(|mv| {
                        let index = self.vocab.index_of(&flip(mv))?;
                        Some(MoveProbability {
                            uci: mv.clone(),
                            index,
                            probability: probs.get(index).copied().unwrap_or(0.0),
                        })
                    })
                    .collect();
                found.sort_by_key(|m| m.index);
                found.dedup_by_key(|m| m.index);
                found
            }
        };
        if legal.is_some() {
            let total: f32 = moves.iter().map(|m| m.probability).sum();
            if total > 0.0 {
                for m in &mut moves {
                    m.probability /= total;
                }
            }
        }
        Ok(Prediction { moves, win_prob })
    }
}

/// Lazily loaded, shareable model.
#[derive(Debug)]
pub struct ModelHandle {
    artifact: PathBuf,
    vocab: Option<PathBuf>,
    model: OnceCell<LoadedModel>,
}

impl ModelHandle {
    #[must_use]
    pub fn new(artifact: impl Into<PathBuf>, vocab: Option<PathBuf>) -> Self {
        ModelHandle {
            artifact: artifact.into(),
            vocab,
            model: OnceCell::new(),
        }
    }

    /// The loaded model, loading it on first call.
    pub fn get(&self) -> Result<&LoadedModel, PipelineError> {
        self.model
            .get_or_try_init(|| LoadedModel::load(&self.artifact, self.vocab.as_deref()))
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    pub fn predict(
        &self,
        fen: &str,
        elo_self: i64,
        elo_oppo: i64,
        legal: Option<&[String]>,
    ) -> Result<Prediction, PipelineError> {
        self.get()?.predict(fen, elo_self, elo_oppo, legal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(uci: &str, index: usize, probability: f32) -> MoveProbability {
        MoveProbability {
            uci: uci.to_string(),
            index,
            probability,
        }
    }

    #[test]
    fn test_best_move_prefers_earliest_on_ties() {
        let prediction = Prediction {
            moves: vec![
                candidate("a2a3", 3, 0.25),
                candidate("e2e4", 9, 0.5),
                candidate("d2d4", 12, 0.5),
                candidate("g1f3", 20, 0.25),
            ],
            win_prob: 0.5,
        };
        assert_eq!(prediction.best_move().map(|m| m.uci.as_str()), Some("e2e4"));
        let top: Vec<&str> = prediction.top(3).iter().map(|m| m.uci.as_str()).collect();
        assert_eq!(top, vec!["e2e4", "d2d4", "a2a3"]);
    }

    #[test]
    fn test_empty_prediction_has_no_best_move() {
        let prediction = Prediction {
            moves: Vec::new(),
            win_prob: 0.5,
        };
        assert!(prediction.best_move().is_none());
    }

    #[test]
    fn test_empty_win_head_is_an_error() {
        assert_eq!(first(WIN_PROB, &[0.75, 0.25]).unwrap(), 0.75);
        let err = first(WIN_PROB, &[]).unwrap_err();
        assert_eq!(err.stage(), "inference");
        assert!(matches!(
            err,
            PipelineError::Runtime(RuntimeError::EmptyOutput { ref name }) if name == WIN_PROB
        ));
    }

    #[test]
    fn test_failed_load_is_an_error_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ModelHandle::new(dir.path().join("missing.graph"), None);
        assert!(handle.get().is_err());
        assert!(!handle.is_loaded());
        assert!(handle.get().is_err());
    }

    #[test]
    fn test_handle_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ModelHandle>();
        assert_send_sync::<LoadedModel>();
    }
}
