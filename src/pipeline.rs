//! Export pipeline: export, validate, verify and promote, then optionally
//! quantize, validate, verify and promote again.
//!
//! Every artifact is written to a staging path first and only renamed to its
//! final path once it has passed verification. A failing stage removes its
//! staged file and aborts the run.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::ExportConfig;
use crate::encoder::SampleBatch;
use crate::error::PipelineError;
use crate::export::export;
use crate::graph::{Dim, Session, MOVE_PROBS};
use crate::model::{self, Evaluator};
use crate::parity::{verify, ParityReport, Tolerance};
use crate::positions::{load_positions, verification_positions};
use crate::quantize::{quantize_artifact, QuantizeSummary};
use crate::vocab::MoveVocabulary;

/// Outcome of a successful run.
#[derive(Clone, Debug)]
pub struct PipelineSummary {
    pub artifact: PathBuf,
    pub artifact_bytes: u64,
    pub parameter_count: usize,
    pub report: ParityReport,
    pub vocab: Option<PathBuf>,
    pub quantized: Option<QuantizedArtifact>,
}

#[derive(Clone, Debug)]
pub struct QuantizedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub report: ParityReport,
    pub summary: QuantizeSummary,
}

impl QuantizedArtifact {
    /// File size reduction relative to `original_bytes`, in percent.
    #[must_use]
    pub fn reduction_percent(&self, original_bytes: u64) -> f64 {
        if original_bytes == 0 {
            return 0.0;
        }
        100.0 * (1.0 - self.bytes as f64 / original_bytes as f64)
    }
}

/// A file that is deleted on drop unless promoted.
struct Staged {
    path: PathBuf,
    promoted: bool,
}

impl Staged {
    fn for_target(target: &Path) -> Self {
        let name = target
            .file_name()
            .map_or_else(|| "artifact".into(), |n| n.to_string_lossy().into_owned());
        Staged {
            path: target.with_file_name(format!("{name}.staging")),
            promoted: false,
        }
    }

    fn promote(mut self, target: &Path) -> Result<(), PipelineError> {
        fs::rename(&self.path, target).map_err(|e| PipelineError::io(target, e))?;
        self.promoted = true;
        Ok(())
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.promoted && self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("could not remove staged file {}: {e}", self.path.display());
            }
        }
    }
}

fn file_size(path: &Path) -> Result<u64, PipelineError> {
    fs::metadata(path).map(|m| m.len()).map_err(|e| PipelineError::io(path, e))
}

/// Validate the staged artifact and compare it against the evaluator.
fn check_staged<E: Evaluator>(
    evaluator: &E,
    staged: &Path,
    batch: &SampleBatch,
    tolerance: &Tolerance,
) -> Result<ParityReport, PipelineError> {
    let session = Session::load(staged)?;
    let report = verify(evaluator, &session, batch, tolerance)?;
    for (head, outcome) in &report.heads {
        info!("  {head}: {outcome}");
    }
    report.ensure_passed()?;
    Ok(report)
}

/// Verification batch: built-in positions plus configured extras.
pub fn verification_batch(config: &ExportConfig) -> Result<SampleBatch, PipelineError> {
    let mut extra = config.positions.clone();
    if let Some(path) = &config.positions_file {
        extra.extend(load_positions(path)?);
    }
    let fens = verification_positions(&extra);
    Ok(SampleBatch::from_fens(&fens, config.verify_rating)?)
}

/// Run every stage for `evaluator`.
pub fn run<E: Evaluator>(
    evaluator: &E,
    vocab: &MoveVocabulary,
    config: &ExportConfig,
) -> Result<PipelineSummary, PipelineError> {
    config.check()?;
    vocab.ensure_size(evaluator.move_vocab_size())?;
    let batch = verification_batch(config)?;
    let parameter_count = evaluator.parameter_count();
    info!(
        "exporting {} model with {} parameters, verifying on {} positions at rating {}",
        config.model_type,
        parameter_count,
        batch.len(),
        config.verify_rating
    );

    info!("=== export ===");
    let staged = Staged::for_target(&config.output);
    let graph = export(evaluator, &batch, &staged.path, config.opset)?;
    let produced = match graph.output(MOVE_PROBS).and_then(|v| v.dims.get(1)) {
        Some(Dim::Fixed(n)) => *n,
        _ => 0,
    };
    vocab.ensure_size(produced)?;

    info!("=== verify (tolerance {:.1e}) ===", config.tolerance);
    let report = check_staged(evaluator, &staged.path, &batch, &config.full_precision_tolerance())?;
    staged.promote(&config.output)?;
    let artifact_bytes = file_size(&config.output)?;
    info!("artifact written to {} ({} bytes)", config.output.display(), artifact_bytes);

    let vocab_path = match &config.vocab_output {
        Some(path) => {
            vocab.save_json(path)?;
            info!("vocabulary of {} moves written to {}", vocab.len(), path.display());
            Some(path.clone())
        }
        None => None,
    };

    let quantized = if config.quantize {
        info!("=== quantize ===");
        let target = config.quantized_output();
        let staged = Staged::for_target(&target);
        let summary = quantize_artifact(&config.output, &staged.path, &config.quantization)?;
        info!("=== verify quantized (tolerance {:.1e}) ===", config.quantized_tolerance);
        let report = check_staged(evaluator, &staged.path, &batch, &config.quantized_tolerance())?;
        staged.promote(&target)?;
        let artifact = QuantizedArtifact {
            bytes: file_size(&target)?,
            path: target,
            report,
            summary,
        };
        info!(
            "quantized artifact written to {} ({} bytes, {:.1}% smaller)",
            artifact.path.display(),
            artifact.bytes,
            artifact.reduction_percent(artifact_bytes)
        );
        Some(artifact)
    } else {
        None
    };

    Ok(PipelineSummary {
        artifact: config.output.clone(),
        artifact_bytes,
        parameter_count,
        report,
        vocab: vocab_path,
        quantized,
    })
}

/// Load the configured checkpoint and run the pipeline with the standard
/// vocabulary.
pub fn run_with_checkpoint(config: &ExportConfig) -> Result<PipelineSummary, PipelineError> {
    let net = model::load(config.model_type, config.device, &config.checkpoint_dir)?;
    run(&net, MoveVocabulary::standard(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkConfig, RatingPolicyNet};
    use crate::vocab::VOCAB_SIZE;

    fn net() -> RatingPolicyNet {
        let config = NetworkConfig {
            hidden: 16,
            elo_dim: 4,
            ..NetworkConfig::default()
        };
        RatingPolicyNet::random(config, 11)
    }

    fn config(dir: &Path) -> ExportConfig {
        ExportConfig {
            output: dir.join("out").join("model.graph"),
            vocab_output: Some(dir.join("out").join("vocab.json")),
            ..ExportConfig::default()
        }
    }

    #[test]
    fn test_full_precision_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let summary = run(&net(), MoveVocabulary::standard(), &config).unwrap();
        assert!(summary.report.passed());
        assert!(config.output.exists());
        assert!(!Staged::for_target(&config.output).path.exists());
        assert_eq!(summary.vocab.as_deref(), config.vocab_output.as_deref());
        assert_eq!(MoveVocabulary::load(&dir.path().join("out/vocab.json")).unwrap().len(), VOCAB_SIZE);
        assert!(summary.quantized.is_none());
    }

    #[test]
    fn test_quantized_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            quantize: true,
            ..config(dir.path())
        };
        let summary = run(&net(), MoveVocabulary::standard(), &config).unwrap();
        let quantized = summary.quantized.unwrap();
        assert!(quantized.report.passed());
        assert_eq!(quantized.path, dir.path().join("out/model_quantized.graph"));
        assert!(quantized.bytes < summary.artifact_bytes);
    }

    #[test]
    fn test_failed_verification_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            quantize: true,
            quantized_tolerance: 1e-9,
            ..config(dir.path())
        };
        let err = run(&net(), MoveVocabulary::standard(), &config).unwrap_err();
        assert_eq!(err.stage(), "parity");
        assert!(err.to_string().contains("move_probs"), "{err}");
        // The full-precision artifact had already passed and stays published
        assert!(config.output.exists());
        let target = config.quantized_output();
        assert!(!target.exists());
        assert!(!Staged::for_target(&target).path.exists());
    }

    #[test]
    fn test_vocabulary_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let small = MoveVocabulary::from_moves(vec!["e2e4".to_string()]).unwrap();
        let err = run(&net(), &small, &config(dir.path())).unwrap_err();
        assert_eq!(err.stage(), "vocabulary");
        assert!(!config(dir.path()).output.exists());
    }

    #[test]
    fn test_bad_positions_abort_before_export() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            positions: vec!["not a fen".to_string()],
            ..config(dir.path())
        };
        let err = run(&net(), MoveVocabulary::standard(), &config).unwrap_err();
        assert_eq!(err.stage(), "encoding");
        assert!(!config.output.exists());
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            checkpoint_dir: dir.path().join("nowhere"),
            ..config(dir.path())
        };
        assert_eq!(run_with_checkpoint(&config).unwrap_err().stage(), "checkpoint");
    }
}
