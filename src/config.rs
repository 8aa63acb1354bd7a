//! Export run configuration.
//!
//! Defaults cover a plain run; a JSON file may override any subset of the
//! fields and command-line flags override the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::export::DEFAULT_OPSET;
use crate::graph::{MAX_OPSET, MIN_OPSET};
use crate::model::{Device, ModelKind};
use crate::parity::{Tolerance, DEFAULT_TOLERANCE, QUANTIZED_TOLERANCE};
use crate::quantize::QuantizeOptions;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub checkpoint_dir: PathBuf,
    pub model_type: ModelKind,
    pub device: Device,
    pub output: PathBuf,
    /// Defaults to `<output stem>_quantized.<ext>`
    pub quantized_output: Option<PathBuf>,
    pub quantize: bool,
    pub quantization: QuantizeOptions,
    pub opset: u32,
    /// Rating used for both sides of every verification position
    pub verify_rating: i64,
    /// Extra verification FENs appended to the built-in set
    pub positions: Vec<String>,
    pub positions_file: Option<PathBuf>,
    pub tolerance: f32,
    pub quantized_tolerance: f32,
    pub vocab_output: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            checkpoint_dir: PathBuf::from("checkpoints"),
            model_type: ModelKind::Rapid,
            device: Device::Cpu,
            output: PathBuf::from("artifacts/rapid_model.graph"),
            quantized_output: None,
            quantize: false,
            quantization: QuantizeOptions::default(),
            opset: DEFAULT_OPSET,
            verify_rating: 1500,
            positions: Vec::new(),
            positions_file: None,
            tolerance: DEFAULT_TOLERANCE,
            quantized_tolerance: QUANTIZED_TOLERANCE,
            vocab_output: None,
        }
    }
}

impl ExportConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))
    }

    /// Where the quantized artifact goes.
    #[must_use]
    pub fn quantized_output(&self) -> PathBuf {
        if let Some(path) = &self.quantized_output {
            return path.clone();
        }
        let stem = self
            .output
            .file_stem()
            .map_or_else(|| "model".into(), |s| s.to_string_lossy().into_owned());
        let name = match self.output.extension() {
            Some(ext) => format!("{stem}_quantized.{}", ext.to_string_lossy()),
            None => format!("{stem}_quantized"),
        };
        self.output.with_file_name(name)
    }

    #[must_use]
    pub fn full_precision_tolerance(&self) -> Tolerance {
        Tolerance::uniform(self.tolerance)
    }

    #[must_use]
    pub fn quantized_tolerance(&self) -> Tolerance {
        Tolerance::uniform(self.quantized_tolerance)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn check(&self) -> Result<(), PipelineError> {
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset) {
            return Err(PipelineError::config(format!(
                "opset {} is outside {MIN_OPSET}..={MAX_OPSET}",
                self.opset
            )));
        }
        if self.verify_rating <= 0 {
            return Err(PipelineError::config(format!(
                "verification rating must be positive, got {}",
                self.verify_rating
            )));
        }
        for (name, tol) in [("tolerance", self.tolerance), ("quantized tolerance", self.quantized_tolerance)] {
            if !tol.is_finite() || tol <= 0.0 {
                return Err(PipelineError::config(format!("{name} must be positive, got {tol}")));
            }
        }
        if self.quantize && self.quantized_output() == self.output {
            return Err(PipelineError::config("quantized output must differ from the output"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::WeightPrecision;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExportConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.opset, 17);
        assert_eq!(config.verify_rating, 1500);
        assert_eq!(
            config.quantized_output(),
            PathBuf::from("artifacts/rapid_model_quantized.graph")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        fs::write(
            &path,
            r#"{"model_type": "blitz", "quantize": true, "quantization": {"weight_precision": "uint8"}}"#,
        )
        .unwrap();
        let config = ExportConfig::from_file(&path).unwrap();
        assert_eq!(config.model_type, ModelKind::Blitz);
        assert!(config.quantize);
        assert_eq!(config.quantization.weight_precision, WeightPrecision::UInt8);
        assert!(!config.quantization.per_channel);
        assert_eq!(config.tolerance, DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        fs::write(&path, r#"{"opset": 17, "batch": 4}"#).unwrap();
        assert!(matches!(ExportConfig::from_file(&path), Err(PipelineError::Config { .. })));
    }

    #[test]
    fn test_check_rejects_bad_values() {
        let bad = [
            ExportConfig {
                opset: 9,
                ..ExportConfig::default()
            },
            ExportConfig {
                verify_rating: 0,
                ..ExportConfig::default()
            },
            ExportConfig {
                quantized_tolerance: f32::NAN,
                ..ExportConfig::default()
            },
            ExportConfig {
                quantize: true,
                quantized_output: Some(PathBuf::from("artifacts/rapid_model.graph")),
                ..ExportConfig::default()
            },
        ];
        for config in bad {
            assert!(config.check().is_err(), "{config:?}");
        }
    }
}
