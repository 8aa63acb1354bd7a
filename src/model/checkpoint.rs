//! Checkpoint files: one safetensors file per model kind holding the network
//! parameters by name, weights stored `[in, out]`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};

use super::network::RatingPolicyNet;
use super::NetworkConfig;
use crate::error::PipelineError;
use crate::graph::serialize::{decode_tensors, encode_tensors};

/// Which trained model to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Rapid,
    Blitz,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Rapid => f.write_str("rapid"),
            ModelKind::Blitz => f.write_str("blitz"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rapid" => Ok(ModelKind::Rapid),
            "blitz" => Ok(ModelKind::Blitz),
            _ => Err(format!("unknown model type '{s}', expected 'rapid' or 'blitz'")),
        }
    }
}

/// Where the evaluator runs. Only the CPU is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cpu")
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            _ => Err(format!("device '{s}' is not supported, only 'cpu' is")),
        }
    }
}

/// Checkpoint file for `kind` inside `dir`.
#[must_use]
pub fn checkpoint_path(kind: ModelKind, dir: &Path) -> PathBuf {
    dir.join(format!("{kind}_model.safetensors"))
}

/// Load the `kind` checkpoint from `dir`.
pub fn load(kind: ModelKind, device: Device, dir: &Path) -> Result<RatingPolicyNet, PipelineError> {
    let path = checkpoint_path(kind, dir);
    let bytes = fs::read(&path).map_err(|e| PipelineError::checkpoint(&path, e.to_string()))?;
    let params = decode_tensors(&bytes).map_err(|reason| PipelineError::checkpoint(&path, reason))?;
    let net = RatingPolicyNet::from_parameters(params, NetworkConfig::default().dropout)
        .map_err(|err| PipelineError::checkpoint(&path, err.to_string()))?;
    info!(
        "Loaded {kind} checkpoint from {} on {device} (hidden {}, {} moves)",
        path.display(),
        net.config().hidden,
        net.config().vocab_size
    );
    Ok(net)
}

/// Write `net` as the `kind` checkpoint in `dir`, replacing any existing one.
pub fn save(net: &RatingPolicyNet, kind: ModelKind, dir: &Path) -> Result<PathBuf, PipelineError> {
    let path = checkpoint_path(kind, dir);
    let bytes = encode_tensors(net.parameters(), None).map_err(|reason| PipelineError::checkpoint(&path, reason))?;
    fs::create_dir_all(dir).map_err(|source| PipelineError::io(dir, source))?;
    let tmp = path.with_extension("safetensors.tmp");
    fs::write(&tmp, bytes).map_err(|source| PipelineError::io(&tmp, source))?;
    fs::rename(&tmp, &path).map_err(|source| PipelineError::io(&path, source))?;
    Ok(path)
}
