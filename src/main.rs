use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::info;

use policy_export::config::ExportConfig;
use policy_export::error::PipelineError;
use policy_export::inference::ModelHandle;
use policy_export::model::checkpoint::save;
use policy_export::model::{Device, Evaluator, ModelKind, NetworkConfig, RatingPolicyNet};
use policy_export::pipeline::run_with_checkpoint;
use policy_export::quantize::WeightPrecision;
use policy_export::vocab::MoveVocabulary;

/// Export, verify and quantize rating-conditioned policy networks.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Export a checkpoint to a verified graph artifact
    Export(ExportArgs),
    /// Write the move vocabulary as JSON
    Vocab {
        #[arg(long, value_name = "FILE", default_value = "artifacts/move_vocab.json")]
        output: PathBuf,
    },
    /// Evaluate one position with an exported artifact
    Predict(PredictArgs),
    /// Write a randomly initialised checkpoint
    Init {
        #[arg(long, value_name = "DIR", default_value = "checkpoints")]
        checkpoint_dir: PathBuf,
        #[arg(long, value_name = "KIND", default_value = "rapid")]
        model_type: ModelKind,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// JSON config file; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// rapid or blitz
    #[arg(long, value_name = "KIND")]
    model_type: Option<ModelKind>,

    #[arg(long)]
    device: Option<Device>,

    /// Full-precision artifact path
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Quantized artifact path (defaults to <output>_quantized)
    #[arg(long, value_name = "FILE")]
    quantized_output: Option<PathBuf>,

    /// Also produce a weight-quantized artifact
    #[arg(long)]
    quantize: bool,

    #[arg(long)]
    opset: Option<u32>,

    /// Rating used for both sides during verification
    #[arg(long, value_name = "ELO")]
    verify_rating: Option<i64>,

    /// Extra verification positions: JSON list or one FEN per line
    #[arg(long, value_name = "FILE")]
    positions: Option<PathBuf>,

    /// Max abs difference allowed for the full-precision artifact
    #[arg(long)]
    tolerance: Option<f32>,

    /// Max abs difference allowed for the quantized artifact
    #[arg(long)]
    quantized_tolerance: Option<f32>,

    /// One quantization scale per output column
    #[arg(long)]
    per_channel: bool,

    /// int8 or uint8
    #[arg(long, value_name = "TYPE")]
    weight_type: Option<WeightPrecision>,

    /// Write the move vocabulary next to the artifact
    #[arg(long, value_name = "FILE")]
    vocab_output: Option<PathBuf>,
}

impl ExportArgs {
    fn into_config(self) -> Result<ExportConfig, PipelineError> {
        let mut config = match &self.config {
            Some(path) => ExportConfig::from_file(path)?,
            None => ExportConfig::default(),
        };
        if let Some(dir) = self.checkpoint_dir {
            config.checkpoint_dir = dir;
        }
        if let Some(kind) = self.model_type {
            config.model_type = kind;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if self.quantized_output.is_some() {
            config.quantized_output = self.quantized_output;
        }
        config.quantize |= self.quantize;
        if let Some(opset) = self.opset {
            config.opset = opset;
        }
        if let Some(rating) = self.verify_rating {
            config.verify_rating = rating;
        }
        if self.positions.is_some() {
            config.positions_file = self.positions;
        }
        if let Some(tol) = self.tolerance {
            config.tolerance = tol;
        }
        if let Some(tol) = self.quantized_tolerance {
            config.quantized_tolerance = tol;
        }
        config.quantization.per_channel |= self.per_channel;
        if let Some(precision) = self.weight_type {
            config.quantization.weight_precision = precision;
        }
        if self.vocab_output.is_some() {
            config.vocab_output = self.vocab_output;
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
struct PredictArgs {
    #[arg(long, value_name = "FILE")]
    artifact: PathBuf,

    /// Vocabulary JSON (defaults to the generated vocabulary)
    #[arg(long, value_name = "FILE")]
    vocab: Option<PathBuf>,

    #[arg(long)]
    fen: String,

    /// Rating of the side to move
    #[arg(long)]
    elo: i64,

    /// Opponent rating (defaults to --elo)
    #[arg(long)]
    elo_oppo: Option<i64>,

    /// Restrict to these UCI moves, comma separated
    #[arg(long, value_delimiter = ',')]
    legal: Vec<String>,

    #[arg(long, default_value_t = 5)]
    top: usize,
}

fn predict(args: PredictArgs) -> Result<(), PipelineError> {
    let handle = ModelHandle::new(args.artifact, args.vocab);
    let legal = (!args.legal.is_empty()).then_some(args.legal.as_slice());
    let prediction = handle.predict(&args.fen, args.elo, args.elo_oppo.unwrap_or(args.elo), legal)?;
    match prediction.best_move() {
        Some(best) => println!("bestmove {}", best.uci),
        None => println!("bestmove (none)"),
    }
    for candidate in prediction.top(args.top) {
        println!("{:>7} {:.4}", candidate.uci, candidate.probability);
    }
    println!("win_prob {:.4}", prediction.win_prob);
    Ok(())
}

fn run(command: Command) -> Result<(), PipelineError> {
    match command {
        Command::Export(args) => {
            let config = args.into_config()?;
            let summary = run_with_checkpoint(&config)?;
            info!(
                "export complete: {} ({} bytes)",
                summary.artifact.display(),
                summary.artifact_bytes
            );
        }
        Command::Vocab { output } => {
            let vocab = MoveVocabulary::standard();
            vocab.save_json(&output)?;
            info!("wrote {} moves to {}", vocab.len(), output.display());
        }
        Command::Predict(args) => predict(args)?,
        Command::Init {
            checkpoint_dir,
            model_type,
            seed,
        } => {
            let net = RatingPolicyNet::random(NetworkConfig::default(), seed);
            let path = save(&net, model_type, &checkpoint_dir)?;
            info!(
                "wrote {model_type} checkpoint with {} parameters to {}",
                net.parameter_count(),
                path.display()
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    run(cli.command).map_err(|err| anyhow::anyhow!("{} stage failed: {err}", err.stage()))
}
