pub mod board;
pub mod config;
pub mod encoder;
pub mod error;
pub mod export;
pub mod graph;
pub mod inference;
pub mod model;
pub mod ops;
pub mod parity;
pub mod pipeline;
pub mod positions;
pub mod quantize;
pub mod tensor;
pub mod vocab;

pub use config::ExportConfig;
pub use encoder::{encode, SampleBatch};
pub use error::PipelineError;
pub use export::export;
pub use graph::{validate, Graph, Session};
pub use inference::{ModelHandle, Prediction};
pub use parity::{verify, ParityReport, Tolerance};
pub use quantize::{quantize, QuantizeOptions};
pub use vocab::MoveVocabulary;
