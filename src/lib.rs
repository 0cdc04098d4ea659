pub mod baseline;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decoding;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod formatter;
#[cfg(feature = "libtorch")]
pub mod model;
pub mod runtime;
pub mod scheduler;
pub mod tokenizer;
pub mod trainer;

pub use baseline::{BaselineBuilder, BaselineConfig, BaselineSeq2Seq};
pub use checkpoint::{CheckpointId, CheckpointManager};
pub use crate::config::{AppConfig, ServingConfig, TrainingConfig};
pub use dataset::{load_examples, Example, OverflowPolicy};
pub use decoding::DecodingConfig;
pub use engine::{
    GenerationEngine, GenerationRequest, GenerationResponse, LocalRepository, ModelHandle,
    ModelRepository, ModelSource,
};
pub use error::{ErrorKind, QgError, Result};
pub use evaluation::{EvaluationPipeline, MetricReport, MetricScorer, OverlapScorer};
pub use formatter::{DataFormatter, TaskType};
#[cfg(feature = "libtorch")]
pub use model::{TchBuilder, TchConfig, TchSeq2Seq};
pub use runtime::{RuntimeBuilder, Seq2SeqRuntime, VocabSpec};
pub use scheduler::{MixturePolicy, TaskBatch, TaskScheduler};
pub use tokenizer::QgTokenizer;
pub use trainer::{TrainingLoop, TrainingState, TrainingSummary};
