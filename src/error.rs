use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::formatter::TaskType;

#[derive(Error, Debug)]
pub enum QgError {
    #[error("example is missing `{field}` required by {task}")]
    MissingField { task: TaskType, field: &'static str },

    #[error("highlight `{highlight}` not found in context")]
    HighlightNotFound { highlight: String },

    #[error("task {0} has a nonzero mixture weight but no eligible examples")]
    EmptyTaskPool(TaskType),

    #[error("evaluation data error: {0}")]
    EvaluationData(String),

    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint at {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("invalid decoding config: {0}")]
    InvalidDecodingConfig(String),

    #[error("no model loaded")]
    ModelNotLoaded,

    #[error("no answer could be extracted from the context")]
    AnswerNotFound,

    #[error("input has {length} tokens, exceeding the maximum of {max}")]
    InputTooLong { length: usize, max: usize },

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reported by the compute runtime, passed through untouched.
    #[error(transparent)]
    Compute(#[from] anyhow::Error),
}

/// Coarse error classification carried by generation responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingField,
    HighlightNotFound,
    EmptyTaskPool,
    EvaluationData,
    CheckpointNotFound,
    CheckpointCorrupt,
    InvalidDecodingConfig,
    ModelNotLoaded,
    AnswerNotFound,
    InputTooLong,
    Timeout,
    Internal,
}

impl QgError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        QgError::Config(msg.into())
    }

    pub fn invalid_decoding<S: Into<String>>(msg: S) -> Self {
        QgError::InvalidDecodingConfig(msg.into())
    }

    pub fn corrupt<S: Into<String>>(path: impl Into<PathBuf>, reason: S) -> Self {
        QgError::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QgError::MissingField { .. } => ErrorKind::MissingField,
            QgError::HighlightNotFound { .. } => ErrorKind::HighlightNotFound,
            QgError::EmptyTaskPool(_) => ErrorKind::EmptyTaskPool,
            QgError::EvaluationData(_) => ErrorKind::EvaluationData,
            QgError::CheckpointNotFound(_) => ErrorKind::CheckpointNotFound,
            QgError::CheckpointCorrupt { .. } => ErrorKind::CheckpointCorrupt,
            QgError::InvalidDecodingConfig(_) => ErrorKind::InvalidDecodingConfig,
            QgError::ModelNotLoaded => ErrorKind::ModelNotLoaded,
            QgError::AnswerNotFound => ErrorKind::AnswerNotFound,
            QgError::InputTooLong { .. } => ErrorKind::InputTooLong,
            QgError::Timeout(_) => ErrorKind::Timeout,
            QgError::Config(_)
            | QgError::Tokenizer(_)
            | QgError::Io(_)
            | QgError::Json(_)
            | QgError::Compute(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, QgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = QgError::MissingField {
            task: TaskType::QuestionGeneration,
            field: "answer_span",
        };
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert!(err.to_string().contains("answer_span"));

        let err = QgError::invalid_decoding("beam_width must be >= 1");
        assert_eq!(err.kind(), ErrorKind::InvalidDecodingConfig);

        let err: QgError = anyhow::anyhow!("CUDA out of memory").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "CUDA out of memory");
    }
}
