use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{QgError, Result};
use crate::formatter::TaskType;
use crate::scheduler::TaskBatch;
use crate::tokenizer::QgTokenizer;

/// Label value skipped by the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One raw question-answering record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    #[serde(alias = "paragraph")]
    pub context: String,
    #[serde(default, alias = "answer")]
    pub answer_span: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
}

impl Example {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            answer_span: None,
            question: None,
        }
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer_span = Some(answer.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }
}

/// Reads one JSON example per line; blank lines are skipped.
pub fn load_examples(file_path: impl AsRef<Path>) -> Result<Vec<Example>> {
    let path = file_path.as_ref();
    if !path.exists() {
        return Err(QgError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("dataset file not found: {}", path.display()),
        )));
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut items = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item: Example = serde_json::from_str(&line)?;
        items.push(item);
    }

    info!("Loaded {} examples from {}", items.len(), path.display());
    Ok(items)
}

/// Token ids for one task batch, padded to the longest row.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub task: TaskType,
    pub input_ids: Vec<Vec<u32>>,
    pub input_lengths: Vec<usize>,
    /// Target ids ending in `[EOS]`, padded with [`IGNORE_INDEX`].
    pub labels: Vec<Vec<i64>>,
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of supervised target positions.
    pub fn target_tokens(&self) -> usize {
        self.labels
            .iter()
            .flatten()
            .filter(|&&label| label != IGNORE_INDEX)
            .count()
    }
}

/// What happens to a training pair longer than the configured limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Truncate,
    /// Leave the pair out of its batch.
    Drop,
}

/// Tokenizes text pairs into padded id matrices.
pub struct BatchEncoder {
    tokenizer: QgTokenizer,
    max_input_length: usize,
    max_output_length: usize,
    overflow: OverflowPolicy,
}

impl BatchEncoder {
    pub fn new(tokenizer: QgTokenizer, max_input_length: usize, max_output_length: usize) -> Self {
        Self {
            tokenizer,
            max_input_length,
            max_output_length,
            overflow: OverflowPolicy::Truncate,
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn tokenizer(&self) -> &QgTokenizer {
        &self.tokenizer
    }

    pub fn encode(&self, batch: &TaskBatch) -> Result<EncodedBatch> {
        let mut inputs = Vec::with_capacity(batch.pairs.len());
        let mut targets = Vec::with_capacity(batch.pairs.len());
        let mut truncated = 0;
        let mut dropped = 0;

        for (input_text, target_text) in &batch.pairs {
            let mut input = self.tokenizer.encode(input_text)?;
            let mut target = self.tokenizer.encode_target(target_text)?;
            let overflows =
                input.len() > self.max_input_length || target.len() > self.max_output_length;
            if overflows && self.overflow == OverflowPolicy::Drop {
                dropped += 1;
                continue;
            }
            if input.len() > self.max_input_length {
                input.truncate(self.max_input_length);
                truncated += 1;
            }
            if target.len() > self.max_output_length {
                target.truncate(self.max_output_length);
                truncated += 1;
            }
            inputs.push(input);
            targets.push(target);
        }
        if truncated > 0 {
            debug!("truncated {} over-long sequences in {} batch", truncated, batch.task);
        }
        if dropped > 0 {
            debug!("dropped {} over-long pairs from {} batch", dropped, batch.task);
        }

        let input_width = inputs.iter().map(Vec::len).max().unwrap_or(0);
        let label_width = targets.iter().map(Vec::len).max().unwrap_or(0);
        let pad_id = self.tokenizer.vocab().pad_id;

        let input_lengths = inputs.iter().map(Vec::len).collect();
        let input_ids = inputs
            .into_iter()
            .map(|tokens| pad_tokens(tokens, input_width, pad_id))
            .collect();
        let labels = targets
            .into_iter()
            .map(|tokens| {
                let tokens = tokens.into_iter().map(i64::from).collect();
                pad_tokens(tokens, label_width, IGNORE_INDEX)
            })
            .collect();

        Ok(EncodedBatch {
            task: batch.task,
            input_ids,
            input_lengths,
            labels,
        })
    }
}

fn pad_tokens<T: Copy>(mut tokens: Vec<T>, width: usize, pad: T) -> Vec<T> {
    if tokens.len() > width {
        tokens.truncate(width);
    } else {
        tokens.resize(width, pad);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_tokens() {
        assert_eq!(pad_tokens(vec![1, 2], 4, 0), vec![1, 2, 0, 0]);
        assert_eq!(pad_tokens(vec![1, 2, 3], 2, 0), vec![1, 2]);
        assert_eq!(pad_tokens(vec![7i64], 3, IGNORE_INDEX), vec![7, -100, -100]);
    }

    #[test]
    fn test_example_aliases() {
        let example: Example =
            serde_json::from_str(r#"{"paragraph": "Tokyo is big.", "answer": "Tokyo"}"#).unwrap();
        assert_eq!(example.context, "Tokyo is big.");
        assert_eq!(example.answer_span.as_deref(), Some("Tokyo"));
        assert_eq!(example.question, None);
    }
}
