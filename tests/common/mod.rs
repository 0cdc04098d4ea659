#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{ensure, Result};
use multiqg::checkpoint::{CheckpointExtras, CheckpointId, CheckpointManager};
use multiqg::dataset::EncodedBatch;
use multiqg::runtime::LossValue;
use multiqg::{DecodingConfig, Example, QgTokenizer, RuntimeBuilder, Seq2SeqRuntime, VocabSpec};

pub const ECHO_STATE: &[u8] = b"echo-runtime-v1";

pub fn capitals() -> Vec<Example> {
    [
        ("Paris", "France"),
        ("Berlin", "Germany"),
        ("Rome", "Italy"),
        ("Madrid", "Spain"),
        ("Lisbon", "Portugal"),
        ("Vienna", "Austria"),
    ]
    .iter()
    .map(|(city, country)| {
        Example::new(format!("{city} is the capital of {country}."))
            .with_answer(*city)
            .with_question(format!("What is the capital of {country}?"))
    })
    .collect()
}

pub fn tokenizer() -> Result<QgTokenizer> {
    let mut texts = multiqg::trainer::tokenizer_corpus(&capitals());
    texts.extend(
        [
            "Paris is the capital of France. Berlin is the capital of Germany.",
            "Alice met Bob in Oslo.",
            "Café is open.",
            "generate question: extract answers: question: context:",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    Ok(QgTokenizer::train(&texts, 400)?)
}

/// Records how a runtime is driven, shared between a builder and every
/// runtime it builds.
#[derive(Debug, Default)]
pub struct CallStats {
    pub builds: AtomicUsize,
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl CallStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct EchoLoss;

impl LossValue for EchoLoss {
    fn value(&self) -> f64 {
        1.0
    }
}

/// Returns the highlighted span of its input, or the whole input when nothing
/// is highlighted. Sleeps for `delay` inside every decode.
pub struct EchoRuntime {
    vocab: VocabSpec,
    stats: Arc<CallStats>,
    delay: Duration,
}

impl Seq2SeqRuntime for EchoRuntime {
    type Loss = EchoLoss;

    fn forward(&mut self, _batch: &EncodedBatch) -> Result<EchoLoss> {
        Ok(EchoLoss)
    }

    fn backward(&mut self, _loss: EchoLoss) -> Result<()> {
        Ok(())
    }

    fn optimizer_step(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate(&mut self, input_ids: &[u32], config: &DecodingConfig) -> Result<Vec<Vec<u32>>> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let marks: Vec<usize> = input_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == self.vocab.highlight_id)
            .map(|(i, _)| i)
            .collect();
        let span = match (marks.first(), marks.last()) {
            (Some(&first), Some(&last)) if first < last => &input_ids[first + 1..last],
            _ => input_ids,
        };
        let mut output: Vec<u32> = span
            .iter()
            .copied()
            .filter(|&id| id != self.vocab.pad_id && id != self.vocab.bos_id && id != self.vocab.eos_id)
            .collect();
        output.truncate(config.max_output_length);

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![output; config.num_return_sequences])
    }

    fn model_state(&self) -> Result<Vec<u8>> {
        Ok(ECHO_STATE.to_vec())
    }

    fn optimizer_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore(&mut self, model: &[u8], _optimizer: &[u8]) -> Result<()> {
        ensure!(model == ECHO_STATE, "not an echo runtime state");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct EchoBuilder {
    pub stats: Arc<CallStats>,
    pub delay: Duration,
}

impl EchoBuilder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            stats: Arc::default(),
            delay,
        }
    }
}

impl RuntimeBuilder for EchoBuilder {
    type Runtime = EchoRuntime;

    fn build(&self, vocab: &VocabSpec) -> Result<EchoRuntime> {
        self.stats.builds.fetch_add(1, Ordering::SeqCst);
        Ok(EchoRuntime {
            vocab: *vocab,
            stats: Arc::clone(&self.stats),
            delay: self.delay,
        })
    }
}

/// Writes an echo-runtime checkpoint for `epoch` under `root`.
pub fn echo_checkpoint(root: &Path, tokenizer: &QgTokenizer, epoch: usize) -> Result<CheckpointId> {
    let manager = CheckpointManager::new(root)?;
    let extras = CheckpointExtras {
        tokenizer_json: tokenizer.to_json()?,
        seed: 0,
        global_step: 0,
    };
    Ok(manager.save(epoch, ECHO_STATE, &[], &extras)?)
}
