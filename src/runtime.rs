use serde::{Deserialize, Serialize};

use crate::dataset::EncodedBatch;
use crate::decoding::DecodingConfig;

/// Vocabulary facts a runtime needs to size embeddings and drive decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabSpec {
    pub size: usize,
    pub pad_id: u32,
    pub bos_id: u32,
    pub eos_id: u32,
    pub highlight_id: u32,
}

/// A scalar loss that still carries whatever the runtime needs for `backward`.
pub trait LossValue {
    fn value(&self) -> f64;
}

pub trait Seq2SeqRuntime: Send {
    type Loss: LossValue;

    fn forward(&mut self, batch: &EncodedBatch) -> anyhow::Result<Self::Loss>;

    /// Accumulates gradients of `loss` into the runtime's parameters.
    fn backward(&mut self, loss: Self::Loss) -> anyhow::Result<()>;

    /// Applies and clears the accumulated gradients.
    fn optimizer_step(&mut self) -> anyhow::Result<()>;

    /// Decodes candidates for one input, best first, without the leading
    /// `[BOS]` or trailing `[EOS]`.
    fn generate(&mut self, input_ids: &[u32], config: &DecodingConfig) -> anyhow::Result<Vec<Vec<u32>>>;

    fn model_state(&self) -> anyhow::Result<Vec<u8>>;

    fn optimizer_state(&self) -> anyhow::Result<Vec<u8>>;

    /// Replaces weights and optimizer state with previously exported bytes.
    /// An empty `optimizer` slice keeps a freshly initialised optimizer.
    fn restore(&mut self, model: &[u8], optimizer: &[u8]) -> anyhow::Result<()>;
}

/// Creates runtimes sized for a vocabulary, for training and for every model
/// the generation engine loads.
pub trait RuntimeBuilder: Send + Sync {
    type Runtime: Seq2SeqRuntime + 'static;

    fn build(&self, vocab: &VocabSpec) -> anyhow::Result<Self::Runtime>;
}
