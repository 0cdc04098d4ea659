//! libtorch runtime: GRU encoder-decoder trained with teacher forcing.

use std::io::Cursor;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tch::nn::{self, Module, OptimizerConfig, RNN};
use tch::{Device, Kind, Reduction, Tensor};

use crate::dataset::EncodedBatch;
use crate::decoding::{self, DecodingConfig};
use crate::runtime::{LossValue, RuntimeBuilder, Seq2SeqRuntime, VocabSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TchConfig {
    pub embedding_size: i64,
    pub hidden_size: i64,
    pub num_layers: i64,
    pub dropout: f64,
    pub learning_rate: f64,
    pub label_smoothing: f64,
    pub seed: i64,
}

impl Default for TchConfig {
    fn default() -> Self {
        Self {
            embedding_size: 256,
            hidden_size: 512,
            num_layers: 2,
            dropout: 0.1,
            learning_rate: 1e-4,
            label_smoothing: 0.0,
            seed: 42,
        }
    }
}

pub struct TchLoss {
    loss: Tensor,
    value: f64,
}

impl LossValue for TchLoss {
    fn value(&self) -> f64 {
        self.value
    }
}

/// Decoder hidden state carried between search steps.
struct Hidden(nn::GRUState);

impl Clone for Hidden {
    fn clone(&self) -> Self {
        Hidden(nn::GRUState(self.0 .0.shallow_clone()))
    }
}

pub struct TchSeq2Seq {
    config: TchConfig,
    vocab: VocabSpec,
    device: Device,
    vs: nn::VarStore,
    embeddings: nn::Embedding,
    encoder: nn::GRU,
    decoder: nn::GRU,
    lm_head: nn::Linear,
    optimizer: nn::Optimizer,
}

impl TchSeq2Seq {
    pub fn new(config: TchConfig, vocab: VocabSpec, device: Device) -> Result<Self> {
        tch::manual_seed(config.seed);
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let vocab_size = vocab.size as i64;

        let embeddings = nn::embedding(
            &root / "embeddings",
            vocab_size,
            config.embedding_size,
            Default::default(),
        );
        let rnn_config = nn::RNNConfig {
            num_layers: config.num_layers,
            dropout: config.dropout,
            batch_first: true,
            ..Default::default()
        };
        let encoder = nn::gru(&root / "encoder", config.embedding_size, config.hidden_size, rnn_config);
        let decoder = nn::gru(&root / "decoder", config.embedding_size, config.hidden_size, rnn_config);
        let lm_head = nn::linear(&root / "lm_head", config.hidden_size, vocab_size, Default::default());
        let optimizer = nn::Adam::default().build(&vs, config.learning_rate)?;

        Ok(Self {
            config,
            vocab,
            device,
            vs,
            embeddings,
            encoder,
            decoder,
            lm_head,
            optimizer,
        })
    }

    fn ids_tensor(&self, rows: &[Vec<i64>]) -> Tensor {
        let width = rows.first().map_or(0, Vec::len) as i64;
        let flat: Vec<i64> = rows.iter().flatten().copied().collect();
        Tensor::from_slice(&flat)
            .view([rows.len() as i64, width])
            .to_device(self.device)
    }

    fn encode(&self, input_ids: &Tensor) -> nn::GRUState {
        let embedded = self.embeddings.forward(input_ids);
        let (_, state) = self.encoder.seq(&embedded);
        state
    }
}

impl Seq2SeqRuntime for TchSeq2Seq {
    type Loss = TchLoss;

    fn forward(&mut self, batch: &EncodedBatch) -> Result<TchLoss> {
        ensure!(!batch.is_empty(), "empty batch");
        let inputs: Vec<Vec<i64>> = batch
            .input_ids
            .iter()
            .map(|row| row.iter().map(|&id| i64::from(id)).collect())
            .collect();
        // [BOS] followed by the shifted labels, padding in place of ignored positions.
        let decoder_inputs: Vec<Vec<i64>> = batch
            .labels
            .iter()
            .map(|row| {
                std::iter::once(i64::from(self.vocab.bos_id))
                    .chain(row.iter().take(row.len().saturating_sub(1)).map(|&label| {
                        if label < 0 {
                            i64::from(self.vocab.pad_id)
                        } else {
                            label
                        }
                    }))
                    .collect()
            })
            .collect();

        let input_ids = self.ids_tensor(&inputs);
        let decoder_ids = self.ids_tensor(&decoder_inputs);
        let labels = self.ids_tensor(&batch.labels);

        let state = self.encode(&input_ids);
        let (output, _) = self
            .decoder
            .seq_init(&self.embeddings.forward(&decoder_ids), &state);
        let logits = self.lm_head.forward(&output);

        let loss = logits
            .view([-1, self.vocab.size as i64])
            .cross_entropy_loss::<Tensor>(
                &labels.view(-1),
                None,
                Reduction::Mean,
                -100,
                self.config.label_smoothing,
            );
        let value = loss.double_value(&[]);
        Ok(TchLoss { loss, value })
    }

    fn backward(&mut self, loss: TchLoss) -> Result<()> {
        loss.loss.backward();
        Ok(())
    }

    fn optimizer_step(&mut self) -> Result<()> {
        self.optimizer.step();
        self.optimizer.zero_grad();
        Ok(())
    }

    fn generate(&mut self, input_ids: &[u32], config: &DecodingConfig) -> Result<Vec<Vec<u32>>> {
        ensure!(!input_ids.is_empty(), "empty input");
        let row: Vec<i64> = input_ids.iter().map(|&id| i64::from(id)).collect();
        let input = self.ids_tensor(&[row]);

        tch::no_grad(|| {
            let init = Hidden(self.encode(&input));
            decoding::search(config, &self.vocab, init, |state, prev| {
                let token = Tensor::from_slice(&[i64::from(prev)])
                    .view([1, 1])
                    .to_device(self.device);
                let (output, next) = self
                    .decoder
                    .seq_init(&self.embeddings.forward(&token), &state.0);
                let logits = self
                    .lm_head
                    .forward(&output)
                    .view([-1])
                    .to_kind(Kind::Float)
                    .to_device(Device::Cpu);
                Ok((Hidden(next), Vec::<f32>::try_from(&logits)?))
            })
        })
    }

    fn model_state(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.vs.save_to_stream(&mut bytes)?;
        Ok(bytes)
    }

    /// libtorch optimizer buffers are not exported; a restored run restarts
    /// Adam's moment estimates.
    fn optimizer_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore(&mut self, model: &[u8], _optimizer: &[u8]) -> Result<()> {
        self.vs.load_from_stream(Cursor::new(model))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TchBuilder {
    pub config: TchConfig,
}

impl RuntimeBuilder for TchBuilder {
    type Runtime = TchSeq2Seq;

    fn build(&self, vocab: &VocabSpec) -> Result<TchSeq2Seq> {
        TchSeq2Seq::new(self.config.clone(), *vocab, Device::cuda_if_available())
    }
}
