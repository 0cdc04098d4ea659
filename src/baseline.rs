//! CPU reference runtime built on ndarray. Training and decoding are
//! deterministic, so a resumed run reproduces an uninterrupted one.

use anyhow::{bail, ensure};
use ndarray::{Array, Array1, Array2, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::dataset::{EncodedBatch, IGNORE_INDEX};
use crate::decoding::{self, DecodingConfig};
use crate::runtime::{LossValue, RuntimeBuilder, Seq2SeqRuntime, VocabSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub hidden_size: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub label_smoothing: f64,
    pub init_scale: f64,
    pub seed: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            hidden_size: 64,
            learning_rate: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            label_smoothing: 0.0,
            init_scale: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Params {
    encoder: Array2<f32>,
    decoder: Array2<f32>,
    projection: Array2<f32>,
    bias: Array1<f32>,
}

impl Params {
    fn zeros(vocab_size: usize, hidden: usize) -> Self {
        Self {
            encoder: Array2::zeros((vocab_size, hidden)),
            decoder: Array2::zeros((vocab_size, hidden)),
            projection: Array2::zeros((hidden, vocab_size)),
            bias: Array1::zeros(vocab_size),
        }
    }

    fn random(vocab_size: usize, hidden: usize, scale: f32, rng: &mut StdRng) -> Self {
        let mut uniform = |_: (usize, usize)| rng.gen_range(-scale..scale);
        Self {
            encoder: Array2::from_shape_fn((vocab_size, hidden), &mut uniform),
            decoder: Array2::from_shape_fn((vocab_size, hidden), &mut uniform),
            projection: Array2::from_shape_fn((hidden, vocab_size), &mut uniform),
            bias: Array1::zeros(vocab_size),
        }
    }

    fn same_shape(&self, other: &Params) -> bool {
        self.encoder.dim() == other.encoder.dim()
            && self.decoder.dim() == other.decoder.dim()
            && self.projection.dim() == other.projection.dim()
            && self.bias.dim() == other.bias.dim()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdamState {
    first: Params,
    second: Params,
    step: u64,
}

struct AdamHyper {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    correction1: f32,
    correction2: f32,
}

fn adam_update<D: Dimension>(
    param: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    first: &mut Array<f32, D>,
    second: &mut Array<f32, D>,
    hp: &AdamHyper,
) {
    Zip::from(param)
        .and(grad)
        .and(first)
        .and(second)
        .for_each(|p, &g, m, v| {
            *m = hp.beta1 * *m + (1.0 - hp.beta1) * g;
            *v = hp.beta2 * *v + (1.0 - hp.beta2) * g * g;
            let m_hat = *m / hp.correction1;
            let v_hat = *v / hp.correction2;
            *p -= hp.lr * m_hat / (v_hat.sqrt() + hp.epsilon);
        });
}

/// Loss of one forward pass; keeps the batch so `backward` can replay it.
#[derive(Debug, Clone)]
pub struct BaselineLoss {
    value: f64,
    batch: EncodedBatch,
}

impl LossValue for BaselineLoss {
    fn value(&self) -> f64 {
        self.value
    }
}

pub struct BaselineSeq2Seq {
    config: BaselineConfig,
    vocab: VocabSpec,
    params: Params,
    grads: Params,
    adam: AdamState,
}

impl BaselineSeq2Seq {
    pub fn new(config: BaselineConfig, vocab: VocabSpec) -> anyhow::Result<Self> {
        ensure!(config.hidden_size > 0, "hidden_size must be positive");
        ensure!(vocab.size > 0, "vocabulary is empty");
        ensure!(
            (0.0..1.0).contains(&config.label_smoothing),
            "label_smoothing must be in [0, 1), got {}",
            config.label_smoothing
        );

        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = Params::random(
            vocab.size,
            config.hidden_size,
            config.init_scale as f32,
            &mut rng,
        );
        let grads = Params::zeros(vocab.size, config.hidden_size);
        let adam = Self::fresh_adam(&vocab, &config);

        Ok(Self {
            config,
            vocab,
            params,
            grads,
            adam,
        })
    }

    fn fresh_adam(vocab: &VocabSpec, config: &BaselineConfig) -> AdamState {
        AdamState {
            first: Params::zeros(vocab.size, config.hidden_size),
            second: Params::zeros(vocab.size, config.hidden_size),
            step: 0,
        }
    }

    fn check_ids(&self, batch: &EncodedBatch) -> anyhow::Result<()> {
        let size = self.vocab.size as i64;
        let inputs_ok = batch.input_ids.iter().flatten().all(|&id| (id as i64) < size);
        let labels_ok = batch
            .labels
            .iter()
            .flatten()
            .all(|&label| label == IGNORE_INDEX || (0..size).contains(&label));
        ensure!(inputs_ok && labels_ok, "token id outside vocabulary of {}", size);
        Ok(())
    }

    fn context(&self, input: &[u32]) -> Array1<f32> {
        let mut context = Array1::zeros(self.config.hidden_size);
        if input.is_empty() {
            return context;
        }
        for &token in input {
            context += &self.params.encoder.row(token as usize);
        }
        context /= input.len() as f32;
        context
    }

    fn hidden(&self, context: &Array1<f32>, prev: u32) -> Array1<f32> {
        (context + &self.params.decoder.row(prev as usize)).mapv(f32::tanh)
    }

    fn logits(&self, hidden: &Array1<f32>) -> Array1<f32> {
        hidden.dot(&self.params.projection) + &self.params.bias
    }

    /// `(input tokens, [(previous token, target token)])` for every row.
    fn rows<'a>(&self, batch: &'a EncodedBatch) -> Vec<(&'a [u32], Vec<(u32, usize)>)> {
        batch
            .input_ids
            .iter()
            .zip(&batch.input_lengths)
            .zip(&batch.labels)
            .map(|((ids, &len), labels)| {
                let mut prev = self.vocab.bos_id;
                let steps = labels
                    .iter()
                    .take_while(|&&label| label != IGNORE_INDEX)
                    .map(|&label| {
                        let step = (prev, label as usize);
                        prev = label as u32;
                        step
                    })
                    .collect();
                (&ids[..len.min(ids.len())], steps)
            })
            .collect()
    }

    fn position_loss(&self, log_probs: &[f32], target: usize) -> f64 {
        let eps = self.config.label_smoothing;
        let nll = -f64::from(log_probs[target]);
        if eps == 0.0 {
            return nll;
        }
        let smooth = -log_probs.iter().map(|&lp| f64::from(lp)).sum::<f64>() / log_probs.len() as f64;
        (1.0 - eps) * nll + eps * smooth
    }
}

impl Seq2SeqRuntime for BaselineSeq2Seq {
    type Loss = BaselineLoss;

    fn forward(&mut self, batch: &EncodedBatch) -> anyhow::Result<BaselineLoss> {
        self.check_ids(batch)?;
        let mut total = 0.0;
        let mut positions = 0usize;

        for (input, steps) in self.rows(batch) {
            let context = self.context(input);
            for (prev, target) in steps {
                let logits = self.logits(&self.hidden(&context, prev));
                let log_probs = decoding::log_softmax(&logits.to_vec());
                total += self.position_loss(&log_probs, target);
                positions += 1;
            }
        }

        let value = if positions == 0 {
            0.0
        } else {
            total / positions as f64
        };
        Ok(BaselineLoss {
            value,
            batch: batch.clone(),
        })
    }

    fn backward(&mut self, loss: BaselineLoss) -> anyhow::Result<()> {
        let batch = loss.batch;
        let positions = batch.target_tokens();
        if positions == 0 {
            return Ok(());
        }
        let scale = 1.0 / positions as f32;
        let eps = self.config.label_smoothing as f32;
        let uniform = eps / self.vocab.size as f32;

        for (input, steps) in self.rows(&batch) {
            let context = self.context(input);
            let mut d_context = Array1::<f32>::zeros(self.config.hidden_size);

            for (prev, target) in steps {
                let hidden = self.hidden(&context, prev);
                let logits = self.logits(&hidden);
                let mut d_logits = Array1::from(decoding::softmax(&logits.to_vec()));
                d_logits -= uniform;
                d_logits[target] -= 1.0 - eps;
                d_logits *= scale;

                let outer = hidden
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&d_logits.view().insert_axis(Axis(0)));
                let d_hidden = self.params.projection.dot(&d_logits);
                let d_pre = d_hidden * hidden.mapv(|h| 1.0 - h * h);

                self.grads.projection += &outer;
                self.grads.bias += &d_logits;
                let mut row = self.grads.decoder.row_mut(prev as usize);
                row += &d_pre;
                d_context += &d_pre;
            }

            if !input.is_empty() {
                d_context /= input.len() as f32;
                for &token in input {
                    let mut row = self.grads.encoder.row_mut(token as usize);
                    row += &d_context;
                }
            }
        }
        Ok(())
    }

    fn optimizer_step(&mut self) -> anyhow::Result<()> {
        self.adam.step += 1;
        let step = i32::try_from(self.adam.step).unwrap_or(i32::MAX);
        let beta1 = self.config.beta1 as f32;
        let beta2 = self.config.beta2 as f32;
        let hp = AdamHyper {
            lr: self.config.learning_rate as f32,
            beta1,
            beta2,
            epsilon: self.config.epsilon as f32,
            correction1: 1.0 - beta1.powi(step),
            correction2: 1.0 - beta2.powi(step),
        };

        let Params {
            encoder,
            decoder,
            projection,
            bias,
        } = &mut self.params;
        let (first, second) = (&mut self.adam.first, &mut self.adam.second);
        adam_update(encoder, &self.grads.encoder, &mut first.encoder, &mut second.encoder, &hp);
        adam_update(decoder, &self.grads.decoder, &mut first.decoder, &mut second.decoder, &hp);
        adam_update(
            projection,
            &self.grads.projection,
            &mut first.projection,
            &mut second.projection,
            &hp,
        );
        adam_update(bias, &self.grads.bias, &mut first.bias, &mut second.bias, &hp);

        self.grads = Params::zeros(self.vocab.size, self.config.hidden_size);
        Ok(())
    }

    fn generate(&mut self, input_ids: &[u32], config: &DecodingConfig) -> anyhow::Result<Vec<Vec<u32>>> {
        if input_ids.iter().any(|&id| id as usize >= self.vocab.size) {
            bail!("input token outside vocabulary of {}", self.vocab.size);
        }
        let this = &*self;
        let context = this.context(input_ids);
        decoding::search(config, &this.vocab, (), |_, prev| {
            let logits = this.logits(&this.hidden(&context, prev));
            Ok(((), logits.to_vec()))
        })
    }

    fn model_state(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(&self.params)?)
    }

    fn optimizer_state(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(&self.adam)?)
    }

    fn restore(&mut self, model: &[u8], optimizer: &[u8]) -> anyhow::Result<()> {
        let params: Params = bincode::deserialize(model)?;
        ensure!(
            params.same_shape(&self.grads),
            "model state does not match vocabulary {} / hidden size {}",
            self.vocab.size,
            self.config.hidden_size
        );
        let adam = if optimizer.is_empty() {
            Self::fresh_adam(&self.vocab, &self.config)
        } else {
            let adam: AdamState = bincode::deserialize(optimizer)?;
            ensure!(
                adam.first.same_shape(&params) && adam.second.same_shape(&params),
                "optimizer state does not match model shape"
            );
            adam
        };

        self.params = params;
        self.adam = adam;
        self.grads = Params::zeros(self.vocab.size, self.config.hidden_size);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BaselineBuilder {
    pub config: BaselineConfig,
}

impl BaselineBuilder {
    pub fn new(config: BaselineConfig) -> Self {
        Self { config }
    }
}

impl RuntimeBuilder for BaselineBuilder {
    type Runtime = BaselineSeq2Seq;

    fn build(&self, vocab: &VocabSpec) -> anyhow::Result<BaselineSeq2Seq> {
        BaselineSeq2Seq::new(self.config.clone(), *vocab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TaskType;

    const VOCAB: VocabSpec = VocabSpec {
        size: 12,
        pad_id: 0,
        bos_id: 1,
        eos_id: 2,
        highlight_id: 3,
    };

    fn batch() -> EncodedBatch {
        EncodedBatch {
            task: TaskType::QuestionGeneration,
            input_ids: vec![vec![4, 5, 6], vec![7, 8, 0]],
            input_lengths: vec![3, 2],
            labels: vec![vec![9, 10, 2], vec![11, 2, IGNORE_INDEX]],
        }
    }

    fn model() -> BaselineSeq2Seq {
        let config = BaselineConfig {
            hidden_size: 8,
            learning_rate: 0.05,
            ..Default::default()
        };
        BaselineSeq2Seq::new(config, VOCAB).unwrap()
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = model();
        let initial = model.forward(&batch()).unwrap().value();
        for _ in 0..200 {
            let loss = model.forward(&batch()).unwrap();
            model.backward(loss).unwrap();
            model.optimizer_step().unwrap();
        }
        let trained = model.forward(&batch()).unwrap().value();
        assert!(trained < initial * 0.5, "{trained} vs {initial}");

        let out = model.generate(&[4, 5, 6], &DecodingConfig::greedy(5)).unwrap();
        assert_eq!(out, vec![vec![9, 10]]);
    }

    #[test]
    fn test_label_smoothing_raises_floor() {
        let mut smoothed = BaselineSeq2Seq::new(
            BaselineConfig {
                hidden_size: 8,
                label_smoothing: 0.1,
                ..Default::default()
            },
            VOCAB,
        )
        .unwrap();
        let mut plain = model();
        plain.restore(&smoothed.model_state().unwrap(), &[]).unwrap();
        let a = smoothed.forward(&batch()).unwrap().value();
        let b = plain.forward(&batch()).unwrap().value();
        assert!(a.is_finite() && b.is_finite());
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_round_trip() {
        let mut source = model();
        let loss = source.forward(&batch()).unwrap();
        source.backward(loss).unwrap();
        source.optimizer_step().unwrap();

        let mut target = BaselineSeq2Seq::new(
            BaselineConfig {
                hidden_size: 8,
                seed: 7,
                ..Default::default()
            },
            VOCAB,
        )
        .unwrap();
        target
            .restore(&source.model_state().unwrap(), &source.optimizer_state().unwrap())
            .unwrap();

        assert_eq!(target.model_state().unwrap(), source.model_state().unwrap());
        assert_eq!(target.optimizer_state().unwrap(), source.optimizer_state().unwrap());
    }

    #[test]
    fn test_rejects_mismatched_state() {
        let source = model();
        let mut other = BaselineSeq2Seq::new(
            BaselineConfig {
                hidden_size: 4,
                ..Default::default()
            },
            VOCAB,
        )
        .unwrap();
        assert!(other.restore(&source.model_state().unwrap(), &[]).is_err());
    }

    #[test]
    fn test_out_of_vocab_input_fails() {
        let mut model = model();
        assert!(model.generate(&[99], &DecodingConfig::greedy(3)).is_err());
    }
}
