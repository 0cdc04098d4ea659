use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{QgError, Result};
use crate::runtime::VocabSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingConfig {
    pub beam_width: usize,
    pub max_output_length: usize,
    pub num_return_sequences: usize,
    #[serde(alias = "sampling")]
    pub do_sample: bool,
    pub temperature: f64,
    /// Seed for sampling; unseeded sampling draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            max_output_length: 32,
            num_return_sequences: 1,
            do_sample: false,
            temperature: 1.0,
            seed: None,
        }
    }
}

impl DecodingConfig {
    pub fn greedy(max_output_length: usize) -> Self {
        Self {
            beam_width: 1,
            max_output_length,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_width < 1 {
            return Err(QgError::invalid_decoding("beam_width must be at least 1"));
        }
        if self.max_output_length == 0 {
            return Err(QgError::invalid_decoding("max_output_length must be positive"));
        }
        if self.num_return_sequences < 1 {
            return Err(QgError::invalid_decoding("num_return_sequences must be at least 1"));
        }
        if !self.do_sample && self.num_return_sequences > self.beam_width {
            return Err(QgError::invalid_decoding(format!(
                "num_return_sequences ({}) exceeds beam_width ({})",
                self.num_return_sequences, self.beam_width
            )));
        }
        if self.do_sample && !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(QgError::invalid_decoding(format!(
                "temperature must be positive when sampling, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Hypothesis<S> {
    tokens: Vec<u32>,
    log_prob: f64,
    state: S,
    finished: bool,
}

impl<S> Hypothesis<S> {
    fn normalized_score(&self) -> f64 {
        self.log_prob / self.tokens.len().max(1) as f64
    }

    fn into_output(mut self, eos_id: u32) -> Vec<u32> {
        if self.tokens.last() == Some(&eos_id) {
            self.tokens.pop();
        }
        self.tokens
    }
}

/// Runs the search selected by `config` over a step function.
pub fn search<S, F>(
    config: &DecodingConfig,
    vocab: &VocabSpec,
    init: S,
    step: F,
) -> anyhow::Result<Vec<Vec<u32>>>
where
    S: Clone,
    F: FnMut(&S, u32) -> anyhow::Result<(S, Vec<f32>)>,
{
    if config.do_sample {
        sample(config, vocab, init, step)
    } else {
        beam_search(config, vocab, init, step)
    }
}

/// Beam search; a width of one is greedy decoding.
fn beam_search<S, F>(
    config: &DecodingConfig,
    vocab: &VocabSpec,
    init: S,
    mut step: F,
) -> anyhow::Result<Vec<Vec<u32>>>
where
    S: Clone,
    F: FnMut(&S, u32) -> anyhow::Result<(S, Vec<f32>)>,
{
    let width = config.beam_width;
    let mut beams = vec![Hypothesis {
        tokens: Vec::new(),
        log_prob: 0.0,
        state: init,
        finished: false,
    }];

    for _ in 0..config.max_output_length {
        if beams.iter().all(|hyp| hyp.finished) {
            break;
        }
        let mut candidates = Vec::with_capacity(width * width);
        for hyp in &beams {
            if hyp.finished {
                candidates.push(hyp.clone());
                continue;
            }
            let prev = hyp.tokens.last().copied().unwrap_or(vocab.bos_id);
            let (state, mut logits) = step(&hyp.state, prev)?;
            mask_control_tokens(&mut logits, vocab);
            let log_probs = log_softmax(&logits);
            for token in top_k(&log_probs, width) {
                let log_prob = log_probs[token];
                if !log_prob.is_finite() {
                    continue;
                }
                let mut tokens = hyp.tokens.clone();
                tokens.push(token as u32);
                candidates.push(Hypothesis {
                    tokens,
                    log_prob: hyp.log_prob + f64::from(log_prob),
                    state: state.clone(),
                    finished: token as u32 == vocab.eos_id,
                });
            }
        }
        if candidates.is_empty() {
            break;
        }
        candidates.sort_by(|a, b| b.log_prob.total_cmp(&a.log_prob));
        candidates.truncate(width);
        beams = candidates;
    }

    beams.sort_by(|a, b| b.normalized_score().total_cmp(&a.normalized_score()));
    Ok(beams
        .into_iter()
        .take(config.num_return_sequences)
        .map(|hyp| hyp.into_output(vocab.eos_id))
        .collect())
}

fn sample<S, F>(
    config: &DecodingConfig,
    vocab: &VocabSpec,
    init: S,
    mut step: F,
) -> anyhow::Result<Vec<Vec<u32>>>
where
    S: Clone,
    F: FnMut(&S, u32) -> anyhow::Result<(S, Vec<f32>)>,
{
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let inv_temp = (1.0 / config.temperature) as f32;

    let mut outputs = Vec::with_capacity(config.num_return_sequences);
    for _ in 0..config.num_return_sequences {
        let mut state = init.clone();
        let mut prev = vocab.bos_id;
        let mut tokens = Vec::new();
        for _ in 0..config.max_output_length {
            let (next, mut logits) = step(&state, prev)?;
            mask_control_tokens(&mut logits, vocab);
            for logit in logits.iter_mut() {
                *logit *= inv_temp;
            }
            let probs = softmax(&logits);
            let dist = WeightedIndex::new(&probs)?;
            let token = dist.sample(&mut rng) as u32;
            state = next;
            if token == vocab.eos_id {
                break;
            }
            tokens.push(token);
            prev = token;
        }
        outputs.push(tokens);
    }
    Ok(outputs)
}

fn mask_control_tokens(logits: &mut [f32], vocab: &VocabSpec) {
    for id in [vocab.pad_id, vocab.bos_id] {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    let log_sum = sum.ln() + max;
    logits.iter().map(|&l| l - log_sum).collect()
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Indices of the `k` largest values, ties broken by lower index.
fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    indices.truncate(k);
    indices
}
