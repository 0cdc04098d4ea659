use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::{write_atomic, CheckpointId};
use crate::dataset::Example;
use crate::decoding::DecodingConfig;
use crate::engine::{GenerationEngine, ModelSource};
use crate::error::{QgError, Result};
use crate::formatter::{DataFormatter, TaskType};
use crate::runtime::RuntimeBuilder;

/// Scores `(reference, generated)` pairs. BLEU/ROUGE style scorers plug in
/// here.
pub trait MetricScorer: Send + Sync {
    fn score(&self, pairs: &[(String, String)]) -> BTreeMap<String, f64>;
}

/// Exact match and bag-of-tokens F1 after lowercasing and dropping
/// punctuation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlapScorer;

impl OverlapScorer {
    fn normalize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    fn token_f1(reference: &[String], generated: &[String]) -> f64 {
        if reference.is_empty() || generated.is_empty() {
            return if reference == generated { 1.0 } else { 0.0 };
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in reference {
            *counts.entry(token.as_str()).or_default() += 1;
        }
        let mut common = 0usize;
        for token in generated {
            if let Some(count) = counts.get_mut(token.as_str()) {
                if *count > 0 {
                    *count -= 1;
                    common += 1;
                }
            }
        }
        if common == 0 {
            return 0.0;
        }
        let precision = common as f64 / generated.len() as f64;
        let recall = common as f64 / reference.len() as f64;
        2.0 * precision * recall / (precision + recall)
    }
}

impl MetricScorer for OverlapScorer {
    fn score(&self, pairs: &[(String, String)]) -> BTreeMap<String, f64> {
        let mut exact = 0.0;
        let mut f1 = 0.0;
        for (reference, generated) in pairs {
            let reference = Self::normalize(reference);
            let generated = Self::normalize(generated);
            if reference == generated {
                exact += 1.0;
            }
            f1 += Self::token_f1(&reference, &generated);
        }
        let n = pairs.len().max(1) as f64;
        BTreeMap::from([
            ("exact_match".to_string(), exact / n),
            ("token_f1".to_string(), f1 / n),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSample {
    pub context: String,
    pub answer: String,
    pub reference: String,
    pub generated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub checkpoint: PathBuf,
    pub epoch: usize,
    pub created_at: DateTime<Utc>,
    pub scores: BTreeMap<String, f64>,
    pub samples: Vec<EvaluationSample>,
}

impl MetricReport {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

pub struct EvaluationPipeline<B: RuntimeBuilder> {
    engine: GenerationEngine<B>,
    decoding: DecodingConfig,
    scorer: Box<dyn MetricScorer>,
}

impl<B: RuntimeBuilder> EvaluationPipeline<B> {
    pub fn new(engine: GenerationEngine<B>, decoding: DecodingConfig) -> Self {
        Self {
            engine,
            decoding,
            scorer: Box::new(OverlapScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn MetricScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Generates a question for every example from the weights stored in
    /// `checkpoint` and scores it against the reference question. The model
    /// being trained is never touched.
    pub fn evaluate(&self, checkpoint: &CheckpointId, examples: &[Example]) -> Result<MetricReport> {
        if examples.is_empty() {
            return Err(QgError::EvaluationData("no evaluation examples".to_string()));
        }
        self.decoding.validate()?;

        let mut references = Vec::with_capacity(examples.len());
        for (i, example) in examples.iter().enumerate() {
            let (_, reference) = DataFormatter
                .format(example, TaskType::QuestionGeneration)
                .map_err(|e| QgError::EvaluationData(format!("example {i}: {e}")))?;
            references.push(reference);
        }

        let source = ModelSource::from(checkpoint);
        let handle = self.engine.load(&source)?;

        let mut samples = Vec::with_capacity(examples.len());
        let mut pairs = Vec::with_capacity(examples.len());
        for (example, reference) in examples.iter().zip(references) {
            let answer = example.answer_span.as_deref().unwrap_or_default();
            let candidates = handle.generate(&example.context, Some(answer), &self.decoding);
            let generated = match candidates {
                Ok(candidates) => candidates.into_iter().next().unwrap_or_default(),
                Err(e) => {
                    self.engine.unload(&source);
                    return Err(e);
                }
            };
            pairs.push((reference.clone(), generated.clone()));
            samples.push(EvaluationSample {
                context: example.context.clone(),
                answer: answer.to_string(),
                reference,
                generated,
            });
        }
        self.engine.unload(&source);

        let scores = self.scorer.score(&pairs);
        info!(
            "evaluated epoch {} on {} examples: {:?}",
            handle.epoch(),
            samples.len(),
            scores
        );

        Ok(MetricReport {
            checkpoint: checkpoint.path().to_path_buf(),
            epoch: handle.epoch(),
            created_at: Utc::now(),
            scores,
            samples,
        })
    }
}
