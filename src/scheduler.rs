//! Seeded epoch planning across the three tasks.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Example;
use crate::error::{QgError, Result};
use crate::formatter::{DataFormatter, TaskType};

/// Relative weight of each task within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixturePolicy {
    pub question_generation: f64,
    pub question_answering: f64,
    pub answer_extraction: f64,
}

impl Default for MixturePolicy {
    fn default() -> Self {
        Self::uniform()
    }
}

impl MixturePolicy {
    pub fn uniform() -> Self {
        Self {
            question_generation: 1.0,
            question_answering: 1.0,
            answer_extraction: 1.0,
        }
    }

    /// Single-task policy.
    pub fn only(task: TaskType) -> Self {
        let mut policy = Self {
            question_generation: 0.0,
            question_answering: 0.0,
            answer_extraction: 0.0,
        };
        policy.set_weight(task, 1.0);
        policy
    }

    pub fn weight(&self, task: TaskType) -> f64 {
        match task {
            TaskType::QuestionGeneration => self.question_generation,
            TaskType::QuestionAnswering => self.question_answering,
            TaskType::AnswerExtraction => self.answer_extraction,
        }
    }

    pub fn set_weight(&mut self, task: TaskType, weight: f64) {
        match task {
            TaskType::QuestionGeneration => self.question_generation = weight,
            TaskType::QuestionAnswering => self.question_answering = weight,
            TaskType::AnswerExtraction => self.answer_extraction = weight,
        }
    }

    /// Tasks with a nonzero weight, in declaration order.
    pub fn active_tasks(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|task| self.weight(*task) > 0.0)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for task in TaskType::ALL {
            let weight = self.weight(task);
            if !weight.is_finite() || weight < 0.0 {
                return Err(QgError::config(format!(
                    "mixture weight for {task} must be a finite non-negative number, got {weight}"
                )));
            }
        }
        if self.active_tasks().is_empty() {
            return Err(QgError::config("mixture policy has no task with a nonzero weight"));
        }
        Ok(())
    }
}

/// Text pairs of a single task, consumed by one training step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBatch {
    pub task: TaskType,
    pub pairs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct TaskScheduler {
    formatter: DataFormatter,
    batch_size: usize,
    batches_per_epoch: Option<usize>,
}

impl TaskScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            formatter: DataFormatter,
            batch_size,
            batches_per_epoch: None,
        }
    }

    /// Fixes the epoch length instead of deriving it from the pool sizes.
    pub fn with_batches_per_epoch(mut self, batches: Option<usize>) -> Self {
        self.batches_per_epoch = batches;
        self
    }

    pub fn build_epoch(
        &self,
        examples: &[Example],
        policy: &MixturePolicy,
        seed: u64,
    ) -> Result<Vec<TaskBatch>> {
        if self.batch_size == 0 {
            return Err(QgError::config("batch_size must be at least 1"));
        }
        policy.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let tasks = policy.active_tasks();

        let mut pools = Vec::with_capacity(tasks.len());
        for &task in &tasks {
            let eligible: Vec<&Example> = examples.iter().filter(|e| task.is_eligible(e)).collect();
            if eligible.is_empty() {
                return Err(QgError::EmptyTaskPool(task));
            }
            let mut pool = eligible
                .par_iter()
                .map(|example| self.formatter.format(example, task))
                .collect::<Result<Vec<_>>>()?;
            pool.shuffle(&mut rng);
            pools.push(pool);
        }

        let total_pairs: usize = pools.iter().map(Vec::len).sum();
        let total_batches = self
            .batches_per_epoch
            .unwrap_or_else(|| total_pairs.div_ceil(self.batch_size))
            .max(1);
        let weights: Vec<f64> = tasks.iter().map(|task| policy.weight(*task)).collect();
        let counts = apportion(total_batches, &weights);

        let mut batches = Vec::with_capacity(total_batches);
        for ((task, pool), count) in tasks.iter().zip(&pools).zip(&counts) {
            let width = self.batch_size.min(pool.len());
            let mut cursor = 0;
            for _ in 0..*count {
                let pairs = (0..width)
                    .map(|offset| pool[(cursor + offset) % pool.len()].clone())
                    .collect();
                cursor = (cursor + width) % pool.len();
                batches.push(TaskBatch { task: *task, pairs });
            }
            debug!("{}: {} pairs, {} batches", task, pool.len(), count);
        }
        batches.shuffle(&mut rng);

        Ok(batches)
    }
}

/// Splits `total` into integer shares proportional to `weights` using the
/// largest-remainder method; ties go to the earlier entry.
fn apportion(total: usize, weights: &[f64]) -> Vec<usize> {
    // Scaled to the largest weight so the sum stays finite.
    let max = weights.iter().copied().fold(0.0, f64::max);
    let scaled: Vec<f64> = weights.iter().map(|w| w / max).collect();
    let sum: f64 = scaled.iter().sum();
    let quotas: Vec<f64> = scaled.iter().map(|w| total as f64 * w / sum).collect();
    let mut counts: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();

    let assigned: usize = counts.iter().sum();
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = quotas[a] - quotas[a].floor();
        let rb = quotas[b] - quotas[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    for &index in order.iter().take(total.saturating_sub(assigned)) {
        counts[index] += 1;
    }
    counts
}
