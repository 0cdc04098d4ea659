use std::path::PathBuf;

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointExtras, CheckpointId, CheckpointManager, REPORT_FILE};
use crate::config::TrainingConfig;
use crate::dataset::{BatchEncoder, Example};
use crate::error::{QgError, Result};
use crate::evaluation::EvaluationPipeline;
use crate::formatter::{DataFormatter, TaskType};
use crate::runtime::{LossValue, RuntimeBuilder, Seq2SeqRuntime};
use crate::scheduler::TaskScheduler;
use crate::tokenizer::QgTokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Initializing,
    Running { epoch: usize },
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub average_loss: f64,
    /// Batches that reached the runtime.
    pub batches: usize,
    pub optimizer_steps: usize,
    pub checkpoint: CheckpointId,
    pub metric_report: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochSummary>,
    pub global_step: u64,
}

impl TrainingSummary {
    pub fn final_checkpoint(&self) -> Option<&CheckpointId> {
        self.epochs.last().map(|epoch| &epoch.checkpoint)
    }
}

/// Scheduler seed of one epoch: every epoch reshuffles, and a resumed run
/// sees the same order as an uninterrupted one.
pub fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_add(epoch as u64)
}

/// Formats every example for every task it qualifies for and returns all input
/// and target texts, the corpus the tokenizer is trained on.
pub fn tokenizer_corpus(examples: &[Example]) -> Vec<String> {
    let mut texts = Vec::new();
    for example in examples {
        for task in TaskType::ALL {
            if !task.is_eligible(example) {
                continue;
            }
            if let Ok((input, target)) = DataFormatter.format(example, task) {
                texts.push(input);
                texts.push(target);
            }
        }
    }
    texts
}

pub struct TrainingLoop<B: RuntimeBuilder> {
    config: TrainingConfig,
    runtime: B::Runtime,
    encoder: BatchEncoder,
    scheduler: TaskScheduler,
    checkpoints: CheckpointManager,
    evaluation: Option<(EvaluationPipeline<B>, Vec<Example>)>,
    state: TrainingState,
    seed: u64,
    next_epoch: usize,
    global_step: u64,
}

impl<B: RuntimeBuilder> TrainingLoop<B> {
    /// Starts a fresh run, training the tokenizer on the formatted examples.
    pub fn new(config: TrainingConfig, builder: &B, examples: &[Example]) -> Result<Self> {
        let corpus = tokenizer_corpus(examples);
        if corpus.is_empty() {
            return Err(QgError::config("no training example is usable by any task"));
        }
        let tokenizer = QgTokenizer::train(&corpus, config.vocab_size)?;
        info!(
            "trained tokenizer on {} texts, vocabulary size {}",
            corpus.len(),
            tokenizer.get_vocab_size()
        );
        Self::with_tokenizer(config, builder, tokenizer)
    }

    /// Starts a fresh run with an existing tokenizer.
    pub fn with_tokenizer(config: TrainingConfig, builder: &B, tokenizer: QgTokenizer) -> Result<Self> {
        config.validate()?;
        let runtime = builder.build(&tokenizer.vocab())?;
        let checkpoints = CheckpointManager::new(&config.checkpoint_dir)?;
        let seed = config.seed;
        Ok(Self::assemble(config, runtime, tokenizer, checkpoints, seed, 1, 0))
    }

    /// Continues a run from the checkpoint of a completed epoch. Weights,
    /// optimizer state, tokenizer, seed and step count come from the
    /// checkpoint; training resumes with the following epoch.
    pub fn resume(config: TrainingConfig, builder: &B, checkpoint: &CheckpointId) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointManager::new(&config.checkpoint_dir)?;
        let loaded = checkpoints.load(checkpoint)?;

        let tokenizer = QgTokenizer::from_json(&loaded.extras.tokenizer_json)
            .map_err(|e| QgError::corrupt(checkpoint.path(), e.to_string()))?;
        let mut runtime = builder.build(&tokenizer.vocab())?;
        runtime
            .restore(&loaded.model_state, &loaded.optimizer_state)
            .map_err(|e| QgError::corrupt(checkpoint.path(), format!("{e:#}")))?;

        if loaded.extras.seed != config.seed {
            warn!(
                "configured seed {} differs from the checkpoint's {}; keeping the checkpoint's",
                config.seed, loaded.extras.seed
            );
        }
        info!(
            "resuming from epoch {} (step {}) at {}",
            loaded.epoch,
            loaded.extras.global_step,
            checkpoint.path().display()
        );
        Ok(Self::assemble(
            config,
            runtime,
            tokenizer,
            checkpoints,
            loaded.extras.seed,
            loaded.epoch + 1,
            loaded.extras.global_step,
        ))
    }

    /// Resumes from the newest checkpoint recorded under `checkpoint_dir`.
    pub fn resume_latest(config: TrainingConfig, builder: &B) -> Result<Self> {
        let latest = CheckpointManager::new(&config.checkpoint_dir)?.latest()?;
        match latest {
            Some((_, id)) => Self::resume(config, builder, &id),
            None => Err(QgError::CheckpointNotFound(config.checkpoint_dir.clone())),
        }
    }

    fn assemble(
        config: TrainingConfig,
        runtime: B::Runtime,
        tokenizer: QgTokenizer,
        checkpoints: CheckpointManager,
        seed: u64,
        next_epoch: usize,
        global_step: u64,
    ) -> Self {
        let encoder = BatchEncoder::new(tokenizer, config.max_input_length, config.max_output_length)
            .with_overflow(config.overflow);
        let scheduler = TaskScheduler::new(config.batch_size).with_batches_per_epoch(config.batches_per_epoch);
        Self {
            config,
            runtime,
            encoder,
            scheduler,
            checkpoints,
            evaluation: None,
            state: TrainingState::Initializing,
            seed,
            next_epoch,
            global_step,
        }
    }

    /// Evaluates checkpoints on `examples` every `eval_every` epochs and after
    /// the final epoch.
    pub fn with_evaluation(mut self, pipeline: EvaluationPipeline<B>, examples: Vec<Example>) -> Self {
        self.evaluation = Some((pipeline, examples));
        self
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn runtime(&self) -> &B::Runtime {
        &self.runtime
    }

    pub fn tokenizer(&self) -> &QgTokenizer {
        self.encoder.tokenizer()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn next_epoch(&self) -> usize {
        self.next_epoch
    }

    /// Runs the remaining epochs up to `config.epochs`. Any error moves the
    /// loop to [`TrainingState::Failed`] and is returned as is.
    pub fn run(&mut self, examples: &[Example]) -> Result<TrainingSummary> {
        let mut epochs = Vec::new();
        for epoch in self.next_epoch..=self.config.epochs {
            self.state = TrainingState::Running { epoch };
            match self.run_epoch(epoch, examples) {
                Ok(summary) => epochs.push(summary),
                Err(e) => {
                    self.state = TrainingState::Failed;
                    error!("training failed in epoch {}: {}", epoch, e);
                    return Err(e);
                }
            }
            self.next_epoch = epoch + 1;
        }
        self.state = TrainingState::Completed;
        info!("training completed after {} steps", self.global_step);
        Ok(TrainingSummary {
            epochs,
            global_step: self.global_step,
        })
    }

    fn run_epoch(&mut self, epoch: usize, examples: &[Example]) -> Result<EpochSummary> {
        let batches =
            self.scheduler
                .build_epoch(examples, &self.config.mixture, epoch_seed(self.seed, epoch))?;
        let accumulation = self.config.gradient_accumulation_steps;

        let mut total_loss = 0.0;
        let mut trained = 0;
        let mut pending = 0;
        let mut optimizer_steps = 0;
        for (i, batch) in batches.iter().enumerate() {
            let encoded = self.encoder.encode(batch)?;
            if encoded.is_empty() {
                debug!("epoch {} batch {}: every pair dropped as over-long", epoch, i + 1);
                continue;
            }
            let loss = self.runtime.forward(&encoded)?;
            let value = loss.value();
            if value.is_nan() {
                return Err(anyhow!("NaN loss encountered in epoch {epoch}, batch {i}").into());
            }
            self.runtime.backward(loss)?;
            pending += 1;
            trained += 1;

            if pending == accumulation {
                self.runtime.optimizer_step()?;
                pending = 0;
                optimizer_steps += 1;
                self.global_step += 1;
            }
            total_loss += value;
            debug!(
                "epoch {} batch {}/{} ({}, {} pairs): loss = {:.6}",
                epoch,
                i + 1,
                batches.len(),
                batch.task,
                encoded.len(),
                value
            );
        }
        if pending > 0 {
            self.runtime.optimizer_step()?;
            optimizer_steps += 1;
            self.global_step += 1;
        }
        if trained == 0 {
            warn!("epoch {} trained on no batch; every pair exceeded the length limits", epoch);
        }

        let average_loss = if trained == 0 {
            0.0
        } else {
            total_loss / trained as f64
        };
        info!(
            "Epoch {}: Average loss = {:.6} ({} batches, {} optimizer steps)",
            epoch, average_loss, trained, optimizer_steps
        );

        let extras = CheckpointExtras {
            tokenizer_json: self.encoder.tokenizer().to_json()?,
            seed: self.seed,
            global_step: self.global_step,
        };
        let checkpoint = self.checkpoints.save(
            epoch,
            &self.runtime.model_state()?,
            &self.runtime.optimizer_state()?,
            &extras,
        )?;

        let metric_report = if self.is_evaluation_epoch(epoch) {
            self.evaluate(epoch, &checkpoint)?
        } else {
            None
        };

        Ok(EpochSummary {
            epoch,
            average_loss,
            batches: trained,
            optimizer_steps,
            checkpoint,
            metric_report,
        })
    }

    fn is_evaluation_epoch(&self, epoch: usize) -> bool {
        epoch == self.config.epochs || self.config.eval_every.is_some_and(|every| epoch % every == 0)
    }

    fn evaluate(&self, epoch: usize, checkpoint: &CheckpointId) -> Result<Option<PathBuf>> {
        let Some((pipeline, examples)) = &self.evaluation else {
            return Ok(None);
        };
        let report = pipeline.evaluate(checkpoint, examples)?;
        let path = checkpoint.path().join(REPORT_FILE);
        report.write_to(&path)?;
        self.checkpoints.attach_report(epoch, &path)?;
        Ok(Some(path))
    }
}
