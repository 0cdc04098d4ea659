use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::{read_checkpoint, CheckpointId};
use crate::dataset::Example;
use crate::decoding::DecodingConfig;
use crate::error::{ErrorKind, QgError, Result};
use crate::formatter::{sentence_spans, DataFormatter, TaskType};
use crate::runtime::{RuntimeBuilder, Seq2SeqRuntime};
use crate::tokenizer::QgTokenizer;

/// Identity of a model: a repository alias or a checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSource {
    Alias(String),
    Path(PathBuf),
}

impl ModelSource {
    /// Existing filesystem paths win over aliases.
    pub fn parse(value: &str) -> Self {
        if Path::new(value).exists() {
            ModelSource::Path(PathBuf::from(value))
        } else {
            ModelSource::Alias(value.to_string())
        }
    }
}

impl From<&CheckpointId> for ModelSource {
    fn from(id: &CheckpointId) -> Self {
        ModelSource::Path(id.path().to_path_buf())
    }
}

/// Resolves model aliases to local checkpoint directories.
pub trait ModelRepository: Send + Sync {
    fn resolve(&self, alias: &str) -> Result<PathBuf>;
}

/// Repository of downloaded models, `org/name` stored as `{root}/org--name`.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModelRepository for LocalRepository {
    fn resolve(&self, alias: &str) -> Result<PathBuf> {
        let path = self.root.join(alias.replace('/', "--"));
        if path.is_dir() {
            Ok(path)
        } else {
            Err(QgError::CheckpointNotFound(path))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_input_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_input_length: 512,
        }
    }
}

struct LoadedModel<R> {
    identity: String,
    epoch: usize,
    tokenizer: QgTokenizer,
    runtime: Mutex<R>,
    max_input_length: usize,
}

/// Shared reference to one loaded model. Every request holds the runtime
/// lock while it decodes; a failed request leaves the model usable.
pub struct ModelHandle<R> {
    inner: Arc<LoadedModel<R>>,
}

impl<R> Clone for ModelHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Seq2SeqRuntime> ModelHandle<R> {
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Epoch of the checkpoint the weights came from.
    pub fn epoch(&self) -> usize {
        self.inner.epoch
    }

    pub fn tokenizer(&self) -> &QgTokenizer {
        &self.inner.tokenizer
    }

    /// Generates candidate questions, best first.
    ///
    /// With an answer the answer is highlighted in the context and
    /// `num_return_sequences` candidates are returned. Without one, answers
    /// are first extracted sentence by sentence and one question is returned
    /// per extracted answer.
    pub fn generate(
        &self,
        context: &str,
        answer: Option<&str>,
        config: &DecodingConfig,
    ) -> Result<Vec<String>> {
        config.validate()?;
        let answer = answer.map(str::trim).filter(|a| !a.is_empty());

        let Some(answer) = answer else {
            let pairs = self.generate_qa(context, config)?;
            return Ok(pairs.into_iter().map(|(question, _)| question).collect());
        };

        let example = Example::new(context).with_answer(answer);
        let input = DataFormatter.format_input(&example, TaskType::QuestionGeneration)?;
        let ids = self.encode_input(&input)?;

        let outputs = {
            let mut runtime = self.inner.runtime.lock();
            runtime.generate(&ids, config)?
        };
        self.decode_all(&outputs)
    }

    /// Extracts answers from every sentence of `context` and generates one
    /// question per answer found verbatim in the context.
    pub fn generate_qa(&self, context: &str, config: &DecodingConfig) -> Result<Vec<(String, String)>> {
        config.validate()?;
        if context.trim().is_empty() {
            return Err(QgError::MissingField {
                task: TaskType::AnswerExtraction,
                field: "context",
            });
        }
        let single = DecodingConfig {
            num_return_sequences: 1,
            ..config.clone()
        };

        let extraction_inputs = sentence_spans(context)
            .into_iter()
            .map(|span| self.encode_input(&DataFormatter.answer_extraction_input(context, span)))
            .collect::<Result<Vec<_>>>()?;

        let mut runtime = self.inner.runtime.lock();

        let mut answers: Vec<String> = Vec::new();
        for ids in &extraction_inputs {
            let outputs = runtime.generate(ids, &single)?;
            let Some(best) = outputs.first() else { continue };
            let answer = self.inner.tokenizer.decode(best)?;
            if !answer.is_empty() && context.contains(answer.as_str()) {
                answers.push(answer);
            }
        }
        debug!(
            "extracted {} answers from {} sentences",
            answers.len(),
            extraction_inputs.len()
        );
        if answers.is_empty() {
            return Err(QgError::AnswerNotFound);
        }

        let mut pairs = Vec::with_capacity(answers.len());
        for answer in answers {
            let example = Example::new(context).with_answer(answer.as_str());
            let input = DataFormatter.format_input(&example, TaskType::QuestionGeneration)?;
            let ids = self.encode_input(&input)?;
            let outputs = runtime.generate(&ids, &single)?;
            let question = match outputs.first() {
                Some(best) => self.inner.tokenizer.decode(best)?,
                None => String::new(),
            };
            pairs.push((question, answer));
        }
        Ok(pairs)
    }

    fn encode_input(&self, text: &str) -> Result<Vec<u32>> {
        let ids = self.inner.tokenizer.encode(text)?;
        if ids.len() > self.inner.max_input_length {
            return Err(QgError::InputTooLong {
                length: ids.len(),
                max: self.inner.max_input_length,
            });
        }
        Ok(ids)
    }

    fn decode_all(&self, outputs: &[Vec<u32>]) -> Result<Vec<String>> {
        outputs
            .iter()
            .map(|ids| self.inner.tokenizer.decode(ids))
            .collect()
    }
}

/// Request accepted by the serving layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub context: String,
    #[serde(default, alias = "highlight")]
    pub answer: Option<String>,
    #[serde(default)]
    pub decoding: DecodingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationResponse {
    Ok { questions: Vec<String> },
    Error { kind: ErrorKind, message: String },
}

impl From<Result<Vec<String>>> for GenerationResponse {
    fn from(result: Result<Vec<String>>) -> Self {
        match result {
            Ok(questions) => GenerationResponse::Ok { questions },
            Err(err) => GenerationResponse::Error {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

pub struct GenerationEngine<B: RuntimeBuilder> {
    builder: B,
    repository: Arc<dyn ModelRepository>,
    config: EngineConfig,
    handles: Mutex<HashMap<PathBuf, ModelHandle<B::Runtime>>>,
    current: Mutex<Option<ModelHandle<B::Runtime>>>,
}

impl<B: RuntimeBuilder> GenerationEngine<B> {
    pub fn new(builder: B, repository: Arc<dyn ModelRepository>, config: EngineConfig) -> Self {
        Self {
            builder,
            repository,
            config,
            handles: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    /// Loads a model, or returns the cached handle when the same checkpoint
    /// directory was loaded before. The most recent load becomes the model
    /// used by [`GenerationEngine::serve`].
    pub fn load(&self, source: &ModelSource) -> Result<ModelHandle<B::Runtime>> {
        let dir = match source {
            ModelSource::Alias(alias) => self.repository.resolve(alias)?,
            ModelSource::Path(path) => path.clone(),
        };
        let key = fs::canonicalize(&dir).map_err(|_| QgError::CheckpointNotFound(dir.clone()))?;

        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&key) {
            debug!("reusing loaded model {}", handle.identity());
            *self.current.lock() = Some(handle.clone());
            return Ok(handle.clone());
        }

        let checkpoint = read_checkpoint(&key)?;
        let tokenizer = QgTokenizer::from_json(&checkpoint.extras.tokenizer_json)
            .map_err(|e| QgError::corrupt(&key, e.to_string()))?;
        let mut runtime = self.builder.build(&tokenizer.vocab())?;
        runtime
            .restore(&checkpoint.model_state, &[])
            .map_err(|e| QgError::corrupt(&key, format!("{e:#}")))?;

        let handle = ModelHandle {
            inner: Arc::new(LoadedModel {
                identity: key.display().to_string(),
                epoch: checkpoint.epoch,
                tokenizer,
                runtime: Mutex::new(runtime),
                max_input_length: self.config.max_input_length,
            }),
        };
        info!(
            "loaded model {} (epoch {})",
            handle.identity(),
            handle.epoch()
        );
        handles.insert(key, handle.clone());
        *self.current.lock() = Some(handle.clone());
        Ok(handle)
    }

    /// Handle of the most recently loaded model.
    pub fn current(&self) -> Result<ModelHandle<B::Runtime>> {
        self.current.lock().clone().ok_or(QgError::ModelNotLoaded)
    }

    /// Drops a cached model; requests already holding its handle finish
    /// normally.
    pub fn unload(&self, source: &ModelSource) -> bool {
        let dir = match source {
            ModelSource::Alias(alias) => match self.repository.resolve(alias) {
                Ok(dir) => dir,
                Err(_) => return false,
            },
            ModelSource::Path(path) => path.clone(),
        };
        let Ok(key) = fs::canonicalize(&dir) else {
            return false;
        };
        let removed = self.handles.lock().remove(&key);
        let mut current = self.current.lock();
        if current.as_ref().map(|h| h.identity()) == Some(key.display().to_string().as_str()) {
            *current = None;
        }
        removed.is_some()
    }

    pub fn generate(
        &self,
        handle: &ModelHandle<B::Runtime>,
        context: &str,
        answer: Option<&str>,
        config: &DecodingConfig,
    ) -> Result<Vec<String>> {
        handle.generate(context, answer, config)
    }

    /// Serves one request against the current model.
    pub fn serve(&self, request: &GenerationRequest) -> GenerationResponse {
        let result = self.current().and_then(|handle| {
            handle.generate(&request.context, request.answer.as_deref(), &request.decoding)
        });
        if let Err(err) = &result {
            debug!("request failed: {}", err);
        }
        GenerationResponse::from(result)
    }

    /// Runs a request on a blocking worker and gives up after `timeout`.
    ///
    /// The decode itself cannot be interrupted: on timeout it keeps running
    /// to completion in the background and its output is discarded.
    pub async fn generate_with_timeout(
        &self,
        handle: &ModelHandle<B::Runtime>,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        request.decoding.validate()?;
        let handle = handle.clone();
        let task = tokio::task::spawn_blocking(move || {
            handle.generate(&request.context, request.answer.as_deref(), &request.decoding)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(QgError::Compute(anyhow::anyhow!(
                "generation worker failed: {join_error}"
            ))),
            Err(_) => {
                warn!("generation request abandoned after {:?}", timeout);
                Err(QgError::Timeout(timeout))
            }
        }
    }
}
