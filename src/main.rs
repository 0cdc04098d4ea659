use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multiqg::{
    load_examples, AppConfig, BaselineBuilder, CheckpointId, EvaluationPipeline, GenerationEngine,
    GenerationRequest, LocalRepository, ModelSource, RuntimeBuilder, TrainingLoop,
};

#[derive(Parser)]
#[command(name = "multiqg", about = "Multitask question generation: training and inference")]
struct Cli {
    /// TOML configuration file; `MULTIQG_*` variables override it.
    #[arg(long, short, global = true, env = "MULTIQG_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Baseline, global = true)]
    backend: Backend,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Baseline,
    #[cfg(feature = "libtorch")]
    Libtorch,
}

#[derive(Subcommand)]
enum Command {
    /// Train from scratch.
    Train {
        #[arg(long)]
        train: PathBuf,
        #[arg(long)]
        eval: Option<PathBuf>,
    },
    /// Continue training from a checkpoint (the latest one by default).
    Resume {
        #[arg(long)]
        train: PathBuf,
        #[arg(long)]
        eval: Option<PathBuf>,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Generate questions for a passage.
    Generate {
        #[arg(long)]
        context: String,
        #[arg(long)]
        answer: Option<String>,
        /// Model alias or checkpoint directory, overriding `serving.model`.
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multiqg=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.backend {
        Backend::Baseline => run(BaselineBuilder::new(config.baseline.clone()), config, cli.command).await,
        #[cfg(feature = "libtorch")]
        Backend::Libtorch => run(multiqg::TchBuilder::default(), config, cli.command).await,
    }
}

async fn run<B>(builder: B, config: AppConfig, command: Command) -> Result<()>
where
    B: RuntimeBuilder + Clone + 'static,
{
    match command {
        Command::Train { train, eval } => {
            let examples = load_examples(&train)?;
            let trainer = TrainingLoop::new(config.training.clone(), &builder, &examples)?;
            train_to_completion(trainer, builder, &config, &examples, eval)
        }
        Command::Resume {
            train,
            eval,
            checkpoint,
        } => {
            let examples = load_examples(&train)?;
            let trainer = match checkpoint {
                Some(dir) => {
                    TrainingLoop::resume(config.training.clone(), &builder, &CheckpointId::from_path(dir))?
                }
                None => TrainingLoop::resume_latest(config.training.clone(), &builder)?,
            };
            train_to_completion(trainer, builder, &config, &examples, eval)
        }
        Command::Generate {
            context,
            answer,
            model,
        } => {
            let serving = config.serving;
            let repository = Arc::new(LocalRepository::new(&serving.model_cache_dir));
            let engine = GenerationEngine::new(builder, repository, serving.engine());
            let model = model.unwrap_or_else(|| serving.model.clone());
            let handle = engine.load(&ModelSource::parse(&model))?;

            let request = GenerationRequest {
                context,
                answer,
                decoding: serving.decoding.clone(),
            };
            let questions = match serving.request_timeout() {
                Some(timeout) => engine.generate_with_timeout(&handle, request, timeout).await?,
                None => engine.generate(
                    &handle,
                    &request.context,
                    request.answer.as_deref(),
                    &request.decoding,
                )?,
            };
            for question in questions {
                println!("{question}");
            }
            Ok(())
        }
    }
}

fn train_to_completion<B>(
    mut trainer: TrainingLoop<B>,
    builder: B,
    config: &AppConfig,
    examples: &[multiqg::Example],
    eval: Option<PathBuf>,
) -> Result<()>
where
    B: RuntimeBuilder + Clone + 'static,
{
    if let Some(path) = eval {
        let eval_examples = load_examples(&path)?;
        let repository = Arc::new(LocalRepository::new(&config.serving.model_cache_dir));
        let engine = GenerationEngine::new(builder, repository, config.serving.engine());
        let pipeline = EvaluationPipeline::new(engine, config.training.eval_decoding.clone());
        trainer = trainer.with_evaluation(pipeline, eval_examples);
    }

    let summary = trainer.run(examples)?;
    if let Some(checkpoint) = summary.final_checkpoint() {
        info!(
            "finished {} epochs, {} steps; final checkpoint {}",
            summary.epochs.len(),
            summary.global_step,
            checkpoint.path().display()
        );
    }
    Ok(())
}
