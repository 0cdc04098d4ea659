mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use common::{capitals, echo_checkpoint, tokenizer, EchoBuilder};
use multiqg::engine::EngineConfig;
use multiqg::{DecodingConfig, EvaluationPipeline, GenerationEngine, LocalRepository, MetricScorer};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Keeps every pair it is asked to score and reports their count.
#[derive(Clone, Default)]
struct RecordingScorer {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl MetricScorer for RecordingScorer {
    fn score(&self, pairs: &[(String, String)]) -> BTreeMap<String, f64> {
        self.seen.lock().extend_from_slice(pairs);
        BTreeMap::from([
            ("bleu_4".to_string(), 0.25),
            ("pairs".to_string(), pairs.len() as f64),
        ])
    }
}

#[test]
fn test_custom_scorer_receives_generated_pairs() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = echo_checkpoint(dir.path(), &tokenizer()?, 2)?;
    let engine = GenerationEngine::new(
        EchoBuilder::default(),
        Arc::new(LocalRepository::new(dir.path())),
        EngineConfig::default(),
    );
    let scorer = RecordingScorer::default();
    let pipeline = EvaluationPipeline::new(engine, DecodingConfig::greedy(8))
        .with_scorer(Box::new(scorer.clone()));

    let examples = capitals();
    let report = pipeline.evaluate(&checkpoint, &examples)?;

    let seen = scorer.seen.lock().clone();
    assert_eq!(seen.len(), examples.len());
    for ((pair, sample), example) in seen.iter().zip(&report.samples).zip(&examples) {
        assert_eq!(Some(&pair.0), example.question.as_ref());
        assert_eq!(pair.0, sample.reference);
        assert_eq!(pair.1, sample.generated);
        // the echo runtime answers with the highlighted span
        let answer = example.answer_span.as_deref().unwrap_or_default();
        assert_eq!(pair.1.to_lowercase(), answer.to_lowercase());
    }

    assert_eq!(report.epoch, 2);
    assert_eq!(report.scores.get("bleu_4"), Some(&0.25));
    assert_eq!(report.scores.get("pairs"), Some(&6.0));
    assert!(!report.scores.contains_key("exact_match"));
    Ok(())
}
