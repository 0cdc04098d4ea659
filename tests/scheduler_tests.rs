mod common;

use std::collections::BTreeMap;

use anyhow::Result;
use multiqg::{DataFormatter, Example, MixturePolicy, QgError, TaskBatch, TaskScheduler, TaskType};

fn examples() -> Vec<Example> {
    let mut examples = common::capitals();
    examples.push(
        Example::new("The Nile flows through Egypt. It is the longest river in Africa.")
            .with_answer("Africa")
            .with_question("Where is the longest river?"),
    );
    examples.push(Example::new("Tokyo is large.").with_answer("Tokyo"));
    examples
}

fn task_counts(batches: &[TaskBatch]) -> BTreeMap<TaskType, usize> {
    let mut counts = BTreeMap::new();
    for batch in batches {
        *counts.entry(batch.task).or_default() += 1;
    }
    counts
}

#[test]
fn test_epoch_is_reproducible() -> Result<()> {
    let scheduler = TaskScheduler::new(3);
    let policy = MixturePolicy::uniform();

    let first = scheduler.build_epoch(&examples(), &policy, 7)?;
    let second = scheduler.build_epoch(&examples(), &policy, 7)?;
    assert_eq!(first, second);

    let reshuffled = (8..16).any(|seed| {
        scheduler
            .build_epoch(&examples(), &policy, seed)
            .map(|batches| batches != first)
            .unwrap_or(false)
    });
    assert!(reshuffled, "different seeds should change the order");
    Ok(())
}

#[test]
fn test_mixture_proportions() -> Result<()> {
    let mut policy = MixturePolicy::uniform();
    policy.set_weight(TaskType::QuestionGeneration, 2.0);
    policy.set_weight(TaskType::AnswerExtraction, 0.5);
    let weights: f64 = TaskType::ALL.iter().map(|t| policy.weight(*t)).sum();

    for batches_per_epoch in [1, 7, 10, 23] {
        let scheduler = TaskScheduler::new(2).with_batches_per_epoch(Some(batches_per_epoch));
        let batches = scheduler.build_epoch(&examples(), &policy, 1)?;
        assert_eq!(batches.len(), batches_per_epoch);

        let counts = task_counts(&batches);
        for task in TaskType::ALL {
            let expected = batches_per_epoch as f64 * policy.weight(task) / weights;
            let actual = counts.get(&task).copied().unwrap_or(0) as f64;
            assert!(
                (actual - expected).abs() <= 1.0,
                "{task}: {actual} batches, expected about {expected}"
            );
        }
    }
    Ok(())
}

#[test]
fn test_huge_weights_keep_epoch_length() -> Result<()> {
    let mut policy = MixturePolicy::uniform();
    for task in TaskType::ALL {
        policy.set_weight(task, 1e308);
    }
    let scheduler = TaskScheduler::new(2).with_batches_per_epoch(Some(10));
    let batches = scheduler.build_epoch(&examples(), &policy, 1)?;
    assert_eq!(batches.len(), 10);

    let counts = task_counts(&batches);
    let mut per_task: Vec<usize> = counts.values().copied().collect();
    per_task.sort_unstable();
    assert_eq!(per_task, vec![3, 3, 4]);
    Ok(())
}

#[test]
fn test_batches_are_single_task() -> Result<()> {
    let scheduler = TaskScheduler::new(4);
    let batches = scheduler.build_epoch(&examples(), &MixturePolicy::uniform(), 3)?;

    // 7 QG + 7 QA + 8 AE pairs in batches of 4
    assert_eq!(batches.len(), 6);
    for batch in &batches {
        assert_eq!(batch.pairs.len(), 4);
        for (input, target) in &batch.pairs {
            assert!(input.starts_with(&format!("{}: ", batch.task.prefix())));
            assert!(!target.is_empty());
        }
    }
    Ok(())
}

#[test]
fn test_zero_weight_task_is_skipped() -> Result<()> {
    let answers_only: Vec<Example> = examples()
        .into_iter()
        .map(|mut e| {
            e.question = None;
            e
        })
        .collect();

    let err = TaskScheduler::new(2)
        .build_epoch(&answers_only, &MixturePolicy::uniform(), 0)
        .unwrap_err();
    assert!(matches!(err, QgError::EmptyTaskPool(TaskType::QuestionGeneration)));

    let batches = TaskScheduler::new(2).build_epoch(
        &answers_only,
        &MixturePolicy::only(TaskType::AnswerExtraction),
        0,
    )?;
    assert!(batches.iter().all(|b| b.task == TaskType::AnswerExtraction));
    Ok(())
}

#[test]
fn test_malformed_example_aborts_epoch() -> Result<()> {
    let mut examples = examples();
    examples.push(
        Example::new("Lima is in Peru.")
            .with_answer("Quito")
            .with_question("What is in Peru?"),
    );
    let err = TaskScheduler::new(2)
        .build_epoch(&examples, &MixturePolicy::uniform(), 0)
        .unwrap_err();
    assert!(matches!(err, QgError::HighlightNotFound { .. }));
    Ok(())
}

#[test]
fn test_format_is_pure() -> Result<()> {
    for example in examples() {
        for task in TaskType::ALL {
            let first = DataFormatter.format(&example, task);
            let second = DataFormatter.format(&example, task);
            match (first, second) {
                (Ok(a), Ok(b)) => assert_eq!(a, b),
                (Err(QgError::MissingField { .. }), Err(QgError::MissingField { .. })) => {
                    assert!(!task.is_eligible(&example))
                }
                (a, b) => panic!("inconsistent results {a:?} / {b:?}"),
            }
        }
    }
    Ok(())
}
