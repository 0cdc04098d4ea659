use std::fs;

use anyhow::Result;
use multiqg::checkpoint::{read_checkpoint, CheckpointExtras, CheckpointId, CheckpointManager};
use multiqg::QgError;
use tempfile::TempDir;

fn extras(step: u64) -> CheckpointExtras {
    CheckpointExtras {
        tokenizer_json: r#"{"version": "1.0"}"#.to_string(),
        seed: 42,
        global_step: step,
    }
}

#[test]
fn test_save_load_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;

    let model = vec![1u8, 2, 3, 4, 5];
    let optimizer = vec![9u8; 17];
    let id = manager.save(3, &model, &optimizer, &extras(12))?;
    assert!(id.path().ends_with("epoch-0003"));

    let loaded = manager.load(&id)?;
    assert_eq!(loaded.epoch, 3);
    assert_eq!(loaded.model_state, model);
    assert_eq!(loaded.optimizer_state, optimizer);
    assert_eq!(loaded.extras, extras(12));

    // empty optimizer state is valid
    let id = manager.save(4, &model, &[], &extras(16))?;
    assert!(manager.load(&id)?.optimizer_state.is_empty());
    Ok(())
}

#[test]
fn test_manifest_lookup() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;
    assert_eq!(manager.latest()?, None);

    for epoch in [2, 1, 3] {
        manager.save(epoch, &[epoch as u8], &[], &extras(epoch as u64))?;
    }
    let (epoch, latest) = manager.latest()?.expect("checkpoints were saved");
    assert_eq!(epoch, 3);
    assert_eq!(manager.load(&latest)?.model_state, vec![3]);
    assert_eq!(manager.checkpoint_for(2)?, CheckpointId::from_path(dir.path().join("epoch-0002")));
    assert_eq!(manager.entries()?.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

    // a directory that is not in the manifest is never picked up
    fs::create_dir(dir.path().join("epoch-0009"))?;
    assert_eq!(manager.latest()?.map(|(epoch, _)| epoch), Some(3));
    assert!(matches!(manager.checkpoint_for(9), Err(QgError::CheckpointNotFound(_))));
    Ok(())
}

#[test]
fn test_resave_replaces_epoch() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;

    let id = manager.save(1, b"old", &[], &extras(1))?;
    let report = id.path().join("metric_report.json");
    fs::write(&report, "{}")?;
    manager.attach_report(1, &report)?;
    assert_eq!(manager.entries()?[&1].metric_report.as_deref(), Some(report.as_path()));

    let id = manager.save(1, b"new", &[], &extras(2))?;
    let loaded = manager.load(&id)?;
    assert_eq!(loaded.model_state, b"new");
    assert_eq!(loaded.extras.global_step, 2);
    assert_eq!(manager.entries()?[&1].metric_report, None);
    assert!(!report.exists());
    Ok(())
}

#[test]
fn test_interrupted_save_is_discarded() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;
    manager.save(1, b"weights", &[], &extras(1))?;

    // simulate a crash halfway through writing epoch 2
    let partial = dir.path().join(".tmp-epoch-0002-4242");
    fs::create_dir(&partial)?;
    fs::write(partial.join("model.bin"), b"wei")?;

    let manager = CheckpointManager::new(dir.path())?;
    assert!(!partial.exists());
    assert_eq!(manager.latest()?.map(|(epoch, _)| epoch), Some(1));
    assert!(matches!(manager.checkpoint_for(2), Err(QgError::CheckpointNotFound(_))));
    Ok(())
}

#[test]
fn test_interrupted_resave_keeps_old_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;
    manager.save(1, b"weights", &[], &extras(1))?;
    manager.save(2, b"newer", &[], &extras(2))?;

    // crash right after a re-save of epoch 1 moved the old directory aside
    let live = dir.path().join("epoch-0001");
    let stale = dir.path().join(".tmp-stale-epoch-0001");
    fs::rename(&live, &stale)?;

    // a stale copy of an epoch that was fully replaced is just garbage
    fs::create_dir(dir.path().join(".tmp-stale-epoch-0002"))?;

    let manager = CheckpointManager::new(dir.path())?;
    assert!(!stale.exists());
    assert!(!dir.path().join(".tmp-stale-epoch-0002").exists());
    let loaded = manager.load(&manager.checkpoint_for(1)?)?;
    assert_eq!(loaded.model_state, b"weights");
    assert_eq!(manager.load(&manager.checkpoint_for(2)?)?.model_state, b"newer");
    Ok(())
}

#[test]
fn test_missing_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;

    let id = CheckpointId::from_path(dir.path().join("epoch-0007"));
    assert!(matches!(manager.load(&id), Err(QgError::CheckpointNotFound(_))));
    Ok(())
}

#[test]
fn test_corrupt_checkpoints() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = CheckpointManager::new(dir.path())?;

    let truncated = manager.save(1, &[7u8; 64], &[1u8; 8], &extras(1))?;
    fs::write(truncated.path().join("model.bin"), [7u8; 10])?;
    assert!(matches!(
        manager.load(&truncated),
        Err(QgError::CheckpointCorrupt { .. })
    ));

    let versioned = manager.save(2, &[7u8; 4], &[], &extras(2))?;
    let meta_path = versioned.path().join("meta.json");
    let mut meta: serde_json::Value = serde_json::from_slice(&fs::read(&meta_path)?)?;
    meta["format_version"] = serde_json::json!(99);
    fs::write(&meta_path, serde_json::to_vec(&meta)?)?;
    match manager.load(&versioned) {
        Err(QgError::CheckpointCorrupt { reason, .. }) => assert!(reason.contains("99")),
        other => panic!("expected a corrupt checkpoint, got {other:?}"),
    }

    let no_meta = manager.save(3, &[7u8; 4], &[], &extras(3))?;
    fs::remove_file(no_meta.path().join("meta.json"))?;
    assert!(matches!(
        read_checkpoint(no_meta.path()),
        Err(QgError::CheckpointCorrupt { .. })
    ));

    fs::write(dir.path().join("manifest.json"), "not json")?;
    assert!(matches!(manager.latest(), Err(QgError::CheckpointCorrupt { .. })));
    Ok(())
}
