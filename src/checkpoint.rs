use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{QgError, Result};

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const MODEL_FILE: &str = "model.bin";
const OPTIMIZER_FILE: &str = "optimizer.bin";
const TOKENIZER_FILE: &str = "tokenizer.json";
const META_FILE: &str = "meta.json";
pub const REPORT_FILE: &str = "metric_report.json";
const TMP_PREFIX: &str = ".tmp-";
const STALE_PREFIX: &str = ".tmp-stale-";

/// Location of one written checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(PathBuf);

impl CheckpointId {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Everything besides weights that a resumed run or a loaded model needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointExtras {
    pub tokenizer_json: String,
    /// Base scheduler seed of the run.
    pub seed: u64,
    pub global_step: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedCheckpoint {
    pub epoch: usize,
    pub model_state: Vec<u8>,
    pub optimizer_state: Vec<u8>,
    pub extras: CheckpointExtras,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMeta {
    format_version: u32,
    epoch: usize,
    seed: u64,
    global_step: u64,
    created_at: DateTime<Utc>,
    model_bytes: u64,
    optimizer_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub directory: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metric_report: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    entries: BTreeMap<usize, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Owns `manifest.json` and the `epoch-NNNN/` directories under one root.
/// Directories are written under a `.tmp-` name and renamed into place.
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    /// Opens (creating if needed) a checkpoint root and clears leftovers of
    /// interrupted saves.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // A re-save interrupted between its two renames leaves the old
            // directory only under its stale name.
            if let Some(original) = name.strip_prefix(STALE_PREFIX) {
                let target = root.join(original);
                if !target.exists() {
                    warn!("restoring {} from an interrupted re-save", target.display());
                    fs::rename(entry.path(), &target)?;
                    continue;
                }
            }
            if name.starts_with(TMP_PREFIX) {
                warn!("removing interrupted checkpoint write {:?}", entry.path());
                if entry.path().is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(
        &self,
        epoch: usize,
        model_state: &[u8],
        optimizer_state: &[u8],
        extras: &CheckpointExtras,
    ) -> Result<CheckpointId> {
        let name = epoch_dir_name(epoch);
        let final_dir = self.root.join(&name);
        let tmp_dir = self.root.join(format!("{TMP_PREFIX}{name}-{}", std::process::id()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let created_at = Utc::now();
        let meta = CheckpointMeta {
            format_version: FORMAT_VERSION,
            epoch,
            seed: extras.seed,
            global_step: extras.global_step,
            created_at,
            model_bytes: model_state.len() as u64,
            optimizer_bytes: optimizer_state.len() as u64,
        };
        write_synced(&tmp_dir.join(MODEL_FILE), model_state)?;
        write_synced(&tmp_dir.join(OPTIMIZER_FILE), optimizer_state)?;
        write_synced(&tmp_dir.join(TOKENIZER_FILE), extras.tokenizer_json.as_bytes())?;
        write_synced(&tmp_dir.join(META_FILE), &serde_json::to_vec_pretty(&meta)?)?;

        if final_dir.exists() {
            warn!("replacing existing checkpoint {}", final_dir.display());
            let stale = self.root.join(format!("{STALE_PREFIX}{name}"));
            fs::rename(&final_dir, &stale)?;
            fs::rename(&tmp_dir, &final_dir)?;
            fs::remove_dir_all(&stale)?;
        } else {
            fs::rename(&tmp_dir, &final_dir)?;
        }

        self.update_manifest(|manifest| {
            manifest.entries.insert(
                epoch,
                ManifestEntry {
                    directory: name.clone(),
                    created_at,
                    metric_report: None,
                },
            );
            Ok(())
        })?;

        info!("saved checkpoint for epoch {} at {}", epoch, final_dir.display());
        Ok(CheckpointId(final_dir))
    }

    /// Reads and structurally validates a checkpoint directory.
    pub fn load(&self, id: &CheckpointId) -> Result<LoadedCheckpoint> {
        read_checkpoint(id.path())
    }

    pub fn checkpoint_for(&self, epoch: usize) -> Result<CheckpointId> {
        let manifest = self.read_manifest()?;
        manifest
            .entries
            .get(&epoch)
            .map(|entry| CheckpointId(self.root.join(&entry.directory)))
            .ok_or_else(|| QgError::CheckpointNotFound(self.root.join(epoch_dir_name(epoch))))
    }

    /// Checkpoint of the highest recorded epoch.
    pub fn latest(&self) -> Result<Option<(usize, CheckpointId)>> {
        let manifest = self.read_manifest()?;
        Ok(manifest
            .entries
            .iter()
            .next_back()
            .map(|(epoch, entry)| (*epoch, CheckpointId(self.root.join(&entry.directory)))))
    }

    pub fn entries(&self) -> Result<BTreeMap<usize, ManifestEntry>> {
        Ok(self.read_manifest()?.entries)
    }

    /// Records the metric report of an evaluated epoch in the manifest.
    pub fn attach_report(&self, epoch: usize, report_path: &Path) -> Result<()> {
        let root = self.root.clone();
        self.update_manifest(|manifest| {
            let entry = manifest
                .entries
                .get_mut(&epoch)
                .ok_or_else(|| QgError::CheckpointNotFound(root.join(epoch_dir_name(epoch))))?;
            entry.metric_report = Some(report_path.to_path_buf());
            Ok(())
        })
    }

    fn read_manifest(&self) -> Result<Manifest> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let bytes = fs::read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| QgError::corrupt(&path, format!("unreadable manifest: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(QgError::corrupt(
                &path,
                format!("unsupported manifest version {}", manifest.format_version),
            ));
        }
        Ok(manifest)
    }

    fn update_manifest<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut Manifest) -> Result<()>,
    {
        let mut manifest = self.read_manifest()?;
        update(&mut manifest)?;
        write_atomic(&self.root.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
        debug!("manifest now lists {} checkpoints", manifest.entries.len());
        Ok(())
    }
}

fn epoch_dir_name(epoch: usize) -> String {
    format!("epoch-{epoch:04}")
}

/// Reads a checkpoint directory without going through a manager; used when a
/// model is loaded straight from a path.
pub fn read_checkpoint(dir: &Path) -> Result<LoadedCheckpoint> {
    if !dir.is_dir() {
        return Err(QgError::CheckpointNotFound(dir.to_path_buf()));
    }

    let read = |file: &str| {
        fs::read(dir.join(file)).map_err(|e| QgError::corrupt(dir, format!("cannot read {file}: {e}")))
    };

    let meta: CheckpointMeta = serde_json::from_slice(&read(META_FILE)?)
        .map_err(|e| QgError::corrupt(dir, format!("invalid {META_FILE}: {e}")))?;
    if meta.format_version != FORMAT_VERSION {
        return Err(QgError::corrupt(
            dir,
            format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                meta.format_version
            ),
        ));
    }

    let model_state = read(MODEL_FILE)?;
    if model_state.len() as u64 != meta.model_bytes {
        return Err(QgError::corrupt(
            dir,
            format!("{MODEL_FILE} has {} bytes, expected {}", model_state.len(), meta.model_bytes),
        ));
    }
    let optimizer_state = read(OPTIMIZER_FILE)?;
    if optimizer_state.len() as u64 != meta.optimizer_bytes {
        return Err(QgError::corrupt(
            dir,
            format!(
                "{OPTIMIZER_FILE} has {} bytes, expected {}",
                optimizer_state.len(),
                meta.optimizer_bytes
            ),
        ));
    }
    let tokenizer_json = String::from_utf8(read(TOKENIZER_FILE)?)
        .map_err(|_| QgError::corrupt(dir, format!("{TOKENIZER_FILE} is not UTF-8")))?;

    Ok(LoadedCheckpoint {
        epoch: meta.epoch,
        model_state,
        optimizer_state,
        extras: CheckpointExtras {
            tokenizer_json,
            seed: meta.seed,
            global_step: meta.global_step,
        },
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Writes `bytes` next to `path` and renames over it.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{TMP_PREFIX}{file_name}"));
    write_synced(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
