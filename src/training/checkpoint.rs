//! Checkpoint persistence
//!
//! A checkpoint is a JSON metadata file (`<name>.json`) next to a Burn
//! `CompactRecorder` model record (`<name>.mpk`). Per cycle directory the manager
//! keeps `checkpoint_latest` (rewritten every epoch), `model_best` (rewritten on
//! improvement) and `checkpoint_NNN` archives that are never overwritten by later
//! epochs.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::backend::Backend;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::ActiveSegModel;
use crate::utils::error::{Result, SegmentationError};

const LATEST: &str = "checkpoint_latest";
const BEST: &str = "model_best";

/// Metadata persisted next to the model record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Number of completed epochs; training resumes at this epoch
    pub epoch: usize,
    pub arch: String,
    pub best_prec1: f64,
    pub best_map: f64,
    pub cycle: usize,
    pub saved_at: String,
}

impl Checkpoint {
    pub fn new(epoch: usize, arch: &str, best_prec1: f64, best_map: f64, cycle: usize) -> Self {
        Self {
            epoch,
            arch: arch.to_string(),
            best_prec1,
            best_map,
            cycle,
            saved_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            SegmentationError::Checkpoint(format!("unreadable checkpoint {:?}: {}", path, e))
        })
    }

    /// Model record belonging to a metadata file
    pub fn model_path(path: &Path) -> PathBuf {
        path.with_extension("mpk")
    }
}

/// Write a model record with the compact recorder
pub fn save_model<B: Backend>(model: &ActiveSegModel<B>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    model
        .clone()
        .save_file(path.to_path_buf(), &CompactRecorder::new())?;
    Ok(())
}

/// Load a model record into an already constructed model
pub fn load_model<B: Backend>(
    model: ActiveSegModel<B>,
    path: &Path,
    device: &B::Device,
) -> Result<ActiveSegModel<B>> {
    let record_path = path.with_extension("mpk");
    if !record_path.exists() {
        return Err(SegmentationError::PathNotFound(record_path));
    }
    Ok(model.load_file(record_path, &CompactRecorder::new(), device)?)
}

/// Restore metadata and weights from a checkpoint metadata path
pub fn restore<B: Backend>(
    path: &Path,
    model: ActiveSegModel<B>,
    device: &B::Device,
) -> Result<(Checkpoint, ActiveSegModel<B>)> {
    let checkpoint = Checkpoint::load(path)?;
    let model = load_model(model, &Checkpoint::model_path(path), device)?;
    Ok((checkpoint, model))
}

/// Where one save landed
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCheckpoint {
    pub latest: PathBuf,
    pub best: Option<PathBuf>,
    pub archived: Option<PathBuf>,
}

/// Applies the latest / best / archive policy inside one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    save_iter: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, save_iter: usize) -> Self {
        Self {
            dir: dir.into(),
            save_iter: save_iter.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", LATEST))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", BEST))
    }

    /// Archive name for a checkpoint whose `epoch` field is `epoch`
    pub fn history_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_{:03}.json", epoch))
    }

    /// Persist `checkpoint` and `model` as latest, then copy as the policy requires
    pub fn save<B: Backend>(
        &self,
        checkpoint: &Checkpoint,
        model: &ActiveSegModel<B>,
        is_best: bool,
    ) -> Result<SavedCheckpoint> {
        let latest = self.latest_path();
        checkpoint.save(&latest)?;
        save_model(model, &Checkpoint::model_path(&latest))?;
        self.promote(checkpoint, is_best)
    }

    /// Copy the current latest files to best and/or the epoch archive
    pub fn promote(&self, checkpoint: &Checkpoint, is_best: bool) -> Result<SavedCheckpoint> {
        let latest = self.latest_path();

        let best = if is_best {
            let best = self.best_path();
            copy_pair(&latest, &best)?;
            Some(best)
        } else {
            None
        };

        let archived = if checkpoint.epoch % self.save_iter == 0 {
            let archive = self.history_path(checkpoint.epoch);
            copy_pair(&latest, &archive)?;
            Some(archive)
        } else {
            None
        };

        Ok(SavedCheckpoint {
            latest,
            best,
            archived,
        })
    }
}

fn copy_pair(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)?;
    let model_from = Checkpoint::model_path(from);
    if model_from.exists() {
        fs::copy(&model_from, Checkpoint::model_path(to))?;
    }
    Ok(())
}
