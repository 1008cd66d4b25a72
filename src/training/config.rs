//! Run configuration
//!
//! One [`RunConfig`] describes a whole active-learning run. The CLI fills it from
//! flags, the run validates it before touching any data and stores a copy as
//! `run_config.json` in the save directory.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::active::{DiscriminativePolicy, ScoringConfig, StrategyKind};
use crate::dataset::AugmentationConfig;
use crate::model::{Architecture, MIN_INPUT_SIZE};
use crate::training::scheduler::{LrMode, LrSchedule};
use crate::utils::error::{Result, SegmentationError};

/// How validation images are cut before batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ValCrop {
    /// Random `crop_size` square, same as training minus the other augmentations
    RandomCrop,
    /// Whole image; batching then needs equally sized validation images
    FullImage,
}

/// Active-learning training run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root that manifest paths are relative to
    pub data_dir: PathBuf,
    /// Directory holding `{phase}_images.txt`; defaults to `data_dir`
    pub list_dir: Option<PathBuf>,
    pub classes: usize,
    pub crop_size: u32,
    pub arch: Architecture,
    pub batch_size: usize,
    /// Epochs per cycle
    pub epochs: usize,
    pub lr: f64,
    pub lr_mode: LrMode,
    /// Epochs between decays in `step` mode
    pub step: usize,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Validate once and stop
    pub evaluate: bool,
    /// Checkpoint metadata file to resume each cycle from
    pub resume: Option<PathBuf>,
    /// Model record to initialise every fresh model from
    pub pretrained: Option<PathBuf>,
    pub save_path: PathBuf,
    /// Archive a checkpoint every this many epochs
    pub save_iter: usize,
    pub print_freq: usize,
    pub cycles: usize,
    pub images_per_cycle: usize,
    pub strategy: StrategyKind,
    /// Weight of the ranking loss
    pub lamda: f64,
    pub lp_warmup_epochs: usize,
    pub lp_detach_epoch: usize,
    pub dal_policy: DiscriminativePolicy,
    pub dal_epochs: usize,
    pub val_crop: ValCrop,
    /// Scale range factor for training augmentation; 0 disables
    pub random_scale: f32,
    /// Maximum rotation in degrees for training augmentation; 0 disables
    pub random_rotate: f32,
    pub seed: u64,
    /// Base path of the per-cycle selection CSVs
    pub selection_csv: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            list_dir: None,
            classes: 19,
            crop_size: 896,
            arch: Architecture::DrnD22,
            batch_size: 64,
            epochs: 10,
            lr: 0.01,
            lr_mode: LrMode::Step,
            step: 200,
            momentum: 0.9,
            weight_decay: 1e-4,
            evaluate: false,
            resume: None,
            pretrained: None,
            save_path: PathBuf::from("output/runs"),
            save_iter: 1,
            print_freq: 10,
            cycles: 10,
            images_per_cycle: 150,
            strategy: StrategyKind::Random,
            lamda: 1.0,
            lp_warmup_epochs: 1,
            lp_detach_epoch: 150,
            dal_policy: DiscriminativePolicy::MostUnlabeled,
            dal_epochs: 10,
            val_crop: ValCrop::RandomCrop,
            random_scale: 0.0,
            random_rotate: 0.0,
            seed: crate::DEFAULT_SEED,
            selection_csv: None,
        }
    }
}

impl RunConfig {
    /// Reject settings that cannot produce a run
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.classes == 0, "classes must be at least 1"),
            (self.batch_size == 0, "batch size must be at least 1"),
            (self.save_iter == 0, "save_iter must be at least 1"),
            (self.step == 0, "lr step must be at least 1"),
            (self.cycles == 0, "cycles must be at least 1"),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(SegmentationError::Config(message.to_string()));
            }
        }
        if (self.crop_size as usize) < MIN_INPUT_SIZE {
            return Err(SegmentationError::Config(format!(
                "crop size must be at least {}, got {}",
                MIN_INPUT_SIZE, self.crop_size
            )));
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(SegmentationError::Config(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        Ok(())
    }

    pub fn list_dir(&self) -> &Path {
        self.list_dir.as_deref().unwrap_or(&self.data_dir)
    }

    pub fn schedule(&self) -> LrSchedule {
        LrSchedule::new(self.lr_mode, self.lr, self.step, self.epochs)
    }

    pub fn train_augmentation(&self) -> AugmentationConfig {
        AugmentationConfig::training(self.crop_size, self.random_scale, self.random_rotate)
    }

    pub fn val_augmentation(&self) -> AugmentationConfig {
        match self.val_crop {
            ValCrop::RandomCrop => AugmentationConfig::validation(Some(self.crop_size)),
            ValCrop::FullImage => AugmentationConfig::none(),
        }
    }

    pub fn scoring(&self) -> ScoringConfig {
        ScoringConfig {
            seed: self.seed,
            dal_policy: self.dal_policy,
            dal_epochs: self.dal_epochs,
            ..ScoringConfig::default()
        }
    }

    /// Checkpoint directory of one cycle
    pub fn cycle_dir(&self, cycle: usize) -> PathBuf {
        self.save_path.join(format!("cycle_{:02}", cycle))
    }

    /// `selection.csv` becomes `selection_cycle_03.csv` for cycle 3
    pub fn selection_csv_for(&self, cycle: usize) -> Option<PathBuf> {
        self.selection_csv.as_ref().map(|base| {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "selection".to_string());
            let ext = base
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "csv".to_string());
            base.with_file_name(format!("{}_cycle_{:02}.{}", stem, cycle, ext))
        })
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
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.seed, 1311);
        assert_eq!(config.list_dir(), Path::new("data"));
    }

    #[test]
    fn test_zero_values_fail_validation() {
        for broken in [
            RunConfig { classes: 0, ..RunConfig::default() },
            RunConfig { crop_size: 0, ..RunConfig::default() },
            RunConfig { batch_size: 0, ..RunConfig::default() },
            RunConfig { save_iter: 0, ..RunConfig::default() },
        ] {
            assert!(matches!(broken.validate(), Err(SegmentationError::Config(_))));
        }
    }

    #[test]
    fn test_crop_below_network_minimum_rejected() {
        let small = RunConfig { crop_size: 16, ..RunConfig::default() };
        assert!(matches!(small.validate(), Err(SegmentationError::Config(_))));

        let smallest = RunConfig { crop_size: MIN_INPUT_SIZE as u32, ..RunConfig::default() };
        assert!(smallest.validate().is_ok());
    }

    #[test]
    fn test_unknown_lr_mode_in_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_config.json");
        RunConfig::default().save(&path).unwrap();

        let json = fs::read_to_string(&path)
            .unwrap()
            .replace("\"lr_mode\": \"step\"", "\"lr_mode\": \"cosine\"");
        fs::write(&path, json).unwrap();
        assert!(matches!(
            RunConfig::load(&path),
            Err(SegmentationError::Serialization(_))
        ));
    }

    #[test]
    fn test_save_load_keeps_strategy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_config.json");
        let config = RunConfig {
            strategy: StrategyKind::LossPrediction,
            val_crop: ValCrop::FullImage,
            ..RunConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_selection_csv_names_per_cycle() {
        let config = RunConfig {
            selection_csv: Some(PathBuf::from("out/selected.csv")),
            ..RunConfig::default()
        };
        assert_eq!(
            config.selection_csv_for(3),
            Some(PathBuf::from("out/selected_cycle_03.csv"))
        );
        assert_eq!(RunConfig::default().selection_csv_for(0), None);
    }
}
