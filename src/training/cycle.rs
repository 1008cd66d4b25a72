//! Active-learning cycle orchestration
//!
//! Each cycle starts from a fresh network, grows the labeled pool by one
//! selection, and trains for the configured epochs with a validation pass and a
//! checkpoint after each epoch. Selection in cycle `k` uses the model trained in
//! cycle `k - 1`; the first cycle has no trained model and selects at random.

use std::fs;
use std::path::Path;

use burn::{
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig},
    tensor::backend::{AutodiffBackend, Backend},
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::active::scoring::RandomScorer;
use crate::active::{
    build_scorer, select, write_selection_report, Scorer, ScoringContext, StrategyKind,
};
use crate::dataset::{
    AugmentationConfig, Augmenter, DatasetInfo, Manifest, SamplePool, SegBatcher, SegDataset,
};
use crate::model::{ActiveSegModel, SegNetConfig};
use crate::training::checkpoint::{load_model, restore, Checkpoint, CheckpointManager};
use crate::training::config::RunConfig;
use crate::training::ranking::RankingTracker;
use crate::training::step::{train_epoch, validate, Loader, TrainOptions};
use crate::utils::error::{Result, SegmentationError};
use crate::utils::events::{EventSink, TrainingEvent};

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: usize,
    /// Labeled pool size the cycle trained on
    pub labeled: usize,
    pub best_prec1: f64,
    pub best_map: f64,
}

/// Validation result of an evaluate-only run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub prec1: f64,
    pub mean_iou: f64,
}

/// Everything a run produced, written to `run_report.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub strategy: StrategyKind,
    pub cycles: Vec<CycleReport>,
    /// Loss-prediction pair ordering accuracy over the whole run
    pub ranking_accuracy: Option<f64>,
    pub evaluation: Option<EvaluationReport>,
}

impl RunReport {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            cycles: Vec::new(),
            ranking_accuracy: None,
            evaluation: None,
        }
    }

    /// Best validation accuracy per cycle
    pub fn accuracies(&self) -> Vec<f64> {
        self.cycles.iter().map(|c| c.best_prec1).collect()
    }

    /// Best mIoU per cycle
    pub fn maps(&self) -> Vec<f64> {
        self.cycles.iter().map(|c| c.best_map).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// New network, initialised from a pretrained record when one is given
pub fn fresh_model<B: Backend>(
    config: &SegNetConfig,
    pretrained: Option<&Path>,
    device: &B::Device,
) -> Result<ActiveSegModel<B>> {
    let model = ActiveSegModel::new(config, device);
    match pretrained {
        Some(path) => {
            info!("Loading pretrained weights from {:?}", path);
            load_model(model, path, device)
        }
        None => Ok(model),
    }
}

/// Run every cycle of an active-learning experiment
pub fn run_active_learning<B: AutodiffBackend>(
    config: &RunConfig,
    device: &B::Device,
    sink: &dyn EventSink,
) -> Result<RunReport> {
    config.validate()?;
    let net_config = config
        .arch
        .config(config.classes)
        .with_loss_head(config.strategy.needs_loss_head());
    net_config.validate()?;
    B::seed(device, config.seed);

    let info = DatasetInfo::load(&config.data_dir)?;
    let train_set = SegDataset::new(
        &config.data_dir,
        Manifest::read(config.list_dir(), "train")?,
        config.classes,
    );
    if !train_set.has_labels() {
        return Err(SegmentationError::Dataset(
            "training needs a train_labels.txt list".to_string(),
        ));
    }
    let val_set = SegDataset::new(
        &config.data_dir,
        Manifest::read(config.list_dir(), "val")?,
        config.classes,
    );

    fs::create_dir_all(&config.save_path)?;
    config.save(&config.save_path.join("run_config.json"))?;

    let batcher = SegBatcher::new(info);
    let train_augmenter = Augmenter::new(config.train_augmentation());
    let val_augmenter = Augmenter::new(config.val_augmentation());
    let score_augmenter = Augmenter::new(AugmentationConfig::none());
    let train_loader = Loader {
        dataset: &train_set,
        batcher: &batcher,
        augmenter: &train_augmenter,
        batch_size: config.batch_size,
    };
    let val_loader = Loader {
        dataset: &val_set,
        batcher: &batcher,
        augmenter: &val_augmenter,
        batch_size: config.batch_size,
    };

    let schedule = config.schedule();
    info!(
        "{} cycles x {} images, strategy {}, lr {}",
        config.cycles,
        config.images_per_cycle,
        config.strategy,
        schedule.description()
    );

    let mut pool = SamplePool::new(train_set.manifest().len());
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut scorer = build_scorer::<B>(config.strategy, &config.scoring());
    let mut bootstrap = RandomScorer::new(config.seed);
    let mut tracker = RankingTracker::new();
    let mut previous: Option<ActiveSegModel<B::InnerBackend>> = None;
    let mut report = RunReport::new(config.strategy);

    for cycle in 0..config.cycles {
        sink.emit(TrainingEvent::CycleStarted {
            cycle,
            cycles: config.cycles,
            labeled: pool.labeled().len(),
            unlabeled: pool.unlabeled().len(),
        });

        let mut model = fresh_model::<B>(&net_config, config.pretrained.as_deref(), device)?;
        let mut start_epoch = 0;
        let mut best_prec1 = 0.0f64;
        let mut best_map = 0.0f64;

        if let Some(path) = config.resume.as_deref() {
            if path.is_file() {
                let (checkpoint, restored) = restore(path, model, device)?;
                model = restored;
                start_epoch = checkpoint.epoch;
                best_prec1 = checkpoint.best_prec1;
                best_map = checkpoint.best_map;
                sink.emit(TrainingEvent::ResumeLoaded {
                    path: path.to_path_buf(),
                    epoch: checkpoint.epoch,
                    best_prec1,
                });
            } else {
                sink.emit(TrainingEvent::CheckpointMissing {
                    path: path.to_path_buf(),
                });
            }
        }

        if config.evaluate {
            let stats = validate(
                &model.valid(),
                &val_loader,
                &mut rng,
                config.print_freq,
                device,
                sink,
            )?;
            sink.emit(TrainingEvent::EvaluationOnly {
                prec1: stats.score,
                mean_iou: stats.mean_iou,
            });
            report.evaluation = Some(EvaluationReport {
                prec1: stats.score,
                mean_iou: stats.mean_iou,
            });
            report.save(&config.save_path.join("run_report.json"))?;
            return Ok(report);
        }

        let (strategy_name, scores) = {
            let active: &mut dyn Scorer<B> = if previous.is_some() {
                scorer.as_mut()
            } else {
                &mut bootstrap
            };
            let ctx = ScoringContext::<B> {
                cycle,
                model: previous.as_ref(),
                dataset: &train_set,
                batcher: &batcher,
                augmenter: &score_augmenter,
                pool: &pool,
                batch_size: config.batch_size,
                device,
                sink,
            };
            let scores = active.score(&ctx)?;
            (active.name(), scores)
        };

        let selected = select(&scores, &mut pool, config.images_per_cycle)?;
        sink.emit(TrainingEvent::SelectionMade {
            cycle,
            strategy: strategy_name.to_string(),
            selected: selected.clone(),
        });
        if let Some(path) = config.selection_csv_for(cycle) {
            write_selection_report(&path, &train_set, &selected, &scores)?;
        }

        let mut optimizer = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(config.momentum)
                    .with_dampening(0.0),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
            .init();

        let manager = CheckpointManager::new(config.cycle_dir(cycle), config.save_iter);
        let labeled = pool.labeled().to_vec();

        for epoch in start_epoch..config.epochs {
            let lr = schedule.get_lr(epoch);
            sink.emit(TrainingEvent::EpochStarted { cycle, epoch, lr });

            let options = TrainOptions {
                epoch,
                lr,
                print_freq: config.print_freq,
                lamda: config.lamda,
                lp_warmup_epochs: config.lp_warmup_epochs,
                lp_detach_epoch: config.lp_detach_epoch,
            };
            let (trained, train_stats) = train_epoch(
                model,
                &mut optimizer,
                &train_loader,
                &labeled,
                &options,
                &mut tracker,
                &mut rng,
                device,
                sink,
            )?;
            model = trained;

            let stats = validate(
                &model.valid(),
                &val_loader,
                &mut rng,
                config.print_freq,
                device,
                sink,
            )?;

            let is_best = stats.score > best_prec1;
            best_prec1 = best_prec1.max(stats.score);
            best_map = best_map.max(stats.mean_iou);

            let checkpoint =
                Checkpoint::new(epoch + 1, config.arch.name(), best_prec1, best_map, cycle);
            let saved = manager.save(&checkpoint, &model, is_best)?;

            sink.emit(TrainingEvent::EpochCompleted {
                cycle,
                epoch,
                train_loss: train_stats.loss,
                prec1: stats.score,
                mean_iou: stats.mean_iou,
                is_best,
            });
            sink.emit(TrainingEvent::CheckpointSaved {
                path: saved.latest,
                is_best,
                archived: saved.archived,
            });
        }

        sink.emit(TrainingEvent::CycleCompleted {
            cycle,
            labeled: labeled.len(),
            best_prec1,
            best_map,
        });
        report.cycles.push(CycleReport {
            cycle,
            labeled: labeled.len(),
            best_prec1,
            best_map,
        });
        info!(
            "{} accuracies: {:?} mAPs: {:?}",
            config.strategy,
            report.accuracies(),
            report.maps()
        );

        previous = Some(model.valid());
    }

    if config.strategy.needs_loss_head() {
        report.ranking_accuracy = Some(tracker.accuracy());
    }
    report.save(&config.save_path.join("run_report.json"))?;
    Ok(report)
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::model::Architecture;
    use crate::utils::events::MemorySink;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    const SIDE: u32 = 64;

    fn write_split(dir: &Path, phase: &str, count: usize) {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for i in 0..count {
            let image = format!("{}_{}.png", phase, i);
            let label = format!("{}_{}_gt.png", phase, i);
            RgbImage::from_fn(SIDE, SIDE, |x, y| {
                Rgb([(x * 4) as u8, (y * 4) as u8, (i * 50) as u8])
            })
                .save(dir.join(&image))
                .unwrap();
            GrayImage::from_fn(SIDE, SIDE, |x, _| Luma([if x < SIDE / 2 { 0 } else { 1 }]))
                .save(dir.join(&label))
                .unwrap();
            images.push(image);
            labels.push(label);
        }
        Manifest::new(phase, images, Some(labels))
            .unwrap()
            .write(dir)
            .unwrap();
    }

    fn synthetic_config(dir: &Path) -> RunConfig {
        write_split(dir, "train", 5);
        write_split(dir, "val", 2);
        DatasetInfo::default().save(dir).unwrap();
        RunConfig {
            data_dir: dir.to_path_buf(),
            save_path: dir.join("runs"),
            classes: 2,
            crop_size: 32,
            arch: Architecture::DrnDTiny,
            batch_size: 2,
            epochs: 1,
            cycles: 2,
            images_per_cycle: 2,
            print_freq: 1,
            ..RunConfig::default()
        }
    }

    fn selections(sink: &MemorySink) -> Vec<Vec<usize>> {
        sink.events()
            .into_iter()
            .filter_map(|e| match e {
                TrainingEvent::SelectionMade { selected, .. } => Some(selected),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_two_cycles_grow_pool_without_repeats() {
        let dir = TempDir::new().unwrap();
        let config = synthetic_config(dir.path());
        let sink = MemorySink::new();

        let report =
            run_active_learning::<TestBackend>(&config, &Default::default(), &sink).unwrap();

        let picked: Vec<usize> = selections(&sink).into_iter().flatten().collect();
        let unique: BTreeSet<usize> = picked.iter().copied().collect();
        assert_eq!(picked.len(), 4);
        assert_eq!(unique.len(), 4);

        assert_eq!(report.cycles.len(), 2);
        assert_eq!(report.cycles[0].labeled, 2);
        assert_eq!(report.cycles[1].labeled, 4);
        assert!(report.ranking_accuracy.is_none());

        let cycle_dir = config.cycle_dir(1);
        assert!(cycle_dir.join("checkpoint_latest.json").exists());
        assert!(cycle_dir.join("checkpoint_001.json").exists());
        assert!(config.save_path.join("run_report.json").exists());
        assert!(config.save_path.join("run_config.json").exists());
    }

    #[test]
    fn test_loss_prediction_run_scores_with_previous_model() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig {
            strategy: StrategyKind::LossPrediction,
            selection_csv: Some(dir.path().join("selected.csv")),
            epochs: 2,
            lp_warmup_epochs: 0,
            ..synthetic_config(dir.path())
        };
        let sink = MemorySink::new();

        let report =
            run_active_learning::<TestBackend>(&config, &Default::default(), &sink).unwrap();

        let strategies: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TrainingEvent::SelectionMade { strategy, .. } => Some(strategy),
                _ => None,
            })
            .collect();
        assert_eq!(strategies, vec!["random", "loss-prediction"]);
        assert!(report.ranking_accuracy.is_some());
        assert!(sink.count(|e| matches!(
            e,
            TrainingEvent::TrainProgress { epoch: 1, ranking_accuracy: Some(_), .. }
        )) > 0);
        assert_eq!(
            sink.count(|e| matches!(
                e,
                TrainingEvent::TrainProgress { epoch: 0, ranking_accuracy: Some(_), .. }
            )),
            0
        );
        assert!(dir.path().join("selected_cycle_01.csv").exists());
    }

    #[test]
    fn test_evaluate_only_stops_after_one_validation() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig {
            evaluate: true,
            resume: Some(PathBuf::from("does/not/exist.json")),
            ..synthetic_config(dir.path())
        };
        let sink = MemorySink::new();

        let report =
            run_active_learning::<TestBackend>(&config, &Default::default(), &sink).unwrap();

        assert!(report.cycles.is_empty());
        assert!(report.evaluation.is_some());
        assert_eq!(
            sink.count(|e| matches!(e, TrainingEvent::CheckpointMissing { .. })),
            1
        );
        assert_eq!(
            sink.count(|e| matches!(e, TrainingEvent::EpochStarted { .. })),
            0
        );
        assert!(selections(&sink).is_empty());
    }

    #[test]
    fn test_resume_skips_completed_epochs() {
        let dir = TempDir::new().unwrap();
        let first = RunConfig {
            cycles: 1,
            ..synthetic_config(dir.path())
        };
        run_active_learning::<TestBackend>(&first, &Default::default(), &MemorySink::new())
            .unwrap();

        let resumed = RunConfig {
            resume: Some(first.cycle_dir(0).join("checkpoint_latest.json")),
            epochs: 2,
            ..first.clone()
        };
        let sink = MemorySink::new();
        run_active_learning::<TestBackend>(&resumed, &Default::default(), &sink).unwrap();

        assert_eq!(
            sink.count(|e| matches!(e, TrainingEvent::ResumeLoaded { epoch: 1, .. })),
            1
        );
        assert_eq!(
            sink.count(|e| matches!(e, TrainingEvent::EpochStarted { epoch: 1, .. })),
            1
        );
        assert_eq!(
            sink.count(|e| matches!(e, TrainingEvent::EpochStarted { epoch: 0, .. })),
            0
        );
    }

    #[test]
    fn test_invalid_config_fails_before_reading_data() {
        let config = RunConfig {
            batch_size: 0,
            data_dir: PathBuf::from("/nonexistent"),
            ..RunConfig::default()
        };
        let result =
            run_active_learning::<TestBackend>(&config, &Default::default(), &MemorySink::new());
        assert!(matches!(result, Err(SegmentationError::Config(_))));
    }
}
