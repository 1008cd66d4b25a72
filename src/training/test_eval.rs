//! Test-time prediction and evaluation
//!
//! Runs a trained network over one phase manifest, one image at a time, and writes
//! class-id maps plus palette renderings. Multi-scale mode averages class
//! probabilities over several input scales; the per-class probability planes are
//! resized back to the input size in parallel with rayon.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::{data::dataloader::batcher::Batcher, tensor::backend::Backend};
use image::{imageops, imageops::FilterType, GrayImage, Luma};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::transforms::resize_plane;
use crate::dataset::{DatasetInfo, Manifest, SegBatch, SegBatcher, SegDataset, SegItem};
use crate::model::{check_input_size, ActiveSegModel, Architecture};
use crate::training::checkpoint::restore;
use crate::training::cycle::fresh_model;
use crate::training::palette::Palette;
use crate::training::step::{predictions, to_f32_vec};
use crate::utils::error::{Result, SegmentationError};
use crate::utils::events::{EventSink, TrainingEvent};
use crate::utils::meter::RunningMeter;
use crate::utils::metrics::ConfusionHistogram;

/// Input scales of multi-scale testing; the first must be 1.0
pub const MS_SCALES: [f32; 6] = [1.0, 0.5, 0.75, 1.25, 1.5, 1.75];

/// Settings of a `test` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub data_dir: PathBuf,
    pub list_dir: Option<PathBuf>,
    pub classes: usize,
    pub arch: Architecture,
    /// The checkpoint carries a loss-prediction head
    pub loss_head: bool,
    pub resume: Option<PathBuf>,
    pub pretrained: Option<PathBuf>,
    pub phase: String,
    pub multi_scale: bool,
    /// Report mIoU even for the `test` phase
    pub with_gt: bool,
    pub test_suffix: String,
    pub save_path: PathBuf,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            list_dir: None,
            classes: 19,
            arch: Architecture::DrnD22,
            loss_head: false,
            resume: None,
            pretrained: None,
            phase: "val".to_string(),
            multi_scale: false,
            with_gt: false,
            test_suffix: String::new(),
            save_path: PathBuf::from("output/test"),
        }
    }
}

impl TestConfig {
    pub fn has_gt(&self) -> bool {
        self.phase != "test" || self.with_gt
    }

    pub fn list_dir(&self) -> &Path {
        self.list_dir.as_deref().unwrap_or(&self.data_dir)
    }

    /// `{save_path}/{arch}_{epoch:03}_{phase}[_{suffix}][_ms]`
    pub fn output_dir(&self, epoch: usize) -> PathBuf {
        let mut name = format!("{}_{:03}_{}", self.arch.name(), epoch, self.phase);
        if !self.test_suffix.is_empty() {
            name.push('_');
            name.push_str(&self.test_suffix);
        }
        if self.multi_scale {
            name.push_str("_ms");
        }
        self.save_path.join(name)
    }
}

/// Result of a `test` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub output_dir: PathBuf,
    pub images: usize,
    pub mean_iou: Option<f64>,
    pub per_class_iou: Option<Vec<f64>>,
}

/// Predict every image of `config.phase` and write the renderings
pub fn run_test<B: Backend>(
    config: &TestConfig,
    device: &B::Device,
    sink: &dyn EventSink,
) -> Result<TestReport> {
    if config.classes == 0 {
        return Err(SegmentationError::Config(
            "classes must be at least 1".to_string(),
        ));
    }
    let net_config = config
        .arch
        .config(config.classes)
        .with_loss_head(config.loss_head);
    net_config.validate()?;

    let mut model = fresh_model::<B>(&net_config, config.pretrained.as_deref(), device)?;
    let mut epoch = 0;
    match config.resume.as_deref() {
        Some(path) if path.is_file() => {
            let (checkpoint, restored) = restore(path, model, device)?;
            model = restored;
            epoch = checkpoint.epoch;
            sink.emit(TrainingEvent::ResumeLoaded {
                path: path.to_path_buf(),
                epoch,
                best_prec1: checkpoint.best_prec1,
            });
        }
        Some(path) => sink.emit(TrainingEvent::CheckpointMissing {
            path: path.to_path_buf(),
        }),
        None if config.pretrained.is_none() => {
            warn!("No checkpoint or pretrained record given; predicting with random weights")
        }
        None => {}
    }

    let manifest = Manifest::read(config.list_dir(), &config.phase)?;
    let has_gt = match (config.has_gt(), manifest.has_labels()) {
        (true, false) if config.with_gt => {
            return Err(SegmentationError::Dataset(format!(
                "phase '{}' has no label list; pass a phase with ground truth or drop --with-gt",
                config.phase
            )))
        }
        (true, false) => {
            warn!(
                "Phase '{}' has no label list; writing predictions without scoring",
                config.phase
            );
            false
        }
        (expected, _) => expected,
    };
    let dataset = SegDataset::new(&config.data_dir, manifest, config.classes);
    let batcher = SegBatcher::new(DatasetInfo::load(&config.data_dir)?);
    let palette = Palette::for_classes(config.classes);

    let output_dir = config.output_dir(epoch);
    fs::create_dir_all(&output_dir)?;
    info!("Writing predictions to {:?}", output_dir);

    let total = dataset.manifest().len();
    let mut hist = ConfusionHistogram::new(config.classes);
    let mut batch_time = RunningMeter::new();

    for index in 0..total {
        let start = Instant::now();
        let item = if has_gt {
            dataset.load(index)?
        } else {
            dataset.load_image(index)?
        };
        let prediction = if config.multi_scale {
            predict_multi_scale(&model, &batcher, &item, config.classes, device)?
        } else {
            predict_single(&model, &batcher, &item, device)?
        };

        let (width, height) = item.dimensions();
        let class_map = GrayImage::from_fn(width, height, |x, y| {
            Luma([prediction[(y * width + x) as usize] as u8])
        });
        save_prediction(&output_dir, &item.name, &class_map, &palette)?;

        let mean_iou = match (has_gt, item.label.as_ref()) {
            (true, Some(label)) => {
                let labels: Vec<Option<usize>> =
                    label.pixels.iter().map(|p| p.map(usize::from)).collect();
                hist.update_masked(&prediction, &labels);
                Some(hist.mean_iou())
            }
            _ => None,
        };

        batch_time.update(start.elapsed().as_secs_f64(), 1);
        sink.emit(TrainingEvent::TestImage {
            index,
            total,
            name: item.name.clone(),
            mean_iou,
        });
    }

    info!(
        "Predicted {} images ({:.3}s per image)",
        total, batch_time.avg
    );

    let (mean_iou, per_class_iou) = if has_gt {
        let ious: Vec<f64> = hist.per_class_iou().iter().map(|iou| iou * 100.0).collect();
        info!(
            "Per-class IoU: {}",
            ious.iter()
                .map(|iou| format!("{:.3}", iou))
                .collect::<Vec<_>>()
                .join(" ")
        );
        info!("Pixel accuracy: {:.3}", hist.pixel_accuracy());
        (Some(hist.mean_iou()), Some(ious))
    } else {
        (None, None)
    };

    Ok(TestReport {
        output_dir,
        images: total,
        mean_iou,
        per_class_iou,
    })
}

fn predict_single<B: Backend>(
    model: &ActiveSegModel<B>,
    batcher: &SegBatcher,
    item: &SegItem,
    device: &B::Device,
) -> Result<Vec<usize>> {
    let (width, height) = item.dimensions();
    check_input_size(height as usize, width as usize)?;
    let batch: SegBatch<B> = batcher.batch(vec![item.clone()], device);
    predictions(model.forward(batch.images).log_probs)
}

/// Summed class probabilities over [`MS_SCALES`], argmaxed per pixel
fn predict_multi_scale<B: Backend>(
    model: &ActiveSegModel<B>,
    batcher: &SegBatcher,
    item: &SegItem,
    classes: usize,
    device: &B::Device,
) -> Result<Vec<usize>> {
    let (width, height) = item.dimensions();
    let (w, h) = (width as usize, height as usize);
    check_input_size(h, w)?;
    let mut total = vec![0.0f32; classes * h * w];

    for &scale in MS_SCALES.iter() {
        let scaled_w = ((width as f32 * scale).round() as u32).max(1);
        let scaled_h = ((height as f32 * scale).round() as u32).max(1);
        if check_input_size(scaled_h as usize, scaled_w as usize).is_err() {
            debug!("Skipping scale {} for '{}': too small", scale, item.name);
            continue;
        }
        let scaled = SegItem {
            image: imageops::resize(&item.image, scaled_w, scaled_h, FilterType::Triangle),
            label: None,
            ..item.clone()
        };

        let batch: SegBatch<B> = batcher.batch(vec![scaled], device);
        let probs = to_f32_vec(model.forward(batch.images).log_probs.exp())?;
        let resized = resize_channels(&probs, classes, scaled_h as usize, scaled_w as usize, h, w);
        for (sum, p) in total.iter_mut().zip(resized) {
            *sum += p;
        }
    }

    Ok(argmax_channels(&total, classes, h * w))
}

/// Resize a `[classes, h, w]` stack to `[classes, oh, ow]`, one rayon task per channel
pub fn resize_channels(
    src: &[f32],
    classes: usize,
    h: usize,
    w: usize,
    oh: usize,
    ow: usize,
) -> Vec<f32> {
    if h == oh && w == ow {
        return src.to_vec();
    }
    let mut out = vec![0.0f32; classes * oh * ow];
    out.par_chunks_mut(oh * ow)
        .enumerate()
        .for_each(|(c, plane)| resize_plane(&src[c * h * w..(c + 1) * h * w], h, w, plane, oh, ow));
    out
}

/// Index of the largest channel value per pixel
fn argmax_channels(values: &[f32], classes: usize, plane: usize) -> Vec<usize> {
    (0..plane)
        .map(|i| {
            (0..classes)
                .max_by(|&a, &b| {
                    values[a * plane + i]
                        .partial_cmp(&values[b * plane + i])
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0)
        })
        .collect()
}

/// `a/b.png` becomes `{dir}/a/b.png` and `{dir}/a/b_color.png`
fn save_prediction(dir: &Path, name: &str, class_map: &GrayImage, palette: &Palette) -> Result<()> {
    let stem = Path::new(name).with_extension("");
    let class_path = dir.join(&stem).with_extension("png");
    let color_path = dir.join(format!("{}_color.png", stem.to_string_lossy()));
    if let Some(parent) = class_path.parent() {
        fs::create_dir_all(parent)?;
    }
    class_map.save(&class_path)?;
    palette.colorize(class_map).save(&color_path)?;
    Ok(())
}
