//! Train and validate passes
//!
//! The segmentation loss is kept per image (mean NLL over all spatial positions,
//! ignored pixels contributing zero) so the loss-prediction head has one target
//! per image. Batches are processed strictly in sequence; a batch that fails to
//! load aborts the pass.

use std::time::Instant;

use burn::{
    data::dataloader::batcher::Batcher,
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::dataset::{Augmenter, SegBatch, SegBatcher, SegDataset};
use crate::model::{check_input_size, ActiveSegModel, SegOutput};
use crate::training::ranking::{ranking_loss, RankingTracker, DEFAULT_MARGIN};
use crate::utils::error::{Result, SegmentationError};
use crate::utils::events::{EventSink, TrainingEvent};
use crate::utils::meter::RunningMeter;
use crate::utils::metrics::{pixel_accuracy, ConfusionHistogram};

/// Per-image mean negative log-likelihood, shape `[batch]`
pub fn per_image_loss<B: Backend>(
    log_probs: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    valid: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let [n, _, h, w] = log_probs.dims();
    let picked = log_probs
        .gather(1, targets.reshape([n, 1, h, w]))
        .reshape([n, h * w]);
    let nll = picked.neg() * valid.reshape([n, h * w]);
    nll.sum_dim(1).reshape([n]).div_scalar((h * w) as f64)
}

pub(crate) fn to_f32_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SegmentationError::Training(format!("tensor readback failed: {:?}", e)))
}

pub(crate) fn to_usize_vec<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Int>,
) -> Result<Vec<usize>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| SegmentationError::Training(format!("tensor readback failed: {:?}", e)))?;
    Ok(values.into_iter().map(|v| v.max(0) as usize).collect())
}

/// Argmax class per pixel, flattened
pub(crate) fn predictions<B: Backend>(log_probs: Tensor<B, 4>) -> Result<Vec<usize>> {
    to_usize_vec(log_probs.argmax(1))
}

/// Host-side targets and validity mask of a batch
pub(crate) fn batch_labels<B: Backend>(batch: &SegBatch<B>) -> Result<(Vec<usize>, Vec<bool>)> {
    let targets = to_usize_vec(batch.targets.clone())?;
    let valid = to_f32_vec(batch.valid.clone())?
        .into_iter()
        .map(|v| v > 0.5)
        .collect();
    Ok((targets, valid))
}

/// Data a pass iterates over
pub struct Loader<'a> {
    pub dataset: &'a SegDataset,
    pub batcher: &'a SegBatcher,
    pub augmenter: &'a Augmenter,
    pub batch_size: usize,
}

impl Loader<'_> {
    fn batches(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size.max(1))
    }
}

/// Knobs for one training epoch
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    pub epoch: usize,
    pub lr: f64,
    pub print_freq: usize,
    /// Weight of the ranking loss
    pub lamda: f64,
    /// Ranking loss contributes only when `epoch > lp_warmup_epochs`
    pub lp_warmup_epochs: usize,
    /// From this epoch on the loss head no longer back-propagates into the backbone
    pub lp_detach_epoch: usize,
}

impl TrainOptions {
    pub fn ranking_active(&self) -> bool {
        self.epoch > self.lp_warmup_epochs
    }

    pub fn detach_head(&self) -> bool {
        self.epoch >= self.lp_detach_epoch
    }
}

/// Loss terms of one training batch
pub struct BatchLoss<B: Backend> {
    /// What gets back-propagated
    pub total: Tensor<B, 1>,
    /// Mean per-image segmentation loss
    pub segmentation: Tensor<B, 1>,
    /// Present once ranking is active and the model has a loss head
    pub ranking: Option<Tensor<B, 1>>,
}

/// Blend the per-image losses with the ranking loss of the loss head
///
/// Updates `tracker` with the batch's pairs whenever the ranking term is used.
pub fn batch_loss<B: Backend>(
    model: &ActiveSegModel<B>,
    output: &SegOutput<B>,
    image_losses: Tensor<B, 1>,
    options: &TrainOptions,
    tracker: &mut RankingTracker,
) -> Result<BatchLoss<B>> {
    let segmentation = image_losses.clone().mean();
    let predicted = if options.ranking_active() {
        model.predict_loss(output, options.detach_head())
    } else {
        None
    };

    let Some(predicted) = predicted else {
        return Ok(BatchLoss {
            total: segmentation.clone(),
            segmentation,
            ranking: None,
        });
    };

    tracker.update(&to_f32_vec(image_losses.clone())?, &to_f32_vec(predicted.clone())?);
    let ranking = ranking_loss(predicted, image_losses, DEFAULT_MARGIN);
    Ok(BatchLoss {
        total: segmentation.clone() + ranking.clone().mul_scalar(options.lamda),
        segmentation,
        ranking: Some(ranking),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainStats {
    pub loss: f64,
    pub score: f64,
    pub batches: usize,
}

/// One pass over `indices` with parameter updates
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<B, O>(
    mut model: ActiveSegModel<B>,
    optimizer: &mut O,
    loader: &Loader<'_>,
    indices: &[usize],
    options: &TrainOptions,
    tracker: &mut RankingTracker,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
    sink: &dyn EventSink,
) -> Result<(ActiveSegModel<B>, TrainStats)>
where
    B: AutodiffBackend,
    O: Optimizer<ActiveSegModel<B>, B>,
{
    let mut order = indices.to_vec();
    order.shuffle(rng);
    let batches = loader.batches(order.len());

    let mut batch_time = RunningMeter::new();
    let mut data_time = RunningMeter::new();
    let mut losses = RunningMeter::new();
    let mut scores = RunningMeter::new();
    let ranking_active = options.ranking_active();

    let mut end = Instant::now();
    for (batch_idx, chunk) in order.chunks(loader.batch_size.max(1)).enumerate() {
        let items = loader.dataset.load_batch(chunk, loader.augmenter, rng)?;
        let batch: SegBatch<B> = loader.batcher.batch(items, device);
        data_time.update(end.elapsed().as_secs_f64(), 1);

        let (targets, valid) = batch_labels(&batch)?;
        let output = model.forward(batch.images.clone());
        let image_losses = per_image_loss(
            output.log_probs.clone(),
            batch.targets.clone(),
            batch.valid.clone(),
        );
        let preds = predictions(output.log_probs.clone())?;

        let loss = batch_loss(&model, &output, image_losses, options, tracker)?.total;

        let loss_value: f64 = loss.clone().into_scalar().elem();
        let n = chunk.len();
        losses.update(loss_value, n);
        scores.update(pixel_accuracy(&preds, &targets, &valid), n);

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(options.lr, model, grads);

        batch_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if batch_idx % options.print_freq.max(1) == 0 || batch_idx + 1 == batches {
            sink.emit(TrainingEvent::TrainProgress {
                epoch: options.epoch,
                batch: batch_idx,
                batches,
                loss: losses.avg,
                score: scores.avg,
                batch_time: batch_time.avg,
                data_time: data_time.avg,
                ranking_accuracy: (ranking_active && model.loss_head.is_some())
                    .then(|| tracker.accuracy()),
            });
        }
    }

    Ok((
        model,
        TrainStats {
            loss: losses.avg,
            score: scores.avg,
            batches,
        },
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationStats {
    pub loss: f64,
    /// Average top-1 pixel accuracy in percent
    pub score: f64,
    /// mIoU in percent from the histogram of the whole pass
    ///
    /// This is the final snapshot, not the average of the per-batch running
    /// snapshots, so it does not depend on batch size or order.
    pub mean_iou: f64,
    pub per_class_iou: Vec<f64>,
}

/// Forward-only pass accumulating the confusion histogram
pub fn validate<B: Backend>(
    model: &ActiveSegModel<B>,
    loader: &Loader<'_>,
    rng: &mut ChaCha8Rng,
    print_freq: usize,
    device: &B::Device,
    sink: &dyn EventSink,
) -> Result<ValidationStats> {
    if !loader.dataset.has_labels() {
        return Err(SegmentationError::Dataset(
            "validation needs a label list".to_string(),
        ));
    }

    let indices: Vec<usize> = (0..loader.dataset.manifest().len()).collect();
    let batches = loader.batches(indices.len());
    let mut hist = ConfusionHistogram::new(model.num_classes());
    let mut losses = RunningMeter::new();
    let mut scores = RunningMeter::new();

    for (batch_idx, chunk) in indices.chunks(loader.batch_size.max(1)).enumerate() {
        let items = loader.dataset.load_batch(chunk, loader.augmenter, rng)?;
        if let Some(item) = items.first() {
            let (width, height) = item.dimensions();
            check_input_size(height as usize, width as usize)?;
        }
        let batch: SegBatch<B> = loader.batcher.batch(items, device);
        let (targets, valid) = batch_labels(&batch)?;

        let output = model.forward(batch.images);
        let loss: f64 = per_image_loss(output.log_probs.clone(), batch.targets, batch.valid)
            .mean()
            .into_scalar()
            .elem();
        let preds = predictions(output.log_probs)?;

        hist.update(&preds, &targets, Some(&valid));
        losses.update(loss, chunk.len());
        scores.update(pixel_accuracy(&preds, &targets, &valid), chunk.len());

        sink.emit(TrainingEvent::ValidationProgress {
            batch: batch_idx,
            batches,
            loss: losses.avg,
            score: scores.avg,
            mean_iou: hist.mean_iou(),
            periodic: batch_idx % print_freq.max(1) == 0 || batch_idx + 1 == batches,
        });
    }

    Ok(ValidationStats {
        loss: losses.avg,
        score: scores.avg,
        mean_iou: hist.mean_iou(),
        per_class_iou: hist.per_class_iou(),
    })
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::dataset::{AugmentationConfig, DatasetInfo, Manifest};
    use crate::model::Architecture;
    use crate::utils::events::MemorySink;
    use burn::backend::Autodiff;
    use burn::optim::SgdConfig;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use rand::SeedableRng;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray;
    type TrainBackend = Autodiff<NdArray>;

    const SIDE: usize = 32;

    fn loss_head_model(device: &<TrainBackend as Backend>::Device) -> ActiveSegModel<TrainBackend> {
        let config = Architecture::DrnDTiny.config(2).with_loss_head(true);
        ActiveSegModel::new(&config, device)
    }

    fn options(epoch: usize, lamda: f64, lp_detach_epoch: usize) -> TrainOptions {
        TrainOptions {
            epoch,
            lr: 0.01,
            print_freq: 1,
            lamda,
            lp_warmup_epochs: 1,
            lp_detach_epoch,
        }
    }

    fn images(device: &<TrainBackend as Backend>::Device) -> Tensor<TrainBackend, 4> {
        let values: Vec<f32> = (0..3 * 3 * SIDE * SIDE)
            .map(|i| ((i * 7919) % 251) as f32 / 251.0 - 0.5)
            .collect();
        Tensor::from_floats(TensorData::new(values, [3, 3, SIDE, SIDE]), device)
    }

    fn labels(
        device: &<TrainBackend as Backend>::Device,
    ) -> (Tensor<TrainBackend, 3, Int>, Tensor<TrainBackend, 3>) {
        let targets: Vec<i64> = (0..3 * SIDE * SIDE)
            .map(|i| if i % SIDE < SIDE / 2 { 0 } else { 1 })
            .collect();
        (
            Tensor::from_data(TensorData::new(targets, [3, SIDE, SIDE]), device),
            Tensor::ones([3, SIDE, SIDE], device),
        )
    }

    fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
        to_f32_vec(tensor).unwrap()[0]
    }

    fn losses_for(
        model: &ActiveSegModel<TrainBackend>,
        options: &TrainOptions,
        tracker: &mut RankingTracker,
    ) -> BatchLoss<TrainBackend> {
        let device = Default::default();
        let output = model.forward(images(&device));
        let (targets, valid) = labels(&device);
        let image_losses = per_image_loss(output.log_probs.clone(), targets, valid);
        batch_loss(model, &output, image_losses, options, tracker).unwrap()
    }

    /// Gradient of the blended loss with respect to the input images
    fn input_gradient(model: &ActiveSegModel<TrainBackend>, options: &TrainOptions) -> Vec<f32> {
        let device = Default::default();
        let x = images(&device).require_grad();
        let output = model.forward(x.clone());
        let (targets, valid) = labels(&device);
        let image_losses = per_image_loss(output.log_probs.clone(), targets, valid);
        let loss = batch_loss(model, &output, image_losses, options, &mut RankingTracker::new())
            .unwrap();
        let grads = loss.total.backward();
        to_f32_vec(x.grad(&grads).unwrap()).unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    fn write_dataset(dir: &Path, count: usize) -> SegDataset {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for i in 0..count {
            let image = format!("img_{}.png", i);
            let label = format!("gt_{}.png", i);
            RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, (i * 60) as u8]))
                .save(dir.join(&image))
                .unwrap();
            GrayImage::from_fn(64, 64, |x, _| Luma([if x < 32 { 0 } else { 1 }]))
                .save(dir.join(&label))
                .unwrap();
            images.push(image);
            labels.push(label);
        }
        SegDataset::new(dir, Manifest::new("train", images, Some(labels)).unwrap(), 2)
    }

    fn ranking_of_progress(sink: &MemorySink) -> Vec<Option<f64>> {
        sink.events()
            .into_iter()
            .filter_map(|e| match e {
                TrainingEvent::TrainProgress {
                    ranking_accuracy, ..
                } => Some(ranking_accuracy),
                _ => None,
            })
            .collect()
    }

    fn run_epoch(epoch: usize) -> (TrainStats, RankingTracker, MemorySink) {
        let dir = TempDir::new().unwrap();
        let dataset = write_dataset(dir.path(), 4);
        let batcher = SegBatcher::new(DatasetInfo::default());
        let augmenter = Augmenter::new(AugmentationConfig::training(SIDE as u32, 0.0, 0.0));
        let loader = Loader {
            dataset: &dataset,
            batcher: &batcher,
            augmenter: &augmenter,
            batch_size: 2,
        };

        let device = Default::default();
        let mut optimizer = SgdConfig::new().init::<TrainBackend, ActiveSegModel<TrainBackend>>();
        let mut tracker = RankingTracker::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let sink = MemorySink::new();
        let (_, stats) = train_epoch(
            loss_head_model(&device),
            &mut optimizer,
            &loader,
            &[0, 1, 2, 3],
            &options(epoch, 1.0, 100),
            &mut tracker,
            &mut rng,
            &device,
            &sink,
        )
        .unwrap();
        (stats, tracker, sink)
    }

    #[test]
    fn test_per_image_loss_ignores_masked_pixels() {
        let device = Default::default();
        // 1 image, 2 classes, 1x2 pixels; log-probs chosen directly
        let log_probs = Tensor::<TestBackend, 4>::from_floats(
            TensorData::new(vec![-0.5f32, -2.0, -1.0, -0.1], [1, 2, 1, 2]),
            &device,
        );
        let targets = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![0i64, 1], [1, 1, 2]),
            &device,
        );

        let all = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);
        let loss = to_f32_vec(per_image_loss(log_probs.clone(), targets.clone(), all)).unwrap();
        assert!((loss[0] - (0.5 + 0.1) / 2.0).abs() < 1e-6);

        let first_only = Tensor::<TestBackend, 3>::from_floats(
            TensorData::new(vec![1.0f32, 0.0], [1, 1, 2]),
            &device,
        );
        let loss = to_f32_vec(per_image_loss(log_probs, targets, first_only)).unwrap();
        assert!((loss[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_loss_is_kept_per_image() {
        let device = Default::default();
        let log_probs = Tensor::<TestBackend, 4>::zeros([3, 4, 2, 2], &device);
        let targets = Tensor::<TestBackend, 3, Int>::zeros([3, 2, 2], &device);
        let valid = Tensor::<TestBackend, 3>::ones([3, 2, 2], &device);
        assert_eq!(per_image_loss(log_probs, targets, valid).dims(), [3]);
    }

    #[test]
    fn test_no_ranking_term_during_warmup() {
        let device = Default::default();
        let model = loss_head_model(&device);
        let mut tracker = RankingTracker::new();

        let loss = losses_for(&model, &options(1, 1.0, 100), &mut tracker);
        assert!(loss.ranking.is_none());
        assert_eq!(tracker.total, 0);
        assert_eq!(scalar(loss.total), scalar(loss.segmentation));
    }

    #[test]
    fn test_ranking_term_is_weighted_after_warmup() {
        let device = Default::default();
        let model = loss_head_model(&device);
        let mut tracker = RankingTracker::new();

        let loss = losses_for(&model, &options(2, 0.5, 100), &mut tracker);
        let ranking = scalar(loss.ranking.unwrap());
        let expected = scalar(loss.segmentation) + 0.5 * ranking;
        assert!((scalar(loss.total) - expected).abs() < 1e-5);
        // three images give three ordered pairs
        assert_eq!(tracker.total, 3);
    }

    #[test]
    fn test_detached_head_sends_no_gradient_into_backbone() {
        let device = Default::default();
        let model = loss_head_model(&device);

        let segmentation_only = input_gradient(&model, &options(0, 1.0, 100));
        let detached = input_gradient(&model, &options(5, 1.0, 5));
        let attached = input_gradient(&model, &options(5, 1.0, 100));

        assert!(max_abs_diff(&segmentation_only, &detached) < 1e-6);
        assert!(max_abs_diff(&segmentation_only, &attached) > 0.0);
    }

    #[test]
    fn test_train_epoch_counts_pairs_after_warmup() {
        let (stats, tracker, sink) = run_epoch(2);

        assert_eq!(stats.batches, 2);
        assert!(stats.loss.is_finite());
        // two batches of two images, one pair each
        assert_eq!(tracker.total, 2);
        let progress = ranking_of_progress(&sink);
        assert_eq!(progress.len(), 2);
        assert!(progress.iter().all(Option::is_some));
    }

    #[test]
    fn test_train_epoch_skips_ranking_during_warmup() {
        let (stats, tracker, sink) = run_epoch(1);

        assert_eq!(stats.batches, 2);
        assert_eq!(tracker.total, 0);
        assert!(ranking_of_progress(&sink).iter().all(Option::is_none));
    }

    #[test]
    fn test_validate_rejects_images_below_minimum() {
        let dir = TempDir::new().unwrap();
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for i in 0..2 {
            RgbImage::new(16, 16).save(dir.path().join(format!("v{}.png", i))).unwrap();
            GrayImage::new(16, 16).save(dir.path().join(format!("v{}_gt.png", i))).unwrap();
            images.push(format!("v{}.png", i));
            labels.push(format!("v{}_gt.png", i));
        }
        let dataset =
            SegDataset::new(dir.path(), Manifest::new("val", images, Some(labels)).unwrap(), 2);
        let batcher = SegBatcher::new(DatasetInfo::default());
        let augmenter = Augmenter::new(AugmentationConfig::none());
        let loader = Loader {
            dataset: &dataset,
            batcher: &batcher,
            augmenter: &augmenter,
            batch_size: 2,
        };

        let device = Default::default();
        let model = ActiveSegModel::<TestBackend>::new(&Architecture::DrnDTiny.config(2), &device);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let result = validate(&model, &loader, &mut rng, 1, &device, &MemorySink::new());
        assert!(matches!(result, Err(SegmentationError::InvalidInput(_))));
    }
}
