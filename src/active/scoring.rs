//! Scoring strategies
//!
//! A [`Scorer`] turns the current model and sample pool into a [`ScoreRecord`] over
//! the unlabeled images. Images that fail to load are reported through the event
//! sink and left out of the record; selection then simply never sees them.

use std::collections::BTreeMap;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion, Int, Tensor, TensorData},
};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::active::{DiscriminativePolicy, ScoreRecord, StrategyKind};
use crate::dataset::{Augmenter, SamplePool, SegBatch, SegBatcher, SegDataset, SegItem};
use crate::model::{
    check_input_size, ActiveSegModel, Discriminator, DiscriminatorConfig, SegOutput,
};
use crate::training::step::{per_image_loss, to_f32_vec};
use crate::utils::error::{Result, SegmentationError};
use crate::utils::events::{EventSink, TrainingEvent};

/// Settings shared by all scorers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub seed: u64,
    pub dal_policy: DiscriminativePolicy,
    /// Passes over the pooled embeddings per discriminator fit
    pub dal_epochs: usize,
    pub dal_hidden: usize,
    pub dal_lr: f64,
    pub dal_batch_size: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            seed: crate::DEFAULT_SEED,
            dal_policy: DiscriminativePolicy::MostUnlabeled,
            dal_epochs: 10,
            dal_hidden: 512,
            dal_lr: 1e-3,
            dal_batch_size: 64,
        }
    }
}

/// Everything a scorer may consult in one cycle
pub struct ScoringContext<'a, B: AutodiffBackend> {
    pub cycle: usize,
    /// Model trained in the previous cycle; `None` before the first training
    pub model: Option<&'a ActiveSegModel<B::InnerBackend>>,
    pub dataset: &'a SegDataset,
    pub batcher: &'a SegBatcher,
    pub augmenter: &'a Augmenter,
    pub pool: &'a SamplePool,
    pub batch_size: usize,
    pub device: &'a B::Device,
    pub sink: &'a dyn EventSink,
}

impl<'a, B: AutodiffBackend> ScoringContext<'a, B> {
    fn require_model(&self, scorer: &str) -> Result<&'a ActiveSegModel<B::InnerBackend>> {
        self.model.ok_or_else(|| {
            SegmentationError::Model(format!("{} scoring needs a trained model", scorer))
        })
    }

    /// Forward `indices` through `model` in batches of equally sized images
    ///
    /// Label maps are decoded only `with_labels`. Unreadable images and images
    /// below the network's minimum size are reported and skipped. `visit` gets the
    /// batch (its `indices` name the rows) and the model output.
    fn forward_each<F>(
        &self,
        model: &ActiveSegModel<B::InnerBackend>,
        indices: &[usize],
        with_labels: bool,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&SegBatch<B::InnerBackend>, SegOutput<B::InnerBackend>) -> Result<()>,
    {
        let mut rng = ChaCha8Rng::seed_from_u64(self.cycle as u64);
        for chunk in indices.chunks(self.batch_size.max(1)) {
            let mut groups: BTreeMap<(u32, u32), Vec<SegItem>> = BTreeMap::new();
            for &index in chunk {
                let loaded = if with_labels {
                    self.dataset.load(index)
                } else {
                    self.dataset.load_image(index)
                };
                let item = loaded.and_then(|item| {
                    let item = self.augmenter.apply(item, &mut rng);
                    let (width, height) = item.dimensions();
                    check_input_size(height as usize, width as usize)?;
                    Ok(item)
                });
                match item {
                    Ok(item) => groups.entry(item.dimensions()).or_default().push(item),
                    Err(err) => self.sink.emit(TrainingEvent::ScoringSkipped {
                        index,
                        reason: err.to_string(),
                    }),
                }
            }

            for items in groups.into_values() {
                let batch: SegBatch<B::InnerBackend> = self.batcher.batch(items, self.device);
                let output = model.forward(batch.images.clone());
                visit(&batch, output)?;
            }
        }
        Ok(())
    }

    fn unlabeled(&self) -> Vec<usize> {
        self.pool.unlabeled().iter().copied().collect()
    }
}

/// A selection strategy
pub trait Scorer<B: AutodiffBackend> {
    fn name(&self) -> &'static str;

    /// Score every image of `ctx.pool`'s unlabeled set that can be scored
    fn score(&mut self, ctx: &ScoringContext<'_, B>) -> Result<ScoreRecord>;
}

/// Scorer for a strategy name
pub fn build_scorer<B: AutodiffBackend>(
    kind: StrategyKind,
    config: &ScoringConfig,
) -> Box<dyn Scorer<B>> {
    match kind {
        StrategyKind::Random => Box::new(RandomScorer::new(config.seed)),
        StrategyKind::LossPrediction => Box::new(LossPredictionScorer),
        StrategyKind::Discriminative => Box::new(DiscriminativeScorer::new(config.clone())),
        StrategyKind::Oracle => Box::new(OracleScorer),
    }
}

/// Uniform scores from a seeded generator
#[derive(Debug, Clone)]
pub struct RandomScorer {
    seed: u64,
}

impl RandomScorer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl<B: AutodiffBackend> Scorer<B> for RandomScorer {
    fn name(&self) -> &'static str {
        StrategyKind::Random.name()
    }

    fn score(&mut self, ctx: &ScoringContext<'_, B>) -> Result<ScoreRecord> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(ctx.cycle as u64));
        Ok(ctx
            .pool
            .unlabeled()
            .iter()
            .map(|&index| (index, rng.gen::<f64>()))
            .collect())
    }
}

/// Scores are the loss-prediction head's outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct LossPredictionScorer;

impl<B: AutodiffBackend> Scorer<B> for LossPredictionScorer {
    fn name(&self) -> &'static str {
        StrategyKind::LossPrediction.name()
    }

    fn score(&mut self, ctx: &ScoringContext<'_, B>) -> Result<ScoreRecord> {
        let model = ctx.require_model("loss-prediction")?;
        if model.loss_head.is_none() {
            return Err(SegmentationError::Model(
                "loss-prediction scoring needs a model with a loss head".to_string(),
            ));
        }

        let mut record = ScoreRecord::new();
        ctx.forward_each(model, &ctx.unlabeled(), false, |batch, output| {
            if let Some(predicted) = model.predict_loss(&output, true) {
                for (&index, value) in batch.indices.iter().zip(to_f32_vec(predicted)?) {
                    record.insert(index, value as f64);
                }
            }
            Ok(())
        })?;
        Ok(record)
    }
}

/// Scores are the true per-image losses against withheld ground truth
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleScorer;

impl<B: AutodiffBackend> Scorer<B> for OracleScorer {
    fn name(&self) -> &'static str {
        StrategyKind::Oracle.name()
    }

    fn score(&mut self, ctx: &ScoringContext<'_, B>) -> Result<ScoreRecord> {
        let model = ctx.require_model("oracle")?;
        let unlabeled = ctx.unlabeled();
        let mut record = ScoreRecord::new();

        if !ctx.dataset.has_labels() {
            for index in unlabeled {
                ctx.sink.emit(TrainingEvent::ScoringSkipped {
                    index,
                    reason: "no ground truth".to_string(),
                });
            }
            return Ok(record);
        }

        ctx.forward_each(model, &unlabeled, true, |batch, output| {
            let losses = per_image_loss(
                output.log_probs,
                batch.targets.clone(),
                batch.valid.clone(),
            );
            for (&index, value) in batch.indices.iter().zip(to_f32_vec(losses)?) {
                record.insert(index, value as f64);
            }
            Ok(())
        })?;
        Ok(record)
    }
}

/// Labeled-vs-unlabeled classifier over pooled embeddings
///
/// The discriminator is kept between cycles and keeps training from where the last
/// cycle left it.
pub struct DiscriminativeScorer<B: AutodiffBackend> {
    config: ScoringConfig,
    discriminator: Option<Discriminator<B>>,
}

impl<B: AutodiffBackend> DiscriminativeScorer<B> {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            discriminator: None,
        }
    }

    pub fn discriminator(&self) -> Option<&Discriminator<B>> {
        self.discriminator.as_ref()
    }

    /// Rows of `[embedding_dim]` per index that could be embedded
    fn embed(
        ctx: &ScoringContext<'_, B>,
        model: &ActiveSegModel<B::InnerBackend>,
        indices: &[usize],
    ) -> Result<Vec<(usize, Vec<f32>)>> {
        let mut rows = Vec::with_capacity(indices.len());
        ctx.forward_each(model, indices, false, |batch, output| {
            let [n, dim] = output.embedding.dims();
            let values = to_f32_vec(output.embedding)?;
            for (row, &index) in batch.indices.iter().enumerate().take(n) {
                rows.push((index, values[row * dim..(row + 1) * dim].to_vec()));
            }
            Ok(())
        })?;
        Ok(rows)
    }

    fn fit(
        &self,
        mut discriminator: Discriminator<B>,
        samples: &[(Vec<f32>, i64)],
        dim: usize,
        cycle: usize,
        device: &B::Device,
    ) -> Result<Discriminator<B>> {
        let mut optimizer = AdamConfig::new().init();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(cycle as u64));
        let mut order: Vec<usize> = (0..samples.len()).collect();

        for epoch in 0..self.config.dal_epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0f64;
            let mut batches = 0usize;

            for chunk in order.chunks(self.config.dal_batch_size.max(1)) {
                let features: Vec<f32> = chunk
                    .iter()
                    .flat_map(|&i| samples[i].0.iter().copied())
                    .collect();
                let targets: Vec<i64> = chunk.iter().map(|&i| samples[i].1).collect();

                let x = Tensor::<B, 2>::from_floats(
                    TensorData::new(features, [chunk.len(), dim]),
                    device,
                );
                let y = Tensor::<B, 1, Int>::from_data(
                    TensorData::new(targets, [chunk.len()]),
                    device,
                );

                let loss = CrossEntropyLossConfig::new()
                    .init(device)
                    .forward(discriminator.forward(x), y);
                let loss_value: f64 = loss.clone().into_scalar().elem();
                epoch_loss += loss_value;
                batches += 1;

                let grads = GradientsParams::from_grads(loss.backward(), &discriminator);
                discriminator = optimizer.step(self.config.dal_lr, discriminator, grads);
            }

            debug!(
                "discriminator epoch {}/{}: loss {:.4}",
                epoch + 1,
                self.config.dal_epochs,
                epoch_loss / batches.max(1) as f64
            );
        }
        Ok(discriminator)
    }
}

impl<B: AutodiffBackend> Scorer<B> for DiscriminativeScorer<B> {
    fn name(&self) -> &'static str {
        StrategyKind::Discriminative.name()
    }

    fn score(&mut self, ctx: &ScoringContext<'_, B>) -> Result<ScoreRecord> {
        let model = ctx.require_model("discriminative")?;
        let labeled = Self::embed(ctx, model, ctx.pool.labeled())?;
        let unlabeled = Self::embed(ctx, model, &ctx.unlabeled())?;

        let dim = match unlabeled.first().or(labeled.first()) {
            Some((_, row)) => row.len(),
            None => return Ok(ScoreRecord::new()),
        };

        let samples: Vec<(Vec<f32>, i64)> = labeled
            .iter()
            .map(|(_, row)| (row.clone(), 0))
            .chain(unlabeled.iter().map(|(_, row)| (row.clone(), 1)))
            .collect();

        let discriminator = match self.discriminator.take() {
            Some(existing) => existing,
            None => DiscriminatorConfig::new(dim)
                .with_hidden(self.config.dal_hidden)
                .init(ctx.device),
        };
        info!(
            "Fitting discriminator on {} labeled / {} unlabeled embeddings",
            labeled.len(),
            unlabeled.len()
        );
        let discriminator = self.fit(discriminator, &samples, dim, ctx.cycle, ctx.device)?;

        let inference = discriminator.valid();
        let mut record = ScoreRecord::new();
        for chunk in unlabeled.chunks(self.config.dal_batch_size.max(1)) {
            let features: Vec<f32> = chunk.iter().flat_map(|(_, row)| row.iter().copied()).collect();
            let x = Tensor::<B::InnerBackend, 2>::from_floats(
                TensorData::new(features, [chunk.len(), dim]),
                ctx.device,
            );
            let probs = to_f32_vec(inference.prob_unlabeled(x))?;
            for ((index, _), p) in chunk.iter().zip(probs) {
                record.insert(*index, self.config.dal_policy.score(p as f64));
            }
        }

        self.discriminator = Some(discriminator);
        Ok(record)
    }
}
