//! # activeseg
//!
//! Active-learning training for semantic segmentation with the Burn framework.
//!
//! Instead of labeling a whole dataset upfront, training runs in cycles: each cycle
//! scores the unlabeled images, moves the most informative ones into the labeled
//! pool, and retrains a fresh dilated residual segmentation network on that pool.
//! The per-cycle best accuracy and mIoU are the run's output, used to compare
//! selection strategies against random selection.
//!
//! ## Modules
//!
//! - `active`: scoring strategies, the sample selector and the selection report
//! - `dataset`: manifests, normalization metadata, transforms, batching and the sample pool
//! - `model`: the DRN segmentation network, loss-prediction head and discriminator
//! - `training`: run configuration, LR schedule, checkpoints, train/validate steps,
//!   the cycle orchestrator and test-time evaluation
//! - `utils`: errors, logging, observability events, meters and metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use activeseg::backend::{default_device, TrainingBackend};
//! use activeseg::training::{run_active_learning, RunConfig};
//! use activeseg::utils::events::TracingSink;
//!
//! let config = RunConfig { classes: 19, ..RunConfig::default() };
//! let report = run_active_learning::<TrainingBackend>(&config, &default_device(), &TracingSink)?;
//! ```

pub mod active;
pub mod backend;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

pub use active::{select, DiscriminativePolicy, ScoreRecord, StrategyKind};
pub use dataset::{DatasetInfo, Manifest, SamplePool, SegBatch, SegBatcher, SegDataset, SegItem};
pub use model::{ActiveSegModel, SegNetConfig};
pub use training::{
    run_active_learning, run_test, Checkpoint, LrMode, RunConfig, RunReport, TestConfig,
};
pub use utils::error::{Result, SegmentationError};
pub use utils::metrics::ConfusionHistogram;

/// Seed used when none is configured
pub const DEFAULT_SEED: u64 = 1311;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
