//! Training pipeline
//!
//! - `config`: the run configuration filled by the CLI
//! - `scheduler`: step and poly learning-rate policies
//! - `checkpoint`: latest / best / archive checkpoint files
//! - `ranking`: pairwise ranking loss of the loss-prediction head
//! - `step`: one train pass and one validation pass
//! - `cycle`: the active-learning cycle loop
//! - `test_eval`, `palette`: prediction export and multi-scale testing

pub mod checkpoint;
pub mod config;
pub mod cycle;
pub mod palette;
pub mod ranking;
pub mod scheduler;
pub mod step;
pub mod test_eval;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{RunConfig, ValCrop};
pub use cycle::{run_active_learning, CycleReport, EvaluationReport, RunReport};
pub use ranking::{ranking_loss, RankingTracker};
pub use scheduler::{LrMode, LrSchedule};
pub use step::{per_image_loss, train_epoch, validate, ValidationStats};
pub use test_eval::{run_test, TestConfig, TestReport};
