//! Active-learning selection
//!
//! Each cycle a [`Scorer`] assigns every unlabeled image an informativeness score,
//! [`select`] moves the top-scoring images into the labeled pool, and the optional
//! selection report hands the new batch to external annotation tooling.
//!
//! ## Strategies
//!
//! - `random`: seeded uniform scores, the no-active-learning baseline
//! - `loss-prediction`: the model's auxiliary head predicts each image's loss
//! - `discriminative`: a classifier separates labeled from unlabeled embeddings
//! - `oracle`: true loss from withheld ground truth (ablation upper bound only)

pub mod report;
pub mod scoring;
pub mod selector;

use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub use report::write_selection_report;
pub use scoring::{build_scorer, Scorer, ScoringConfig, ScoringContext};
pub use selector::select;

/// Which scoring strategy drives selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Random,
    LossPrediction,
    Discriminative,
    Oracle,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Random => "random",
            StrategyKind::LossPrediction => "loss-prediction",
            StrategyKind::Discriminative => "discriminative",
            StrategyKind::Oracle => "oracle",
        }
    }

    /// Whether the segmentation model must carry the loss-prediction head
    pub fn needs_loss_head(&self) -> bool {
        matches!(self, StrategyKind::LossPrediction)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which end of the discriminator's output counts as informative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DiscriminativePolicy {
    /// Highest probability of belonging to the unlabeled pool
    MostUnlabeled,
    /// Closest to the decision boundary
    MostAmbiguous,
}

impl DiscriminativePolicy {
    /// Score from the discriminator's P(unlabeled)
    pub fn score(&self, prob_unlabeled: f64) -> f64 {
        match self {
            DiscriminativePolicy::MostUnlabeled => prob_unlabeled,
            DiscriminativePolicy::MostAmbiguous => 1.0 - 2.0 * (prob_unlabeled - 0.5).abs(),
        }
    }
}

/// Informativeness per unlabeled image index, rebuilt from scratch every cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    scores: BTreeMap<usize, f64>,
}

impl ScoreRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: usize, score: f64) {
        self.scores.insert(index, score);
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.scores.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.scores.iter().map(|(&i, &s)| (i, s))
    }
}

impl FromIterator<(usize, f64)> for ScoreRecord {
    fn from_iter<T: IntoIterator<Item = (usize, f64)>>(iter: T) -> Self {
        Self {
            scores: iter.into_iter().collect(),
        }
    }
}
