//! Pairwise ranking loss for the loss-prediction head
//!
//! For every pair (i, j) with i > j in a mini-batch the head is penalized when the
//! ordering of its predictions disagrees with the ordering of the true losses:
//! `max(0, margin - sign(l_i - l_j) * (p_i - p_j))`. Pairs with tied true losses
//! carry no ordering and are left out.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MARGIN: f64 = 1.0;

/// Mean hinge over ordered pairs; zero for batches of fewer than two images
///
/// `actual` is treated as a constant target.
pub fn ranking_loss<B: Backend>(
    predicted: Tensor<B, 1>,
    actual: Tensor<B, 1>,
    margin: f64,
) -> Tensor<B, 1> {
    let [n] = predicted.dims();
    let device = predicted.device();
    if n < 2 {
        return Tensor::zeros([1], &device);
    }

    let actual = actual.detach();
    let diff_pred = pairwise_difference(predicted, n);
    let diff_actual = pairwise_difference(actual, n);
    let sign = diff_actual.sign();

    let lower: Vec<f32> = (0..n * n)
        .map(|k| if k / n > k % n { 1.0 } else { 0.0 })
        .collect();
    let pair_mask = Tensor::<B, 2>::from_floats(TensorData::new(lower, [n, n]), &device)
        * sign.clone().abs();

    let hinge = (sign * diff_pred).neg().add_scalar(margin).clamp_min(0.0) * pair_mask.clone();
    let pairs = pair_mask.sum().clamp_min(1.0);
    (hinge.sum() / pairs).reshape([1])
}

/// `[n, n]` matrix with entry (i, j) = `values[i] - values[j]`
fn pairwise_difference<B: Backend>(values: Tensor<B, 1>, n: usize) -> Tensor<B, 2> {
    let rows = values.clone().reshape([n, 1]).repeat_dim(1, n);
    let cols = values.reshape([1, n]).repeat_dim(0, n);
    rows - cols
}

/// Running count of correctly ordered prediction pairs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingTracker {
    pub correct: u64,
    pub total: u64,
}

impl RankingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count pairs i > j whose predicted order matches the true order
    pub fn update(&mut self, actual: &[f32], predicted: &[f32]) {
        for i in 0..actual.len() {
            for j in 0..i {
                self.total += 1;
                if (actual[i] - actual[j]) * (predicted[i] - predicted[j]) > 0.0 {
                    self.correct += 1;
                }
            }
        }
    }

    pub fn accuracy(&self) -> f64 {
        self.correct as f64 / (self.total as f64 + 1e-5)
    }
}
