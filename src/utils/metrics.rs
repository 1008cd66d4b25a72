//! Segmentation metrics
//!
//! A [`ConfusionHistogram`] accumulates (ground-truth, predicted) pixel counts over one
//! evaluation pass and derives per-class and mean intersection-over-union from them.

use serde::{Deserialize, Serialize};

/// Square (ground-truth class, predicted class) pixel count table
///
/// Rows are ground truth, columns are predictions, stored row-major. Counts only ever
/// grow; start a new histogram (or call [`ConfusionHistogram::reset`]) per pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionHistogram {
    /// Number of classes
    pub num_classes: usize,
    /// Flattened `num_classes x num_classes` counts
    pub counts: Vec<u64>,
}

impl ConfusionHistogram {
    /// Create an empty histogram
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    /// Accumulate flattened per-pixel predictions against ground truth
    ///
    /// Pixels whose label is out of range, whose prediction is out of range, or whose
    /// entry in `valid` is `false` are ignored.
    pub fn update(&mut self, predictions: &[usize], labels: &[usize], valid: Option<&[bool]>) {
        let n = self.num_classes;
        for (i, (&pred, &label)) in predictions.iter().zip(labels.iter()).enumerate() {
            if let Some(mask) = valid {
                if !mask.get(i).copied().unwrap_or(false) {
                    continue;
                }
            }
            if label < n && pred < n {
                self.counts[label * n + pred] += 1;
            }
        }
    }

    /// Accumulate against typed labels where `None` marks an ignored pixel
    pub fn update_masked(&mut self, predictions: &[usize], labels: &[Option<usize>]) {
        let n = self.num_classes;
        for (&pred, label) in predictions.iter().zip(labels.iter()) {
            if let Some(label) = *label {
                if label < n && pred < n {
                    self.counts[label * n + pred] += 1;
                }
            }
        }
    }

    /// Count at (ground truth, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> u64 {
        if actual < self.num_classes && predicted < self.num_classes {
            self.counts[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    /// Clear all counts
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    /// Total number of counted pixels
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn row_sums(&self) -> Vec<u64> {
        (0..self.num_classes)
            .map(|row| (0..self.num_classes).map(|col| self.get(row, col)).sum())
            .collect()
    }

    pub fn col_sums(&self) -> Vec<u64> {
        (0..self.num_classes)
            .map(|col| (0..self.num_classes).map(|row| self.get(row, col)).sum())
            .collect()
    }

    /// `hist[c,c] / (row[c] + col[c] - hist[c,c])` per class; NaN when the class is
    /// absent from both ground truth and predictions
    pub fn per_class_iou(&self) -> Vec<f64> {
        let rows = self.row_sums();
        let cols = self.col_sums();
        (0..self.num_classes)
            .map(|c| {
                let tp = self.get(c, c) as f64;
                let denom = rows[c] as f64 + cols[c] as f64 - tp;
                if denom == 0.0 {
                    f64::NAN
                } else {
                    tp / denom
                }
            })
            .collect()
    }

    /// NaN-aware mean IoU in percent
    ///
    /// Returns NaN when no class has a defined IoU.
    pub fn mean_iou(&self) -> f64 {
        nan_mean(&self.per_class_iou()) * 100.0
    }

    /// Percentage of counted pixels on the diagonal
    pub fn pixel_accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: u64 = (0..self.num_classes).map(|c| self.get(c, c)).sum();
        100.0 * correct as f64 / total as f64
    }
}

/// Mean over the non-NaN entries
pub fn nan_mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Percentage of valid pixels predicted correctly; 0 when nothing is valid
pub fn pixel_accuracy(predictions: &[usize], labels: &[usize], valid: &[bool]) -> f64 {
    let (correct, total) = predictions
        .iter()
        .zip(labels.iter())
        .zip(valid.iter())
        .filter(|(_, v)| **v)
        .fold((0usize, 0usize), |(c, t), ((p, l), _)| {
            (c + (p == l) as usize, t + 1)
        });
    if total == 0 {
        0.0
    } else {
        100.0 * correct as f64 / total as f64
    }
}
