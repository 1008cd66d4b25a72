//! Learning Rate Scheduler Module
//!
//! Two policies: `step` divides the rate by ten every `step` epochs, `poly` decays it
//! polynomially to zero over the whole run.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::SegmentationError;

/// Learning-rate policy name as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrMode {
    Step,
    Poly,
}

impl FromStr for LrMode {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(LrMode::Step),
            "poly" => Ok(LrMode::Poly),
            other => Err(SegmentationError::Config(format!(
                "unknown lr mode '{}' (expected 'step' or 'poly')",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LrMode::Step => write!(f, "step"),
            LrMode::Poly => write!(f, "poly"),
        }
    }
}

/// A policy bound to its base rate and horizon
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub mode: LrMode,
    pub base_lr: f64,
    /// Epochs between decays in `step` mode
    pub step: usize,
    pub total_epochs: usize,
}

impl LrSchedule {
    pub fn new(mode: LrMode, base_lr: f64, step: usize, total_epochs: usize) -> Self {
        Self {
            mode,
            base_lr,
            step,
            total_epochs,
        }
    }

    /// Learning rate for `epoch` (0-based)
    pub fn get_lr(&self, epoch: usize) -> f64 {
        match self.mode {
            LrMode::Step => {
                let decays = epoch / self.step.max(1);
                self.base_lr * 0.1f64.powi(decays as i32)
            }
            LrMode::Poly => {
                let progress = epoch as f64 / self.total_epochs.max(1) as f64;
                self.base_lr * (1.0 - progress).max(0.0).powf(0.9)
            }
        }
    }

    pub fn description(&self) -> String {
        match self.mode {
            LrMode::Step => format!(
                "step (lr={}, x0.1 every {} epochs)",
                self.base_lr, self.step
            ),
            LrMode::Poly => format!(
                "poly (lr={}, power 0.9 over {} epochs)",
                self.base_lr, self.total_epochs
            ),
        }
    }
}
