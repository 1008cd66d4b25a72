//! Model configuration
//!
//! Architectures are addressed by name (the string stored in checkpoints). Each
//! name expands to a [`SegNetConfig`] with concrete stage widths.

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::utils::error::SegmentationError;

/// Supported backbone variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Narrow variant for CPU runs and tests
    DrnDTiny,
    /// DRN-D-22 widths
    DrnD22,
    /// DRN-D-38 widths with two blocks per dilated stage
    DrnD38,
}

impl Architecture {
    pub fn parse(name: &str) -> crate::utils::error::Result<Self> {
        match name {
            "drn_d_tiny" => Ok(Architecture::DrnDTiny),
            "drn_d_22" => Ok(Architecture::DrnD22),
            "drn_d_38" => Ok(Architecture::DrnD38),
            other => Err(SegmentationError::Config(format!(
                "unknown architecture '{}' (expected drn_d_tiny, drn_d_22 or drn_d_38)",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::DrnDTiny => "drn_d_tiny",
            Architecture::DrnD22 => "drn_d_22",
            Architecture::DrnD38 => "drn_d_38",
        }
    }

    /// Network config for this variant
    pub fn config(&self, num_classes: usize) -> SegNetConfig {
        match self {
            Architecture::DrnDTiny => SegNetConfig::new(num_classes, vec![8, 16, 32, 64, 64, 64]),
            Architecture::DrnD22 => {
                SegNetConfig::new(num_classes, vec![16, 32, 64, 128, 256, 512])
            }
            Architecture::DrnD38 => {
                SegNetConfig::new(num_classes, vec![16, 32, 64, 128, 256, 512])
                    .with_dilated_blocks(2)
            }
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Dilated residual segmentation network
///
/// `channels` lists the widths of the six stages: stem, three strided stages (output
/// stride 8), and two dilated stages (dilation 2 and 4).
#[derive(Config, Debug)]
pub struct SegNetConfig {
    pub num_classes: usize,

    pub channels: Vec<usize>,

    /// Residual blocks in each dilated stage
    #[config(default = "1")]
    pub dilated_blocks: usize,

    /// Attach the loss-prediction head
    #[config(default = "false")]
    pub loss_head: bool,

    /// Hidden width of each loss-prediction branch
    #[config(default = "128")]
    pub loss_head_width: usize,
}

impl SegNetConfig {
    pub fn validate(&self) -> crate::utils::error::Result<()> {
        if self.num_classes == 0 {
            return Err(SegmentationError::Config(
                "number of classes must be positive".to_string(),
            ));
        }
        if self.channels.len() != 6 || self.channels.contains(&0) {
            return Err(SegmentationError::Config(format!(
                "expected six positive stage widths, got {:?}",
                self.channels
            )));
        }
        if self.dilated_blocks == 0 {
            return Err(SegmentationError::Config(
                "dilated stages need at least one block".to_string(),
            ));
        }
        Ok(())
    }

    /// Widths of the feature maps handed to the loss-prediction head
    pub fn feature_channels(&self) -> Vec<usize> {
        let c = &self.channels;
        vec![c[2], c[3], c[4], c[5], c[5]]
    }

    /// Width of the pooled embedding used by the discriminator
    pub fn embedding_dim(&self) -> usize {
        self.channels[5]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_names_roundtrip() {
        for arch in [
            Architecture::DrnDTiny,
            Architecture::DrnD22,
            Architecture::DrnD38,
        ] {
            assert_eq!(Architecture::parse(arch.name()).unwrap(), arch);
        }
        assert!(Architecture::parse("resnet50").is_err());
    }

    #[test]
    fn test_presets_validate() {
        let config = Architecture::DrnD38.config(19);
        assert!(config.validate().is_ok());
        assert_eq!(config.dilated_blocks, 2);
        assert_eq!(config.feature_channels(), vec![64, 128, 256, 512, 512]);
    }

    #[test]
    fn test_zero_classes_rejected() {
        let config = Architecture::DrnDTiny.config(0);
        assert!(matches!(
            config.validate(),
            Err(SegmentationError::Config(_))
        ));
    }
}
