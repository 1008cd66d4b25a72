//! Dataset handling for segmentation active learning
//!
//! - `manifest`: phase list files and `info.json` normalization metadata
//! - `transforms`: paired image/label augmentation with an explicit ignore mask
//! - `burn_dataset`: on-demand decoding, Burn `Dataset` and `Batcher` impls
//! - `pool`: the labeled / unlabeled index partition grown by each cycle

pub mod burn_dataset;
pub mod manifest;
pub mod pool;
pub mod transforms;

pub use burn_dataset::{SegBatch, SegBatcher, SegDataset, SegItem};
pub use manifest::{DatasetInfo, Manifest};
pub use pool::SamplePool;
pub use transforms::{AugmentationConfig, Augmenter, LabelMap};
