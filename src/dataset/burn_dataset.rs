//! Burn Dataset Integration for segmentation lists
//!
//! [`SegDataset`] decodes images and label maps on demand from a [`Manifest`];
//! [`SegBatcher`] normalizes a batch of equally sized items into tensors. The ignore
//! label never reaches the tensors as a magic value: ignored pixels get target 0 and
//! a 0 in the `valid` mask.

use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{ImageReader, RgbImage};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::dataset::manifest::{DatasetInfo, Manifest};
use crate::dataset::transforms::{Augmenter, LabelMap};
use crate::utils::error::{Result, SegmentationError};

/// One decoded image with its optional label map
#[derive(Clone, Debug)]
pub struct SegItem {
    /// Position in the manifest
    pub index: usize,
    /// Image path as listed in the manifest
    pub name: String,
    pub image: RgbImage,
    pub label: Option<LabelMap>,
}

impl SegItem {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Image as a flattened CHW array scaled to `[0, 1]`
    pub fn to_chw(&self) -> Vec<f32> {
        let (width, height) = self.image.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];
        for (i, pixel) in self.image.pixels().enumerate() {
            data[i] = pixel[0] as f32 / 255.0;
            data[plane + i] = pixel[1] as f32 / 255.0;
            data[2 * plane + i] = pixel[2] as f32 / 255.0;
        }
        data
    }
}

/// Lazily decoding dataset over one phase manifest
#[derive(Debug, Clone)]
pub struct SegDataset {
    data_dir: PathBuf,
    manifest: Manifest,
    num_classes: usize,
}

impl SegDataset {
    pub fn new(data_dir: impl Into<PathBuf>, manifest: Manifest, num_classes: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            manifest,
            num_classes,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn has_labels(&self) -> bool {
        self.manifest.has_labels()
    }

    pub fn image_name(&self, index: usize) -> Option<&str> {
        self.manifest.images.get(index).map(String::as_str)
    }

    /// Decode item `index`, reporting why it could not be read
    pub fn load(&self, index: usize) -> Result<SegItem> {
        self.decode(index, true)
    }

    /// Decode only the image of item `index`; the label list is not touched
    pub fn load_image(&self, index: usize) -> Result<SegItem> {
        self.decode(index, false)
    }

    fn decode(&self, index: usize, with_label: bool) -> Result<SegItem> {
        let name = self.manifest.images.get(index).ok_or_else(|| {
            SegmentationError::Dataset(format!(
                "index {} out of range for {} images",
                index,
                self.manifest.len()
            ))
        })?;
        let image_path = self.data_dir.join(name);
        let image = open_image(&image_path)?.to_rgb8();

        let label = match self.manifest.labels {
            Some(ref labels) if with_label => {
                let label_path = self.data_dir.join(&labels[index]);
                let gray = open_image(&label_path)?.to_luma8();
                if gray.dimensions() != image.dimensions() {
                    return Err(SegmentationError::ImageLoad(
                        label_path,
                        format!(
                            "label is {:?} but image is {:?}",
                            gray.dimensions(),
                            image.dimensions()
                        ),
                    ));
                }
                Some(LabelMap::decode(&gray, self.num_classes))
            }
            _ => None,
        };

        Ok(SegItem {
            index,
            name: name.clone(),
            image,
            label,
        })
    }

    /// Decode `indices` in parallel, then augment them in order with `rng`
    ///
    /// Fails on the first unreadable item or when the augmented items do not share
    /// one size.
    pub fn load_batch(
        &self,
        indices: &[usize],
        augmenter: &Augmenter,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<SegItem>> {
        let decoded: Vec<Result<SegItem>> = indices.par_iter().map(|&i| self.load(i)).collect();
        let items = decoded
            .into_iter()
            .map(|item| item.map(|item| augmenter.apply(item, rng)))
            .collect::<Result<Vec<_>>>()?;

        if let Some(first) = items.first() {
            let dims = first.dimensions();
            if let Some(other) = items.iter().find(|item| item.dimensions() != dims) {
                return Err(SegmentationError::Dataset(format!(
                    "cannot batch '{}' ({:?}) with '{}' ({:?}); set a crop size",
                    first.name,
                    dims,
                    other.name,
                    other.dimensions()
                )));
            }
        }
        Ok(items)
    }
}

fn open_image(path: &Path) -> Result<image::DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| SegmentationError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| SegmentationError::ImageLoad(path.to_path_buf(), e.to_string()))
}

impl Dataset<SegItem> for SegDataset {
    fn get(&self, index: usize) -> Option<SegItem> {
        self.load(index).ok()
    }

    fn len(&self) -> usize {
        self.manifest.len()
    }
}

/// A batch of normalized images with per-pixel targets
#[derive(Clone, Debug)]
pub struct SegBatch<B: Backend> {
    /// `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch, height, width]`, 0 where the pixel is ignored
    pub targets: Tensor<B, 3, Int>,
    /// `[batch, height, width]`, 1.0 for pixels with ground truth
    pub valid: Tensor<B, 3>,
    /// Dataset indices of the batch rows
    pub indices: Vec<usize>,
    /// False when none of the items carried a label map
    pub has_labels: bool,
}

/// Collates [`SegItem`]s into a [`SegBatch`]
#[derive(Clone, Debug)]
pub struct SegBatcher {
    info: DatasetInfo,
}

impl SegBatcher {
    pub fn new(info: DatasetInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }
}

impl<B: Backend> Batcher<B, SegItem, SegBatch<B>> for SegBatcher {
    fn batch(&self, items: Vec<SegItem>, device: &B::Device) -> SegBatch<B> {
        let batch_size = items.len();
        let (width, height) = items.first().map(SegItem::dimensions).unwrap_or((0, 0));
        let (width, height) = (width as usize, height as usize);

        let images_data: Vec<f32> = items.iter().flat_map(SegItem::to_chw).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, height, width]),
            device,
        );

        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(self.info.mean.to_vec(), [1, 3, 1, 1]),
            device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(self.info.std.to_vec(), [1, 3, 1, 1]),
            device,
        );
        let images = (images - mean) / std;

        let plane = width * height;
        let mut targets_data = vec![0i64; batch_size * plane];
        let mut valid_data = vec![0.0f32; batch_size * plane];
        for (b, item) in items.iter().enumerate() {
            if let Some(ref label) = item.label {
                for (i, pixel) in label.pixels.iter().enumerate() {
                    if let Some(class) = pixel {
                        targets_data[b * plane + i] = *class as i64;
                        valid_data[b * plane + i] = 1.0;
                    }
                }
            }
        }

        let targets = Tensor::<B, 3, Int>::from_data(
            TensorData::new(targets_data, [batch_size, height, width]),
            device,
        );
        let valid = Tensor::<B, 3>::from_floats(
            TensorData::new(valid_data, [batch_size, height, width]),
            device,
        );

        SegBatch {
            images,
            targets,
            valid,
            indices: items.iter().map(|item| item.index).collect(),
            has_labels: items.iter().any(|item| item.label.is_some()),
        }
    }
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::dataset::transforms::AugmentationConfig;
    use burn_ndarray::NdArray;
    use image::{GrayImage, Luma, Rgb};
    use rand::SeedableRng;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn write_pair(dir: &Path, name: &str, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([255, 0, 128]))
            .save(dir.join(format!("{}.png", name)))
            .unwrap();
        GrayImage::from_fn(width, height, |x, _| Luma([if x == 0 { 255 } else { 1 }]))
            .save(dir.join(format!("{}_gt.png", name)))
            .unwrap();
    }

    fn dataset(dir: &Path, names: &[&str]) -> SegDataset {
        let manifest = Manifest::new(
            "train",
            names.iter().map(|n| format!("{}.png", n)).collect(),
            Some(names.iter().map(|n| format!("{}_gt.png", n)).collect()),
        )
        .unwrap();
        SegDataset::new(dir, manifest, 2)
    }

    #[test]
    fn test_load_decodes_image_and_label() {
        let dir = TempDir::new().unwrap();
        write_pair(dir.path(), "a", 3, 2);
        let ds = dataset(dir.path(), &["a"]);

        let item = ds.load(0).unwrap();
        assert_eq!(item.dimensions(), (3, 2));
        let label = item.label.unwrap();
        assert_eq!(label.get(0, 0), None);
        assert_eq!(label.get(1, 0), Some(1));
        assert!(ds.get(1).is_none());
    }

    #[test]
    fn test_image_only_load_ignores_label_file() {
        let dir = TempDir::new().unwrap();
        write_pair(dir.path(), "a", 3, 2);
        std::fs::remove_file(dir.path().join("a_gt.png")).unwrap();
        let ds = dataset(dir.path(), &["a"]);

        assert!(ds.load(0).is_err());
        let item = ds.load_image(0).unwrap();
        assert_eq!(item.dimensions(), (3, 2));
        assert!(item.label.is_none());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(dir.path(), &["missing"]);
        match ds.load(0) {
            Err(SegmentationError::ImageLoad(path, _)) => {
                assert!(path.ends_with("missing.png"))
            }
            other => panic!("unexpected {:?}", other.map(|i| i.name)),
        }
    }

    #[test]
    fn test_batch_masks_ignored_pixels() {
        let dir = TempDir::new().unwrap();
        write_pair(dir.path(), "a", 3, 2);
        write_pair(dir.path(), "b", 3, 2);
        let ds = dataset(dir.path(), &["a", "b"]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let items = ds
            .load_batch(&[1, 0], &Augmenter::new(AugmentationConfig::none()), &mut rng)
            .unwrap();

        let device = Default::default();
        let batch: SegBatch<TestBackend> =
            SegBatcher::new(DatasetInfo::default()).batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 2, 3]);
        assert_eq!(batch.indices, vec![1, 0]);
        let valid = batch.valid.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(&valid[..3], &[0.0, 1.0, 1.0]);
        let total: f32 = valid.iter().sum();
        assert_eq!(total, 8.0);
    }

    #[test]
    fn test_mismatched_sizes_are_rejected() {
        let dir = TempDir::new().unwrap();
        write_pair(dir.path(), "a", 3, 2);
        write_pair(dir.path(), "b", 4, 2);
        let ds = dataset(dir.path(), &["a", "b"]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let result = ds.load_batch(&[0, 1], &Augmenter::new(AugmentationConfig::none()), &mut rng);
        assert!(matches!(result, Err(SegmentationError::Dataset(_))));
    }
}
