//! Dataset manifests and normalization metadata
//!
//! A phase (`train`, `val`, `test`) is described by two parallel list files in the
//! list directory: `{phase}_images.txt` (required) and `{phase}_labels.txt`
//! (optional). Each line holds one path relative to the data directory. The data
//! directory also carries `info.json` with per-channel normalization statistics.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SegmentationError};

/// Image and label list for one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub phase: String,
    pub images: Vec<String>,
    /// `None` when the phase ships without ground truth
    pub labels: Option<Vec<String>>,
}

impl Manifest {
    /// Read `{phase}_images.txt` and, if present, `{phase}_labels.txt`
    pub fn read(list_dir: &Path, phase: &str) -> Result<Self> {
        let image_path = list_dir.join(format!("{}_images.txt", phase));
        let label_path = list_dir.join(format!("{}_labels.txt", phase));

        if !image_path.exists() {
            return Err(SegmentationError::PathNotFound(image_path));
        }
        let images = read_lines(&image_path)?;
        let labels = if label_path.exists() {
            Some(read_lines(&label_path)?)
        } else {
            None
        };

        Self::new(phase, images, labels)
    }

    /// Build a manifest from in-memory lists, checking they are parallel
    pub fn new(phase: &str, images: Vec<String>, labels: Option<Vec<String>>) -> Result<Self> {
        if let Some(ref labels) = labels {
            if labels.len() != images.len() {
                return Err(SegmentationError::Dataset(format!(
                    "{} phase lists {} images but {} labels",
                    phase,
                    images.len(),
                    labels.len()
                )));
            }
        }
        Ok(Self {
            phase: phase.to_string(),
            images,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn has_labels(&self) -> bool {
        self.labels.is_some()
    }

    /// Write both list files into `list_dir`
    pub fn write(&self, list_dir: &Path) -> Result<()> {
        fs::create_dir_all(list_dir)?;
        fs::write(
            list_dir.join(format!("{}_images.txt", self.phase)),
            self.images.join("\n") + "\n",
        )?;
        if let Some(ref labels) = self.labels {
            fs::write(
                list_dir.join(format!("{}_labels.txt", self.phase)),
                labels.join("\n") + "\n",
            )?;
        }
        Ok(())
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Per-channel normalization statistics on the `[0, 1]` pixel scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for DatasetInfo {
    fn default() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

impl DatasetInfo {
    /// Load `info.json` from a data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path: PathBuf = data_dir.join("info.json");
        if !path.exists() {
            return Err(SegmentationError::PathNotFound(path));
        }
        let content = fs::read_to_string(&path)?;
        let info: Self = serde_json::from_str(&content)?;
        info.validate()?;
        Ok(info)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::write(data_dir.join("info.json"), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.std.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
            return Err(SegmentationError::Dataset(format!(
                "info.json std must be positive, got {:?}",
                self.std
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_manifest_with_labels() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("train_images.txt"), "a.png\n\nb.png\n").unwrap();
        fs::write(dir.path().join("train_labels.txt"), "a_gt.png\nb_gt.png\n").unwrap();

        let manifest = Manifest::read(dir.path(), "train").unwrap();
        assert_eq!(manifest.images, vec!["a.png", "b.png"]);
        assert_eq!(manifest.labels.unwrap(), vec!["a_gt.png", "b_gt.png"]);
    }

    #[test]
    fn test_missing_label_list_means_no_ground_truth() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("test_images.txt"), "x.png\n").unwrap();

        let manifest = Manifest::read(dir.path(), "test").unwrap();
        assert!(!manifest.has_labels());
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let result = Manifest::new(
            "val",
            vec!["a.png".into(), "b.png".into()],
            Some(vec!["a_gt.png".into()]),
        );
        assert!(matches!(result, Err(SegmentationError::Dataset(_))));
    }

    #[test]
    fn test_missing_image_list_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Manifest::read(dir.path(), "val"),
            Err(SegmentationError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_info_roundtrip() {
        let dir = TempDir::new().unwrap();
        let info = DatasetInfo {
            mean: [0.29, 0.33, 0.29],
            std: [0.18, 0.18, 0.18],
        };
        info.save(dir.path()).unwrap();
        assert_eq!(DatasetInfo::load(dir.path()).unwrap(), info);
    }
}
