//! Selection report export
//!
//! One CSV row per newly selected image, in selection order, for annotation tools.

use std::path::Path;

use crate::active::ScoreRecord;
use crate::dataset::SegDataset;
use crate::utils::error::Result;

/// Write `image,score` rows for `selected`
pub fn write_selection_report(
    path: &Path,
    dataset: &SegDataset,
    selected: &[usize],
    scores: &ScoreRecord,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["image", "score"])?;
    for &index in selected {
        let image = dataset.image_name(index).unwrap_or_default();
        let score = scores
            .get(index)
            .map(|s| format!("{:.6}", s))
            .unwrap_or_default();
        writer.write_record([image.to_string(), score])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Manifest;
    use tempfile::TempDir;

    #[test]
    fn test_rows_follow_selection_order() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(
            "train",
            vec!["a.png".into(), "b.png".into(), "c.png".into()],
            None,
        )
        .unwrap();
        let dataset = SegDataset::new(dir.path(), manifest, 3);
        let scores: ScoreRecord = [(0, 0.25), (2, 0.75)].into_iter().collect();

        let path = dir.path().join("reports/cycle_01.csv");
        write_selection_report(&path, &dataset, &[2, 0], &scores).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["image,score", "c.png,0.750000", "a.png,0.250000"]);
    }
}
