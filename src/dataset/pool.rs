//! Labeled / unlabeled index pools over a fixed-size training set

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SegmentationError};

/// Two disjoint index sets covering `0..size`
///
/// `labeled` keeps selection order and only grows; `unlabeled` only shrinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePool {
    size: usize,
    labeled: Vec<usize>,
    unlabeled: BTreeSet<usize>,
}

impl SamplePool {
    /// Every index starts unlabeled
    pub fn new(size: usize) -> Self {
        Self {
            size,
            labeled: Vec::new(),
            unlabeled: (0..size).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn labeled(&self) -> &[usize] {
        &self.labeled
    }

    pub fn unlabeled(&self) -> &BTreeSet<usize> {
        &self.unlabeled
    }

    pub fn is_unlabeled(&self, index: usize) -> bool {
        self.unlabeled.contains(&index)
    }

    /// Move `indices` from unlabeled to labeled in one step
    ///
    /// Either every index moves or none does: duplicates or indices that are not
    /// currently unlabeled reject the whole call.
    pub fn label(&mut self, indices: &[usize]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for &index in indices {
            if !self.unlabeled.contains(&index) {
                return Err(SegmentationError::InvalidInput(format!(
                    "index {} is not in the unlabeled pool",
                    index
                )));
            }
            if !seen.insert(index) {
                return Err(SegmentationError::InvalidInput(format!(
                    "index {} selected twice",
                    index
                )));
            }
        }

        for &index in indices {
            self.unlabeled.remove(&index);
            self.labeled.push(index);
        }
        Ok(())
    }

    /// Disjoint and jointly covering `0..size`
    pub fn is_consistent(&self) -> bool {
        let labeled: BTreeSet<usize> = self.labeled.iter().copied().collect();
        labeled.len() == self.labeled.len()
            && labeled.is_disjoint(&self.unlabeled)
            && labeled.len() + self.unlabeled.len() == self.size
            && labeled.iter().chain(self.unlabeled.iter()).all(|&i| i < self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pool_is_all_unlabeled() {
        let pool = SamplePool::new(4);
        assert!(pool.labeled().is_empty());
        assert_eq!(pool.unlabeled().len(), 4);
        assert!(pool.is_consistent());
    }

    #[test]
    fn test_label_moves_indices_in_order() {
        let mut pool = SamplePool::new(5);
        pool.label(&[3, 1]).unwrap();
        pool.label(&[4]).unwrap();
        assert_eq!(pool.labeled(), &[3, 1, 4]);
        assert!(!pool.is_unlabeled(3));
        assert!(pool.is_consistent());
    }

    #[test]
    fn test_label_is_all_or_nothing() {
        let mut pool = SamplePool::new(3);
        pool.label(&[0]).unwrap();

        assert!(pool.label(&[1, 0]).is_err());
        assert!(pool.label(&[2, 2]).is_err());
        assert_eq!(pool.labeled(), &[0]);
        assert_eq!(pool.unlabeled().len(), 2);
    }
}
