//! Top-budget sample selection

use std::cmp::Ordering;

use crate::active::ScoreRecord;
use crate::dataset::SamplePool;
use crate::utils::error::Result;

/// Move the `budget` highest-scoring unlabeled indices into the labeled pool
///
/// Only indices that are still unlabeled and carry a non-NaN score compete. Ties are
/// broken by ascending index. A budget larger than the candidate set takes every
/// candidate. The returned order is the selection order.
pub fn select(scores: &ScoreRecord, pool: &mut SamplePool, budget: usize) -> Result<Vec<usize>> {
    let mut candidates: Vec<(usize, f64)> = scores
        .iter()
        .filter(|(index, score)| pool.is_unlabeled(*index) && !score.is_nan())
        .collect();

    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let selected: Vec<usize> = candidates
        .into_iter()
        .take(budget)
        .map(|(index, _)| index)
        .collect();

    pool.label(&selected)?;
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn uniform(pool: &SamplePool) -> ScoreRecord {
        pool.unlabeled().iter().map(|&i| (i, 1.0)).collect()
    }

    #[test]
    fn test_selects_highest_scores_first() {
        let mut pool = SamplePool::new(5);
        let scores: ScoreRecord = [(0, 0.1), (1, 0.9), (2, 0.5), (3, 0.7), (4, 0.2)]
            .into_iter()
            .collect();

        let selected = select(&scores, &mut pool, 3).unwrap();
        assert_eq!(selected, vec![1, 3, 2]);
        assert_eq!(pool.labeled(), &[1, 3, 2]);
    }

    #[test]
    fn test_ties_break_by_index() {
        let mut pool = SamplePool::new(6);
        let selected = select(&uniform(&pool), &mut pool, 4).unwrap();
        assert_eq!(selected, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_budget_within_pool_returns_distinct_unlabeled() {
        for budget in 0..=8 {
            let mut pool = SamplePool::new(8);
            pool.label(&[6, 2]).unwrap();
            let before: BTreeSet<usize> = pool.unlabeled().clone();
            let budget = budget.min(before.len());

            let scores: ScoreRecord = (0..8).map(|i| (i, (i * 7 % 5) as f64)).collect();
            let selected = select(&scores, &mut pool, budget).unwrap();

            let unique: BTreeSet<usize> = selected.iter().copied().collect();
            assert_eq!(selected.len(), budget);
            assert_eq!(unique.len(), budget);
            assert!(unique.is_subset(&before));
            assert!(pool.is_consistent());
        }
    }

    #[test]
    fn test_oversized_budget_takes_remaining_pool() {
        let mut pool = SamplePool::new(4);
        pool.label(&[1]).unwrap();
        let selected = select(&uniform(&pool), &mut pool, 10).unwrap();

        assert_eq!(selected, vec![0, 2, 3]);
        assert!(pool.unlabeled().is_empty());
        assert!(pool.is_consistent());
    }

    #[test]
    fn test_unscored_and_nan_images_sit_out() {
        let mut pool = SamplePool::new(4);
        let scores: ScoreRecord = [(0, f64::NAN), (2, 0.3)].into_iter().collect();
        let selected = select(&scores, &mut pool, 4).unwrap();
        assert_eq!(selected, vec![2]);
        assert!(pool.is_unlabeled(0));
        assert!(pool.is_unlabeled(1));
    }

    #[test]
    fn test_two_cycles_on_five_images() {
        let mut pool = SamplePool::new(5);
        for _ in 0..2 {
            let scores = uniform(&pool);
            select(&scores, &mut pool, 2).unwrap();
        }

        let labeled: BTreeSet<usize> = pool.labeled().iter().copied().collect();
        assert_eq!(pool.unlabeled().len(), 1);
        assert_eq!(pool.labeled().len(), 4);
        assert_eq!(labeled.len(), 4);
    }
}
