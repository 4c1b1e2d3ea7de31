use crate::candidate::Candidate;
use crate::error::CycleError;
use crate::topology::ScreenTopology;
use rand::Rng;
use std::sync::Arc;

/// Result of the eligibility pass over a pool.
#[derive(Debug, Clone, Default)]
pub struct Eligibility {
    /// Eligible candidates in shuffled order.
    pub candidates: Vec<Arc<Candidate>>,
    pub max_priority_multi: i32,
    pub max_priority_single: i32,
    pub sum_priority_multi: u64,
    pub sum_priority_single: u64,
    /// Per screen, how many eligible candidates are not excluded from it.
    pub usable_per_screen: Vec<usize>,
}

impl Eligibility {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn max_priority(&self, spanning: bool) -> i32 {
        if spanning {
            self.max_priority_multi
        } else {
            self.max_priority_single
        }
    }
}

/// Keep only activated, positively weighted candidates and gather priority stats.
///
/// Each survivor is inserted at a uniformly random index so later front to
/// back scans carry no positional bias from the pool order.
pub fn filter_candidates<R: Rng + ?Sized>(
    pool: &[Candidate],
    topology: &ScreenTopology,
    rng: &mut R,
) -> Result<Eligibility, CycleError> {
    let mut out = Eligibility {
        usable_per_screen: vec![0; topology.count()],
        ..Default::default()
    };

    for candidate in pool.iter().filter(|c| c.is_eligible()) {
        let priority = candidate.priority;
        if candidate.multiscreen {
            out.max_priority_multi = out.max_priority_multi.max(priority);
            out.sum_priority_multi += priority as u64;
        } else {
            out.max_priority_single = out.max_priority_single.max(priority);
            out.sum_priority_single += priority as u64;
        }

        for (screen, usable) in out.usable_per_screen.iter_mut().enumerate() {
            if candidate.allowed_on(screen) {
                *usable += 1;
            }
        }

        let at = rng.gen_range(0..=out.candidates.len());
        out.candidates.insert(at, Arc::new(candidate.clone()));
    }

    if out.candidates.is_empty() {
        return Err(CycleError::InsufficientCandidates {
            required: 1,
            available: 0,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::{single, spanning};
    use crate::topology::testing::row;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_drops_inactive_and_non_positive() {
        let mut off = single("off", 10);
        off.activated = false;
        let pool = vec![single("a", 5), off, single("zero", 0), single("neg", -2), spanning("s", 7)];
        let mut rng = StdRng::seed_from_u64(1);

        let out = filter_candidates(&pool, &row(2, 0), &mut rng).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.candidates.iter().all(|c| c.is_eligible()));
        assert_eq!(out.max_priority_single, 5);
        assert_eq!(out.max_priority_multi, 7);
        assert_eq!(out.sum_priority_single, 5);
        assert_eq!(out.sum_priority_multi, 7);
    }

    #[test]
    fn test_usable_per_screen_counts_exclusions() {
        let mut a = single("a", 1);
        a.disabled_screens.insert(0);
        let mut b = single("b", 1);
        b.disabled_screens.insert(1);
        b.disabled_screens.insert(2);
        let pool = vec![a, b, single("c", 1)];
        let mut rng = StdRng::seed_from_u64(3);

        let out = filter_candidates(&pool, &row(3, 0), &mut rng).unwrap();
        assert_eq!(out.usable_per_screen, vec![2, 2, 2]);
    }

    #[test]
    fn test_empty_after_filter_is_insufficient() {
        let pool = vec![single("zero", 0)];
        let mut rng = StdRng::seed_from_u64(9);
        let err = filter_candidates(&pool, &row(1, 0), &mut rng).unwrap_err();
        assert!(matches!(err, CycleError::InsufficientCandidates { .. }));
    }

    #[test]
    fn test_insertion_is_shuffled() {
        let pool: Vec<_> = (0..20).map(|i| single(&format!("w{}", i), 1)).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let mut moved = false;
        for _ in 0..10 {
            let out = filter_candidates(&pool, &row(1, 0), &mut rng).unwrap();
            let order: Vec<_> = out.candidates.iter().map(|c| c.path.clone()).collect();
            let original: Vec<_> = pool.iter().map(|c| c.path.clone()).collect();
            if order != original {
                moved = true;
            }
            let mut sorted = order.clone();
            sorted.sort();
            let mut expected = original.clone();
            expected.sort();
            assert_eq!(sorted, expected);
        }
        assert!(moved);
    }
}
