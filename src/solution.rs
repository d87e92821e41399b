use itertools::Itertools;

use crate::error::MatchError;
use crate::problem::{PairConstraint, Problem};

/// Solution of the matching problem: for each paper, the assigned reviewer
/// indices in ascending order.
///
/// Owned by the caller after a solve; solvers build it once and never hand
/// out partially-filled instances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    by_paper: Vec<Vec<u32>>,
}

impl Assignment {
    /// Assemble from (paper, reviewer) pairs; reviewers are sorted per paper.
    pub(crate) fn from_pairs(num_papers: usize, pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut by_paper = vec![Vec::new(); num_papers];
        for (paper, reviewer) in pairs {
            by_paper[paper as usize].push(reviewer);
        }
        for reviewers in &mut by_paper {
            reviewers.sort_unstable();
        }
        Assignment { by_paper }
    }

    pub fn num_papers(&self) -> usize {
        self.by_paper.len()
    }

    pub fn reviewers_of(&self, paper: usize) -> &[u32] {
        &self.by_paper[paper]
    }

    pub fn contains(&self, paper: usize, reviewer: u32) -> bool {
        self.by_paper[paper].binary_search(&reviewer).is_ok()
    }

    pub fn num_assigned(&self) -> usize {
        self.by_paper.iter().map(Vec::len).sum()
    }

    pub fn reviewer_loads(&self, num_reviewers: usize) -> Vec<u32> {
        let mut loads = vec![0u32; num_reviewers];
        for reviewers in &self.by_paper {
            for &r in reviewers {
                loads[r as usize] += 1;
            }
        }
        loads
    }

    pub fn paper_sum(&self, problem: &Problem, paper: usize) -> f64 {
        self.by_paper[paper]
            .iter()
            .map(|&r| problem.affinity(paper, r as usize))
            .sum()
    }

    /// Mean affinity over the paper's assigned reviewers; 0 when unassigned.
    pub fn paper_mean(&self, problem: &Problem, paper: usize) -> f64 {
        let count = self.by_paper[paper].len();
        if count == 0 {
            0.0
        } else {
            self.paper_sum(problem, paper) / count as f64
        }
    }

    pub fn total_affinity(&self, problem: &Problem) -> f64 {
        (0..self.by_paper.len()).map(|p| self.paper_sum(problem, p)).sum()
    }

    /// Check the universal output invariants (quotas, loads, conflicts,
    /// locks, uniqueness) against the problem.
    pub fn validate(&self, problem: &Problem) -> Result<(), MatchError> {
        if self.by_paper.len() != problem.num_papers {
            return Err(MatchError::solver(format!(
                "assignment covers {} papers, problem has {}",
                self.by_paper.len(),
                problem.num_papers
            )));
        }
        for (p, reviewers) in self.by_paper.iter().enumerate() {
            let count = reviewers.len() as u32;
            if count < problem.min_reviewers[p] || count > problem.max_reviewers[p] {
                return Err(MatchError::solver(format!(
                    "paper {p} has {count} reviewers, quota is [{}, {}]",
                    problem.min_reviewers[p], problem.max_reviewers[p]
                )));
            }
            if reviewers.windows(2).any(|w| w[0] == w[1]) {
                return Err(MatchError::solver(format!("paper {p} has a duplicate reviewer")));
            }
            for &r in reviewers {
                if problem.constraint(p, r as usize) == PairConstraint::Conflicted {
                    return Err(MatchError::solver(format!(
                        "conflicted pair ({p}, {r}) is assigned"
                    )));
                }
            }
        }
        for (p, r) in problem.locked_pairs() {
            if !self.contains(p as usize, r) {
                return Err(MatchError::solver(format!("locked pair ({p}, {r}) is missing")));
            }
        }
        let loads = self.reviewer_loads(problem.num_reviewers);
        for (r, &load) in loads.iter().enumerate() {
            if load < problem.min_papers[r] || load > problem.max_papers[r] {
                return Err(MatchError::solver(format!(
                    "reviewer {r} has load {load}, quota is [{}, {}]",
                    problem.min_papers[r], problem.max_papers[r]
                )));
            }
        }
        Ok(())
    }
}

/// Rank up to `k` alternates per paper: non-conflicted, non-assigned
/// reviewers by descending affinity, ties broken by ascending reviewer id.
/// Alternates never consume reviewer capacity.
pub fn alternates(problem: &Problem, assignment: &Assignment, k: usize) -> Vec<Vec<u32>> {
    (0..problem.num_papers)
        .map(|p| {
            if k == 0 {
                return Vec::new();
            }
            (0..problem.num_reviewers as u32)
                .filter(|&r| {
                    problem.constraint(p, r as usize) != PairConstraint::Conflicted
                        && !assignment.contains(p, r)
                })
                .sorted_by(|&a, &b| {
                    problem
                        .affinity(p, b as usize)
                        .total_cmp(&problem.affinity(p, a as usize))
                        .then(a.cmp(&b))
                })
                .take(k)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{alternates, Assignment};
    use crate::problem::tests::simple_problem;

    #[test]
    fn pairs_sort_per_paper() {
        let assignment = Assignment::from_pairs(2, vec![(0, 2), (1, 0), (0, 1)]);
        assert_eq!(assignment.reviewers_of(0), &[1, 2]);
        assert_eq!(assignment.reviewers_of(1), &[0]);
        assert_eq!(assignment.num_assigned(), 3);
        assert!(assignment.contains(0, 2));
        assert!(!assignment.contains(1, 2));
    }

    #[test]
    fn affinity_queries() {
        let problem = simple_problem(vec![vec![1.0, 0.5], vec![0.25, 0.0]], None, 0, 2, 0, 2);
        let assignment = Assignment::from_pairs(2, vec![(0, 0), (0, 1), (1, 0)]);
        assert!((assignment.paper_sum(&problem, 0) - 1.5).abs() < 1e-12);
        assert!((assignment.paper_mean(&problem, 0) - 0.75).abs() < 1e-12);
        assert!((assignment.total_affinity(&problem) - 1.75).abs() < 1e-12);
        assert_eq!(assignment.reviewer_loads(2), vec![2, 1]);
    }

    #[test]
    fn validate_flags_quota_and_conflict_violations() {
        let problem = simple_problem(
            vec![vec![1.0, 0.1], vec![0.1, 1.0]],
            Some(vec![vec![0, -1], vec![0, 0]]),
            1,
            1,
            0,
            2,
        );
        let ok = Assignment::from_pairs(2, vec![(0, 0), (1, 1)]);
        ok.validate(&problem).expect("valid assignment");

        let under = Assignment::from_pairs(2, vec![(1, 1)]);
        assert!(under.validate(&problem).is_err());

        let conflicted = Assignment::from_pairs(2, vec![(0, 1), (1, 0)]);
        assert!(conflicted.validate(&problem).is_err());
    }

    #[test]
    fn validate_requires_locked_pairs() {
        let problem = simple_problem(
            vec![vec![1.0, 0.1], vec![0.1, 1.0]],
            Some(vec![vec![0, 1], vec![0, 0]]),
            1,
            1,
            0,
            2,
        );
        let missing_lock = Assignment::from_pairs(2, vec![(0, 0), (1, 1)]);
        assert!(missing_lock.validate(&problem).is_err());
        let with_lock = Assignment::from_pairs(2, vec![(0, 1), (1, 0)]);
        with_lock.validate(&problem).expect("lock honored");
    }

    #[test]
    fn alternates_rank_by_affinity_and_skip_assigned() {
        let problem = simple_problem(
            vec![vec![0.9, 0.2, 0.8, 0.8], vec![0.1, 0.9, 0.3, 0.2]],
            Some(vec![vec![0, 0, 0, -1], vec![0, 0, 0, 0]]),
            1,
            1,
            0,
            4,
        );
        let assignment = Assignment::from_pairs(2, vec![(0, 0), (1, 1)]);
        let alts = alternates(&problem, &assignment, 2);
        // reviewer 3 is conflicted with paper 0, reviewer 0 is assigned
        assert_eq!(alts[0], vec![2, 1]);
        // descending affinity: r2 (0.3), r3 (0.2) ... r0 (0.1)
        assert_eq!(alts[1], vec![2, 3]);

        assert!(alternates(&problem, &assignment, 0).iter().all(Vec::is_empty));
    }
}
