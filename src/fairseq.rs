use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::problem::{PairConstraint, Problem};
use crate::solution::Assignment;
use crate::solver::Solver;

/// Greedy picking-sequence allocator targeting weighted envy-freeness up
/// to one item, with paper weights proportional to `max_reviewers`.
///
/// Each turn goes to the paper with the lowest filled fraction of its
/// quota (ties: higher best available affinity, then ascending paper id),
/// which takes its best eligible reviewer. Two repair passes then lift
/// papers and reviewers that ended below their minimums by moving single
/// assignments, minimizing the affinity given up; an unrepairable minimum
/// is infeasible under this solver. Fully deterministic.
#[derive(Clone, Debug, Default)]
pub struct FairSequenceSolver {
    pub picks: u32,
    pub paper_repairs: u32,
    pub reviewer_repairs: u32,
}

struct Allocation {
    assigned: Vec<BTreeSet<u32>>,
    loads: Vec<u32>,
}

impl Allocation {
    fn new(problem: &Problem) -> Self {
        Allocation {
            assigned: vec![BTreeSet::new(); problem.num_papers],
            loads: vec![0; problem.num_reviewers],
        }
    }

    fn count(&self, paper: usize) -> u32 {
        self.assigned[paper].len() as u32
    }

    fn eligible(&self, problem: &Problem, paper: usize, reviewer: usize) -> bool {
        problem.assignable(paper, reviewer)
            && !self.assigned[paper].contains(&(reviewer as u32))
            && self.loads[reviewer] < problem.max_papers[reviewer]
    }

    fn assign(&mut self, paper: usize, reviewer: u32) {
        self.assigned[paper].insert(reviewer);
        self.loads[reviewer as usize] += 1;
    }

    fn unassign(&mut self, paper: usize, reviewer: u32) {
        self.assigned[paper].remove(&reviewer);
        self.loads[reviewer as usize] -= 1;
    }
}

// Best eligible reviewer for a paper: maximum affinity, ties to the
// lowest reviewer id.
fn best_reviewer(problem: &Problem, alloc: &Allocation, paper: usize) -> Option<(u32, f64)> {
    let mut best: Option<(u32, f64)> = None;
    for r in 0..problem.num_reviewers {
        if !alloc.eligible(problem, paper, r) {
            continue;
        }
        let affinity = problem.affinity(paper, r);
        best = match best {
            None => Some((r as u32, affinity)),
            Some((_, current)) if affinity > current => Some((r as u32, affinity)),
            keep => keep,
        };
    }
    best
}

impl Solver for FairSequenceSolver {
    fn solve(&mut self, problem: &Problem, cancel: &CancelToken) -> Result<Assignment, MatchError> {
        problem.check_totals()?;
        let mut alloc = Allocation::new(problem);

        // locked pairs are allocations like any other, they just go first
        for (p, r) in problem.locked_pairs() {
            alloc.assign(p as usize, r);
        }

        loop {
            cancel.check()?;
            // next turn: lowest filled fraction count/max, compared as
            // integer cross products so equal fractions tie exactly
            let mut turn: Option<(usize, u32, f64)> = None;
            for p in 0..problem.num_papers {
                if alloc.count(p) >= problem.max_reviewers[p] {
                    continue;
                }
                let Some((reviewer, affinity)) = best_reviewer(problem, &alloc, p) else {
                    continue;
                };
                let take = match turn {
                    None => true,
                    Some((q, _, best_affinity)) => {
                        let lhs = u64::from(alloc.count(p)) * u64::from(problem.max_reviewers[q]);
                        let rhs = u64::from(alloc.count(q)) * u64::from(problem.max_reviewers[p]);
                        lhs < rhs || (lhs == rhs && affinity > best_affinity)
                    }
                };
                if take {
                    turn = Some((p, reviewer, affinity));
                }
            }
            let Some((paper, reviewer, affinity)) = turn else {
                break;
            };
            trace!(paper, reviewer, affinity, "picked");
            alloc.assign(paper, reviewer);
            self.picks += 1;
        }

        self.repair_paper_minimums(problem, &mut alloc, cancel)?;
        self.repair_reviewer_minimums(problem, &mut alloc, cancel)?;

        debug!(
            picks = self.picks,
            paper_repairs = self.paper_repairs,
            reviewer_repairs = self.reviewer_repairs,
            "fair sequence finished"
        );
        Ok(Assignment::from_pairs(
            problem.num_papers,
            alloc
                .assigned
                .iter()
                .enumerate()
                .flat_map(|(p, reviewers)| reviewers.iter().map(move |&r| (p as u32, r))),
        ))
    }

    fn diagnostics(&self, out: &mut BTreeMap<String, String>) {
        out.insert("fairsequence.picks".into(), self.picks.to_string());
        out.insert("fairsequence.paper_repairs".into(), self.paper_repairs.to_string());
        out.insert(
            "fairsequence.reviewer_repairs".into(),
            self.reviewer_repairs.to_string(),
        );
    }
}

impl FairSequenceSolver {
    // Pull one reviewer at a time from papers strictly above their minimum
    // into papers below it, giving up as little affinity as possible.
    fn repair_paper_minimums(
        &mut self,
        problem: &Problem,
        alloc: &mut Allocation,
        cancel: &CancelToken,
    ) -> Result<(), MatchError> {
        for p in 0..problem.num_papers {
            while alloc.count(p) < problem.min_reviewers[p] {
                cancel.check()?;
                let mut best: Option<(f64, usize, u32)> = None;
                for q in 0..problem.num_papers {
                    if q == p || alloc.count(q) <= problem.min_reviewers[q] {
                        continue;
                    }
                    for &r in &alloc.assigned[q] {
                        if problem.constraint(q, r as usize) == PairConstraint::Locked {
                            continue;
                        }
                        if !problem.assignable(p, r as usize)
                            || alloc.assigned[p].contains(&r)
                        {
                            continue;
                        }
                        let loss = problem.affinity(q, r as usize) - problem.affinity(p, r as usize);
                        let candidate = (loss, q, r);
                        best = match best {
                            None => Some(candidate),
                            Some(current) if lighter_swap(candidate, current) => Some(candidate),
                            keep => keep,
                        };
                    }
                }
                let Some((loss, q, r)) = best else {
                    return Err(MatchError::infeasible(format!(
                        "paper {p} cannot reach min_reviewers {} under FairSequence",
                        problem.min_reviewers[p]
                    )));
                };
                trace!(paper = p, from = q, reviewer = r, loss, "paper minimum repair");
                alloc.unassign(q, r);
                alloc.assign(p, r);
                self.paper_repairs += 1;
            }
        }
        Ok(())
    }

    // Swap a starved reviewer in for an over-minimum colleague on the same
    // paper; paper counts are untouched so the previous pass stays intact.
    fn repair_reviewer_minimums(
        &mut self,
        problem: &Problem,
        alloc: &mut Allocation,
        cancel: &CancelToken,
    ) -> Result<(), MatchError> {
        for r in 0..problem.num_reviewers {
            while alloc.loads[r] < problem.min_papers[r] {
                cancel.check()?;
                let mut best: Option<(f64, usize, u32)> = None;
                for p in 0..problem.num_papers {
                    if !problem.assignable(p, r) || alloc.assigned[p].contains(&(r as u32)) {
                        continue;
                    }
                    for &other in &alloc.assigned[p] {
                        if other as usize == r
                            || problem.constraint(p, other as usize) == PairConstraint::Locked
                            || alloc.loads[other as usize] <= problem.min_papers[other as usize]
                        {
                            continue;
                        }
                        let loss = problem.affinity(p, other as usize) - problem.affinity(p, r);
                        let candidate = (loss, p, other);
                        best = match best {
                            None => Some(candidate),
                            Some(current) if lighter_swap(candidate, current) => Some(candidate),
                            keep => keep,
                        };
                    }
                }
                let Some((loss, p, other)) = best else {
                    return Err(MatchError::infeasible(format!(
                        "reviewer {r} cannot reach min_papers {} under FairSequence",
                        problem.min_papers[r]
                    )));
                };
                trace!(reviewer = r, paper = p, displaced = other, loss, "reviewer minimum repair");
                alloc.unassign(p, other);
                alloc.assign(p, r as u32);
                self.reviewer_repairs += 1;
            }
        }
        Ok(())
    }
}

fn lighter_swap(a: (f64, usize, u32), b: (f64, usize, u32)) -> bool {
    match a.0.total_cmp(&b.0) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => (a.1, a.2) < (b.1, b.2),
    }
}

#[cfg(test)]
mod tests {
    use super::FairSequenceSolver;
    use crate::cancel::CancelToken;
    use crate::error::MatchError;
    use crate::problem::tests::simple_problem;
    use crate::problem::{Problem, QuotaInput};
    use crate::solution::Assignment;
    use crate::solver::Solver;

    // WEF1 with weights max_reviewers: for every (p, q) some reviewer can
    // be dropped from q's bundle so p stops envying it.
    fn assert_wef1(problem: &Problem, assignment: &Assignment) {
        for p in 0..problem.num_papers {
            let own = assignment.paper_sum(problem, p) / f64::from(problem.max_reviewers[p]);
            for q in 0..problem.num_papers {
                if p == q {
                    continue;
                }
                let bundle = assignment.reviewers_of(q);
                if bundle.is_empty() {
                    assert!(own >= 0.0);
                    continue;
                }
                let from_p: f64 = bundle.iter().map(|&r| problem.affinity(p, r as usize)).sum();
                let satisfied = bundle.iter().any(|&r| {
                    let reduced = from_p - problem.affinity(p, r as usize);
                    own + 1e-9 >= reduced / f64::from(problem.max_reviewers[q])
                });
                assert!(satisfied, "paper {p} envies paper {q} beyond one reviewer");
            }
        }
    }

    #[test]
    fn assigns_best_reviewers_on_the_diagonal() {
        let problem = simple_problem(vec![vec![1.0, 0.1], vec![0.1, 1.0]], None, 1, 1, 1, 1);
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assert_eq!(assignment.reviewers_of(0), &[0]);
        assert_eq!(assignment.reviewers_of(1), &[1]);
        assignment.validate(&problem).unwrap();
    }

    #[test]
    fn alternating_turns_share_the_good_reviewers() {
        // both papers prefer the same reviewers; the picking sequence
        // alternates so neither paper hoards them
        let scores = vec![
            vec![0.9, 0.8, 0.3, 0.2],
            vec![0.9, 0.8, 0.3, 0.2],
        ];
        let problem = simple_problem(scores, None, 2, 2, 0, 1);
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        // paper 0 opens with reviewer 0, paper 1 answers with reviewer 1
        assert!(assignment.contains(0, 0));
        assert!(assignment.contains(1, 1));
        assignment.validate(&problem).unwrap();
        assert_wef1(&problem, &assignment);
    }

    fn quota_problem(
        scores: Vec<Vec<f64>>,
        min_reviewers: Vec<u32>,
        max_reviewers: Vec<u32>,
        min_papers: u32,
        max_papers: u32,
    ) -> Problem {
        let num_papers = scores.len();
        let num_reviewers = scores.first().map_or(0, Vec::len);
        Problem::build(
            num_papers,
            num_reviewers,
            &[scores],
            &[1.0],
            None,
            &QuotaInput::PerEntity(min_reviewers),
            &QuotaInput::PerEntity(max_reviewers),
            &QuotaInput::Uniform(min_papers),
            &QuotaInput::Uniform(max_papers),
            None,
            true,
        )
        .expect("problem should build")
    }

    #[test]
    fn weighted_priority_favors_emptier_quota() {
        // paper 0 wants four reviewers, paper 1 wants one; the filled
        // fraction keeps handing turns to whoever is further from quota
        let scores = vec![
            vec![0.9, 0.8, 0.7, 0.6, 0.5],
            vec![0.9, 0.2, 0.2, 0.2, 0.2],
        ];
        let problem = quota_problem(scores, vec![0, 0], vec![4, 1], 0, 1);
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assignment.validate(&problem).unwrap();
        // equal opening priorities tie to paper 0, which takes reviewer 0;
        // paper 1 then jumps the queue at 0/1 filled
        assert_eq!(assignment.reviewers_of(0), &[0, 2, 3, 4]);
        assert_eq!(assignment.reviewers_of(1), &[1]);
        assert_wef1(&problem, &assignment);
    }

    #[test]
    fn honors_conflicts_and_locks() {
        let problem = simple_problem(
            vec![vec![0.9, 0.1, 0.5], vec![0.9, 0.9, 0.5]],
            Some(vec![vec![-1, 1, 0], vec![0, 0, 0]]),
            1,
            2,
            0,
            2,
        );
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assert!(!assignment.contains(0, 0));
        assert!(assignment.contains(0, 1));
        assignment.validate(&problem).unwrap();
    }

    #[test]
    fn repairs_paper_minimums_with_cheapest_swap() {
        // one reviewer, two papers: paper 0 outbids paper 1 on the opening
        // tie, so the greedy phase leaves paper 1 empty and below minimum;
        // the repair pass pulls the reviewer over since paper 0 sits at
        // minimum zero
        let scores = vec![vec![0.9], vec![0.5]];
        let problem = quota_problem(scores, vec![0, 1], vec![1, 1], 0, 1);
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assignment.validate(&problem).unwrap();
        assert!(assignment.reviewers_of(0).is_empty());
        assert_eq!(assignment.reviewers_of(1), &[0]);
    }

    #[test]
    fn repairs_reviewer_minimums() {
        // reviewer 1 must review one paper even though reviewer 0 is
        // universally preferred
        let scores = vec![vec![0.9, 0.2], vec![0.8, 0.3]];
        let problem = simple_problem(scores, None, 1, 1, 1, 2);
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assignment.validate(&problem).unwrap();
        let loads = assignment.reviewer_loads(2);
        assert_eq!(loads, vec![1, 1]);
        // swapping on paper 1 loses 0.5, on paper 0 it loses 0.7
        assert_eq!(assignment.reviewers_of(1), &[1]);
    }

    #[test]
    fn unrepairable_minimum_is_infeasible() {
        // paper 1 conflicts with every reviewer but requires one
        let problem = simple_problem(
            vec![vec![0.9, 0.8], vec![0.5, 0.5]],
            Some(vec![vec![0, 0], vec![-1, -1]]),
            1,
            1,
            0,
            2,
        );
        let err = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, MatchError::Infeasible(_)));
    }

    #[test]
    fn wef1_holds_on_a_contended_instance() {
        let scores = vec![
            vec![0.9, 0.7, 0.6, 0.4, 0.3, 0.2],
            vec![0.8, 0.7, 0.5, 0.4, 0.2, 0.1],
            vec![0.9, 0.6, 0.6, 0.5, 0.3, 0.1],
        ];
        let problem = simple_problem(scores, None, 0, 2, 0, 1);
        let assignment = FairSequenceSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assignment.validate(&problem).unwrap();
        assert_wef1(&problem, &assignment);
    }

    #[test]
    fn deterministic_across_reruns() {
        let scores = vec![
            vec![0.5, 0.5, 0.5],
            vec![0.5, 0.5, 0.5],
        ];
        let problem = simple_problem(scores, None, 1, 1, 0, 2);
        let first = FairSequenceSolver::default().solve(&problem, &CancelToken::new()).unwrap();
        let second = FairSequenceSolver::default().solve(&problem, &CancelToken::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cancellation_stops_picking() {
        let problem = simple_problem(vec![vec![1.0, 0.1], vec![0.1, 1.0]], None, 1, 1, 1, 1);
        let token = CancelToken::new();
        token.cancel();
        let err = FairSequenceSolver::default().solve(&problem, &token).unwrap_err();
        assert!(matches!(err, MatchError::Cancelled));
    }
}
