use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::flow::SCALE;
use crate::minmax;
use crate::problem::Problem;
use crate::solution::Assignment;
use crate::solver::Solver;

// Per-paper mean affinity held as a scaled-integer rational so the
// lexicographic objective stays integer-valued (that is what makes the
// termination argument go through).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mean {
    sum: i64,
    count: i64,
}

impl Mean {
    fn compare(&self, other: &Mean) -> Ordering {
        (i128::from(self.sum) * i128::from(other.count))
            .cmp(&(i128::from(other.sum) * i128::from(self.count)))
    }
}

fn scaled_affinity(problem: &Problem, paper: usize, reviewer: usize) -> i64 {
    (problem.affinity(paper, reviewer) * SCALE).round() as i64
}

fn paper_means(problem: &Problem, assignment: &Assignment) -> Vec<Mean> {
    (0..problem.num_papers)
        .map(|p| {
            let reviewers = assignment.reviewers_of(p);
            Mean {
                sum: reviewers
                    .iter()
                    .map(|&r| scaled_affinity(problem, p, r as usize))
                    .sum(),
                count: reviewers.len() as i64,
            }
        })
        .collect()
}

// (minimum mean over assigned papers, total scaled affinity)
fn objective(means: &[Mean]) -> (Option<Mean>, i64) {
    let mut min: Option<Mean> = None;
    let mut total = 0i64;
    for mean in means {
        total += mean.sum;
        if mean.count == 0 {
            continue;
        }
        min = match min {
            None => Some(*mean),
            Some(current) if mean.compare(&current) == Ordering::Less => Some(*mean),
            keep => keep,
        };
    }
    (min, total)
}

fn improved(new: (Option<Mean>, i64), old: (Option<Mean>, i64)) -> bool {
    match (new.0, old.0) {
        (Some(new_min), Some(old_min)) => match new_min.compare(&old_min) {
            Ordering::Greater => true,
            Ordering::Equal => new.1 > old.1,
            Ordering::Less => false,
        },
        _ => new.1 > old.1,
    }
}

/// Raises the worst-off paper by iterated MinMax re-solves.
///
/// Each round picks the unsaturated paper with the lowest mean affinity
/// and tries to forbid one of its below-mean edges; the re-solve is kept
/// only when it stays feasible and strictly improves the lexicographic
/// (min mean, total affinity) objective. Papers that cannot be improved
/// are saturated and never revisited; the procedure ends with every paper
/// saturated.
#[derive(Clone, Debug, Default)]
pub struct FairFlowSolver {
    pub rounds: u32,
    pub resolves: u32,
    pub accepted: u32,
    pub forbidden_edges: u32,
}

impl Solver for FairFlowSolver {
    fn solve(&mut self, problem: &Problem, cancel: &CancelToken) -> Result<Assignment, MatchError> {
        let mut forbidden: BTreeSet<(u32, u32)> = BTreeSet::new();
        let mut current = minmax::solve_with_forbidden(problem, &forbidden, cancel)?;
        let mut means = paper_means(problem, &current);
        let mut saturated = vec![false; problem.num_papers];
        for (p, mean) in means.iter().enumerate() {
            if mean.count == 0 {
                // nothing assigned, nothing to improve
                saturated[p] = true;
            }
        }

        loop {
            cancel.check()?;
            let Some(worst) = worst_unsaturated(&means, &saturated) else {
                break;
            };
            self.rounds += 1;

            let mut candidates: Vec<(i64, u32)> = current
                .reviewers_of(worst)
                .iter()
                .filter(|&&r| !forbidden.contains(&(worst as u32, r)))
                .map(|&r| (scaled_affinity(problem, worst, r as usize), r))
                .filter(|&(aff, _)| {
                    // strictly below the paper's mean
                    i128::from(aff) * i128::from(means[worst].count) < i128::from(means[worst].sum)
                })
                .filter(|&(_, r)| {
                    problem.constraint(worst, r as usize) != crate::problem::PairConstraint::Locked
                })
                .collect();
            candidates.sort_unstable();

            let old_objective = objective(&means);
            let mut accepted = false;
            for (aff, reviewer) in candidates {
                cancel.check()?;
                let edge = (worst as u32, reviewer);
                forbidden.insert(edge);
                self.resolves += 1;
                match minmax::solve_with_forbidden(problem, &forbidden, cancel) {
                    Ok(next) => {
                        let next_means = paper_means(problem, &next);
                        if improved(objective(&next_means), old_objective) {
                            trace!(paper = worst, reviewer, aff, "forbade edge");
                            current = next;
                            means = next_means;
                            self.accepted += 1;
                            accepted = true;
                            break;
                        }
                        forbidden.remove(&edge);
                    }
                    Err(MatchError::Infeasible(_)) => {
                        forbidden.remove(&edge);
                    }
                    Err(other) => return Err(other),
                }
            }
            if !accepted {
                saturated[worst] = true;
            }
        }

        self.forbidden_edges = forbidden.len() as u32;
        debug!(
            rounds = self.rounds,
            accepted = self.accepted,
            forbidden = self.forbidden_edges,
            "fairflow converged"
        );
        Ok(current)
    }

    fn diagnostics(&self, out: &mut BTreeMap<String, String>) {
        out.insert("fairflow.rounds".into(), self.rounds.to_string());
        out.insert("fairflow.resolves".into(), self.resolves.to_string());
        out.insert("fairflow.accepted".into(), self.accepted.to_string());
        out.insert("fairflow.forbidden_edges".into(), self.forbidden_edges.to_string());
    }
}

// Lowest-mean unsaturated paper; equal means resolve to the lower id.
fn worst_unsaturated(means: &[Mean], saturated: &[bool]) -> Option<usize> {
    let mut worst: Option<usize> = None;
    for (p, mean) in means.iter().enumerate() {
        if saturated[p] || mean.count == 0 {
            continue;
        }
        worst = match worst {
            None => Some(p),
            Some(current) if mean.compare(&means[current]) == Ordering::Less => Some(p),
            keep => keep,
        };
    }
    worst
}
