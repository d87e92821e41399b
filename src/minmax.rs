use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::flow::{self, SCALE};
use crate::problem::Problem;
use crate::solution::Assignment;
use crate::solver::Solver;

/// Optimal assignment under the hard quota constraints: one min-cost
/// max-flow solve on the bipartite graph.
///
/// Total affinity is optimal over integral assignments up to the integer
/// scaling slack (`num_edges / SCALE`). Deterministic: pair arcs enter the
/// graph in ascending (paper, reviewer) order.
#[derive(Clone, Debug, Default)]
pub struct MinMaxSolver {
    pub flow_value: i64,
    pub scaled_total: i64,
}

/// One MinMax solve with an explicit forbidden-edge set. FairFlow drives
/// this directly while it tightens its graph.
pub(crate) fn solve_with_forbidden(
    problem: &Problem,
    forbidden: &BTreeSet<(u32, u32)>,
    cancel: &CancelToken,
) -> Result<Assignment, MatchError> {
    problem.check_totals()?;
    let mut graph = flow::build_assignment_graph(problem, forbidden, true, cancel)?;
    graph.solve(cancel)?;
    graph.require_minimums(problem)?;
    let assignment = Assignment::from_pairs(problem.num_papers, graph.assigned_pairs());
    debug!(
        flow = graph.flow_value(),
        assigned = assignment.num_assigned(),
        "min-cost flow assignment extracted"
    );
    Ok(assignment)
}

impl Solver for MinMaxSolver {
    fn solve(&mut self, problem: &Problem, cancel: &CancelToken) -> Result<Assignment, MatchError> {
        let assignment = solve_with_forbidden(problem, &BTreeSet::new(), cancel)?;
        self.flow_value = assignment.num_assigned() as i64;
        self.scaled_total = (assignment.total_affinity(problem) * SCALE).round() as i64;
        Ok(assignment)
    }

    fn diagnostics(&self, out: &mut BTreeMap<String, String>) {
        out.insert("minmax.flow".into(), self.flow_value.to_string());
        out.insert("minmax.scaled_total".into(), self.scaled_total.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::MinMaxSolver;
    use crate::cancel::CancelToken;
    use crate::error::MatchError;
    use crate::problem::tests::simple_problem;
    use crate::solver::Solver;

    fn two_by_two(constraints: Option<Vec<Vec<i8>>>) -> crate::problem::Problem {
        simple_problem(vec![vec![1.0, 0.1], vec![0.1, 1.0]], constraints, 1, 1, 1, 1)
    }

    #[test]
    fn picks_the_diagonal_optimum() {
        let problem = two_by_two(None);
        let assignment = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assert_eq!(assignment.reviewers_of(0), &[0]);
        assert_eq!(assignment.reviewers_of(1), &[1]);
        assert!((assignment.total_affinity(&problem) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn conflict_forces_the_swap() {
        let problem = two_by_two(Some(vec![vec![-1, 0], vec![0, 0]]));
        let assignment = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assert_eq!(assignment.reviewers_of(0), &[1]);
        assert_eq!(assignment.reviewers_of(1), &[0]);
        assert!((assignment.total_affinity(&problem) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn lock_overrides_the_optimum() {
        let problem = two_by_two(Some(vec![vec![0, 1], vec![0, 0]]));
        let assignment = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assert_eq!(assignment.reviewers_of(0), &[1]);
        assert_eq!(assignment.reviewers_of(1), &[0]);
        assert!((assignment.total_affinity(&problem) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn infeasible_demand_is_reported() {
        let problem = simple_problem(vec![vec![1.0], vec![1.0]], None, 1, 1, 0, 1);
        let err = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, MatchError::Infeasible(_)));
    }

    #[test]
    fn fills_papers_up_to_max() {
        // 1 paper taking up to 3 of 4 reviewers; top three win
        let problem = simple_problem(vec![vec![0.9, 0.1, 0.8, 0.7]], None, 0, 3, 0, 1);
        let assignment = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        assert_eq!(assignment.reviewers_of(0), &[0, 2, 3]);
    }

    #[test]
    fn accepts_negative_affinities() {
        let problem = simple_problem(vec![vec![-0.5, -0.1], vec![-0.2, -0.9]], None, 1, 1, 1, 1);
        let assignment = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        // optimum is -0.1 + -0.2
        assert_eq!(assignment.reviewers_of(0), &[1]);
        assert_eq!(assignment.reviewers_of(1), &[0]);
    }

    #[test]
    fn reviewer_minimums_pull_in_load() {
        // reviewer 1 is weak but must take one paper
        let problem = simple_problem(vec![vec![0.9, 0.1], vec![0.8, 0.2]], None, 1, 1, 1, 2);
        let assignment = MinMaxSolver::default()
            .solve(&problem, &CancelToken::new())
            .unwrap();
        let loads = assignment.reviewer_loads(2);
        assert_eq!(loads, vec![1, 1]);
        // the cheaper concession is paper 0 keeping reviewer 0
        assert_eq!(assignment.reviewers_of(1), &[1]);
    }

    #[test]
    fn deterministic_across_reruns() {
        let problem = simple_problem(
            vec![
                vec![0.5, 0.5, 0.2],
                vec![0.5, 0.5, 0.2],
                vec![0.2, 0.2, 0.5],
            ],
            None,
            1,
            1,
            0,
            2,
        );
        let first = MinMaxSolver::default().solve(&problem, &CancelToken::new()).unwrap();
        let second = MinMaxSolver::default().solve(&problem, &CancelToken::new()).unwrap();
        assert_eq!(first, second);
    }
}
