use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::fairflow::FairFlowSolver;
use crate::fairseq::FairSequenceSolver;
use crate::minmax::MinMaxSolver;
use crate::problem::{Problem, QuotaInput};
use crate::randomized::RandomizedSolver;
use crate::solution::{alternates, Assignment};

/// Shared contract of the four assignment solvers.
///
/// A solver is constructed per solve, owns its transient graphs and
/// tableaux, and reports counters through `diagnostics` afterwards.
pub trait Solver {
    fn solve(&mut self, problem: &Problem, cancel: &CancelToken) -> Result<Assignment, MatchError>;

    fn diagnostics(&self, out: &mut BTreeMap<String, String>);

    /// Marginal matrix for auditing; only the Randomized solver has one.
    fn fractional_assignment(&self, _problem: &Problem) -> Option<Vec<Vec<f64>>> {
        None
    }
}

/// Which solver to dispatch; decided once at entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    MinMax,
    FairFlow,
    Randomized,
    FairSequence,
}

/// Terminal state of a solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Complete,
    Infeasible,
    Cancelled,
    SolverError,
}

/// In-memory input record: everything a solve needs, supplied by the
/// caller. Ids are opaque labels; all internal math runs on 0-based
/// indices in id order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchRequest {
    pub paper_ids: Vec<String>,
    pub reviewer_ids: Vec<String>,
    /// dense paper-major score matrices, one per source
    pub scores: Vec<Vec<Vec<f64>>>,
    pub weights: Vec<f64>,
    /// {-1, 0, +1} per pair; omitted means unconstrained
    #[serde(default)]
    pub constraints: Option<Vec<Vec<i8>>>,
    pub min_reviewers: QuotaInput,
    pub max_reviewers: QuotaInput,
    pub min_papers: QuotaInput,
    pub max_papers: QuotaInput,
    #[serde(default)]
    pub probability_limits: Option<Vec<Vec<f64>>>,
    pub solver: SolverKind,
    #[serde(default)]
    pub num_alternates: u32,
    /// Randomized solver only; deterministic per seed
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_allow_zero")]
    pub allow_zero_score_assignments: bool,
}

fn default_allow_zero() -> bool {
    true
}

/// Output record of a solve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchResult {
    pub status: Status,
    /// per paper, assigned reviewer ids in ascending reviewer order
    pub assignment: Vec<Vec<String>>,
    /// per paper, alternates by descending affinity
    pub alternates: Vec<Vec<String>>,
    /// total affinity of the returned assignment
    pub objective: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fractional_assignment: Option<Vec<Vec<f64>>>,
    pub diagnostics: BTreeMap<String, String>,
    /// human-readable failure reason when status is not Complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MatchResult {
    fn failed(status: Status, message: String, diagnostics: BTreeMap<String, String>) -> Self {
        MatchResult {
            status,
            assignment: Vec::new(),
            alternates: Vec::new(),
            objective: 0.0,
            fractional_assignment: None,
            diagnostics,
            message: Some(message),
        }
    }
}

fn build_problem(request: &MatchRequest) -> Result<Problem, MatchError> {
    if request.paper_ids.is_empty() {
        return Err(MatchError::validation("paper_ids", "no papers"));
    }
    if request.reviewer_ids.is_empty() {
        return Err(MatchError::validation("reviewer_ids", "no reviewers"));
    }
    Problem::build(
        request.paper_ids.len(),
        request.reviewer_ids.len(),
        &request.scores,
        &request.weights,
        request.constraints.as_deref(),
        &request.min_reviewers,
        &request.max_reviewers,
        &request.min_papers,
        &request.max_papers,
        request.probability_limits.as_deref(),
        request.allow_zero_score_assignments,
    )
}

/// Run one match end to end: validate, dispatch the solver, rank
/// alternates, and fold any solve-phase failure into the result status.
///
/// Validation failures are returned as an `Err` instead: the output
/// status vocabulary does not cover them, and callers (the CLI included)
/// report them separately.
pub fn run_match(request: &MatchRequest, cancel: &CancelToken) -> Result<MatchResult, MatchError> {
    let problem = build_problem(request)?;
    debug!(
        papers = problem.num_papers,
        reviewers = problem.num_reviewers,
        solver = ?request.solver,
        "starting solve"
    );

    let mut solver: Box<dyn Solver> = match request.solver {
        SolverKind::MinMax => Box::new(MinMaxSolver::default()),
        SolverKind::FairFlow => Box::new(FairFlowSolver::default()),
        SolverKind::Randomized => Box::new(RandomizedSolver::new(request.seed)),
        SolverKind::FairSequence => Box::new(FairSequenceSolver::default()),
    };

    let mut diagnostics = BTreeMap::new();
    let assignment = match solver.solve(&problem, cancel) {
        Ok(assignment) => assignment,
        Err(err) => {
            solver.diagnostics(&mut diagnostics);
            let status = match &err {
                MatchError::Infeasible(_) => Status::Infeasible,
                MatchError::Cancelled => Status::Cancelled,
                MatchError::Solver(_) => Status::SolverError,
                MatchError::Validation { .. } => return Err(err),
            };
            return Ok(MatchResult::failed(status, err.to_string(), diagnostics));
        }
    };

    solver.diagnostics(&mut diagnostics);
    for p in 0..problem.num_papers {
        diagnostics.insert(
            format!("paper_mean_affinity.{}", request.paper_ids[p]),
            format!("{:.6}", assignment.paper_mean(&problem, p)),
        );
    }

    let alternate_indices = alternates(&problem, &assignment, request.num_alternates as usize);
    let label = |r: u32| request.reviewer_ids[r as usize].clone();
    Ok(MatchResult {
        status: Status::Complete,
        assignment: (0..problem.num_papers)
            .map(|p| assignment.reviewers_of(p).iter().copied().map(label).collect())
            .collect(),
        alternates: alternate_indices
            .iter()
            .map(|row| row.iter().copied().map(label).collect())
            .collect(),
        objective: assignment.total_affinity(&problem),
        fractional_assignment: solver.fractional_assignment(&problem),
        diagnostics,
        message: None,
    })
}

#[cfg(test)]
#[generic_tests::define]
mod contract {
    use std::collections::BTreeSet;

    use rand::distributions::{Distribution, Uniform};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::Solver;
    use crate::cancel::CancelToken;
    use crate::error::MatchError;
    use crate::fairflow::FairFlowSolver;
    use crate::fairseq::FairSequenceSolver;
    use crate::minmax::MinMaxSolver;
    use crate::problem::{PairConstraint, Problem, QuotaInput};
    use crate::randomized::RandomizedSolver;
    use crate::solution::alternates;

    fn init_tracing() {
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .finish(),
        );
    }

    fn random_problem(seed: u64, num_papers: usize, num_reviewers: usize) -> Problem {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let between = Uniform::from(0.05..1.0);
        let scores: Vec<Vec<f64>> = (0..num_papers)
            .map(|_| (0..num_reviewers).map(|_| between.sample(&mut rng)).collect())
            .collect();
        // sprinkle a conflict and a lock
        let mut constraints = vec![vec![0i8; num_reviewers]; num_papers];
        constraints[0][0] = -1;
        constraints[num_papers - 1][num_reviewers - 1] = 1;
        Problem::build(
            num_papers,
            num_reviewers,
            &[scores],
            &[1.0],
            Some(&constraints),
            &QuotaInput::Uniform(1),
            &QuotaInput::Uniform(2),
            &QuotaInput::Uniform(0),
            &QuotaInput::Uniform(2),
            None,
            true,
        )
        .expect("problem should build")
    }

    #[test]
    fn output_satisfies_universal_invariants<S: Solver + Default>() {
        init_tracing();
        for seed in [3u64, 17, 99] {
            let problem = random_problem(seed, 4, 6);
            let assignment = S::default()
                .solve(&problem, &CancelToken::new())
                .expect("random instance is feasible");
            // quotas, loads, conflicts, locks, uniqueness
            assignment.validate(&problem).expect("invariants hold");

            // alternates stay disjoint from the assignment and conflicts
            let alts = alternates(&problem, &assignment, 3);
            for p in 0..problem.num_papers {
                assert!(alts[p].len() <= 3);
                let unique: BTreeSet<u32> = alts[p].iter().copied().collect();
                assert_eq!(unique.len(), alts[p].len());
                for &r in &alts[p] {
                    assert!(!assignment.contains(p, r));
                    assert_ne!(problem.constraint(p, r as usize), PairConstraint::Conflicted);
                }
            }
        }
    }

    #[test]
    fn infeasible_instances_are_rejected<S: Solver + Default>() {
        // 2 papers demanding a reviewer each, one reviewer of capacity 1
        let problem = Problem::build(
            2,
            1,
            &[vec![vec![1.0], vec![1.0]]],
            &[1.0],
            None,
            &QuotaInput::Uniform(1),
            &QuotaInput::Uniform(1),
            &QuotaInput::Uniform(0),
            &QuotaInput::Uniform(1),
            None,
            true,
        )
        .unwrap();
        let err = S::default().solve(&problem, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, MatchError::Infeasible(_)));
    }

    #[test]
    fn reruns_are_byte_identical<S: Solver + Default>() {
        let problem = random_problem(7, 5, 8);
        let first = S::default().solve(&problem, &CancelToken::new()).unwrap();
        let second = S::default().solve(&problem, &CancelToken::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cancellation_short_circuits<S: Solver + Default>() {
        let problem = random_problem(11, 4, 6);
        let token = CancelToken::new();
        token.cancel();
        let err = S::default().solve(&problem, &token).unwrap_err();
        assert!(matches!(err, MatchError::Cancelled));
    }

    #[instantiate_tests(<MinMaxSolver>)]
    mod minmax {}

    #[instantiate_tests(<FairFlowSolver>)]
    mod fairflow {}

    #[instantiate_tests(<RandomizedSolver>)]
    mod randomized {}

    #[instantiate_tests(<FairSequenceSolver>)]
    mod fairsequence {}
}
