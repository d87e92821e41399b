use std::collections::BTreeMap;

use good_lp::{microlp, variable, variables, Expression, ResolutionError, Solution, SolverModel, Variable};
use rand::distributions::{Bernoulli, Distribution};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::problem::{PairConstraint, Problem};
use crate::solution::Assignment;
use crate::solver::Solver;

/// LP outputs within this distance of 0 or 1 are snapped before sampling.
pub const ROUND_EPS: f64 = 1e-6;

// Tolerance for the per-round row/column sum invariant check; the snap
// drifts sums by at most ROUND_EPS per edge per round.
const SUM_TOLERANCE: f64 = 1e-3;

/// Two-stage randomized assignment: a linear program over probability-
/// limited marginals, then a randomized decomposition that samples one
/// integral assignment whose expectation equals the marginals exactly.
///
/// Deterministic per seed: the same problem and seed reproduce the same
/// assignment byte for byte.
#[derive(Clone, Debug)]
pub struct RandomizedSolver {
    seed: u64,
    pub rounds: u32,
    pub lp_objective: f64,
    fractional: Option<Vec<f64>>,
}

impl RandomizedSolver {
    pub fn new(seed: u64) -> Self {
        RandomizedSolver {
            seed,
            rounds: 0,
            lp_objective: 0.0,
            fractional: None,
        }
    }
}

impl Default for RandomizedSolver {
    fn default() -> Self {
        RandomizedSolver::new(0)
    }
}

impl Solver for RandomizedSolver {
    fn solve(&mut self, problem: &Problem, cancel: &CancelToken) -> Result<Assignment, MatchError> {
        problem.check_totals()?;
        cancel.check()?;
        let marginals = solve_marginal_lp(problem, &mut self.lp_objective)?;
        self.fractional = Some(marginals.clone());
        let (assignment, rounds) = sample_assignment(problem, &marginals, self.seed, cancel)?;
        self.rounds = rounds;
        // the decomposition must never leave the feasible polytope
        assignment.validate(problem)?;
        debug!(rounds, lp_objective = self.lp_objective, "sampled assignment");
        Ok(assignment)
    }

    fn diagnostics(&self, out: &mut BTreeMap<String, String>) {
        out.insert("randomized.lp_status".into(), "optimal".into());
        out.insert("randomized.lp_objective".into(), format!("{:.6}", self.lp_objective));
        out.insert("randomized.rounds".into(), self.rounds.to_string());
    }

    fn fractional_assignment(&self, problem: &Problem) -> Option<Vec<Vec<f64>>> {
        self.fractional.as_ref().map(|flat| {
            flat.chunks(problem.num_reviewers)
                .map(<[f64]>::to_vec)
                .collect()
        })
    }
}

/// Stage 1: maximize total affinity over marginals `x(p,r)` bounded by the
/// probability limits, with quota interval constraints on every row and
/// column. Conflicted pairs carry no variable; locked pairs are fixed at 1.
fn solve_marginal_lp(problem: &Problem, objective_out: &mut f64) -> Result<Vec<f64>, MatchError> {
    let n_reviewers = problem.num_reviewers;
    let mut vars = variables!();
    let mut cells: Vec<Option<Variable>> = vec![None; problem.num_papers * n_reviewers];
    let mut objective = Expression::default();
    for p in 0..problem.num_papers {
        for r in 0..n_reviewers {
            let var = match problem.constraint(p, r) {
                PairConstraint::Conflicted => continue,
                PairConstraint::Locked => vars.add(variable().min(1.0).max(1.0)),
                PairConstraint::Free => {
                    let limit = problem.probability_limit(p, r);
                    if limit <= 0.0 || !problem.assignable(p, r) {
                        continue;
                    }
                    vars.add(variable().min(0.0).max(limit))
                }
            };
            objective.add_mul(problem.affinity(p, r), var);
            cells[p * n_reviewers + r] = Some(var);
        }
    }

    // a positive minimum with no variables at all can slip past backends
    // that drop empty constraints; report it as the infeasibility it is
    for p in 0..problem.num_papers {
        let vars_in_row = (0..n_reviewers).filter(|&r| cells[p * n_reviewers + r].is_some()).count();
        if vars_in_row == 0 && problem.min_reviewers[p] > 0 {
            return Err(MatchError::infeasible(format!(
                "paper {p} has no assignable reviewers but min_reviewers {}",
                problem.min_reviewers[p]
            )));
        }
    }
    for r in 0..n_reviewers {
        let vars_in_column = (0..problem.num_papers).filter(|&p| cells[p * n_reviewers + r].is_some()).count();
        if vars_in_column == 0 && problem.min_papers[r] > 0 {
            return Err(MatchError::infeasible(format!(
                "reviewer {r} has no assignable papers but min_papers {}",
                problem.min_papers[r]
            )));
        }
    }

    let mut model = vars.maximise(objective.clone()).using(microlp);
    for p in 0..problem.num_papers {
        let mut row = Expression::default();
        for r in 0..n_reviewers {
            if let Some(var) = cells[p * n_reviewers + r] {
                row.add_mul(1.0, var);
            }
        }
        model = model
            .with(row.clone().leq(f64::from(problem.max_reviewers[p])))
            .with(row.geq(f64::from(problem.min_reviewers[p])));
    }
    for r in 0..n_reviewers {
        let mut column = Expression::default();
        for p in 0..problem.num_papers {
            if let Some(var) = cells[p * n_reviewers + r] {
                column.add_mul(1.0, var);
            }
        }
        model = model
            .with(column.clone().leq(f64::from(problem.max_papers[r])))
            .with(column.geq(f64::from(problem.min_papers[r])));
    }

    let solution = model.solve().map_err(|err| match err {
        ResolutionError::Infeasible => {
            MatchError::infeasible("marginal linear program is infeasible")
        }
        other => MatchError::solver(format!("marginal linear program failed: {other}")),
    })?;

    *objective_out = solution.eval(&objective);
    let marginals = cells
        .iter()
        .map(|cell| cell.map_or(0.0, |var| snap(solution.value(var))))
        .collect();
    Ok(marginals)
}

fn snap(value: f64) -> f64 {
    if value < ROUND_EPS {
        0.0
    } else if value > 1.0 - ROUND_EPS {
        1.0
    } else {
        value
    }
}

fn is_fractional(value: f64) -> bool {
    value > 0.0 && value < 1.0
}

/// Stage 2: repeatedly locate a support cycle or path among the fractional
/// edges, perturb it one way or the other with the exact compensating
/// probabilities, and snap whatever lands on a bound. Marginals are
/// preserved in expectation at every round; row/column sums never leave
/// their quota intervals.
pub(crate) fn sample_assignment(
    problem: &Problem,
    marginals: &[f64],
    seed: u64,
    cancel: &CancelToken,
) -> Result<(Assignment, u32), MatchError> {
    let n_papers = problem.num_papers;
    let n_reviewers = problem.num_reviewers;
    let mut x = marginals.to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut rounds = 0u32;
    let round_limit = (x.len() + 4) as u32;

    loop {
        cancel.check()?;
        let fractional: Vec<usize> = (0..x.len()).filter(|&e| is_fractional(x[e])).collect();
        if fractional.is_empty() {
            break;
        }
        if rounds >= round_limit {
            return Err(MatchError::solver("randomized decomposition stalled"));
        }

        // node ids: papers first, then reviewers
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n_papers + n_reviewers];
        for &e in &fractional {
            adj[e / n_reviewers].push(e);
            adj[n_papers + e % n_reviewers].push(e);
        }
        let walk = find_support(&adj, n_papers, n_reviewers);
        if walk.edges.is_empty() {
            return Err(MatchError::solver("randomized decomposition lost its support"));
        }

        let (alpha_up, alpha_dn) = step_bounds(problem, &x, &walk, n_papers, n_reviewers);
        if alpha_up <= 1e-12 || alpha_dn <= 1e-12 {
            return Err(MatchError::solver("randomized decomposition made no progress"));
        }
        let p_up = alpha_dn / (alpha_up + alpha_dn);
        let go_up = Bernoulli::new(p_up)
            .map_err(|err| MatchError::solver(format!("invalid rounding probability: {err}")))?
            .sample(&mut rng);
        let step = if go_up { alpha_up } else { -alpha_dn };
        for (i, &edge) in walk.edges.iter().enumerate() {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            x[edge] = snap((x[edge] + sign * step).clamp(0.0, 1.0));
        }
        rounds += 1;
        trace!(rounds, len = walk.edges.len(), cycle = walk.is_cycle, step, "bvn round");

        check_sums(problem, &x)?;
    }

    let pairs = (0..x.len()).filter(|&e| x[e] > 0.5).map(|e| {
        ((e / n_reviewers) as u32, (e % n_reviewers) as u32)
    });
    Ok((Assignment::from_pairs(n_papers, pairs), rounds))
}

struct SupportWalk {
    edges: Vec<usize>,
    is_cycle: bool,
    // first and last node of the walk; meaningful for paths only
    head: usize,
    tail: usize,
}

// Walk the fractional-edge graph until a node repeats (support cycle) or
// the walk sticks at a degree-1 node (support path). Starting from a
// degree-1 node when one exists guarantees a stuck walk is a real path
// whose endpoints both have fractional sums.
fn find_support(adj: &[Vec<usize>], n_papers: usize, n_reviewers: usize) -> SupportWalk {
    let start = adj
        .iter()
        .position(|edges| edges.len() == 1)
        .or_else(|| adj.iter().position(|edges| !edges.is_empty()))
        .unwrap_or(0);

    let mut edges = Vec::new();
    let mut nodes = vec![start];
    let mut position: BTreeMap<usize, usize> = BTreeMap::new();
    position.insert(start, 0);
    let mut current = start;
    let mut incoming: Option<usize> = None;
    loop {
        let Some(edge) = adj[current].iter().copied().find(|&e| Some(e) != incoming) else {
            // stuck: the walk is a path
            break;
        };
        let other = other_endpoint(edge, current, n_papers, n_reviewers);
        if let Some(&j) = position.get(&other) {
            edges.push(edge);
            return SupportWalk {
                edges: edges[j..].to_vec(),
                is_cycle: true,
                head: other,
                tail: other,
            };
        }
        edges.push(edge);
        nodes.push(other);
        position.insert(other, nodes.len() - 1);
        incoming = Some(edge);
        current = other;
    }
    SupportWalk {
        edges,
        is_cycle: false,
        head: start,
        tail: current,
    }
}

fn other_endpoint(edge: usize, node: usize, n_papers: usize, n_reviewers: usize) -> usize {
    let paper = edge / n_reviewers;
    if node == paper {
        n_papers + edge % n_reviewers
    } else {
        paper
    }
}

// Largest steps in each direction that keep every edge inside [0, 1] and,
// for a path, both endpoint sums inside their quota intervals.
fn step_bounds(
    problem: &Problem,
    x: &[f64],
    walk: &SupportWalk,
    n_papers: usize,
    n_reviewers: usize,
) -> (f64, f64) {
    let mut alpha_up = f64::INFINITY;
    let mut alpha_dn = f64::INFINITY;
    for (i, &edge) in walk.edges.iter().enumerate() {
        if i % 2 == 0 {
            alpha_up = alpha_up.min(1.0 - x[edge]);
            alpha_dn = alpha_dn.min(x[edge]);
        } else {
            alpha_up = alpha_up.min(x[edge]);
            alpha_dn = alpha_dn.min(1.0 - x[edge]);
        }
    }
    if !walk.is_cycle {
        let head_sign = 1.0;
        let tail_sign = if (walk.edges.len() - 1) % 2 == 0 { 1.0 } else { -1.0 };
        for (node, sign) in [(walk.head, head_sign), (walk.tail, tail_sign)] {
            let (sum, lo, hi) = node_interval(problem, x, node, n_papers, n_reviewers);
            if sign > 0.0 {
                alpha_up = alpha_up.min(hi - sum);
                alpha_dn = alpha_dn.min(sum - lo);
            } else {
                alpha_up = alpha_up.min(sum - lo);
                alpha_dn = alpha_dn.min(hi - sum);
            }
        }
    }
    (alpha_up, alpha_dn)
}

fn node_interval(
    problem: &Problem,
    x: &[f64],
    node: usize,
    n_papers: usize,
    n_reviewers: usize,
) -> (f64, f64, f64) {
    if node < n_papers {
        let sum: f64 = (0..n_reviewers).map(|r| x[node * n_reviewers + r]).sum();
        (
            sum,
            f64::from(problem.min_reviewers[node]),
            f64::from(problem.max_reviewers[node]),
        )
    } else {
        let r = node - n_papers;
        let sum: f64 = (0..n_papers).map(|p| x[p * n_reviewers + r]).sum();
        (sum, f64::from(problem.min_papers[r]), f64::from(problem.max_papers[r]))
    }
}

fn check_sums(problem: &Problem, x: &[f64]) -> Result<(), MatchError> {
    let n_reviewers = problem.num_reviewers;
    for p in 0..problem.num_papers {
        let sum: f64 = (0..n_reviewers).map(|r| x[p * n_reviewers + r]).sum();
        if sum < f64::from(problem.min_reviewers[p]) - SUM_TOLERANCE
            || sum > f64::from(problem.max_reviewers[p]) + SUM_TOLERANCE
        {
            return Err(MatchError::solver(format!(
                "paper {p} marginal sum {sum} left its quota interval"
            )));
        }
    }
    for r in 0..n_reviewers {
        let sum: f64 = (0..problem.num_papers).map(|p| x[p * n_reviewers + r]).sum();
        if sum < f64::from(problem.min_papers[r]) - SUM_TOLERANCE
            || sum > f64::from(problem.max_papers[r]) + SUM_TOLERANCE
        {
            return Err(MatchError::solver(format!(
                "reviewer {r} marginal sum {sum} left its quota interval"
            )));
        }
    }
    Ok(())
}
