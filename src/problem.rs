use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::flow;

/// Hard per-pair constraint, decoded from the {-1, 0, +1} input codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairConstraint {
    Free,
    Locked,
    Conflicted,
}

/// Quota input: a scalar applied to every entity, or one value per entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaInput {
    Uniform(u32),
    PerEntity(Vec<u32>),
}

impl QuotaInput {
    fn resolve(&self, len: usize, field: &'static str) -> Result<Vec<u32>, MatchError> {
        match self {
            QuotaInput::Uniform(value) => Ok(vec![*value; len]),
            QuotaInput::PerEntity(values) if values.len() == len => Ok(values.clone()),
            QuotaInput::PerEntity(values) => Err(MatchError::validation(
                field,
                format!("expected {} entries, got {}", len, values.len()),
            )),
        }
    }
}

/// Canonical, validated matching problem.
///
/// Construction aggregates the weighted score sources into one effective
/// affinity matrix and freezes it together with the constraint matrix and
/// quota vectors; solvers never mutate a `Problem`.
#[derive(Clone, Debug)]
pub struct Problem {
    pub num_papers: usize,
    pub num_reviewers: usize,
    affinity: Vec<f64>,
    constraints: Vec<i8>,
    pub min_reviewers: Vec<u32>,
    pub max_reviewers: Vec<u32>,
    pub min_papers: Vec<u32>,
    pub max_papers: Vec<u32>,
    probability_limits: Option<Vec<f64>>,
    pub allow_zero_score_assignments: bool,
}

// Effective affinities beyond this magnitude would not survive the integer
// cost scaling in the flow kernel.
const MAX_AFFINITY_MAGNITUDE: f64 = 1e12;

impl Problem {
    /// Build and validate a problem from raw inputs.
    ///
    /// `scores` are dense paper-major matrices, one per source; rows may be
    /// shorter than `num_reviewers`, missing entries contribute 0. The
    /// effective affinity is `sum_i weights[i] * scores[i]`; weights may be
    /// negative. Validation short-circuits on the first offending field.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        num_papers: usize,
        num_reviewers: usize,
        scores: &[Vec<Vec<f64>>],
        weights: &[f64],
        constraints: Option<&[Vec<i8>]>,
        min_reviewers: &QuotaInput,
        max_reviewers: &QuotaInput,
        min_papers: &QuotaInput,
        max_papers: &QuotaInput,
        probability_limits: Option<&[Vec<f64>]>,
        allow_zero_score_assignments: bool,
    ) -> Result<Problem, MatchError> {
        if weights.len() != scores.len() {
            return Err(MatchError::validation(
                "weights",
                format!("{} weights for {} score sources", weights.len(), scores.len()),
            ));
        }

        let mut affinity = vec![0.0; num_papers * num_reviewers];
        for (source, weight) in scores.iter().zip(weights) {
            if !weight.is_finite() {
                return Err(MatchError::validation("weights", "weight is not finite"));
            }
            if source.len() != num_papers {
                return Err(MatchError::validation(
                    "scores",
                    format!("score matrix has {} rows, expected {}", source.len(), num_papers),
                ));
            }
            for (p, row) in source.iter().enumerate() {
                if row.len() > num_reviewers {
                    return Err(MatchError::validation(
                        "scores",
                        format!("row {} has {} entries, expected at most {}", p, row.len(), num_reviewers),
                    ));
                }
                for (r, value) in row.iter().enumerate() {
                    if !value.is_finite() {
                        return Err(MatchError::validation(
                            "scores",
                            format!("score ({p}, {r}) is not finite"),
                        ));
                    }
                    affinity[p * num_reviewers + r] += weight * value;
                }
            }
        }
        if let Some(bad) = affinity.iter().find(|a| a.abs() > MAX_AFFINITY_MAGNITUDE) {
            return Err(MatchError::validation(
                "scores",
                format!("effective affinity {bad} exceeds the supported magnitude"),
            ));
        }

        let mut codes = vec![0i8; num_papers * num_reviewers];
        if let Some(matrix) = constraints {
            if matrix.len() != num_papers {
                return Err(MatchError::validation(
                    "constraints",
                    format!("constraint matrix has {} rows, expected {}", matrix.len(), num_papers),
                ));
            }
            for (p, row) in matrix.iter().enumerate() {
                if row.len() > num_reviewers {
                    return Err(MatchError::validation(
                        "constraints",
                        format!("row {} has {} entries, expected at most {}", p, row.len(), num_reviewers),
                    ));
                }
                for (r, code) in row.iter().enumerate() {
                    if !matches!(code, -1 | 0 | 1) {
                        return Err(MatchError::validation(
                            "constraints",
                            format!("unknown constraint code {code} at ({p}, {r})"),
                        ));
                    }
                    codes[p * num_reviewers + r] = *code;
                }
            }
        }

        let min_reviewers = min_reviewers.resolve(num_papers, "min_reviewers")?;
        let max_reviewers = max_reviewers.resolve(num_papers, "max_reviewers")?;
        let min_papers = min_papers.resolve(num_reviewers, "min_papers")?;
        let max_papers = max_papers.resolve(num_reviewers, "max_papers")?;
        for p in 0..num_papers {
            if min_reviewers[p] > max_reviewers[p] {
                return Err(MatchError::validation(
                    "min_reviewers",
                    format!("paper {p}: min {} > max {}", min_reviewers[p], max_reviewers[p]),
                ));
            }
        }
        for r in 0..num_reviewers {
            if min_papers[r] > max_papers[r] {
                return Err(MatchError::validation(
                    "min_papers",
                    format!("reviewer {r}: min {} > max {}", min_papers[r], max_papers[r]),
                ));
            }
        }

        let probability_limits = match probability_limits {
            None => None,
            Some(matrix) => {
                if matrix.len() != num_papers {
                    return Err(MatchError::validation(
                        "probability_limits",
                        format!("limit matrix has {} rows, expected {}", matrix.len(), num_papers),
                    ));
                }
                let mut limits = vec![1.0; num_papers * num_reviewers];
                for (p, row) in matrix.iter().enumerate() {
                    if row.len() > num_reviewers {
                        return Err(MatchError::validation(
                            "probability_limits",
                            format!("row {} has {} entries, expected at most {}", p, row.len(), num_reviewers),
                        ));
                    }
                    for (r, q) in row.iter().enumerate() {
                        if !(0.0..=1.0).contains(q) {
                            return Err(MatchError::validation(
                                "probability_limits",
                                format!("limit {q} at ({p}, {r}) is outside [0, 1]"),
                            ));
                        }
                        limits[p * num_reviewers + r] = *q;
                    }
                }
                for p in 0..num_papers {
                    for r in 0..num_reviewers {
                        if codes[p * num_reviewers + r] == 1 && limits[p * num_reviewers + r] != 1.0 {
                            return Err(MatchError::validation(
                                "probability_limits",
                                format!("locked pair ({p}, {r}) requires a limit of 1"),
                            ));
                        }
                    }
                }
                Some(limits)
            }
        };

        let mut problem = Problem {
            num_papers,
            num_reviewers,
            affinity,
            constraints: codes,
            min_reviewers,
            max_reviewers,
            min_papers,
            max_papers,
            probability_limits,
            allow_zero_score_assignments,
        };
        if !allow_zero_score_assignments {
            problem.relax_unusable_reviewers();
        }
        Ok(problem)
    }

    // Reviewers with no free nonzero-affinity pair can never legally reach a
    // positive minimum load once zero-score edges are dropped.
    fn relax_unusable_reviewers(&mut self) {
        let mut relaxed = 0usize;
        for r in 0..self.num_reviewers {
            if self.min_papers[r] == 0 {
                continue;
            }
            let usable = (0..self.num_papers).any(|p| {
                self.constraint(p, r) == PairConstraint::Free && self.affinity(p, r) != 0.0
            });
            if !usable {
                self.min_papers[r] = 0;
                relaxed += 1;
            }
        }
        if relaxed > 0 {
            debug!(relaxed, "set min_papers to 0 for reviewers without usable affinity edges");
        }
    }

    #[inline]
    pub fn affinity(&self, paper: usize, reviewer: usize) -> f64 {
        self.affinity[paper * self.num_reviewers + reviewer]
    }

    #[inline]
    pub fn constraint(&self, paper: usize, reviewer: usize) -> PairConstraint {
        match self.constraints[paper * self.num_reviewers + reviewer] {
            1 => PairConstraint::Locked,
            -1 => PairConstraint::Conflicted,
            _ => PairConstraint::Free,
        }
    }

    /// Probability limit for a pair; defaults to 1 when no matrix was given.
    #[inline]
    pub fn probability_limit(&self, paper: usize, reviewer: usize) -> f64 {
        self.probability_limits
            .as_ref()
            .map_or(1.0, |limits| limits[paper * self.num_reviewers + reviewer])
    }

    pub fn has_probability_limits(&self) -> bool {
        self.probability_limits.is_some()
    }

    /// Whether a pair may carry an optional assignment edge. Locked pairs
    /// are excluded here: they are pre-committed, not optional.
    #[inline]
    pub(crate) fn assignable(&self, paper: usize, reviewer: usize) -> bool {
        self.constraint(paper, reviewer) == PairConstraint::Free
            && (self.allow_zero_score_assignments || self.affinity(paper, reviewer) != 0.0)
    }

    pub(crate) fn locked_pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();
        for p in 0..self.num_papers {
            for r in 0..self.num_reviewers {
                if self.constraint(p, r) == PairConstraint::Locked {
                    pairs.push((p as u32, r as u32));
                }
            }
        }
        pairs
    }

    /// Demand/supply totals and per-entity lock counts. Cheap; every solver
    /// runs this before touching a graph.
    pub(crate) fn check_totals(&self) -> Result<(), MatchError> {
        let total_min_reviewers: u64 = self.min_reviewers.iter().map(|&v| u64::from(v)).sum();
        let total_max_reviewers: u64 = self.max_reviewers.iter().map(|&v| u64::from(v)).sum();
        let total_min_papers: u64 = self.min_papers.iter().map(|&v| u64::from(v)).sum();
        let total_max_papers: u64 = self.max_papers.iter().map(|&v| u64::from(v)).sum();
        if total_min_reviewers > total_max_papers {
            return Err(MatchError::infeasible(format!(
                "sum of max_papers ({total_max_papers}) < sum of min_reviewers ({total_min_reviewers})"
            )));
        }
        if total_min_papers > total_max_reviewers {
            return Err(MatchError::infeasible(format!(
                "sum of max_reviewers ({total_max_reviewers}) < sum of min_papers ({total_min_papers})"
            )));
        }

        let mut locked_per_paper = vec![0u32; self.num_papers];
        let mut locked_per_reviewer = vec![0u32; self.num_reviewers];
        for (p, r) in self.locked_pairs() {
            locked_per_paper[p as usize] += 1;
            locked_per_reviewer[r as usize] += 1;
        }
        for p in 0..self.num_papers {
            if locked_per_paper[p] > self.max_reviewers[p] {
                return Err(MatchError::infeasible(format!(
                    "paper {p} has {} locked reviewers but max_reviewers {}",
                    locked_per_paper[p], self.max_reviewers[p]
                )));
            }
        }
        for r in 0..self.num_reviewers {
            if locked_per_reviewer[r] > self.max_papers[r] {
                return Err(MatchError::infeasible(format!(
                    "reviewer {r} has {} locked papers but max_papers {}",
                    locked_per_reviewer[r], self.max_papers[r]
                )));
            }
        }
        Ok(())
    }

    /// Full feasibility test: demand/supply sums plus a max-flow check on
    /// the hard-constraint graph (locks pre-committed, conflicts removed).
    pub fn feasibility_check(&self, cancel: &CancelToken) -> Result<(), MatchError> {
        self.check_totals()?;
        let forbidden = BTreeSet::new();
        let mut graph = flow::build_assignment_graph(self, &forbidden, false, cancel)?;
        graph.solve(cancel)?;
        graph.require_minimums(self)
    }
}
