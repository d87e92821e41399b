//! Paper–reviewer assignment solvers.
//!
//! Four interchangeable solvers behind one contract: `MinMax` (optimal
//! min-cost flow), `FairFlow` (iterated re-solves raising the worst-off
//! paper), `Randomized` (probability-limited LP marginals sampled into an
//! integral assignment), and `FairSequence` (a WEF1 picking sequence).
//! Every solver honors the same quota, conflict, and lock invariants and
//! reports infeasibility rather than bending them.
//!
//! The core is synchronous and single-threaded; a solve is a pure function
//! of its inputs plus, for the Randomized solver, an explicit 64-bit seed.
//! Long solves can be interrupted through a shared [`CancelToken`].

#![forbid(unsafe_code)]

pub mod cancel;
pub mod error;
pub mod fairflow;
pub mod fairseq;
pub mod flow;
pub mod minmax;
pub mod problem;
pub mod randomized;
pub mod solution;
pub mod solver;

pub use cancel::CancelToken;
pub use error::MatchError;
pub use problem::{PairConstraint, Problem, QuotaInput};
pub use solution::Assignment;
pub use solver::{run_match, MatchRequest, MatchResult, Solver, SolverKind, Status};
