use displaydoc::Display;

/// Error kinds surfaced by the matching core.
///
/// These are tagged result values, not panics: validation failures are
/// detected before a solve begins, the remaining kinds terminate a solve.
#[derive(Clone, Debug, Display)]
pub enum MatchError {
    /// invalid {field}: {reason}
    Validation {
        /// first offending input field
        field: &'static str,
        /// what was wrong with it
        reason: String,
    },
    /// no feasible assignment: {0}
    Infeasible(String),
    /// solver failure: {0}
    Solver(String),
    /// solve was cancelled
    Cancelled,
}

impl std::error::Error for MatchError {}

impl MatchError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        MatchError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn infeasible(reason: impl Into<String>) -> Self {
        MatchError::Infeasible(reason.into())
    }

    pub fn solver(reason: impl Into<String>) -> Self {
        MatchError::Solver(reason.into())
    }
}
