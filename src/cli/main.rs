#![warn(clippy::all, clippy::pedantic)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use review_matcher::{run_match, CancelToken, MatchError, MatchRequest, QuotaInput, SolverKind, Status};

/// Assign reviewers to papers from affinity score files
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    /// Affinity score file(s): whitespace-separated `paper_id reviewer_id score` lines
    #[arg(short, long, required = true, num_args = 1..)]
    scores: Vec<PathBuf>,

    /// Weight per score file; defaults to 1.0 each
    #[arg(short, long, num_args = 0..)]
    weights: Vec<f64>,

    /// Conflict file: `paper_id reviewer_id` lines that must not match
    #[arg(long)]
    conflicts: Option<PathBuf>,

    /// Lock file: `paper_id reviewer_id` lines that must match
    #[arg(long)]
    locks: Option<PathBuf>,

    /// Minimum reviewers per paper
    #[arg(long, default_value_t = 0)]
    min_reviewers: u32,

    /// Maximum reviewers per paper
    #[arg(long, default_value_t = 3)]
    max_reviewers: u32,

    /// Minimum papers per reviewer
    #[arg(long, default_value_t = 0)]
    min_papers: u32,

    /// Maximum papers per reviewer
    #[arg(long, default_value_t = 6)]
    max_papers: u32,

    #[arg(long, value_enum, default_value = "min-max")]
    solver: SolverArg,

    /// Number of alternates to rank per paper
    #[arg(long, default_value_t = 0)]
    alternates: u32,

    /// Seed for the randomized solver
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Uniform probability limit for the randomized solver
    #[arg(long)]
    probability_limit: Option<f64>,

    /// Drop zero-affinity pairs and relax the minimums of reviewers left
    /// without usable edges
    #[arg(long)]
    skip_zero_scores: bool,

    /// Path for the JSON result; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SolverArg {
    MinMax,
    FairFlow,
    Randomized,
    FairSequence,
}

impl From<SolverArg> for SolverKind {
    fn from(value: SolverArg) -> Self {
        match value {
            SolverArg::MinMax => SolverKind::MinMax,
            SolverArg::FairFlow => SolverKind::FairFlow,
            SolverArg::Randomized => SolverKind::Randomized,
            SolverArg::FairSequence => SolverKind::FairSequence,
        }
    }
}

// One score file: (paper_id, reviewer_id) -> score, last entry wins.
fn read_scores(path: &Path) -> Result<BTreeMap<(String, String), f64>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut entries = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(paper), Some(reviewer), Some(score)) =
            (fields.next(), fields.next(), fields.next())
        else {
            bail!("{}:{}: expected `paper_id reviewer_id score`", path.display(), lineno + 1);
        };
        let score: f64 = score
            .parse()
            .with_context(|| format!("{}:{}: bad score `{score}`", path.display(), lineno + 1))?;
        entries.insert((paper.to_string(), reviewer.to_string()), score);
    }
    Ok(entries)
}

fn read_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut pairs = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(paper), Some(reviewer)) = (fields.next(), fields.next()) else {
            bail!("{}:{}: expected `paper_id reviewer_id`", path.display(), lineno + 1);
        };
        pairs.push((paper.to_string(), reviewer.to_string()));
    }
    Ok(pairs)
}

fn build_request(args: &Args) -> Result<MatchRequest> {
    let sources: Vec<BTreeMap<(String, String), f64>> = args
        .scores
        .iter()
        .map(|path| read_scores(path))
        .collect::<Result<_>>()?;
    let conflicts = args.conflicts.as_deref().map(read_pairs).transpose()?.unwrap_or_default();
    let locks = args.locks.as_deref().map(read_pairs).transpose()?.unwrap_or_default();

    let weights = if args.weights.is_empty() {
        vec![1.0; sources.len()]
    } else if args.weights.len() == sources.len() {
        args.weights.clone()
    } else {
        bail!("{} weights given for {} score files", args.weights.len(), sources.len());
    };

    // the index space is the sorted union of every id we saw
    let mut papers: BTreeSet<&str> = BTreeSet::new();
    let mut reviewers: BTreeSet<&str> = BTreeSet::new();
    for source in &sources {
        for (paper, reviewer) in source.keys() {
            papers.insert(paper);
            reviewers.insert(reviewer);
        }
    }
    for (paper, reviewer) in conflicts.iter().chain(&locks) {
        papers.insert(paper);
        reviewers.insert(reviewer);
    }
    let paper_ids: Vec<String> = papers.iter().map(ToString::to_string).collect();
    let reviewer_ids: Vec<String> = reviewers.iter().map(ToString::to_string).collect();
    let paper_index: BTreeMap<&str, usize> =
        papers.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let reviewer_index: BTreeMap<&str, usize> =
        reviewers.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // missing pairs default to 0
    let score_matrices: Vec<Vec<Vec<f64>>> = sources
        .iter()
        .map(|source| {
            let mut matrix = vec![vec![0.0; reviewer_ids.len()]; paper_ids.len()];
            for ((paper, reviewer), score) in source {
                matrix[paper_index[paper.as_str()]][reviewer_index[reviewer.as_str()]] = *score;
            }
            matrix
        })
        .collect();

    let mut constraints = vec![vec![0i8; reviewer_ids.len()]; paper_ids.len()];
    for (paper, reviewer) in &conflicts {
        constraints[paper_index[paper.as_str()]][reviewer_index[reviewer.as_str()]] = -1;
    }
    for (paper, reviewer) in &locks {
        let cell = &mut constraints[paper_index[paper.as_str()]][reviewer_index[reviewer.as_str()]];
        if *cell == -1 {
            bail!("pair ({paper}, {reviewer}) is both locked and conflicted");
        }
        *cell = 1;
    }

    let probability_limits = args.probability_limit.map(|limit| {
        vec![vec![limit; reviewer_ids.len()]; paper_ids.len()]
    });

    Ok(MatchRequest {
        paper_ids,
        reviewer_ids,
        scores: score_matrices,
        weights,
        constraints: Some(constraints),
        min_reviewers: QuotaInput::Uniform(args.min_reviewers),
        max_reviewers: QuotaInput::Uniform(args.max_reviewers),
        min_papers: QuotaInput::Uniform(args.min_papers),
        max_papers: QuotaInput::Uniform(args.max_papers),
        probability_limits,
        solver: args.solver.into(),
        num_alternates: args.alternates,
        seed: args.seed,
        allow_zero_score_assignments: !args.skip_zero_scores,
    })
}

fn run(args: &Args) -> Result<ExitCode> {
    let request = build_request(args)?;
    let result = match run_match(&request, &CancelToken::new()) {
        Ok(result) => result,
        Err(err @ MatchError::Validation { .. }) => {
            eprintln!("error: {err}");
            return Ok(ExitCode::from(3));
        }
        Err(err) => return Err(err.into()),
    };

    let rendered = serde_json::to_string_pretty(&result)?;
    match &args.output {
        Some(path) => fs::write(path, rendered + "\n")
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{rendered}"),
    }
    if let Some(message) = &result.message {
        eprintln!("{message}");
    }

    Ok(ExitCode::from(match result.status {
        Status::Complete => 0,
        Status::Infeasible => 1,
        Status::SolverError | Status::Cancelled => 2,
    }))
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(3)
        }
    }
}
