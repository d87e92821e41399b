use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use num_traits::{NumAssign, PrimInt, Signed};
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::MatchError;
use crate::problem::Problem;

/// Fixed-point factor applied to affinities before they become integer
/// arc costs. The induced optimality slack is at most `num_edges / SCALE`.
pub const SCALE: f64 = 10_000.0;

// Cancellation probe stride while inserting arcs.
const CANCEL_STRIDE: usize = 10_000;

/// Integer type carried on arcs: capacities and costs share it so the
/// kernel stays a single generic.
pub trait FlowInt: PrimInt + Signed + NumAssign + std::fmt::Debug {}
impl<T> FlowInt for T where T: PrimInt + Signed + NumAssign + std::fmt::Debug {}

#[derive(Clone, Debug)]
struct FlowArc<C> {
    to: u32,
    rev: u32,
    cap: C,
    cost: C,
}

/// Handle to a forward arc, valid for the network that created it.
#[derive(Clone, Copy, Debug)]
pub struct ArcId {
    node: u32,
    index: u32,
}

/// Residual network with adjacency-list storage.
///
/// `add_arc` inserts the forward arc and its zero-capacity reverse; the
/// kernel is successive shortest augmenting paths with node potentials,
/// deterministic for a fixed insertion order.
pub struct FlowNetwork<C: FlowInt> {
    adj: Vec<Vec<FlowArc<C>>>,
}

impl<C: FlowInt> FlowNetwork<C> {
    pub fn new(num_nodes: usize) -> Self {
        FlowNetwork {
            adj: vec![Vec::new(); num_nodes],
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.adj.len()
    }

    pub fn add_arc(&mut self, from: u32, to: u32, cap: C, cost: C) -> ArcId {
        debug_assert!(from != to);
        debug_assert!(cap >= C::zero());
        let index = self.adj[from as usize].len() as u32;
        let rev = self.adj[to as usize].len() as u32;
        self.adj[from as usize].push(FlowArc { to, rev, cap, cost });
        self.adj[to as usize].push(FlowArc {
            to: from,
            rev: index,
            cap: C::zero(),
            cost: -cost,
        });
        ArcId { node: from, index }
    }

    /// Flow pushed through a forward arc, read off its reverse capacity.
    pub fn flow(&self, arc: ArcId) -> C {
        let fwd = &self.adj[arc.node as usize][arc.index as usize];
        let (to, rev) = (fwd.to as usize, fwd.rev as usize);
        self.adj[to][rev].cap
    }

    pub fn residual(&self, arc: ArcId) -> C {
        self.adj[arc.node as usize][arc.index as usize].cap
    }

    // One queue-based Bellman-Ford pass to seed potentials: negative costs
    // exist only before any flow is pushed, and the builder's graph is
    // acyclic then, so this converges quickly.
    fn seed_potentials(&self, source: u32, large: C) -> Vec<C> {
        let n = self.adj.len();
        let mut dist = vec![large; n];
        let mut in_queue = vec![false; n];
        dist[source as usize] = C::zero();
        let mut queue = VecDeque::with_capacity(n);
        queue.push_back(source as usize);
        in_queue[source as usize] = true;
        while let Some(u) = queue.pop_front() {
            in_queue[u] = false;
            let du = dist[u];
            for arc in &self.adj[u] {
                if arc.cap <= C::zero() {
                    continue;
                }
                let v = arc.to as usize;
                let next = du + arc.cost;
                if next < dist[v] {
                    dist[v] = next;
                    if !in_queue[v] {
                        queue.push_back(v);
                        in_queue[v] = true;
                    }
                }
            }
        }
        dist
    }

    // Dijkstra over reduced costs. Returns per-node distance and the
    // predecessor arc of each reached node.
    #[allow(clippy::type_complexity)]
    fn shortest_path(
        &self,
        source: u32,
        sink: u32,
        potential: &[C],
        large: C,
    ) -> Option<(Vec<C>, Vec<Option<(u32, u32)>>)> {
        let n = self.adj.len();
        let mut dist = vec![large; n];
        let mut prev: Vec<Option<(u32, u32)>> = vec![None; n];
        let mut heap = BinaryHeap::new();
        dist[source as usize] = C::zero();
        heap.push(Reverse((C::zero(), source)));
        while let Some(Reverse((d, u))) = heap.pop() {
            let u_usize = u as usize;
            if d > dist[u_usize] {
                continue;
            }
            for (i, arc) in self.adj[u_usize].iter().enumerate() {
                if arc.cap <= C::zero() {
                    continue;
                }
                let v = arc.to as usize;
                // nodes never reached by the seeding pass stay unreachable
                if potential[v] >= large {
                    continue;
                }
                let next = d + arc.cost + potential[u_usize] - potential[v];
                debug_assert!(next >= d);
                if next < dist[v] {
                    dist[v] = next;
                    prev[v] = Some((u, i as u32));
                    heap.push(Reverse((next, v as u32)));
                }
            }
        }
        if dist[sink as usize] >= large {
            None
        } else {
            Some((dist, prev))
        }
    }

    /// Min-cost max-flow from `source` to `sink`. Returns (flow, cost).
    pub fn min_cost_max_flow(
        &mut self,
        source: u32,
        sink: u32,
        cancel: &CancelToken,
    ) -> Result<(C, C), MatchError> {
        let n = self.adj.len();
        let large = C::max_value() / (C::one() + C::one());
        let mut potential = self.seed_potentials(source, large);
        let mut total_flow = C::zero();
        let mut total_cost = C::zero();
        let mut augmentations = 0u64;
        loop {
            cancel.check()?;
            let Some((dist, prev)) = self.shortest_path(source, sink, &potential, large) else {
                break;
            };
            for v in 0..n {
                if dist[v] < large && potential[v] < large {
                    potential[v] += dist[v];
                }
            }

            let mut bottleneck = large;
            let mut v = sink as usize;
            while let Some((u, i)) = prev[v] {
                let cap = self.adj[u as usize][i as usize].cap;
                if cap < bottleneck {
                    bottleneck = cap;
                }
                v = u as usize;
            }
            if bottleneck <= C::zero() {
                return Err(MatchError::solver("augmenting path with empty bottleneck"));
            }

            let mut v = sink as usize;
            while let Some((u, i)) = prev[v] {
                let (to, rev, cost) = {
                    let arc = &self.adj[u as usize][i as usize];
                    (arc.to as usize, arc.rev as usize, arc.cost)
                };
                self.adj[u as usize][i as usize].cap -= bottleneck;
                self.adj[to][rev].cap += bottleneck;
                total_cost = total_cost
                    .checked_add(&(bottleneck * cost))
                    .ok_or_else(|| MatchError::solver("cost accumulator overflow"))?;
                v = u as usize;
            }
            total_flow += bottleneck;
            augmentations += 1;
            trace!(?bottleneck, ?total_flow, "augmented");
        }
        debug!(?total_flow, ?total_cost, augmentations, "min-cost flow finished");
        Ok((total_flow, total_cost))
    }
}

/// Round an affinity to its integer arc cost (negated: the kernel
/// minimizes, higher affinity must win).
pub(crate) fn scaled_cost(affinity: f64) -> i64 {
    -(affinity * SCALE).round() as i64
}

/// The bipartite assignment graph of a problem, with the bookkeeping
/// needed to read an assignment back out of the flow.
///
/// Node layout: `S, HR, R_0..R_{n_r-1}, P_0..P_{n_p-1}, HP, T`. Minimums
/// are enforced by node splitting: the mandatory legs `HR -> R_r` and
/// `P_p -> HP` carry a cost low enough that any min-cost max-flow
/// saturates them whenever some flow can. Locked pairs are pre-committed
/// by decrementing quotas on both sides and re-added after the solve.
pub struct AssignmentGraph {
    net: FlowNetwork<i64>,
    source: u32,
    sink: u32,
    pair_arcs: Vec<(u32, u32, ArcId)>,
    mandatory_reviewer: Vec<Option<ArcId>>,
    mandatory_paper: Vec<Option<ArcId>>,
    locked: Vec<(u32, u32)>,
    flow_value: i64,
    scaled_cost: i64,
}

pub fn build_assignment_graph(
    problem: &Problem,
    forbidden: &BTreeSet<(u32, u32)>,
    with_costs: bool,
    cancel: &CancelToken,
) -> Result<AssignmentGraph, MatchError> {
    let n_papers = problem.num_papers;
    let n_reviewers = problem.num_reviewers;

    let locked = problem.locked_pairs();
    let mut locked_per_paper = vec![0u32; n_papers];
    let mut locked_per_reviewer = vec![0u32; n_reviewers];
    for &(p, r) in &locked {
        locked_per_paper[p as usize] += 1;
        locked_per_reviewer[r as usize] += 1;
    }
    for p in 0..n_papers {
        if locked_per_paper[p] > problem.max_reviewers[p] {
            return Err(MatchError::infeasible(format!(
                "paper {p} has more locked reviewers than max_reviewers"
            )));
        }
    }
    for r in 0..n_reviewers {
        if locked_per_reviewer[r] > problem.max_papers[r] {
            return Err(MatchError::infeasible(format!(
                "reviewer {r} has more locked papers than max_papers"
            )));
        }
    }

    // Residual quotas once locked pairs are committed.
    let rev_min: Vec<u32> = (0..n_reviewers)
        .map(|r| problem.min_papers[r].saturating_sub(locked_per_reviewer[r]))
        .collect();
    let rev_max: Vec<u32> = (0..n_reviewers)
        .map(|r| problem.max_papers[r] - locked_per_reviewer[r])
        .collect();
    let pap_min: Vec<u32> = (0..n_papers)
        .map(|p| problem.min_reviewers[p].saturating_sub(locked_per_paper[p]))
        .collect();
    let pap_max: Vec<u32> = (0..n_papers)
        .map(|p| problem.max_reviewers[p] - locked_per_paper[p])
        .collect();

    // Pair arcs in ascending (paper, reviewer) order; costs gathered first
    // so the mandatory-leg bonus can dominate every possible reroute.
    let mut pair_costs: Vec<(u32, u32, i64)> = Vec::new();
    let mut inserted = 0usize;
    for p in 0..n_papers {
        for r in 0..n_reviewers {
            inserted += 1;
            if inserted % CANCEL_STRIDE == 0 {
                cancel.check()?;
            }
            if !problem.assignable(p, r) || forbidden.contains(&(p as u32, r as u32)) {
                continue;
            }
            if pap_max[p] == 0 || rev_max[r] == 0 {
                continue;
            }
            let cost = if with_costs { scaled_cost(problem.affinity(p, r)) } else { 0 };
            pair_costs.push((p as u32, r as u32, cost));
        }
    }
    let mut big: i64 = 1;
    for &(_, _, cost) in &pair_costs {
        big = big
            .checked_add(cost.abs())
            .ok_or_else(|| MatchError::solver("arc cost magnitude overflow"))?;
    }

    let source = 0u32;
    let hub_reviewers = 1u32;
    let reviewer_base = 2u32;
    let paper_base = reviewer_base + n_reviewers as u32;
    let hub_papers = paper_base + n_papers as u32;
    let sink = hub_papers + 1;
    let mut net = FlowNetwork::<i64>::new(sink as usize + 1);

    let total_rev_min: i64 = rev_min.iter().map(|&v| i64::from(v)).sum();
    let total_pap_min: i64 = pap_min.iter().map(|&v| i64::from(v)).sum();
    net.add_arc(source, hub_reviewers, total_rev_min, 0);

    let mut mandatory_reviewer = vec![None; n_reviewers];
    for r in 0..n_reviewers {
        if rev_min[r] > 0 {
            mandatory_reviewer[r] =
                Some(net.add_arc(hub_reviewers, reviewer_base + r as u32, i64::from(rev_min[r]), -big));
        }
        let optional = rev_max[r] - rev_min[r];
        if optional > 0 {
            net.add_arc(source, reviewer_base + r as u32, i64::from(optional), 0);
        }
    }

    let mut pair_arcs = Vec::with_capacity(pair_costs.len());
    for (i, &(p, r, cost)) in pair_costs.iter().enumerate() {
        if (i + 1) % CANCEL_STRIDE == 0 {
            cancel.check()?;
        }
        let arc = net.add_arc(reviewer_base + r, paper_base + p, 1, cost);
        pair_arcs.push((p, r, arc));
    }

    let mut mandatory_paper = vec![None; n_papers];
    for p in 0..n_papers {
        if pap_min[p] > 0 {
            mandatory_paper[p] =
                Some(net.add_arc(paper_base + p as u32, hub_papers, i64::from(pap_min[p]), -big));
        }
        let optional = pap_max[p] - pap_min[p];
        if optional > 0 {
            net.add_arc(paper_base + p as u32, sink, i64::from(optional), 0);
        }
    }
    net.add_arc(hub_papers, sink, total_pap_min, 0);

    debug!(
        papers = n_papers,
        reviewers = n_reviewers,
        pair_arcs = pair_arcs.len(),
        locked = locked.len(),
        "assignment graph built"
    );

    Ok(AssignmentGraph {
        net,
        source,
        sink,
        pair_arcs,
        mandatory_reviewer,
        mandatory_paper,
        locked,
        flow_value: 0,
        scaled_cost: 0,
    })
}

impl AssignmentGraph {
    pub fn solve(&mut self, cancel: &CancelToken) -> Result<(), MatchError> {
        let (flow, cost) = self.net.min_cost_max_flow(self.source, self.sink, cancel)?;
        self.flow_value = flow;
        self.scaled_cost = cost;
        Ok(())
    }

    pub fn flow_value(&self) -> i64 {
        self.flow_value
    }

    /// Kernel cost of the last solve, mandatory-leg bonuses included.
    pub fn scaled_cost(&self) -> i64 {
        self.scaled_cost
    }

    /// Reject the solve if some minimum quota leg stayed unsaturated.
    pub fn require_minimums(&self, problem: &Problem) -> Result<(), MatchError> {
        for (r, arc) in self.mandatory_reviewer.iter().enumerate() {
            if let Some(arc) = arc {
                if self.net.residual(*arc) > 0 {
                    return Err(MatchError::infeasible(format!(
                        "reviewer {r} cannot reach min_papers {}",
                        problem.min_papers[r]
                    )));
                }
            }
        }
        for (p, arc) in self.mandatory_paper.iter().enumerate() {
            if let Some(arc) = arc {
                if self.net.residual(*arc) > 0 {
                    return Err(MatchError::infeasible(format!(
                        "paper {p} cannot reach min_reviewers {}",
                        problem.min_reviewers[p]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Assigned pairs: every pair arc carrying flow plus the locked set.
    pub fn assigned_pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = self
            .pair_arcs
            .iter()
            .filter(|(_, _, arc)| self.net.flow(*arc) > 0)
            .map(|&(p, r, _)| (p, r))
            .collect();
        pairs.extend_from_slice(&self.locked);
        pairs
    }
}
