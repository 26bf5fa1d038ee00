//! Operation scheduler: turns a validated plan into an execution graph.
//!
//! Ops are ordered by read/write dependencies and shared pages, then queued
//! onto lanes (one per transfer kind per device). Each lane admits up to its
//! configured number of in-flight ops, strictly FIFO in plan order. Swap
//! plans are also simulated against their window before anything runs.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BandwidthConfig, Config, LaneConfig};
use crate::engine::validator::ValidatedPlan;
use crate::plan::schema::{ranges_overlap, SwapWindow, TransferKind, TransferOp};
use crate::resource::key::{device_tag, lane_endpoint, ResourceKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// These ops would be admitted after the deadline minus the safety margin.
    #[error("ops {ops:?} would miss the deadline")]
    WillMissDeadline { ops: Vec<usize> },

    #[error("dependency cycle among ops {ops:?}")]
    Cycle { ops: Vec<usize> },
}

/// A physical channel: one transfer kind on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId {
    pub kind: TransferKind,
    pub device: String,
}

impl LaneId {
    pub fn for_op(op: &TransferOp) -> Self {
        Self {
            kind: op.kind,
            device: device_tag(lane_endpoint(op)),
        }
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.device)
    }
}

/// One op in the graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub index: usize,
    pub lane: LaneId,

    /// Ops that must reach an outcome before this one starts.
    pub deps: Vec<usize>,
}

/// What the dispatch loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Dispatch(usize),
    /// A dependency did not succeed; the op is settled without running.
    Skip { index: usize, upstream: usize },
}

#[derive(Debug)]
struct LaneState {
    queue: VecDeque<usize>,
    in_flight: usize,
    max_concurrent: usize,
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub total_ops: u64,
    pub total_lanes: u64,
    pub total_edges: u64,
}

/// Dependency graph plus lane queues for one plan.
///
/// The graph is driven by the dispatch loop: [`ExecutionGraph::admit`]
/// hands out work, [`ExecutionGraph::complete`] records outcomes.
#[derive(Debug)]
pub struct ExecutionGraph {
    plan_id: String,
    nodes: Vec<OpNode>,
    lanes: BTreeMap<LaneId, LaneState>,

    /// `None` until the op has an outcome; `Some(true)` only on success.
    settled: Vec<Option<bool>>,

    window: Option<SwapWindow>,
    stats: SchedulerStats,
}

impl ExecutionGraph {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    pub fn window(&self) -> Option<SwapWindow> {
        self.window
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Pop every op that can start or must be skipped right now.
    pub fn admit(&mut self) -> Vec<Admission> {
        let mut admitted = Vec::new();
        loop {
            let mut progressed = false;
            for lane in self.lanes.values_mut() {
                while let Some(&head) = lane.queue.front() {
                    let deps = &self.nodes[head].deps;
                    if let Some(&upstream) =
                        deps.iter().find(|&&dep| self.settled[dep] == Some(false))
                    {
                        lane.queue.pop_front();
                        self.settled[head] = Some(false);
                        admitted.push(Admission::Skip {
                            index: head,
                            upstream,
                        });
                        progressed = true;
                        continue;
                    }
                    let ready = deps.iter().all(|&dep| self.settled[dep] == Some(true));
                    if !ready || lane.in_flight >= lane.max_concurrent {
                        break;
                    }
                    lane.queue.pop_front();
                    lane.in_flight += 1;
                    admitted.push(Admission::Dispatch(head));
                    progressed = true;
                }
            }
            // A skip may unblock a lane visited earlier in this pass.
            if !progressed {
                break;
            }
        }
        admitted
    }

    /// Record the outcome of a dispatched op.
    pub fn complete(&mut self, index: usize, success: bool) {
        if let Some(lane) = self.lanes.get_mut(&self.nodes[index].lane) {
            lane.in_flight = lane.in_flight.saturating_sub(1);
        }
        self.settled[index] = Some(success);
    }

    /// Drop every queued op; returns their indices in plan order.
    pub fn cancel_pending(&mut self) -> Vec<usize> {
        let mut cancelled: Vec<usize> = self
            .lanes
            .values_mut()
            .flat_map(|lane| lane.queue.drain(..))
            .collect();
        cancelled.sort_unstable();
        for &index in &cancelled {
            self.settled[index] = Some(false);
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.lanes.values().map(|lane| lane.queue.len()).sum()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lanes.values().map(|lane| lane.in_flight).sum()
    }

    /// Whether every op has an outcome.
    pub fn is_settled(&self) -> bool {
        self.settled.iter().all(Option::is_some)
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

/// Builds execution graphs. Cheap to clone; holds only configuration.
#[derive(Debug, Clone, Default)]
pub struct OpScheduler {
    lanes: LaneConfig,
    bandwidth: BandwidthConfig,
    safety_margin_ns: u64,
}

impl OpScheduler {
    pub fn new(lanes: LaneConfig, bandwidth: BandwidthConfig, safety_margin_ns: u64) -> Self {
        Self {
            lanes,
            bandwidth,
            safety_margin_ns,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.lanes.clone(),
            config.bandwidth.clone(),
            config.deadline.safety_margin_ns,
        )
    }

    /// Build the graph for `plan`. Swap plans are rejected if any op would
    /// be admitted too late, given `now_ns`.
    pub fn schedule(&self, plan: &ValidatedPlan, now_ns: u64) -> Result<ExecutionGraph, ScheduleError> {
        let ops = plan.ops();
        let deps = dependencies(ops);
        let total_edges = deps.iter().map(Vec::len).sum::<usize>() as u64;
        topological_order(&deps)?;

        let nodes: Vec<OpNode> = ops
            .iter()
            .zip(deps)
            .enumerate()
            .map(|(index, (op, deps))| OpNode {
                index,
                lane: LaneId::for_op(op),
                deps,
            })
            .collect();

        let mut lanes: BTreeMap<LaneId, LaneState> = BTreeMap::new();
        for node in &nodes {
            lanes
                .entry(node.lane.clone())
                .or_insert_with(|| LaneState {
                    queue: VecDeque::new(),
                    in_flight: 0,
                    max_concurrent: self.lanes.limit(node.lane.kind),
                })
                .queue
                .push_back(node.index);
        }

        let window = plan.plan().window();
        if let Some(window) = window {
            let late = self.simulate(ops, &nodes, window, now_ns);
            if !late.is_empty() {
                warn!(
                    plan_id = plan.plan_id(),
                    late = late.len(),
                    deadline = window.t_deadline_ns,
                    "Plan would miss its deadline"
                );
                return Err(ScheduleError::WillMissDeadline { ops: late });
            }
        }

        let stats = SchedulerStats {
            total_ops: nodes.len() as u64,
            total_lanes: lanes.len() as u64,
            total_edges,
        };
        debug!(
            plan_id = plan.plan_id(),
            ops = stats.total_ops,
            lanes = stats.total_lanes,
            edges = stats.total_edges,
            "Scheduled plan"
        );

        Ok(ExecutionGraph {
            plan_id: plan.plan_id().to_string(),
            settled: vec![None; nodes.len()],
            nodes,
            lanes,
            window,
            stats,
        })
    }

    /// Estimate admission times and return the ops admitted after
    /// `deadline - margin`. Ops are walked in plan order, which is both a
    /// topological order and each lane's FIFO order.
    fn simulate(&self, ops: &[TransferOp], nodes: &[OpNode], window: SwapWindow, now_ns: u64) -> Vec<usize> {
        let start = now_ns.max(window.t_start_ns);
        let cutoff = window.t_deadline_ns.saturating_sub(self.safety_margin_ns);

        let mut finish = vec![0u64; ops.len()];
        // Per lane: finish time of each slot, and the last admission time.
        let mut slots: BTreeMap<&LaneId, (Vec<u64>, u64)> = BTreeMap::new();
        let mut late = Vec::new();

        for (node, op) in nodes.iter().zip(ops) {
            let ready = node
                .deps
                .iter()
                .map(|&dep| finish[dep])
                .fold(start, u64::max);

            let (lane_slots, last_admit) = slots
                .entry(&node.lane)
                .or_insert_with(|| (vec![start; self.lanes.limit(node.lane.kind)], start));

            let (slot, free_at) = lane_slots
                .iter()
                .copied()
                .enumerate()
                .min_by_key(|&(_, t)| t)
                .unwrap_or((0, start));

            let admit = ready.max(free_at).max(*last_admit);
            let done = admit.saturating_add(self.bandwidth.estimate_ns(op.kind, op.length));
            if let Some(s) = lane_slots.get_mut(slot) {
                *s = done;
            }
            *last_admit = admit;
            finish[node.index] = done;

            if admit > cutoff {
                late.push(node.index);
            }
        }
        late
    }
}

/// Edges from earlier to later ops: read-after-write, write-after-write,
/// write-after-read on overlapping ranges of the same resource, and any
/// shared page.
fn dependencies(ops: &[TransferOp]) -> Vec<Vec<usize>> {
    struct Access {
        src: ResourceKey,
        dst: ResourceKey,
        pages: HashSet<ResourceKey>,
    }

    let accesses: Vec<Access> = ops
        .iter()
        .map(|op| Access {
            src: ResourceKey::for_endpoint(&op.src),
            dst: ResourceKey::for_endpoint(&op.dst),
            pages: op.kv_refs.iter().cloned().map(ResourceKey::Page).collect(),
        })
        .collect();

    let touches = |a_key: &ResourceKey, a: Option<std::ops::Range<u64>>, b_key: &ResourceKey, b: Option<std::ops::Range<u64>>| {
        a_key == b_key
            && match (a, b) {
                (Some(a), Some(b)) => ranges_overlap(&a, &b),
                _ => false,
            }
    };

    (0..ops.len())
        .map(|later| {
            let (b, b_acc) = (&ops[later], &accesses[later]);
            (0..later)
                .filter(|&earlier| {
                    let (a, a_acc) = (&ops[earlier], &accesses[earlier]);
                    touches(&a_acc.dst, a.dst_range(), &b_acc.src, b.src_range())
                        || touches(&a_acc.dst, a.dst_range(), &b_acc.dst, b.dst_range())
                        || touches(&a_acc.src, a.src_range(), &b_acc.dst, b.dst_range())
                        || !a_acc.pages.is_disjoint(&b_acc.pages)
                })
                .collect()
        })
        .collect()
}

/// Kahn's algorithm over `deps` (node -> prerequisites).
fn topological_order(deps: &[Vec<usize>]) -> Result<Vec<usize>, ScheduleError> {
    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); deps.len()];
    for (node, prereqs) in deps.iter().enumerate() {
        for &prereq in prereqs {
            dependents[prereq].push(node);
        }
    }

    let mut ready: VecDeque<usize> = (0..deps.len()).filter(|&n| indegree[n] == 0).collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(node) = ready.pop_front() {
        order.push(node);
        for &next in &dependents[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() == deps.len() {
        Ok(order)
    } else {
        let ops = (0..deps.len()).filter(|&n| indegree[n] > 0).collect();
        Err(ScheduleError::Cycle { ops })
    }
}
