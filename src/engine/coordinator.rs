//! Plan coordinator: the engine's entry point.
//!
//! `submit` validates synchronously and hands the plan to a driver task;
//! everything else (`status`, `report`, `cancel`, `list`) only reads or
//! flips shared state under short locks. Per plan:
//!
//! ```text
//! Pending -> Running -> Succeeded | PartiallyFailed | Failed | Cancelled
//!    \-> Failed (rejected, integrity, will-miss)
//! ```
//!
//! A swap plan stays `Pending` until its window opens.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::clock::{Clock, SystemClock};
use crate::engine::executor::{OpError, OpReport, TransferExecutor};
use crate::engine::scheduler::{Admission, ExecutionGraph, OpScheduler};
use crate::engine::validator::{validate, ValidatedPlan, ValidationError};
use crate::metrics::EngineMetrics;
use crate::plan::integrity::{FileHashVerifier, ManifestVerifier};
use crate::plan::schema::{Plan, TransferKind};
use crate::resource::extent::ExtentProvider;
use crate::resource::registry::SharedRegistry;
use crate::transfer::backend::BackendSet;

/// Opaque id of a submitted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanHandle(Uuid);

impl PlanHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PlanHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    PartiallyFailed,
    Succeeded,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanStatus::Pending | PlanStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::PartiallyFailed => "partially_failed",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-op state within a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OpStatus {
    Queued,
    Running,
    Succeeded { bytes_moved: u64, attempts: u32 },
    Failed { error: OpError, attempts: u32 },
    /// Not run because op `upstream` did not succeed.
    Skipped { upstream: usize },
    /// Never dispatched: the plan was cancelled or its window closed.
    Cancelled,
    /// Never dispatched: the plan was rejected before scheduling.
    Rejected,
}

impl OpStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OpStatus::Queued => "queued",
            OpStatus::Running => "running",
            OpStatus::Succeeded { .. } => "succeeded",
            OpStatus::Failed { .. } => "failed",
            OpStatus::Skipped { .. } => "skipped",
            OpStatus::Cancelled => "cancelled",
            OpStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpEntry {
    pub index: usize,
    pub kind: TransferKind,
    pub src: String,
    pub dst: String,
    pub length: u64,
    pub status: OpStatus,
}

/// Everything known about one plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub handle: PlanHandle,
    pub plan_id: String,
    pub kind: &'static str,
    pub status: PlanStatus,
    pub ops: Vec<OpEntry>,

    /// Why the plan failed or was cancelled, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub submitted_at_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ns: Option<u64>,
}

impl PlanReport {
    pub fn bytes_moved(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op.status {
                OpStatus::Succeeded { bytes_moved, .. } => bytes_moved,
                _ => 0,
            })
            .fold(0u64, u64::saturating_add)
    }

    pub fn count(&self, label: &str) -> usize {
        self.ops.iter().filter(|op| op.status.label() == label).count()
    }

    fn summary(&self) -> PlanSummary {
        PlanSummary {
            handle: self.handle,
            plan_id: self.plan_id.clone(),
            kind: self.kind,
            status: self.status,
            ops: self.ops.len(),
            succeeded: self.count("succeeded"),
            failed: self.count("failed"),
            bytes_moved: self.bytes_moved(),
        }
    }
}

/// One line of [`PlanCoordinator::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub handle: PlanHandle,
    pub plan_id: String,
    pub kind: &'static str,
    pub status: PlanStatus,
    pub ops: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub bytes_moved: u64,
}

struct PlanRecord {
    report: PlanReport,
    cancel: CancellationToken,
    status_tx: watch::Sender<PlanStatus>,
}

#[derive(Default)]
struct PlanTable {
    records: HashMap<PlanHandle, PlanRecord>,
    order: Vec<PlanHandle>,
}

impl PlanTable {
    /// Drop the oldest finished plans until at most `keep` records remain.
    /// Active plans are never dropped.
    fn prune(&mut self, keep: usize) -> usize {
        let excess = self.records.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }
        let doomed: Vec<PlanHandle> = self
            .order
            .iter()
            .copied()
            .filter(|handle| {
                self.records
                    .get(handle)
                    .is_some_and(|record| record.report.status.is_terminal())
            })
            .take(excess)
            .collect();
        for handle in &doomed {
            self.records.remove(handle);
        }
        let records = &self.records;
        self.order.retain(|handle| records.contains_key(handle));
        doomed.len()
    }
}

/// Longest a driver sleeps before re-reading the clock, so a clock that
/// does not follow real time is still noticed.
const CLOCK_POLL: Duration = Duration::from_millis(10);

fn clock_wait(remaining_ns: u64) -> Duration {
    Duration::from_nanos(remaining_ns).min(CLOCK_POLL)
}

/// Why dispatch stopped early.
#[derive(Debug, Clone, Copy)]
enum Halt {
    Cancelled,
    DeadlinePassed,
}

/// Accepts plans and drives them to a terminal status. Cheap to clone;
/// clones share all state.
#[derive(Clone)]
pub struct PlanCoordinator {
    config: Arc<Config>,
    registry: SharedRegistry,
    executor: TransferExecutor,
    scheduler: OpScheduler,
    extents: Arc<dyn ExtentProvider>,
    clock: Arc<dyn Clock>,
    verifier: Option<Arc<dyn ManifestVerifier>>,
    metrics: EngineMetrics,
    plans: Arc<RwLock<PlanTable>>,
}

impl PlanCoordinator {
    pub fn new(
        config: Config,
        registry: SharedRegistry,
        backends: BackendSet,
        extents: Arc<dyn ExtentProvider>,
    ) -> anyhow::Result<Self> {
        let metrics = EngineMetrics::new()?;
        let executor = TransferExecutor::from_config(&config, registry.clone(), backends)
            .with_metrics(metrics.clone());

        let verifier: Option<Arc<dyn ManifestVerifier>> = if config.integrity.verify_manifest_hashes {
            let mut verifier = FileHashVerifier::new(config.integrity.max_concurrent_reads);
            if let Some(root) = &config.storage_root {
                verifier = verifier.with_root(root.clone());
            }
            Some(Arc::new(verifier))
        } else {
            None
        };

        Ok(Self {
            scheduler: OpScheduler::from_config(&config),
            config: Arc::new(config),
            registry,
            executor,
            extents,
            clock: Arc::new(SystemClock),
            verifier,
            metrics,
            plans: Arc::new(RwLock::new(PlanTable::default())),
        })
    }

    /// Use `clock` for window and deadline checks. Drivers wake at least
    /// every few milliseconds to re-read it, so a manual clock may jump.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify swap target manifests with `verifier`, regardless of config.
    pub fn with_verifier(mut self, verifier: Arc<dyn ManifestVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Validate `plan` and start driving it. Returns at once; a rejected
    /// plan gets a handle whose status is already `Failed`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, plan: impl Into<Plan>) -> PlanHandle {
        let plan = Arc::new(plan.into());
        let handle = PlanHandle::new();
        let now = self.clock.now_ns();
        self.metrics.plan_submitted(plan.kind_label());

        let ops = plan
            .ops()
            .iter()
            .enumerate()
            .map(|(index, op)| OpEntry {
                index,
                kind: op.kind,
                src: op.src.clone(),
                dst: op.dst.clone(),
                length: op.length,
                status: OpStatus::Queued,
            })
            .collect();
        let report = PlanReport {
            handle,
            plan_id: plan.plan_id().to_string(),
            kind: plan.kind_label(),
            status: PlanStatus::Pending,
            ops,
            error: None,
            submitted_at_ns: now,
            finished_at_ns: None,
        };
        let cancel = CancellationToken::new();
        let (status_tx, _) = watch::channel(PlanStatus::Pending);
        {
            let mut plans = self.plans.write();
            plans.records.insert(
                handle,
                PlanRecord {
                    report,
                    cancel: cancel.clone(),
                    status_tx,
                },
            );
            plans.order.push(handle);
            let dropped = plans.prune(self.config.server.max_retained_plans);
            if dropped > 0 {
                debug!(dropped, "Dropped finished plan records");
            }
        }

        match validate(Arc::clone(&plan), self.extents.as_ref(), now) {
            Ok(validated) => {
                info!(
                    plan_id = plan.plan_id(),
                    %handle,
                    kind = plan.kind_label(),
                    ops = plan.ops().len(),
                    bytes = plan.total_bytes(),
                    "Plan accepted"
                );
                tokio::spawn(self.clone().drive(handle, validated, cancel));
            }
            Err(err) => {
                warn!(plan_id = plan.plan_id(), %handle, error = %err, "Plan rejected");
                self.reject(handle, err.to_string());
            }
        }
        handle
    }

    pub fn status(&self, handle: PlanHandle) -> Option<PlanStatus> {
        self.plans
            .read()
            .records
            .get(&handle)
            .map(|record| record.report.status)
    }

    pub fn report(&self, handle: PlanHandle) -> Option<PlanReport> {
        self.plans
            .read()
            .records
            .get(&handle)
            .map(|record| record.report.clone())
    }

    /// Stop dispatching new ops. In-flight ops drain; the plan ends
    /// `Cancelled`. Returns false for unknown or finished plans.
    pub fn cancel(&self, handle: PlanHandle) -> bool {
        let plans = self.plans.read();
        match plans.records.get(&handle) {
            Some(record) if !record.report.status.is_terminal() => {
                info!(plan_id = record.report.plan_id, %handle, "Cancellation requested");
                record.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait until the plan reaches a terminal status.
    pub async fn wait(&self, handle: PlanHandle) -> Option<PlanStatus> {
        let mut rx = {
            let plans = self.plans.read();
            plans.records.get(&handle)?.status_tx.subscribe()
        };
        // A record may be dropped once terminal; its last status still
        // reaches the receiver.
        let result = match rx.wait_for(PlanStatus::is_terminal).await {
            Ok(status) => Some(*status),
            Err(_) => self.status(handle),
        };
        result
    }

    /// Drop the record of a finished plan. Returns false for unknown or
    /// still active plans.
    pub fn forget(&self, handle: PlanHandle) -> bool {
        let mut plans = self.plans.write();
        match plans.records.get(&handle) {
            Some(record) if record.report.status.is_terminal() => {
                plans.records.remove(&handle);
                plans.order.retain(|h| *h != handle);
                true
            }
            _ => false,
        }
    }

    /// Summaries of every submitted plan, oldest first.
    pub fn list(&self) -> Vec<PlanSummary> {
        let plans = self.plans.read();
        plans
            .order
            .iter()
            .filter_map(|handle| plans.records.get(handle))
            .map(|record| record.report.summary())
            .collect()
    }

    async fn drive(self, handle: PlanHandle, plan: ValidatedPlan, cancel: CancellationToken) {
        let plan_id = plan.plan_id().to_string();

        if let (Plan::Swap(swap), Some(verifier)) = (plan.plan().as_ref(), &self.verifier) {
            if let Err(err) = verifier.verify(&swap.to).await {
                let err = ValidationError::integrity(err.to_string());
                warn!(plan_id, %handle, error = %err, "Manifest verification failed");
                self.reject(handle, err.to_string());
                return;
            }
        }

        let mut graph = match self.scheduler.schedule(&plan, self.clock.now_ns()) {
            Ok(graph) => graph,
            Err(err) => {
                warn!(plan_id, %handle, error = %err, "Plan cannot be scheduled");
                self.reject(handle, err.to_string());
                return;
            }
        };

        if let Some(window) = graph.window() {
            if !self.window_open(window.t_start_ns, &cancel).await {
                info!(plan_id, %handle, "Plan cancelled before its window opened");
                self.halt(handle, &mut graph, Halt::Cancelled);
                self.finish(handle, Some(Halt::Cancelled));
                return;
            }
        }

        self.update(handle, |report| report.status = PlanStatus::Running);
        info!(plan_id, %handle, lanes = graph.lane_count(), "Plan running");

        let deadline = graph.window().map(|window| window.t_deadline_ns);
        let ops = Arc::clone(plan.plan());
        let mut tasks: JoinSet<(usize, Result<OpReport, String>)> = JoinSet::new();
        let mut halted: Option<Halt> = None;

        loop {
            if halted.is_none() {
                if cancel.is_cancelled() {
                    halted = Some(Halt::Cancelled);
                } else if deadline.is_some_and(|deadline| self.clock.now_ns() >= deadline) {
                    halted = Some(Halt::DeadlinePassed);
                }
                if let Some(reason) = halted {
                    self.halt(handle, &mut graph, reason);
                }
            }

            if halted.is_none() {
                for admission in graph.admit() {
                    match admission {
                        Admission::Dispatch(index) => {
                            self.set_op(handle, index, OpStatus::Running);
                            let executor = self.executor.clone();
                            let ops = Arc::clone(&ops);
                            let plan_id = plan_id.clone();
                            tasks.spawn(async move {
                                let op = &ops.ops()[index];
                                let outcome = AssertUnwindSafe(executor.execute(&plan_id, index, op))
                                    .catch_unwind()
                                    .await
                                    .map_err(|_| "op task panicked".to_string());
                                (index, outcome)
                            });
                        }
                        Admission::Skip { index, upstream } => {
                            warn!(plan_id, op = index, upstream, "Skipping op after upstream failure");
                            self.set_op(handle, index, OpStatus::Skipped { upstream });
                        }
                    }
                }
            }

            if graph.is_settled() || (halted.is_some() && tasks.is_empty()) {
                break;
            }

            let until_deadline = match (halted, deadline) {
                (None, Some(deadline)) => Some(clock_wait(deadline.saturating_sub(self.clock.now_ns()))),
                _ => None,
            };

            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok((_, Ok(report))) => self.record(handle, &mut graph, &ops, report),
                    Ok((index, Err(message))) => {
                        error!(plan_id, op = index, "Op task panicked");
                        let report = OpReport {
                            index,
                            result: Err(OpError::Internal { message }),
                            attempts: 0,
                            elapsed: Duration::ZERO,
                        };
                        self.record(handle, &mut graph, &ops, report);
                    }
                    Err(err) => error!(plan_id, error = %err, "Op task lost"),
                },
                _ = cancel.cancelled(), if halted.is_none() => {
                    halted = Some(Halt::Cancelled);
                    self.halt(handle, &mut graph, Halt::Cancelled);
                }
                // The loop head re-reads the clock and halts if the deadline passed.
                _ = tokio::time::sleep(until_deadline.unwrap_or_default()), if until_deadline.is_some() => {}
                else => break,
            }
        }

        self.finish(handle, halted);
    }

    /// Wait until the clock reaches `start_ns`. False if cancelled first.
    async fn window_open(&self, start_ns: u64, cancel: &CancellationToken) -> bool {
        loop {
            let now = self.clock.now_ns();
            if now >= start_ns {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(clock_wait(start_ns - now)) => {}
            }
        }
    }

    fn record(&self, handle: PlanHandle, graph: &mut ExecutionGraph, plan: &Plan, report: OpReport) {
        let kind = plan.ops()[report.index].kind;
        let seconds = report.elapsed.as_secs_f64();
        let status = match report.result {
            Ok(bytes_moved) => {
                self.metrics.op_finished(kind, "succeeded", bytes_moved, seconds);
                OpStatus::Succeeded {
                    bytes_moved,
                    attempts: report.attempts,
                }
            }
            Err(error) => {
                self.metrics.op_finished(kind, error.label(), 0, seconds);
                OpStatus::Failed {
                    error,
                    attempts: report.attempts,
                }
            }
        };
        graph.complete(report.index, matches!(status, OpStatus::Succeeded { .. }));
        self.set_op(handle, report.index, status);
    }

    fn halt(&self, handle: PlanHandle, graph: &mut ExecutionGraph, reason: Halt) {
        let dropped = graph.cancel_pending();
        warn!(
            plan_id = graph.plan_id(),
            %handle,
            reason = ?reason,
            dropped = dropped.len(),
            in_flight = graph.in_flight_count(),
            "Dispatch halted"
        );
        let message = match reason {
            Halt::Cancelled => "cancelled",
            Halt::DeadlinePassed => "deadline passed during execution",
        };
        self.update(handle, |report| {
            for index in dropped {
                report.ops[index].status = OpStatus::Cancelled;
            }
            report.error = Some(message.to_string());
        });
    }

    /// Terminal bookkeeping for a plan that ran.
    fn finish(&self, handle: PlanHandle, halted: Option<Halt>) {
        let now = self.clock.now_ns();
        let mut plans = self.plans.write();
        let Some(record) = plans.records.get_mut(&handle) else {
            return;
        };
        let report = &mut record.report;

        // Anything still marked running lost its task.
        for op in report.ops.iter_mut() {
            if matches!(op.status, OpStatus::Running | OpStatus::Queued) {
                op.status = OpStatus::Failed {
                    error: OpError::Internal {
                        message: "op task lost".to_string(),
                    },
                    attempts: 0,
                };
            }
        }

        let succeeded = report.count("succeeded");
        report.status = match halted {
            Some(_) => PlanStatus::Cancelled,
            None if succeeded == report.ops.len() => PlanStatus::Succeeded,
            None if succeeded > 0 => PlanStatus::PartiallyFailed,
            None => PlanStatus::Failed,
        };
        report.finished_at_ns = Some(now);

        info!(
            plan_id = report.plan_id,
            %handle,
            status = %report.status,
            succeeded,
            failed = report.count("failed"),
            skipped = report.count("skipped"),
            bytes = report.bytes_moved(),
            "Plan finished"
        );
        self.metrics.plan_finished(report.kind, report.status.as_str());
        record.status_tx.send_replace(report.status);
    }

    /// Fail a plan before any op was dispatched.
    fn reject(&self, handle: PlanHandle, message: String) {
        let now = self.clock.now_ns();
        let mut plans = self.plans.write();
        let Some(record) = plans.records.get_mut(&handle) else {
            return;
        };
        let report = &mut record.report;
        for op in report.ops.iter_mut() {
            op.status = OpStatus::Rejected;
        }
        report.status = PlanStatus::Failed;
        report.error = Some(message);
        report.finished_at_ns = Some(now);
        self.metrics.plan_finished(report.kind, report.status.as_str());
        record.status_tx.send_replace(PlanStatus::Failed);
    }

    fn set_op(&self, handle: PlanHandle, index: usize, status: OpStatus) {
        self.update(handle, |report| {
            if let Some(op) = report.ops.get_mut(index) {
                op.status = status;
            }
        });
    }

    fn update(&self, handle: PlanHandle, f: impl FnOnce(&mut PlanReport)) {
        let mut plans = self.plans.write();
        if let Some(record) = plans.records.get_mut(&handle) {
            f(&mut record.report);
            record.status_tx.send_if_modified(|status| {
                let changed = *status != record.report.status;
                *status = record.report.status;
                changed
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::schema::{CachePlan, KvPageRef, TransferOp};
    use crate::resource::registry::new_shared_registry;
    use crate::transfer::memory::MemoryBackend;

    fn coordinator() -> (PlanCoordinator, Arc<MemoryBackend>) {
        let arena = Arc::new(MemoryBackend::with_buffers([("host://0/a", 8192), ("gpu://0/kv", 8192)]));
        let backends = BackendSet::new().with_kinds(
            [TransferKind::H2D, TransferKind::D2H, TransferKind::P2P],
            arena.clone(),
        );
        let coordinator =
            PlanCoordinator::new(Config::default(), new_shared_registry(), backends, arena.clone()).unwrap();
        (coordinator, arena)
    }

    #[tokio::test]
    async fn test_forget_and_retention() {
        let (coordinator, _) = coordinator();
        let mut config = Config::default();
        config.server.max_retained_plans = 2;
        let coordinator = PlanCoordinator {
            config: Arc::new(config),
            ..coordinator
        };

        let mut handles = Vec::new();
        for i in 0..3 {
            let handle = coordinator.submit(CachePlan::new(format!("p{i}"), vec![]));
            assert_eq!(coordinator.wait(handle).await, Some(PlanStatus::Succeeded));
            handles.push(handle);
        }
        // One more submission pushes the table past the cap.
        let last = coordinator.submit(CachePlan::new("p3", vec![]));
        coordinator.wait(last).await;

        let listed: Vec<_> = coordinator.list().into_iter().map(|p| p.plan_id).collect();
        assert_eq!(listed, vec!["p2".to_string(), "p3".to_string()]);
        assert_eq!(coordinator.status(handles[0]), None);

        assert!(coordinator.forget(last));
        assert!(!coordinator.forget(last));
        assert_eq!(coordinator.list().len(), 1);
    }

    #[test]
    fn test_handle_round_trip() {
        let handle = PlanHandle::new();
        assert_eq!(handle.to_string().parse::<PlanHandle>().unwrap(), handle);
        assert!("not-a-uuid".parse::<PlanHandle>().is_err());
    }

    #[tokio::test]
    async fn test_cache_plan_succeeds() {
        let (coordinator, arena) = coordinator();
        arena.write("host://0/a", 0, &[7; 16]).unwrap();

        let page = KvPageRef::new("layer0", 0, 0, 0);
        let plan = CachePlan::new(
            "c1",
            vec![TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/kv", 16).with_kv_refs([page])],
        );
        let handle = coordinator.submit(plan);
        assert_eq!(coordinator.wait(handle).await, Some(PlanStatus::Succeeded));

        let report = coordinator.report(handle).unwrap();
        assert_eq!(report.bytes_moved(), 16);
        assert_eq!(arena.read("gpu://0/kv", 0, 16).unwrap(), vec![7; 16]);
        assert!(coordinator.registry().lock().await.is_idle());
    }

    #[tokio::test]
    async fn test_rejected_plan_is_failed_at_once() {
        let (coordinator, _) = coordinator();
        let plan = CachePlan::new(
            "bad",
            vec![TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/kv", 0)],
        );
        let handle = coordinator.submit(plan);
        assert_eq!(coordinator.status(handle), Some(PlanStatus::Failed));

        let report = coordinator.report(handle).unwrap();
        assert_eq!(report.ops[0].status, OpStatus::Rejected);
        assert!(report.error.unwrap().contains("zero-length"));
    }

    #[tokio::test]
    async fn test_empty_plan_succeeds() {
        let (coordinator, _) = coordinator();
        let handle = coordinator.submit(CachePlan::new("empty", vec![]));
        assert_eq!(coordinator.wait(handle).await, Some(PlanStatus::Succeeded));
        assert_eq!(coordinator.list().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_finished_plan_is_refused() {
        let (coordinator, _) = coordinator();
        let handle = coordinator.submit(CachePlan::new("empty", vec![]));
        coordinator.wait(handle).await;
        assert!(!coordinator.cancel(handle));
        assert!(!coordinator.cancel(PlanHandle::new()));
    }
}
