//! Plan validation.
//!
//! A pure pass over a plan and an extent snapshot: no registry mutation, no
//! I/O. Checks run in a fixed order and the first failure wins:
//!
//! 1. overlapping writes and repeated pages within one op
//! 2. prefetch / evict disjointness (cache plans)
//! 3. window, deadline and resource resolution (swap plans)
//! 4. lengths, offset overflow and extent bounds
//!
//! Only this module can build a [`ValidatedPlan`], so the scheduler never
//! sees a plan that skipped these checks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::plan::schema::{ranges_overlap, KvPageRef, Plan, SwapPlan, TransferOp};
use crate::resource::extent::{ExtentProvider, ExtentTable};
use crate::resource::key::{is_storage, ResourceKey};

/// Why a plan was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    /// This op's destination range overlaps the one written by `other`.
    OverlappingWrite { other: usize, resource: String },
    DuplicatePageRef { page: KvPageRef },
    PrefetchEvictOverlap { page: KvPageRef },
    InvalidWindow { t_start_ns: u64, t_deadline_ns: u64 },
    DeadlineMissed { t_deadline_ns: u64, now_ns: u64 },
    /// A swap op names something that is neither a manifest file nor a
    /// declared buffer.
    UnresolvedResource { resource: String },
    ZeroLength,
    OffsetOverflow { resource: String },
    OutOfBounds { resource: String, end: u64, extent: u64 },
    /// No extent is known for a cache plan resource.
    UnknownResource { resource: String },
    /// Manifest content did not match its hashes.
    Integrity(String),
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReason::OverlappingWrite { other, resource } => {
                write!(f, "write to {resource} overlaps op {other}")
            }
            ValidationReason::DuplicatePageRef { page } => write!(f, "page {page} listed twice"),
            ValidationReason::PrefetchEvictOverlap { page } => {
                write!(f, "page {page} is both prefetched and evicted")
            }
            ValidationReason::InvalidWindow {
                t_start_ns,
                t_deadline_ns,
            } => write!(f, "window deadline {t_deadline_ns} precedes start {t_start_ns}"),
            ValidationReason::DeadlineMissed {
                t_deadline_ns,
                now_ns,
            } => write!(f, "deadline missed: deadline {t_deadline_ns} is not after now {now_ns}"),
            ValidationReason::UnresolvedResource { resource } => {
                write!(f, "{resource} is not in either manifest or a declared buffer")
            }
            ValidationReason::ZeroLength => f.write_str("zero-length transfer"),
            ValidationReason::OffsetOverflow { resource } => {
                write!(f, "offset + length overflows on {resource}")
            }
            ValidationReason::OutOfBounds {
                resource,
                end,
                extent,
            } => write!(f, "range end {end} exceeds {resource} extent {extent}"),
            ValidationReason::UnknownResource { resource } => {
                write!(f, "no known extent for {resource}")
            }
            ValidationReason::Integrity(msg) => write!(f, "integrity check failed: {msg}"),
        }
    }
}

/// A rejected plan: the reason plus the offending op, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub op_index: Option<usize>,
    pub reason: ValidationReason,
}

impl ValidationError {
    fn plan(reason: ValidationReason) -> Self {
        Self {
            op_index: None,
            reason,
        }
    }

    fn op(index: usize, reason: ValidationReason) -> Self {
        Self {
            op_index: Some(index),
            reason,
        }
    }

    /// Wrap a manifest verification failure.
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::plan(ValidationReason::Integrity(msg.into()))
    }

    pub fn is_deadline_miss(&self) -> bool {
        matches!(self.reason, ValidationReason::DeadlineMissed { .. })
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op_index {
            Some(index) => write!(f, "op {index}: {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// A plan that passed [`validate`].
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    plan: Arc<Plan>,
}

impl ValidatedPlan {
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    pub fn plan_id(&self) -> &str {
        self.plan.plan_id()
    }

    pub fn ops(&self) -> &[TransferOp] {
        self.plan.ops()
    }
}

/// Validate `plan` against the known extents at time `now_ns`.
pub fn validate(
    plan: Arc<Plan>,
    extents: &dyn ExtentProvider,
    now_ns: u64,
) -> Result<ValidatedPlan, ValidationError> {
    check_writes(plan.ops())?;

    let manifest_extents = match plan.as_ref() {
        Plan::Cache(cache) => {
            check_prefetch_evict(&cache.prefetch, &cache.evict)?;
            None
        }
        Plan::Swap(swap) => Some(check_swap(swap, extents, now_ns)?),
    };

    for (index, op) in plan.ops().iter().enumerate() {
        check_bounds(index, op, extents, manifest_extents.as_ref())?;
    }

    debug!(
        plan_id = plan.plan_id(),
        kind = plan.kind_label(),
        ops = plan.ops().len(),
        "Plan validated"
    );
    Ok(ValidatedPlan { plan })
}

fn check_writes(ops: &[TransferOp]) -> Result<(), ValidationError> {
    let mut writes: HashMap<ResourceKey, Vec<(usize, Range<u64>)>> = HashMap::new();

    for (index, op) in ops.iter().enumerate() {
        let mut pages = HashSet::new();
        if let Some(page) = op.kv_refs.iter().find(|page| !pages.insert(*page)) {
            return Err(ValidationError::op(
                index,
                ValidationReason::DuplicatePageRef { page: page.clone() },
            ));
        }

        // Empty or overflowing ranges are reported by the bounds pass.
        let Some(range) = op.dst_range() else {
            continue;
        };
        let written = writes.entry(ResourceKey::for_endpoint(&op.dst)).or_default();
        if let Some((other, _)) = written.iter().find(|(_, prior)| ranges_overlap(prior, &range)) {
            return Err(ValidationError::op(
                index,
                ValidationReason::OverlappingWrite {
                    other: *other,
                    resource: op.dst.clone(),
                },
            ));
        }
        written.push((index, range));
    }
    Ok(())
}

fn check_prefetch_evict(prefetch: &[KvPageRef], evict: &[KvPageRef]) -> Result<(), ValidationError> {
    let evicted: HashSet<&KvPageRef> = evict.iter().collect();
    match prefetch.iter().find(|page| evicted.contains(page)) {
        Some(page) => Err(ValidationError::plan(
            ValidationReason::PrefetchEvictOverlap { page: page.clone() },
        )),
        None => Ok(()),
    }
}

/// Window, deadline and resolution checks. Returns the manifest file
/// extents for the bounds pass.
fn check_swap(
    swap: &SwapPlan,
    extents: &dyn ExtentProvider,
    now_ns: u64,
) -> Result<ExtentTable, ValidationError> {
    let window = swap.window;
    if window.t_deadline_ns < window.t_start_ns {
        return Err(ValidationError::plan(ValidationReason::InvalidWindow {
            t_start_ns: window.t_start_ns,
            t_deadline_ns: window.t_deadline_ns,
        }));
    }
    if window.t_deadline_ns <= now_ns {
        return Err(ValidationError::plan(ValidationReason::DeadlineMissed {
            t_deadline_ns: window.t_deadline_ns,
            now_ns,
        }));
    }

    let files = ExtentTable::from_manifests([&swap.from, &swap.to]);
    for (index, op) in swap.ops.iter().enumerate() {
        for endpoint in [&op.src, &op.dst] {
            let resolved = if is_storage(endpoint) {
                files.contains(endpoint)
            } else {
                extents.extent(endpoint).is_some()
            };
            if !resolved {
                return Err(ValidationError::op(
                    index,
                    ValidationReason::UnresolvedResource {
                        resource: endpoint.clone(),
                    },
                ));
            }
        }
    }
    Ok(files)
}

fn check_bounds(
    index: usize,
    op: &TransferOp,
    extents: &dyn ExtentProvider,
    manifest_extents: Option<&ExtentTable>,
) -> Result<(), ValidationError> {
    if op.length == 0 {
        return Err(ValidationError::op(index, ValidationReason::ZeroLength));
    }

    for (resource, offset) in [(&op.src, op.src_offset), (&op.dst, op.dst_offset)] {
        let end = offset.checked_add(op.length).ok_or_else(|| {
            ValidationError::op(
                index,
                ValidationReason::OffsetOverflow {
                    resource: resource.clone(),
                },
            )
        })?;

        let extent = match manifest_extents {
            Some(files) if is_storage(resource) => files.extent(resource),
            _ => extents.extent(resource),
        };
        let extent = extent.ok_or_else(|| {
            ValidationError::op(
                index,
                ValidationReason::UnknownResource {
                    resource: resource.clone(),
                },
            )
        })?;

        if end > extent {
            return Err(ValidationError::op(
                index,
                ValidationReason::OutOfBounds {
                    resource: resource.clone(),
                    end,
                    extent,
                },
            ));
        }
    }
    Ok(())
}
