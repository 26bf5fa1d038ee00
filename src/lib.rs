//! kv-plan-exec: transfer plan execution for KV-cache pages and weight swaps.
//!
//! An upstream planner decides what to move; this crate decides how and
//! when. Plans are validated, their ops ordered by read/write dependencies
//! and spread over per-kind transfer lanes, then executed with bounded
//! retries while every touched page, buffer and file is claimed in a
//! [`resource::registry::ResourceRegistry`].

pub mod config;
pub mod engine;
pub mod metrics;
pub mod plan;
pub mod resource;
pub mod server;
pub mod transfer;

pub use config::Config;
pub use engine::coordinator::{PlanCoordinator, PlanHandle, PlanReport, PlanStatus};
pub use plan::schema::{
    CachePlan, FileChunk, KvPageRef, Plan, SwapPlan, SwapWindow, TransferKind, TransferOp,
    WeightManifest,
};
