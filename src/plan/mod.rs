//! Plan objects handed to the engine by the upstream planner.
//!
//! - [`schema`]: KvPageRef, TransferOp, manifests, CachePlan / SwapPlan
//! - [`loader`]: JSON plan files
//! - [`integrity`]: SHA-256 verification of manifest chunks

pub mod integrity;
pub mod loader;
pub mod schema;
