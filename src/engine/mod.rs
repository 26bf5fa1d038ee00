//! The execution engine.
//!
//! - [`validator`]: pure consistency and bounds checks over a plan
//! - [`scheduler`]: dependency graph, per-kind lanes, deadline admission
//! - [`executor`]: acquire / transfer / release for one op, with retries
//! - [`coordinator`]: submit, status, cancel and the per-plan dispatch loop
//! - [`clock`]: wall-clock source for deadlines

pub mod clock;
pub mod coordinator;
pub mod executor;
pub mod scheduler;
pub mod validator;
