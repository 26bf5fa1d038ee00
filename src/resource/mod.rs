//! Addressable resources and their ownership.
//!
//! - [`key`]: ResourceKey and endpoint classification
//! - [`extent`]: byte extents used for bounds checks
//! - [`registry`]: per-key claims, one plan at a time

pub mod extent;
pub mod key;
pub mod registry;
