//! HTTP status server.
//!
//! - [`status_api`]: plan listing, reports, cancellation, health and metrics

pub mod status_api;
