//! Byte movers behind the executor.
//!
//! - [`backend`]: TransferBackend trait, requests and the per-kind BackendSet
//! - [`memory`]: in-process host/device buffer arena (H2D, D2H, P2P)
//! - [`storage`]: async file range reads into the arena (STORAGE2H)

pub mod backend;
pub mod memory;
pub mod storage;
