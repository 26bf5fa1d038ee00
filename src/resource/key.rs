//! Resource identifiers.
//!
//! Op endpoints are opaque strings. Anything with a scheme other than
//! `file://` names a device or host buffer (`gpu://0/kv`, `host://0/staging`);
//! `file://` URIs and bare paths name storage. The `file://` prefix is
//! dropped so that manifest paths and op URIs compare equal.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::plan::schema::{KvPageRef, TransferKind, TransferOp};

const FILE_SCHEME: &str = "file://";

/// A key the registry can hand to exactly one plan at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ResourceKey {
    Page(KvPageRef),
    Buffer(String),
    Storage(String),
}

impl ResourceKey {
    /// Classify an op endpoint.
    pub fn for_endpoint(id: &str) -> Self {
        if is_storage(id) {
            ResourceKey::Storage(normalize(id).to_string())
        } else {
            ResourceKey::Buffer(id.to_string())
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Page(page) => write!(f, "page:{page}"),
            ResourceKey::Buffer(id) => write!(f, "buffer:{id}"),
            ResourceKey::Storage(path) => write!(f, "storage:{path}"),
        }
    }
}

/// Strip a leading `file://`.
pub fn normalize(id: &str) -> &str {
    id.strip_prefix(FILE_SCHEME).unwrap_or(id)
}

/// Whether an endpoint names storage rather than a buffer.
pub fn is_storage(id: &str) -> bool {
    id.starts_with(FILE_SCHEME) || !id.contains("://")
}

/// `scheme://authority` of an endpoint (`gpu://0/kv` → `gpu://0`); bare
/// paths and `file://` URIs collapse to `file`.
pub fn device_tag(id: &str) -> String {
    if is_storage(id) {
        return "file".to_string();
    }
    match id.split_once("://") {
        Some((scheme, rest)) => {
            let authority = rest.split('/').next().unwrap_or_default();
            if authority.is_empty() {
                scheme.to_string()
            } else {
                format!("{scheme}://{authority}")
            }
        }
        None => id.to_string(),
    }
}

/// The endpoint whose channel an op occupies: the device it writes for
/// H2D, the side it reads from otherwise.
pub fn lane_endpoint(op: &TransferOp) -> &str {
    match op.kind {
        TransferKind::H2D => &op.dst,
        TransferKind::D2H | TransferKind::P2P | TransferKind::Storage2H => &op.src,
    }
}

/// Every key an op must hold while it runs: its pages, then `src` and
/// `dst`. Duplicates are removed, first occurrence wins.
pub fn op_keys(op: &TransferOp) -> Vec<ResourceKey> {
    let mut seen = HashSet::new();
    op.kv_refs
        .iter()
        .cloned()
        .map(ResourceKey::Page)
        .chain([
            ResourceKey::for_endpoint(&op.src),
            ResourceKey::for_endpoint(&op.dst),
        ])
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
