//! Resource extents: how many addressable bytes a resource has.
//!
//! The validator bounds-checks every op range against these. Extents come
//! from the device allocator or storage metadata in production; here a
//! static table, the in-process buffer arena and manifests provide them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::plan::schema::WeightManifest;
use crate::resource::key::normalize;

/// Collaborator answering `extent(resource_id) -> byte_length`.
pub trait ExtentProvider: Send + Sync {
    fn extent(&self, resource_id: &str) -> Option<u64>;
}

/// A fixed map of resource ids to lengths.
#[derive(Debug, Clone, Default)]
pub struct ExtentTable {
    extents: HashMap<String, u64>,
}

impl ExtentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource_id: &str, length: u64) {
        self.extents.insert(normalize(resource_id).to_string(), length);
    }

    pub fn with(mut self, resource_id: &str, length: u64) -> Self {
        self.insert(resource_id, length);
        self
    }

    /// Extents of every file named by the manifests. A file's extent is the
    /// furthest byte any of its chunks reaches.
    pub fn from_manifests<'a>(manifests: impl IntoIterator<Item = &'a WeightManifest>) -> Self {
        let mut table = Self::new();
        for chunk in manifests.into_iter().flat_map(|m| m.files.iter()) {
            let entry = table
                .extents
                .entry(normalize(&chunk.path).to_string())
                .or_insert(0);
            *entry = (*entry).max(chunk.end());
        }
        table
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.extents.contains_key(normalize(resource_id))
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

impl ExtentProvider for ExtentTable {
    fn extent(&self, resource_id: &str) -> Option<u64> {
        self.extents.get(normalize(resource_id)).copied()
    }
}

/// Consults several providers in order; the first answer wins.
#[derive(Clone, Default)]
pub struct LayeredExtents {
    layers: Vec<Arc<dyn ExtentProvider>>,
}

impl LayeredExtents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn ExtentProvider>) -> Self {
        self.layers.push(provider);
        self
    }
}

impl ExtentProvider for LayeredExtents {
    fn extent(&self, resource_id: &str) -> Option<u64> {
        self.layers.iter().find_map(|layer| layer.extent(resource_id))
    }
}
