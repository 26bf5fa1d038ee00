//! Resource registry: which plan may touch which page, buffer or file.
//!
//! Claims are process-local and authoritative within one engine instance.
//! A key is held by at most one plan. The owning plan may claim a key again
//! without conflict; each claim is counted and the key becomes free when the
//! last one is released, so ops of the same plan that share a buffer never
//! free it under each other.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::resource::key::ResourceKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resource conflict: {key} is held by plan {holder}")]
    ResourceConflict { key: ResourceKey, holder: String },

    #[error("plan {plan_id} does not own {key}")]
    NotOwned { key: ResourceKey, plan_id: String },
}

/// Diagnostic view of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    Free,
    Held { plan_id: String, claims: usize },
}

#[derive(Debug)]
struct Claim {
    plan_id: String,
    claims: usize,
}

#[derive(Debug, Default, Clone)]
pub struct RegistryStats {
    pub total_acquires: u64,
    pub total_releases: u64,
    pub total_conflicts: u64,
}

/// Process-local claim table.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    claims: HashMap<ResourceKey, Claim>,
    stats: RegistryStats,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every key for `plan_id`, or none of them.
    pub fn acquire(&mut self, keys: &[ResourceKey], plan_id: &str) -> Result<(), RegistryError> {
        // Every key is checked; holding one key never excuses another.
        if let Some((key, claim)) = keys.iter().find_map(|key| {
            self.claims
                .get(key)
                .filter(|claim| claim.plan_id != plan_id)
                .map(|claim| (key, claim))
        }) {
            self.stats.total_conflicts += 1;
            warn!(
                plan_id,
                key = %key,
                holder = claim.plan_id,
                "Resource conflict"
            );
            return Err(RegistryError::ResourceConflict {
                key: key.clone(),
                holder: claim.plan_id.clone(),
            });
        }

        for key in keys {
            self.claims
                .entry(key.clone())
                .and_modify(|claim| claim.claims += 1)
                .or_insert_with(|| Claim {
                    plan_id: plan_id.to_string(),
                    claims: 1,
                });
        }

        self.stats.total_acquires += 1;
        debug!(plan_id, keys = keys.len(), "Acquired resources");
        Ok(())
    }

    /// Drop one claim per key held by `plan_id`. Nothing changes unless the
    /// plan owns every key.
    pub fn release(&mut self, keys: &[ResourceKey], plan_id: &str) -> Result<(), RegistryError> {
        let mut wanted: HashMap<&ResourceKey, usize> = HashMap::new();
        for key in keys {
            *wanted.entry(key).or_insert(0) += 1;
        }

        for (key, count) in &wanted {
            match self.claims.get(*key) {
                Some(claim) if claim.plan_id == plan_id && claim.claims >= *count => {}
                _ => {
                    return Err(RegistryError::NotOwned {
                        key: (*key).clone(),
                        plan_id: plan_id.to_string(),
                    })
                }
            }
        }

        for (key, count) in wanted {
            let drained = match self.claims.get_mut(key) {
                Some(claim) => {
                    claim.claims -= count;
                    claim.claims == 0
                }
                None => false,
            };
            if drained {
                self.claims.remove(key);
            }
        }

        self.stats.total_releases += 1;
        debug!(plan_id, keys = keys.len(), "Released resources");
        Ok(())
    }

    /// Current holder of a key. Diagnostics only; correctness decisions go
    /// through [`ResourceRegistry::acquire`].
    pub fn status(&self, key: &ResourceKey) -> KeyStatus {
        match self.claims.get(key) {
            Some(claim) => KeyStatus::Held {
                plan_id: claim.plan_id.clone(),
                claims: claim.claims,
            },
            None => KeyStatus::Free,
        }
    }

    /// Keys currently held by `plan_id`.
    pub fn held_by(&self, plan_id: &str) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.plan_id == plan_id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of held keys.
    pub fn held_count(&self) -> usize {
        self.claims.len()
    }

    /// Whether no key is held.
    pub fn is_idle(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

/// Thread-safe wrapper around the registry.
pub type SharedRegistry = Arc<Mutex<ResourceRegistry>>;

/// Create a new thread-safe registry.
pub fn new_shared_registry() -> SharedRegistry {
    Arc::new(Mutex::new(ResourceRegistry::new()))
}
