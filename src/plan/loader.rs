//! JSON plan files.
//!
//! Plans arrive from the upstream planner as JSON documents. Missing
//! optional fields take their defaults, `manifest_from`/`manifest_to` and
//! `start_ns`/`deadline_ns` are accepted as aliases, and transfer kinds
//! parse case-insensitively.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::plan::schema::{CachePlan, Plan, SwapPlan};

#[derive(Error, Debug)]
pub enum PlanLoadError {
    #[error("failed to access plan file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed plan JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plan document must be a JSON object")]
    NotAnObject,
}

fn read(path: &Path) -> Result<String, PlanLoadError> {
    std::fs::read_to_string(path).map_err(|source| PlanLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a cache plan from a JSON file.
pub fn load_cache_plan(path: impl AsRef<Path>) -> Result<CachePlan, PlanLoadError> {
    let data = read(path.as_ref())?;
    Ok(serde_json::from_str(&data)?)
}

/// Load a swap plan from a JSON file.
pub fn load_swap_plan(path: impl AsRef<Path>) -> Result<SwapPlan, PlanLoadError> {
    let data = read(path.as_ref())?;
    Ok(serde_json::from_str(&data)?)
}

/// Load either plan shape, detecting swap plans by their manifests or window.
pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan, PlanLoadError> {
    let path = path.as_ref();
    let plan = parse_plan(&read(path)?)?;
    debug!(
        path = %path.display(),
        plan_id = plan.plan_id(),
        kind = plan.kind_label(),
        ops = plan.ops().len(),
        "Loaded plan file"
    );
    Ok(plan)
}

/// Parse a plan document, detecting its shape.
pub fn parse_plan(json: &str) -> Result<Plan, PlanLoadError> {
    let value: Value = serde_json::from_str(json)?;
    let object = value.as_object().ok_or(PlanLoadError::NotAnObject)?;

    let is_swap = ["window", "from", "manifest_from", "to", "manifest_to"]
        .iter()
        .any(|key| object.contains_key(*key));

    if is_swap {
        Ok(Plan::Swap(serde_json::from_value(value)?))
    } else {
        Ok(Plan::Cache(serde_json::from_value(value)?))
    }
}

/// Write a plan as pretty JSON.
pub fn save_plan(plan: &Plan, path: impl AsRef<Path>) -> Result<(), PlanLoadError> {
    let path = path.as_ref();
    let payload = match plan {
        Plan::Cache(p) => p.to_json()?,
        Plan::Swap(p) => p.to_json()?,
    };
    std::fs::write(path, payload).map_err(|source| PlanLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl CachePlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl SwapPlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::schema::TransferKind;

    #[test]
    fn test_cache_plan_defaults() {
        let plan = parse_plan(r#"{"plan_id": "w1", "ops": [{"src": "a", "dst": "b", "length": 8}]}"#)
            .unwrap();
        let Plan::Cache(plan) = plan else {
            panic!("expected cache plan");
        };
        assert_eq!(plan.ops[0].kind, TransferKind::Storage2H);
        assert_eq!(plan.ops[0].src_offset, 0);
        assert!(plan.ops[0].kv_refs.is_empty());
        assert!(plan.prefetch.is_empty());
    }

    #[test]
    fn test_swap_plan_aliases() {
        let json = r#"{
            "plan_id": "swap-v1",
            "manifest_from": {"model_id": "m", "version": "v0", "files": []},
            "manifest_to": {"model_id": "m", "version": "v1", "files": [
                {"path": "a.bin", "offset": 0, "length": 16, "sha256": "00"}
            ]},
            "ops": [{"kind": "storage2h", "src": "file://a.bin", "dst": "host://0/s", "length": 16}],
            "window": {"start_ns": 5, "deadline_ns": 1000000}
        }"#;
        let Plan::Swap(plan) = parse_plan(json).unwrap() else {
            panic!("expected swap plan");
        };
        assert_eq!(plan.to.version, "v1");
        assert_eq!(plan.window.t_start_ns, 5);
        assert_eq!(plan.window.t_deadline_ns, 1_000_000);
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(parse_plan("[1, 2]"), Err(PlanLoadError::NotAnObject)));
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let err = parse_plan(r#"{"plan_id": "x", "ops": [{"kind": "DMA", "length": 1}]}"#);
        assert!(matches!(err, Err(PlanLoadError::Json(_))));
    }
}
