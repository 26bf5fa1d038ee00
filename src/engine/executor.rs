//! Transfer executor: runs one op to an outcome.
//!
//! Every attempt claims the op's keys, calls the backend for its kind under
//! a timeout and releases the keys again, whatever the backend did. Only
//! transient backend errors are retried; conflicts, timeouts and permanent
//! errors end the op at once.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{Config, RetryConfig};
use crate::metrics::EngineMetrics;
use crate::plan::schema::{TransferKind, TransferOp};
use crate::resource::key::{op_keys, ResourceKey};
use crate::resource::registry::{RegistryError, SharedRegistry};
use crate::transfer::backend::{BackendError, BackendSet, TransferRequest};

/// Why an op did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum OpError {
    #[error("resource conflict: {key} held by plan {holder}")]
    ResourceConflict { key: String, holder: String },

    #[error("{message}")]
    Backend { message: String, transient: bool },

    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// Release found a key this plan did not hold. Internal invariant.
    #[error("release of {key} not owned by plan")]
    NotOwned { key: String },

    #[error("no backend registered for {kind}")]
    NoBackend { kind: TransferKind },

    #[error("short transfer: moved {moved} of {expected} bytes")]
    ShortTransfer { expected: u64, moved: u64 },

    /// The op task panicked.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl OpError {
    /// Only transient backend failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpError::Backend { transient: true, .. })
    }

    /// Short label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            OpError::ResourceConflict { .. } => "resource_conflict",
            OpError::Backend { .. } => "backend",
            OpError::Timeout { .. } => "timeout",
            OpError::NotOwned { .. } => "not_owned",
            OpError::NoBackend { .. } => "no_backend",
            OpError::ShortTransfer { .. } => "short_transfer",
            OpError::Internal { .. } => "internal",
        }
    }
}

impl From<BackendError> for OpError {
    fn from(err: BackendError) -> Self {
        let transient = err.is_transient();
        let message = match err {
            BackendError::Transient(msg) | BackendError::Permanent(msg) => msg,
        };
        OpError::Backend { message, transient }
    }
}

/// Outcome of one op, all attempts included.
#[derive(Debug, Clone)]
pub struct OpReport {
    pub index: usize,
    pub result: Result<u64, OpError>,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Runs ops against the registry and the backend set. Cheap to clone.
#[derive(Clone)]
pub struct TransferExecutor {
    registry: SharedRegistry,
    backends: BackendSet,
    retry: RetryConfig,
    op_timeout: Duration,
    metrics: Option<EngineMetrics>,
}

impl TransferExecutor {
    pub fn new(registry: SharedRegistry, backends: BackendSet, retry: RetryConfig, op_timeout: Duration) -> Self {
        Self {
            registry,
            backends,
            retry,
            op_timeout,
            metrics: None,
        }
    }

    pub fn from_config(config: &Config, registry: SharedRegistry, backends: BackendSet) -> Self {
        Self::new(
            registry,
            backends,
            config.retry.clone(),
            Duration::from_millis(config.executor.op_timeout_ms),
        )
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Run op `index` of plan `plan_id` to an outcome.
    pub async fn execute(&self, plan_id: &str, index: usize, op: &TransferOp) -> OpReport {
        let keys = op_keys(op);
        let request = TransferRequest::from(op);
        let started = Instant::now();
        let mut attempts = 0u32;

        let result = loop {
            attempts += 1;
            match self.attempt(plan_id, &keys, &request).await {
                Err(err) if err.is_retryable() && attempts <= self.retry.max_retries => {
                    let backoff = self.backoff(attempts);
                    warn!(
                        plan_id,
                        op = index,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.op_retried();
                    }
                    tokio::time::sleep(backoff).await;
                }
                outcome => break outcome,
            }
        };

        match &result {
            Ok(bytes) => debug!(plan_id, op = index, kind = %op.kind, bytes, attempts, "Op succeeded"),
            Err(err) => warn!(plan_id, op = index, kind = %op.kind, attempts, error = %err, "Op failed"),
        }

        OpReport {
            index,
            result,
            attempts,
            elapsed: started.elapsed(),
        }
    }

    /// One acquire / perform / release cycle.
    async fn attempt(&self, plan_id: &str, keys: &[ResourceKey], request: &TransferRequest) -> Result<u64, OpError> {
        let backend = self
            .backends
            .get(request.kind)
            .ok_or(OpError::NoBackend { kind: request.kind })?;

        self.registry
            .lock()
            .await
            .acquire(keys, plan_id)
            .map_err(|err| match err {
                RegistryError::ResourceConflict { key, holder } => OpError::ResourceConflict {
                    key: key.to_string(),
                    holder,
                },
                RegistryError::NotOwned { key, .. } => OpError::NotOwned { key: key.to_string() },
            })?;

        let outcome = tokio::time::timeout(
            self.op_timeout,
            AssertUnwindSafe(backend.perform(request)).catch_unwind(),
        )
        .await;

        if let Err(err) = self.registry.lock().await.release(keys, plan_id) {
            error!(plan_id, error = %err, "Release failed after transfer");
            let key = match err {
                RegistryError::NotOwned { key, .. } | RegistryError::ResourceConflict { key, .. } => key,
            };
            return Err(OpError::NotOwned { key: key.to_string() });
        }

        match outcome {
            Err(_) => Err(OpError::Timeout {
                after_ms: self.op_timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(OpError::Internal {
                message: "backend panicked".to_string(),
            }),
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Ok(Ok(moved))) if moved != request.length => Err(OpError::ShortTransfer {
                expected: request.length,
                moved,
            }),
            Ok(Ok(Ok(moved))) => Ok(moved),
        }
    }

    /// Delay before the retry that follows attempt `attempt`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry.backoff_base_ms.saturating_mul(factor))
    }
}
