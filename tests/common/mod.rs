//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use kv_plan_exec::config::Config;
use kv_plan_exec::engine::coordinator::PlanCoordinator;
use kv_plan_exec::plan::schema::TransferKind;
use kv_plan_exec::resource::registry::{new_shared_registry, SharedRegistry};
use kv_plan_exec::transfer::backend::{BackendError, BackendSet, TransferBackend, TransferRequest};
use kv_plan_exec::transfer::memory::MemoryBackend;

/// One backend call, as seen by [`ScriptedBackend`].
#[derive(Debug, Clone)]
pub struct Call {
    pub dst: String,
    pub dst_offset: u64,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone)]
enum Script {
    /// Fail transiently this many more times, then behave.
    Transient(usize),
    Permanent,
}

/// Wraps a [`MemoryBackend`] with per-destination failures, a fixed delay
/// and a call log.
pub struct ScriptedBackend {
    arena: Arc<MemoryBackend>,
    delay: Duration,
    scripts: Mutex<HashMap<(String, u64), Script>>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(arena: Arc<MemoryBackend>) -> Self {
        Self {
            arena,
            delay: Duration::ZERO,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every write to `dst` at `offset` fails permanently.
    pub fn fail_permanently(self, dst: &str, offset: u64) -> Self {
        self.scripts
            .lock()
            .insert((dst.to_string(), offset), Script::Permanent);
        self
    }

    /// The first `times` writes to `dst` at `offset` fail transiently.
    pub fn fail_transiently(self, dst: &str, offset: u64, times: usize) -> Self {
        self.scripts
            .lock()
            .insert((dst.to_string(), offset), Script::Transient(times));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_to(&self, dst: &str, offset: u64) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.dst == dst && c.dst_offset == offset)
            .cloned()
            .collect()
    }

    /// Highest number of calls that were in progress at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, request: &TransferRequest) -> Option<BackendError> {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&(request.dst.clone(), request.dst_offset)) {
            Some(Script::Permanent) => Some(BackendError::Permanent("device lost".into())),
            Some(Script::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(BackendError::Transient("channel busy".into()))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl TransferBackend for ScriptedBackend {
    async fn perform(&self, request: &TransferRequest) -> Result<u64, BackendError> {
        let started = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match self.scripted_failure(request) {
            Some(err) => Err(err),
            None => self.arena.perform(request).await,
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().push(Call {
            dst: request.dst.clone(),
            dst_offset: request.dst_offset,
            started,
            finished: Instant::now(),
        });
        result
    }
}

pub const HOST: &str = "host://0/staging";
pub const GPU0: &str = "gpu://0/kv";
pub const GPU1: &str = "gpu://1/kv";

/// 64 KiB host, GPU 0 and GPU 1 buffers.
pub fn arena() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_buffers([
        (HOST, 64 * 1024),
        (GPU0, 64 * 1024),
        (GPU1, 64 * 1024),
    ]))
}

pub fn fast_retry_config() -> Config {
    let mut config = Config::default();
    config.retry.backoff_base_ms = 1;
    config
}

/// A coordinator whose buffer kinds all go through `backend`.
pub fn coordinator_with(
    config: Config,
    arena: Arc<MemoryBackend>,
    backend: Arc<ScriptedBackend>,
) -> (PlanCoordinator, SharedRegistry) {
    let registry = new_shared_registry();
    let backends = BackendSet::new().with_kinds(
        [TransferKind::H2D, TransferKind::D2H, TransferKind::P2P],
        backend,
    );
    let coordinator = PlanCoordinator::new(config, registry.clone(), backends, arena)
        .expect("coordinator");
    (coordinator, registry)
}
