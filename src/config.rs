//! Runtime configuration for kv-plan-exec.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Lane limits, retry policy, deadline margins and bandwidth estimates all
//! live here; every section has defaults, so a partial file is fine.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::plan::schema::TransferKind;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kv-plan-exec",
    about = "Validate and execute KV-cache and weight-swap transfer plans"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check plan files without running them.
    Validate {
        /// Plan files (JSON).
        #[arg(required = true)]
        plans: Vec<PathBuf>,
    },

    /// Execute plan files and print per-op results.
    Run {
        /// Plan files (JSON).
        #[arg(required = true)]
        plans: Vec<PathBuf>,

        /// Keep serving the status API on this address after the plans finish.
        #[arg(long)]
        listen: Option<String>,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Status server configuration.
    pub server: ServerConfig,

    /// Per-lane concurrency limits.
    pub lanes: LaneConfig,

    /// Retry policy for transient backend errors.
    pub retry: RetryConfig,

    /// Executor limits.
    pub executor: ExecutorConfig,

    /// Deadline admission settings.
    pub deadline: DeadlineConfig,

    /// Bandwidth estimates used for deadline admission.
    pub bandwidth: BandwidthConfig,

    /// Manifest hash verification.
    pub integrity: IntegrityConfig,

    /// Buffers declared in the in-process arena.
    pub buffers: Vec<BufferConfig>,

    /// Directory relative storage paths are resolved against.
    pub storage_root: Option<PathBuf>,
}

/// Status server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:9090").
    pub listen: String,

    /// Finished plans kept for `status`/`report`; the oldest are dropped
    /// past this many.
    pub max_retained_plans: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".to_string(),
            max_retained_plans: 1024,
        }
    }
}

/// Maximum in-flight ops per kind per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub h2d: usize,
    pub d2h: usize,
    pub p2p: usize,
    pub storage2h: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            h2d: 1,
            d2h: 1,
            p2p: 1,
            storage2h: 1,
        }
    }
}

impl LaneConfig {
    /// Limit for a kind; never below one.
    pub fn limit(&self, kind: TransferKind) -> usize {
        let limit = match kind {
            TransferKind::H2D => self.h2d,
            TransferKind::D2H => self.d2h,
            TransferKind::P2P => self.p2p,
            TransferKind::Storage2H => self.storage2h,
        };
        limit.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt, for transient errors only.
    pub max_retries: u32,

    /// Backoff before retry n is `backoff_base_ms * 2^(n-1)`.
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-attempt backend timeout.
    pub op_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// Ops must be admitted at least this long before the deadline.
    pub safety_margin_ns: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            safety_margin_ns: 1_000_000, // 1 ms
        }
    }
}

/// Channel throughput estimates in bytes per second. Zero means the
/// channel is only charged the fixed per-op latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub h2d_bps: u64,
    pub d2h_bps: u64,
    pub p2p_bps: u64,
    pub storage2h_bps: u64,

    /// Fixed setup cost charged to every op.
    pub op_latency_ns: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            h2d_bps: 12_000_000_000,       // PCIe 4.0 x16, effective
            d2h_bps: 12_000_000_000,
            p2p_bps: 25_000_000_000,       // NVLink-class peer copy
            storage2h_bps: 2_000_000_000,  // NVMe
            op_latency_ns: 10_000,
        }
    }
}

impl BandwidthConfig {
    pub fn bps(&self, kind: TransferKind) -> u64 {
        match kind {
            TransferKind::H2D => self.h2d_bps,
            TransferKind::D2H => self.d2h_bps,
            TransferKind::P2P => self.p2p_bps,
            TransferKind::Storage2H => self.storage2h_bps,
        }
    }

    /// Estimated wall time of one op.
    pub fn estimate_ns(&self, kind: TransferKind, length: u64) -> u64 {
        let transfer = match self.bps(kind) {
            0 => 0,
            bps => (u128::from(length) * 1_000_000_000 / u128::from(bps)).min(u128::from(u64::MAX)) as u64,
        };
        self.op_latency_ns.saturating_add(transfer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Hash the target manifest's chunks before running a swap.
    pub verify_manifest_hashes: bool,

    /// Chunks hashed concurrently.
    pub max_concurrent_reads: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            verify_manifest_hashes: false,
            max_concurrent_reads: 4,
        }
    }
}

/// One arena buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferConfig {
    /// Resource id, e.g. "gpu://0/kv".
    pub id: String,

    /// Size in bytes.
    pub bytes: u64,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Total bytes of all declared buffers.
    pub fn arena_bytes(&self) -> u64 {
        self.buffers.iter().map(|b| b.bytes).fold(0u64, u64::saturating_add)
    }
}
