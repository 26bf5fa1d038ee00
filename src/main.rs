//! kv-plan-exec: validate and run transfer plans from the command line.
//!
//! Plans execute against an in-process buffer arena (the buffers declared
//! in the config) and the local filesystem for storage reads. With
//! `run --listen`, the status API keeps serving after the plans finish.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use kv_plan_exec::config::{Cli, Command, Config};
use kv_plan_exec::engine::coordinator::{OpStatus, PlanCoordinator, PlanReport, PlanStatus};
use kv_plan_exec::engine::clock::{Clock, SystemClock};
use kv_plan_exec::engine::validator::validate;
use kv_plan_exec::plan::loader::load_plan;
use kv_plan_exec::plan::schema::{Plan, TransferKind};
use kv_plan_exec::resource::extent::{ExtentProvider, LayeredExtents};
use kv_plan_exec::resource::key::is_storage;
use kv_plan_exec::resource::registry::new_shared_registry;
use kv_plan_exec::server::status_api::{build_router, AppState};
use kv_plan_exec::transfer::backend::BackendSet;
use kv_plan_exec::transfer::memory::MemoryBackend;
use kv_plan_exec::transfer::storage::{file_extents, StorageBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_plan_exec=debug,tower_http=debug"
    } else {
        "kv_plan_exec=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-plan-exec v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        buffers = config.buffers.len(),
        arena_bytes = config.arena_bytes(),
        verify_hashes = config.integrity.verify_manifest_hashes,
        "Configuration loaded"
    );

    match cli.command {
        Command::Validate { plans } => validate_plans(&config, &plans).await,
        Command::Run { plans, listen } => run_plans(config, &plans, listen).await,
    }
}

fn load_all(paths: &[impl AsRef<Path>]) -> anyhow::Result<Vec<Plan>> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            load_plan(path).with_context(|| format!("loading {}", path.display()))
        })
        .collect()
}

fn build_arena(config: &Config) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_buffers(
        config.buffers.iter().map(|b| (b.id.as_str(), b.bytes)),
    ))
}

/// Arena buffer sizes, then the on-disk size of every storage file the
/// plans mention.
async fn build_extents(config: &Config, arena: &Arc<MemoryBackend>, plans: &[Plan]) -> LayeredExtents {
    let storage_ids = plans
        .iter()
        .flat_map(|plan| plan.ops())
        .flat_map(|op| [op.src.as_str(), op.dst.as_str()])
        .filter(|id| is_storage(id));
    let files = file_extents(config.storage_root.as_deref(), storage_ids).await;

    LayeredExtents::new()
        .with(arena.clone())
        .with(Arc::new(files))
}

async fn validate_plans(config: &Config, paths: &[std::path::PathBuf]) -> anyhow::Result<()> {
    let plans = load_all(paths)?;
    let arena = build_arena(config);
    let extents = build_extents(config, &arena, &plans).await;
    let now = SystemClock.now_ns();

    let mut rejected = 0usize;
    for plan in plans {
        let plan_id = plan.plan_id().to_string();
        let kind = plan.kind_label();
        match validate(Arc::new(plan), &extents as &dyn ExtentProvider, now) {
            Ok(validated) => println!("{plan_id} ({kind}): ok, {} ops", validated.ops().len()),
            Err(err) => {
                rejected += 1;
                println!("{plan_id} ({kind}): rejected: {err}");
            }
        }
    }

    anyhow::ensure!(rejected == 0, "{rejected} plan(s) rejected");
    Ok(())
}

async fn run_plans(config: Config, paths: &[std::path::PathBuf], listen: Option<String>) -> anyhow::Result<()> {
    let plans = load_all(paths)?;
    let arena = build_arena(&config);
    let extents = build_extents(&config, &arena, &plans).await;

    let mut storage = StorageBackend::new(arena.clone());
    if let Some(root) = &config.storage_root {
        storage = storage.with_root(root.clone());
    }
    let backends = BackendSet::new()
        .with_kinds([TransferKind::H2D, TransferKind::D2H, TransferKind::P2P], arena.clone())
        .with(TransferKind::Storage2H, Arc::new(storage));

    let coordinator = PlanCoordinator::new(config, new_shared_registry(), backends, Arc::new(extents))?;

    let handles: Vec<_> = plans.into_iter().map(|plan| coordinator.submit(plan)).collect();
    let mut unsuccessful = 0usize;
    for handle in handles {
        coordinator.wait(handle).await;
        if let Some(report) = coordinator.report(handle) {
            print_report(&report);
            if report.status != PlanStatus::Succeeded {
                unsuccessful += 1;
            }
        }
    }

    if let Some(addr) = listen {
        let app = build_router(AppState::new(coordinator.clone()));
        let listener = TcpListener::bind(&addr).await?;
        info!("Status API listening on {addr}");
        axum::serve(listener, app).await?;
    }

    if unsuccessful > 0 {
        warn!(unsuccessful, "Not every plan succeeded");
        anyhow::bail!("{unsuccessful} plan(s) did not succeed");
    }
    Ok(())
}

fn print_report(report: &PlanReport) {
    println!(
        "{} ({}) {}: {} bytes moved",
        report.plan_id,
        report.kind,
        report.status,
        report.bytes_moved()
    );
    if let Some(error) = &report.error {
        println!("  error: {error}");
    }
    for op in &report.ops {
        let detail = match &op.status {
            OpStatus::Succeeded { bytes_moved, attempts } => format!("{bytes_moved} bytes, {attempts} attempt(s)"),
            OpStatus::Failed { error, attempts } => format!("{error} after {attempts} attempt(s)"),
            OpStatus::Skipped { upstream } => format!("upstream op {upstream} did not succeed"),
            other => other.label().to_string(),
        };
        println!(
            "  [{}] {} {} -> {} ({} B): {}",
            op.index,
            op.kind,
            op.src,
            op.dst,
            op.length,
            detail
        );
    }
}
