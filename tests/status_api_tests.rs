//! Tests for the HTTP status surface against a real listener.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;

use kv_plan_exec::engine::coordinator::PlanStatus;
use kv_plan_exec::plan::schema::{CachePlan, TransferKind, TransferOp};
use kv_plan_exec::server::status_api::{build_router, AppState};
use kv_plan_exec::PlanCoordinator;

use common::*;

async fn serve(coordinator: PlanCoordinator) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(coordinator));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_plan_report_over_http() {
    let arena = arena();
    let backend = Arc::new(ScriptedBackend::new(arena.clone()));
    let (coordinator, _) = coordinator_with(fast_retry_config(), arena, backend);
    let base = serve(coordinator.clone()).await;

    let plan = CachePlan::new(
        "http-1",
        vec![TransferOp::new(TransferKind::H2D, HOST, GPU0, 128)],
    );
    let handle = coordinator.submit(plan);
    assert_eq!(coordinator.wait(handle).await, Some(PlanStatus::Succeeded));

    let client = reqwest::Client::new();
    let report: Value = client
        .get(format!("{base}/v1/plans/{handle}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["plan_id"], "http-1");
    assert_eq!(report["status"], "succeeded");
    assert_eq!(report["ops"][0]["status"]["state"], "succeeded");
    assert_eq!(report["ops"][0]["status"]["bytes_moved"], 128);
    assert_eq!(report["ops"][0]["kind"], "H2D");

    let list: Value = client
        .get(format!("{base}/v1/plans"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["plans"].as_array().unwrap().len(), 1);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["held_resources"], 0);

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("kv_plan_exec_plans_finished_total"));
}

#[tokio::test]
async fn test_cancel_over_http() {
    let arena = arena();
    let backend =
        Arc::new(ScriptedBackend::new(arena.clone()).with_delay(Duration::from_millis(100)));
    let (coordinator, _) = coordinator_with(fast_retry_config(), arena, backend);
    let base = serve(coordinator.clone()).await;

    let plan = CachePlan::new(
        "http-2",
        vec![
            TransferOp::new(TransferKind::H2D, HOST, GPU0, 64),
            TransferOp::new(TransferKind::H2D, HOST, GPU0, 64).with_offsets(0, 4096),
        ],
    );
    let handle = coordinator.submit(plan);

    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/plans/{handle}/cancel"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["cancelled"], true);
    assert_eq!(coordinator.wait(handle).await, Some(PlanStatus::Cancelled));

    let report = coordinator.report(handle).unwrap();
    assert_eq!(report.ops[1].status.label(), "cancelled");
}
