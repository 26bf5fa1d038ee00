//! Tests for resource claims across plans.

use std::sync::Arc;

use kv_plan_exec::plan::schema::{KvPageRef, TransferKind, TransferOp};
use kv_plan_exec::resource::key::{op_keys, ResourceKey};
use kv_plan_exec::resource::registry::{new_shared_registry, KeyStatus, RegistryError};

fn layer0_page5() -> KvPageRef {
    KvPageRef::new("layer0", 5, 0, 0)
}

#[test]
fn test_op_keys_cover_pages_and_endpoints() {
    let op = TransferOp::new(TransferKind::Storage2H, "file:///w/a.bin", "host://0/s", 64)
        .with_kv_refs([layer0_page5()]);
    assert_eq!(
        op_keys(&op),
        vec![
            ResourceKey::Page(layer0_page5()),
            ResourceKey::Storage("/w/a.bin".into()),
            ResourceKey::Buffer("host://0/s".into()),
        ]
    );
}

#[tokio::test]
async fn test_same_plan_reclaim_does_not_conflict() {
    let registry = new_shared_registry();
    let op = TransferOp::new(TransferKind::H2D, "host://0/s", "gpu://0/kv", 64)
        .with_kv_refs([layer0_page5()]);
    let keys = op_keys(&op);

    let mut guard = registry.lock().await;
    guard.acquire(&keys, "plan-a").unwrap();
    guard.acquire(&keys, "plan-a").unwrap();
    assert_eq!(
        guard.status(&ResourceKey::Page(layer0_page5())),
        KeyStatus::Held {
            plan_id: "plan-a".into(),
            claims: 2
        }
    );

    guard.release(&keys, "plan-a").unwrap();
    guard.release(&keys, "plan-a").unwrap();
    assert!(guard.is_idle());
    assert!(matches!(
        guard.release(&keys, "plan-a"),
        Err(RegistryError::NotOwned { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_claims_on_one_page() {
    let registry = new_shared_registry();
    let key = vec![ResourceKey::Page(layer0_page5())];

    let mut tasks = Vec::new();
    for i in 0..16 {
        let registry = Arc::clone(&registry);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            registry.lock().await.acquire(&key, &format!("plan-{i}")).is_ok()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(registry.lock().await.stats().total_conflicts, 15);
}

#[tokio::test]
async fn test_mixed_owners_are_rejected_and_released_cleanly() {
    let registry = new_shared_registry();
    let own = ResourceKey::Page(KvPageRef::new("layer0", 1, 0, 0));
    let foreign = ResourceKey::Page(layer0_page5());

    let mut guard = registry.lock().await;
    guard.acquire(&[own.clone()], "plan-a").unwrap();
    guard.acquire(&[foreign.clone()], "plan-b").unwrap();

    assert_eq!(
        guard.acquire(&[own.clone(), foreign.clone()], "plan-a"),
        Err(RegistryError::ResourceConflict {
            key: foreign.clone(),
            holder: "plan-b".into()
        })
    );

    // Both plans can still drop exactly what they hold.
    guard.release(&[own], "plan-a").unwrap();
    guard.release(&[foreign], "plan-b").unwrap();
    assert!(guard.is_idle());
}
