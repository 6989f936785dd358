//! End-to-end: multi-worker registration, heartbeat TTL eviction, and the
//! membership change feed, driven entirely through the public
//! `WorkerRegistry` trait.

use orcvm::registry::{InMemoryWorkerRegistry, WorkerRegistry};
use orcvm::repository::InMemoryWorkerRepository;
use orcvm::worker::{Worker, WorkerEvent, WorkerFilter, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;

fn registry(ttl_ms: u64) -> InMemoryWorkerRegistry {
    InMemoryWorkerRegistry::new(Arc::new(InMemoryWorkerRepository::new()), ttl_ms, 0)
}

#[tokio::test]
async fn pool_of_workers_lists_and_filters_by_zone_capability() {
    let registry = registry(30_000);
    let mut a = Worker::new("w-a", "host-a", "10.0.0.1:9000");
    a.zone = "us-east".into();
    a.capabilities = vec!["type-1".into()];
    let mut b = Worker::new("w-b", "host-b", "10.0.0.2:9000");
    b.zone = "us-west".into();
    b.capabilities = vec!["container".into()];

    registry.register(a).await.unwrap();
    registry.register(b).await.unwrap();

    let east = registry.list_workers(&WorkerFilter { zone: Some("us-east".into()), ..Default::default() }).await.unwrap();
    assert_eq!(east.len(), 1);
    assert_eq!(east[0].id, "w-a");

    let containers = registry
        .list_workers(&WorkerFilter { capability: Some("container".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id, "w-b");
}

#[tokio::test]
async fn graceful_drain_then_leave_is_observable_on_watch() {
    let registry = registry(30_000);
    registry.register(Worker::new("w-a", "host-a", "10.0.0.1:9000")).await.unwrap();
    let mut events = registry.watch();

    registry.update_status("w-a", WorkerStatus::Draining).await.unwrap();
    let drained = registry.list_workers(&WorkerFilter::default()).await.unwrap();
    assert_eq!(drained[0].status, WorkerStatus::Draining);

    registry.update_status("w-a", WorkerStatus::Left).await.unwrap();

    let updated = events.recv().await.unwrap();
    assert!(matches!(updated, WorkerEvent::Updated(w) if w.status == WorkerStatus::Draining));
    let updated_left = events.recv().await.unwrap();
    assert!(matches!(updated_left, WorkerEvent::Updated(w) if w.status == WorkerStatus::Left));
    let left = events.recv().await.unwrap();
    assert!(matches!(left, WorkerEvent::Left(id) if id == "w-a"));
}

#[tokio::test]
async fn heartbeat_keeps_a_worker_alive_across_eviction_sweeps() {
    let registry = Arc::new(registry(80));
    registry.register(Worker::new("w-a", "host-a", "10.0.0.1:9000")).await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.heartbeat("w-a").await.unwrap();
        let evicted = registry.evict_stale(orcvm::vm::now_ms()).await.unwrap();
        assert!(evicted.is_empty(), "heartbeating worker should never be evicted");
    }

    assert_eq!(registry.list_workers(&WorkerFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn silence_past_ttl_results_in_eviction() {
    let registry = registry(50);
    registry.register(Worker::new("w-a", "host-a", "10.0.0.1:9000")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let evicted = registry.evict_stale(orcvm::vm::now_ms()).await.unwrap();
    assert_eq!(evicted, vec!["w-a".to_string()]);
    assert!(registry.list_workers(&WorkerFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn silence_within_ttl_plus_deregister_grace_is_not_yet_evicted() {
    let registry = InMemoryWorkerRegistry::new(Arc::new(InMemoryWorkerRepository::new()), 50, 500);
    registry.register(Worker::new("w-a", "host-a", "10.0.0.1:9000")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let evicted = registry.evict_stale(orcvm::vm::now_ms()).await.unwrap();
    assert!(evicted.is_empty(), "worker is past ttl but still within the deregister-after grace period");
    assert_eq!(registry.list_workers(&WorkerFilter::default()).await.unwrap().len(), 1);
}
