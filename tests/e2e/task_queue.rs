//! End-to-end: lane-weighted dispatch order and the retry/dead-letter path,
//! driven through the public `Queue` + `TaskRepository` pair rather than
//! the queue's own unit tests (which only exercise a single lane).

use async_trait::async_trait;
use orcvm::cancel::CancelToken;
use orcvm::config::QueueConfig;
use orcvm::queue::{Queue, TaskHandler};
use orcvm::repository::{InMemoryTaskRepository, TaskRepository};
use orcvm::task::{type_tags, Lane, Task, TaskResult, TaskStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingHandler {
    order: Arc<Mutex<Vec<Lane>>>,
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: &Task, _cancel: CancelToken) -> TaskResult {
        self.order.lock().unwrap().push(task.lane);
        TaskResult { success: true, result: task.payload.clone(), error: None, duration_ms: 0, started_at_ms: orcvm::vm::now_ms() }
    }
}

#[tokio::test]
async fn critical_lane_is_dispatched_ahead_of_low_lane() {
    let repo = Arc::new(InMemoryTaskRepository::new());
    let queue = Arc::new(Queue::new(QueueConfig { concurrency: 1, ..QueueConfig::default() }, repo.clone()));
    let order = Arc::new(Mutex::new(Vec::new()));
    queue.register_handler(type_tags::VM_EXECUTE, Arc::new(RecordingHandler { order: order.clone() })).await;

    // Enqueue low-priority work first; critical work queued after it should
    // still be picked up first by the weighted scheduler.
    for _ in 0..3 {
        queue.enqueue(Task::new(type_tags::VM_EXECUTE, Lane::Low, serde_json::json!({}))).await.unwrap();
    }
    for _ in 0..3 {
        queue.enqueue(Task::new(type_tags::VM_EXECUTE, Lane::Critical, serde_json::json!({}))).await.unwrap();
    }

    let handle = tokio::spawn(queue.clone().start("worker-1".to_string()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    queue.stop(Duration::from_secs(1)).await;
    handle.abort();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 6);
    let first_low_index = order.iter().position(|l| *l == Lane::Low).unwrap();
    let critical_count_before_first_low = order[..first_low_index].iter().filter(|l| **l == Lane::Critical).count();
    assert!(critical_count_before_first_low >= 1, "expected at least one critical task dispatched before any low task, got order {order:?}");
}

struct AlwaysFailHandler {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for AlwaysFailHandler {
    async fn handle(&self, _task: &Task, _cancel: CancelToken) -> TaskResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        TaskResult { success: false, result: serde_json::Value::Null, error: Some("always fails".into()), duration_ms: 0, started_at_ms: orcvm::vm::now_ms() }
    }
}

#[tokio::test]
async fn task_exhausts_retries_and_lands_in_dead_letter() {
    let repo = Arc::new(InMemoryTaskRepository::new());
    let queue = Arc::new(Queue::new(
        QueueConfig { concurrency: 1, retry_base_backoff_ms: 1, retry_backoff_cap_ms: 5, ..QueueConfig::default() },
        repo.clone(),
    ));
    let attempts = Arc::new(AtomicUsize::new(0));
    queue.register_handler(type_tags::VM_DELETE, Arc::new(AlwaysFailHandler { attempts: attempts.clone() })).await;

    let task = Task::new(type_tags::VM_DELETE, Lane::Default, serde_json::Value::Null).with_max_retries(2);
    let id = task.id;
    queue.enqueue(task).await.unwrap();

    let handle = tokio::spawn(queue.clone().start("worker-1".to_string()));
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if repo.get(id).await.unwrap().status == TaskStatus::Dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never went dead");

    queue.stop(Duration::from_secs(1)).await;
    handle.abort();

    let dead = repo.get(id).await.unwrap();
    assert_eq!(dead.retry_count, 2);
    assert!(attempts.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn unregistered_type_tag_fails_without_a_panic() {
    let repo = Arc::new(InMemoryTaskRepository::new());
    let queue = Arc::new(Queue::new(QueueConfig { concurrency: 1, ..QueueConfig::default() }, repo.clone()));

    let task = Task::new("no:such:handler", Lane::Default, serde_json::Value::Null).with_max_retries(0);
    let id = task.id;
    queue.enqueue(task).await.unwrap();

    let handle = tokio::spawn(queue.clone().start("worker-1".to_string()));
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if repo.get(id).await.unwrap().status == TaskStatus::Dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("unhandled task never resolved");

    queue.stop(Duration::from_secs(1)).await;
    handle.abort();
}
