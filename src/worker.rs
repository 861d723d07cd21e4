//! Background worker: dequeue, lock, dispatch, persist outcomes

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::queue::TaskQueueClient;
use crate::task::{Task, TaskOutcome};

/// Error surface of a task handler
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The task type is registered but the feature behind it is not built;
    /// recorded as a `not_implemented` outcome, not a failure
    #[error("not implemented")]
    NotImplemented,

    /// Any other handler failure; recorded as a `failed` outcome and
    /// mirrored into the dead-letter store
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Contract for type-specific task execution
///
/// A handler receives the claimed task and returns a JSON-serializable
/// payload or an error. It must not touch task or lock state; the worker
/// owns all state transitions.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Value, HandlerError>;
}

/// Adapter so plain async closures over the task payload can be handlers
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, task: &Task) -> Result<Value, HandlerError> {
        (self.f)(task.data.clone()).await
    }
}

/// Map from task-type tag to handler, fixed before the worker starts
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type; duplicate registration is a
    /// configuration error
    pub fn register<H>(&mut self, task_type: &str, handler: H) -> QueueResult<()>
    where
        H: TaskHandler + 'static,
    {
        if self.handlers.contains_key(task_type) {
            return Err(QueueError::config(format!(
                "handler for task type {} already registered",
                task_type
            )));
        }
        self.handlers.insert(task_type.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Register an async closure over the task's data payload
    pub fn register_fn<F, Fut>(&mut self, task_type: &str, f: F) -> QueueResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(task_type, FnHandler { f })
    }

    fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Task types this registry can dispatch
    pub fn task_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written into claimed tasks and lock values
    pub worker_host: String,
    /// Sleep between scans when every queue is empty
    pub poll_interval: Duration,
    /// Back-off after a loop-level error before rescanning
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_host: std::env::var("HOSTNAME")
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Handle for requesting a clean worker stop from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Polling worker over all registered task types
///
/// A single cooperative loop: pop the highest-priority entry per type,
/// claim the per-task lock, dispatch, persist the outcome. Multiple worker
/// processes coordinate only through the store.
pub struct Worker {
    client: Arc<TaskQueueClient>,
    registry: HandlerRegistry,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Worker {
    /// Create a worker; refuses an empty registry so unknown deployments
    /// fail fast instead of idling forever
    pub fn new(
        client: Arc<TaskQueueClient>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> QueueResult<Self> {
        if registry.is_empty() {
            return Err(QueueError::config("no task handlers registered"));
        }
        Ok(Self {
            client,
            registry,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Stop cleanly on SIGINT/SIGTERM
    pub fn install_signal_handlers(&self) {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            handle.stop();
        });
    }

    /// Run the worker loop until a stop is requested
    ///
    /// A single failed iteration never exits the loop; store hiccups are
    /// logged and followed by a back-off.
    pub async fn run(&self) -> QueueResult<()> {
        self.client.connect().await?;
        let task_types = self.registry.task_types();
        info!(
            "Worker {} started for task types: {:?}",
            self.config.worker_host, task_types
        );

        while !self.stop.load(Ordering::SeqCst) {
            let mut found_work = false;
            for task_type in &task_types {
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                match self.process_type(task_type).await {
                    Ok(processed) => found_work |= processed,
                    Err(e) => {
                        error!("Worker iteration failed for {}: {}", task_type, e);
                        self.idle(self.config.error_backoff).await;
                    }
                }
            }

            if !found_work && !self.stop.load(Ordering::SeqCst) {
                self.idle(self.config.poll_interval).await;
            }
        }

        info!("Worker {} stopped", self.config.worker_host);
        self.client.close().await;
        Ok(())
    }

    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }

    /// Pop and process at most one task of the given type. Returns whether
    /// an entry was popped.
    ///
    /// The pop is the sole admission point; the lock is a secondary guard
    /// against a double pop for the same task id under store-level races.
    /// A losing worker therefore skips without re-queueing.
    async fn process_type(&self, task_type: &str) -> QueueResult<bool> {
        let Some((task_id, score)) = self.client.pop_highest(task_type).await? else {
            return Ok(false);
        };
        debug!("Popped task {} (score={})", task_id, score);

        if !self
            .client
            .acquire_lock(&task_id, &self.config.worker_host)
            .await?
        {
            warn!("Skipping task {}: lock held by another worker", task_id);
            return Ok(true);
        }

        let run = self.execute_claimed(&task_id).await;
        // The lock is released on every path, success or failure
        if let Err(e) = self.client.release_lock(&task_id).await {
            error!("Failed to release lock for {}: {}", task_id, e);
        }
        run?;
        Ok(true)
    }

    /// Execute a claimed task end to end. Handler failures become stored
    /// outcomes; only store-level errors propagate.
    async fn execute_claimed(&self, task_id: &str) -> QueueResult<()> {
        let Some(mut task) = self.client.fetch_task(task_id).await? else {
            warn!("Task {} metadata expired before processing", task_id);
            return Ok(());
        };

        task.mark_processing(&self.config.worker_host);
        self.client.save_task(&task).await?;

        let (outcome, dead_letter) = self.dispatch(&task).await;
        self.client.store_result(&outcome).await?;
        if let Some(error) = dead_letter {
            self.client
                .store_dead_letter(&task, &error, &self.config.worker_host)
                .await?;
        }
        Ok(())
    }

    /// Dispatch to the type's handler under the task's own timeout.
    /// Returns the outcome to store and, for unrecoverable failures, the
    /// error to dead-letter.
    async fn dispatch(&self, task: &Task) -> (TaskOutcome, Option<String>) {
        let task_id = task.task_id.as_str();
        let Some(handler) = self.registry.get(&task.task_type) else {
            let message = format!("no handler registered for task type {}", task.task_type);
            error!("Task {}: {}", task_id, message);
            return (
                TaskOutcome::failed(task_id, &message, "unknown_task_type"),
                Some(message),
            );
        };

        let deadline = Duration::from_secs(task.timeout_secs);
        match tokio::time::timeout(deadline, handler.handle(task)).await {
            Ok(Ok(result)) => {
                info!("Task {} completed", task_id);
                (TaskOutcome::completed(task_id, result), None)
            }
            Ok(Err(HandlerError::NotImplemented)) => {
                warn!("Task {}: type {} not implemented", task_id, task.task_type);
                (TaskOutcome::not_implemented(task_id, &task.task_type), None)
            }
            Ok(Err(HandlerError::Failed(e))) => {
                let message = format!("{:#}", e);
                error!("Task {} failed: {}", task_id, message);
                (
                    TaskOutcome::failed(task_id, &message, "handler_error"),
                    Some(message),
                )
            }
            Err(_) => {
                error!(
                    "Task {} exceeded its {}s execution timeout",
                    task_id, task.timeout_secs
                );
                let mut outcome = TaskOutcome::timed_out(task_id);
                outcome.error = Some(format!(
                    "execution exceeded {}s timeout",
                    task.timeout_secs
                ));
                (outcome, None)
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::store::{MemoryStore, Store};
    use crate::task::{OutcomeStatus, TaskPriority};
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::Mutex;

    fn setup() -> (Arc<MemoryStore>, Arc<TaskQueueClient>) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(TaskQueueClient::new(store.clone(), QueueConfig::default()));
        (store, client)
    }

    fn echo_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("echo", |data| async move { Ok(json!({ "x": data["x"] })) })
            .unwrap();
        registry
    }

    fn worker_for(client: &Arc<TaskQueueClient>, registry: HandlerRegistry) -> Worker {
        let config = WorkerConfig {
            worker_host: "test-host".to_string(),
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        };
        Worker::new(client.clone(), registry, config).unwrap()
    }

    /// Handler that records the order its tasks arrived in
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: &Task) -> Result<Value, HandlerError> {
            self.seen
                .lock()
                .unwrap()
                .push(task.data["label"].as_str().unwrap_or("").to_string());
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn echo_task_runs_end_to_end() {
        let (_store, client) = setup();
        let worker = Arc::new(worker_for(&client, echo_registry()));
        let shutdown = worker.shutdown_handle();
        let runner = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        let task_id = client
            .enqueue("echo", json!({"x": 1}), TaskPriority::High, 60)
            .await
            .unwrap();
        let outcome = client.get_result(&task_id, Duration::from_secs(5)).await;

        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.result, Some(json!({"x": 1})));

        shutdown.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn critical_task_is_processed_before_low() {
        let (_store, client) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .register("gen", RecordingHandler { seen: seen.clone() })
            .unwrap();
        let worker = worker_for(&client, registry);

        client
            .enqueue("gen", json!({"label": "low"}), TaskPriority::Low, 60)
            .await
            .unwrap();
        client
            .enqueue("gen", json!({"label": "critical"}), TaskPriority::Critical, 60)
            .await
            .unwrap();

        assert!(worker.process_type("gen").await.unwrap());
        assert!(worker.process_type("gen").await.unwrap());
        assert!(!worker.process_type("gen").await.unwrap());

        assert_eq!(*seen.lock().unwrap(), vec!["critical", "low"]);
    }

    #[tokio::test]
    async fn held_lock_skips_the_handler_without_requeueing() {
        let (store, client) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .register("gen", RecordingHandler { seen: seen.clone() })
            .unwrap();
        let worker = worker_for(&client, registry);

        let task_id = client
            .enqueue("gen", json!({"label": "t1"}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        assert!(client.acquire_lock(&task_id, "other-host").await.unwrap());

        assert!(worker.process_type("gen").await.unwrap());

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(client.get_queue_length("gen").await.unwrap(), 0);
        // The losing worker must not release the winner's lock
        let lock_key = client.config().keys.lock_key(&task_id);
        assert_eq!(
            store.get(&lock_key).await.unwrap().as_deref(),
            Some("other-host")
        );
    }

    #[tokio::test]
    async fn failing_handler_stores_failure_and_dead_letter() {
        let (_store, client) = setup();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("gen", |_| async {
                Err(HandlerError::Failed(anyhow!("generation exploded")))
            })
            .unwrap();
        let worker = worker_for(&client, registry);

        let task_id = client
            .enqueue("gen", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        worker.process_type("gen").await.unwrap();

        let outcome = client.get_result(&task_id, Duration::from_secs(1)).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error_type.as_deref(), Some("handler_error"));
        assert!(outcome.error.unwrap().contains("generation exploded"));

        let entry = client.get_dead_letter(&task_id).await.unwrap().unwrap();
        assert_eq!(entry.task_id, task_id);
        assert_eq!(entry.worker_host, "test-host");
    }

    #[tokio::test]
    async fn not_implemented_outcome_skips_the_dead_letter_store() {
        let (_store, client) = setup();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("tryon", |_| async { Err(HandlerError::NotImplemented) })
            .unwrap();
        let worker = worker_for(&client, registry);

        let task_id = client
            .enqueue("tryon", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        worker.process_type("tryon").await.unwrap();

        let outcome = client.get_result(&task_id, Duration::from_secs(1)).await;
        assert_eq!(outcome.status, OutcomeStatus::NotImplemented);
        assert!(client.get_dead_letter(&task_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_with_a_timeout_outcome() {
        let (_store, client) = setup();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(json!(null))
            })
            .unwrap();
        let worker = worker_for(&client, registry);

        let task_id = client
            .enqueue("slow", json!({}), TaskPriority::Normal, 30)
            .await
            .unwrap();
        worker.process_type("slow").await.unwrap();

        let outcome = client.get_result(&task_id, Duration::from_secs(1)).await;
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(client.get_dead_letter(&task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_released_after_processing() {
        let (_store, client) = setup();
        let worker = worker_for(&client, echo_registry());

        let task_id = client
            .enqueue("echo", json!({"x": 2}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        worker.process_type("echo").await.unwrap();

        assert!(client.acquire_lock(&task_id, "anyone").await.unwrap());
    }

    #[tokio::test]
    async fn expired_metadata_is_skipped_without_a_result() {
        let (store, client) = setup();
        let worker = worker_for(&client, echo_registry());

        let task_id = client
            .enqueue("echo", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        // Simulate TTL expiry between pop and fetch
        store
            .delete(&client.config().keys.task_key(&task_id))
            .await
            .unwrap();

        worker.process_type("echo").await.unwrap();
        let outcome = client.get_result(&task_id, Duration::ZERO).await;
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
    }

    #[tokio::test]
    async fn empty_registry_is_rejected_at_construction() {
        let (_store, client) = setup();
        let err = Worker::new(client, HandlerRegistry::new(), WorkerConfig::default())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, QueueError::Config { .. }));
    }

    #[test]
    fn duplicate_handler_registration_is_rejected() {
        let mut registry = echo_registry();
        let err = registry
            .register_fn("echo", |_| async { Ok(json!(null)) })
            .unwrap_err();
        assert!(matches!(err, QueueError::Config { .. }));
    }
}
