//! Task queue client: enqueue, status lookup, result delivery, locking

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::store::{Store, Subscription};
use crate::task::{
    DeadLetterEntry, ResultNotification, Task, TaskLookup, TaskOutcome, TaskPriority, TaskStatus,
};

/// Key namespace for everything the queue writes to the store
#[derive(Debug, Clone)]
pub struct KeySpace {
    /// Prefix for task metadata keys
    pub task_prefix: String,
    /// Prefix for per-type priority queues
    pub queue_prefix: String,
    /// Prefix for result keys
    pub result_prefix: String,
    /// Shared pub/sub channel for result notifications
    pub result_channel: String,
    /// Prefix for per-task lock keys
    pub lock_prefix: String,
    /// Prefix for dead-letter keys
    pub dead_letter_prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self {
            task_prefix: "devskyy:tasks".to_string(),
            queue_prefix: "queue".to_string(),
            result_prefix: "devskyy:results".to_string(),
            result_channel: "devskyy:results:channel".to_string(),
            lock_prefix: "devskyy:locks".to_string(),
            dead_letter_prefix: "devskyy:dlq".to_string(),
        }
    }
}

impl KeySpace {
    pub fn task_key(&self, task_id: &str) -> String {
        format!("{}:{}", self.task_prefix, task_id)
    }

    pub fn queue_key(&self, task_type: &str) -> String {
        format!("{}:{}", self.queue_prefix, task_type)
    }

    pub fn result_key(&self, task_id: &str) -> String {
        format!("{}:{}", self.result_prefix, task_id)
    }

    pub fn lock_key(&self, task_id: &str) -> String {
        format!("{}:{}", self.lock_prefix, task_id)
    }

    pub fn dead_letter_key(&self, task_id: &str) -> String {
        format!("{}:{}", self.dead_letter_prefix, task_id)
    }
}

/// Configuration for the task queue client
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Store connection URL; `REDIS_URL` overrides the built-in default
    pub url: String,
    /// Maximum simultaneously open store connections; passed to
    /// `RedisStore::open_with_limits` when constructing the backend
    pub pool_size: usize,
    /// Timeout for establishing a single connection; also bounds the
    /// client's own ping on `connect` and in the health check
    pub connect_timeout: Duration,
    /// How often the background health check pings the store
    pub health_check_interval: Duration,
    /// Polling interval for `get_result`
    pub poll_interval: Duration,
    /// Retention for stored results
    pub result_ttl_secs: u64,
    /// Lock duration; bounds staleness from a crashed worker, so handler
    /// timeouts must stay below this
    pub lock_ttl_secs: u64,
    /// Retention for dead-letter entries
    pub dead_letter_ttl_secs: u64,
    /// Key namespace
    pub keys: KeySpace,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            pool_size: 50,
            connect_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            result_ttl_secs: 300,
            lock_ttl_secs: 300,
            dead_letter_ttl_secs: 7 * 24 * 3600,
            keys: KeySpace::default(),
        }
    }
}

/// Snapshot of the client's in-process counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueMetrics {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeout: AtomicU64,
}

/// Client for the priority task queue
///
/// Explicitly constructed and passed to callers and workers; there is no
/// process-wide singleton. All coordination goes through the injected
/// [`Store`].
pub struct TaskQueueClient {
    store: Arc<dyn Store>,
    config: QueueConfig,
    connected: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl TaskQueueClient {
    /// Create a client over an injected store backend
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            connected: AtomicBool::new(false),
            health_task: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Verify store liveness and start the background health check.
    /// Idempotent; a second call on a connected client is a no-op.
    pub async fn connect(&self) -> QueueResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        tokio::time::timeout(self.config.connect_timeout, self.store.ping())
            .await
            .map_err(|_| QueueError::connection("ping timed out"))?
            .map_err(|e| QueueError::connection(e.to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        info!("Task queue connected to store at {}", self.config.url);

        let mut guard = self.health_task.lock().await;
        if guard.is_none() {
            *guard = Some(spawn_health_check(
                self.store.clone(),
                self.config.health_check_interval,
                self.config.connect_timeout,
            ));
        }
        Ok(())
    }

    /// Stop the health check; subsequent operations reconnect on demand
    pub async fn close(&self) {
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Task queue client closed");
    }

    async fn ensure_connected(&self) -> QueueResult<()> {
        self.connect().await
    }

    /// Enqueue a task and return its id
    pub async fn enqueue(
        &self,
        task_type: &str,
        data: Value,
        priority: TaskPriority,
        timeout_secs: u64,
    ) -> QueueResult<String> {
        self.enqueue_scored(task_type, data, priority.score(), timeout_secs)
            .await
    }

    /// Enqueue with a raw priority score; higher pops first
    pub async fn enqueue_scored(
        &self,
        task_type: &str,
        data: Value,
        priority: i64,
        timeout_secs: u64,
    ) -> QueueResult<String> {
        self.ensure_connected().await?;

        let mut task = Task::new(task_type, data, priority, timeout_secs);
        task.status = TaskStatus::Queued;

        self.save_task(&task).await?;
        self.store
            .zadd(
                &self.config.keys.queue_key(task_type),
                &task.task_id,
                priority,
            )
            .await?;

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        info!(
            "Enqueued task {} (type={}, priority={})",
            task.task_id, task_type, priority
        );
        Ok(task.task_id)
    }

    /// Persist task metadata with TTL equal to the task's timeout
    pub async fn save_task(&self, task: &Task) -> QueueResult<()> {
        let json = serde_json::to_string(task)?;
        self.store
            .set_ex(
                &self.config.keys.task_key(&task.task_id),
                &json,
                task.timeout_secs,
            )
            .await
    }

    /// Fetch live task metadata, `None` once its TTL has purged it
    pub async fn fetch_task(&self, task_id: &str) -> QueueResult<Option<Task>> {
        match self.store.get(&self.config.keys.task_key(task_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Pop the highest-priority unclaimed entry for a task type
    pub async fn pop_highest(&self, task_type: &str) -> QueueResult<Option<(String, i64)>> {
        self.ensure_connected().await?;
        let popped = self
            .store
            .zpopmax(&self.config.keys.queue_key(task_type))
            .await?;
        Ok(popped.map(|(task_id, score)| (task_id, score as i64)))
    }

    /// Attempt to claim the per-task lock; `false` when another worker
    /// already holds it
    pub async fn acquire_lock(&self, task_id: &str, holder: &str) -> QueueResult<bool> {
        self.ensure_connected().await?;
        self.store
            .set_nx_ex(
                &self.config.keys.lock_key(task_id),
                holder,
                self.config.lock_ttl_secs,
            )
            .await
    }

    /// Release a previously acquired lock
    pub async fn release_lock(&self, task_id: &str) -> QueueResult<()> {
        self.store.delete(&self.config.keys.lock_key(task_id)).await
    }

    /// Store a task outcome, then notify subscribers. The publish happens
    /// strictly after the durable write so a subscriber that re-fetches
    /// never races it.
    pub async fn store_result(&self, outcome: &TaskOutcome) -> QueueResult<()> {
        self.store_result_with_ttl(outcome, self.config.result_ttl_secs)
            .await
    }

    /// Store a task outcome with an explicit retention TTL
    pub async fn store_result_with_ttl(
        &self,
        outcome: &TaskOutcome,
        ttl_secs: u64,
    ) -> QueueResult<()> {
        self.ensure_connected().await?;

        let json = serde_json::to_string(outcome)?;
        self.store
            .set_ex(
                &self.config.keys.result_key(&outcome.task_id),
                &json,
                ttl_secs,
            )
            .await?;

        let notification = serde_json::to_string(&ResultNotification {
            task_id: outcome.task_id.clone(),
            status: outcome.status,
        })?;
        self.store
            .publish(&self.config.keys.result_channel, &notification)
            .await?;

        match outcome.status {
            crate::task::OutcomeStatus::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed)
            }
            crate::task::OutcomeStatus::Timeout => {
                self.counters.timeout.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };

        debug!(
            "Stored result for {} (status={:?})",
            outcome.task_id, outcome.status
        );
        Ok(())
    }

    async fn fetch_result(&self, task_id: &str) -> QueueResult<Option<TaskOutcome>> {
        match self.store.get(&self.config.keys.result_key(task_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Poll for a result every `poll_interval` until found or `wait`
    /// elapses. Degrades to a structured payload on timeout or store
    /// failure; never returns an error.
    pub async fn get_result(&self, task_id: &str, wait: Duration) -> TaskOutcome {
        if let Err(e) = self.ensure_connected().await {
            return degraded_outcome(task_id, &e);
        }

        let deadline = Instant::now() + wait;
        loop {
            match self.fetch_result(task_id).await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {}
                Err(e) => return degraded_outcome(task_id, &e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.counters.timeout.fetch_add(1, Ordering::Relaxed);
                return TaskOutcome::timed_out(task_id);
            }
            tokio::time::sleep(remaining.min(self.config.poll_interval)).await;
        }
    }

    /// Wait for a result on the shared notification channel. Checks for an
    /// already-stored result after subscribing (the completed-before-
    /// subscribe race), then waits for a notification with a matching
    /// task id. The subscription is torn down on every exit path.
    pub async fn get_result_pubsub(&self, task_id: &str, wait: Duration) -> TaskOutcome {
        if let Err(e) = self.ensure_connected().await {
            return degraded_outcome(task_id, &e);
        }

        let mut sub = match self.store.subscribe(&self.config.keys.result_channel).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Subscribe failed, falling back to polling: {}", e);
                return self.get_result(task_id, wait).await;
            }
        };

        let outcome = self.await_notification(sub.as_mut(), task_id, wait).await;
        if let Err(e) = sub.unsubscribe().await {
            warn!("Failed to close result subscription: {}", e);
        }
        outcome
    }

    async fn await_notification(
        &self,
        sub: &mut dyn Subscription,
        task_id: &str,
        wait: Duration,
    ) -> TaskOutcome {
        match self.fetch_result(task_id).await {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(e) => return degraded_outcome(task_id, &e),
        }

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match sub.next_message(remaining).await {
                Ok(Some(payload)) => {
                    let notification: ResultNotification = match serde_json::from_str(&payload) {
                        Ok(n) => n,
                        Err(e) => {
                            warn!("Ignoring malformed result notification: {}", e);
                            continue;
                        }
                    };
                    if notification.task_id != task_id {
                        continue;
                    }
                    match self.fetch_result(task_id).await {
                        Ok(Some(outcome)) => return outcome,
                        // Notified but not readable yet; keep waiting
                        Ok(None) => continue,
                        Err(e) => return degraded_outcome(task_id, &e),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Result subscription failed, falling back to polling: {}", e);
                    return self.get_result(task_id, remaining).await;
                }
            }
        }

        self.counters.timeout.fetch_add(1, Ordering::Relaxed);
        TaskOutcome::timed_out(task_id)
    }

    /// Report a task's status: live metadata first, then the result key
    /// (covers tasks whose metadata TTL has already purged), else not found
    pub async fn get_task_status(&self, task_id: &str) -> TaskLookup {
        if let Err(e) = self.ensure_connected().await {
            return TaskLookup::Unreachable(e.to_string());
        }

        match self.fetch_task(task_id).await {
            Ok(Some(task)) => return TaskLookup::Active(task),
            Ok(None) => {}
            Err(e) => return TaskLookup::Unreachable(e.to_string()),
        }
        match self.fetch_result(task_id).await {
            Ok(Some(outcome)) => TaskLookup::Finished(outcome),
            Ok(None) => TaskLookup::NotFound,
            Err(e) => TaskLookup::Unreachable(e.to_string()),
        }
    }

    /// Record an unrecoverable failure for offline inspection
    pub async fn store_dead_letter(
        &self,
        task: &Task,
        error: &str,
        worker_host: &str,
    ) -> QueueResult<()> {
        let entry = DeadLetterEntry {
            task_id: task.task_id.clone(),
            task: task.clone(),
            error: error.to_string(),
            worker_host: worker_host.to_string(),
            failed_at: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&entry)?;
        self.store
            .set_ex(
                &self.config.keys.dead_letter_key(&task.task_id),
                &json,
                self.config.dead_letter_ttl_secs,
            )
            .await?;
        error!(
            "Dead-lettered task {} from {}: {}",
            task.task_id, worker_host, error
        );
        Ok(())
    }

    /// Fetch a dead-letter entry, if one was recorded
    pub async fn get_dead_letter(&self, task_id: &str) -> QueueResult<Option<DeadLetterEntry>> {
        match self
            .store
            .get(&self.config.keys.dead_letter_key(task_id))
            .await?
        {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Number of unclaimed tasks for a type; for caller-side backpressure
    /// and monitoring, not enforced internally
    pub async fn get_queue_length(&self, task_type: &str) -> QueueResult<u64> {
        self.ensure_connected().await?;
        self.store
            .zcard(&self.config.keys.queue_key(task_type))
            .await
    }

    /// Snapshot the in-process counters
    pub fn get_metrics(&self) -> QueueMetrics {
        QueueMetrics {
            queued: self.counters.queued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timeout: self.counters.timeout.load(Ordering::Relaxed),
        }
    }
}

fn degraded_outcome(task_id: &str, error: &QueueError) -> TaskOutcome {
    TaskOutcome::failed(task_id, &error.to_string(), "connection_error")
}

fn spawn_health_check(
    store: Arc<dyn Store>,
    interval: Duration,
    ping_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let healthy = matches!(
                tokio::time::timeout(ping_timeout, store.ping()).await,
                Ok(Ok(()))
            );
            if healthy {
                debug!("Store health check ok");
                continue;
            }

            warn!("Store health check failed, attempting reconnect");
            match store.reconnect().await {
                Ok(()) => info!("Store reconnected"),
                Err(e) => warn!("Store reconnect failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::OutcomeStatus;
    use serde_json::json;

    fn client_with_store() -> (Arc<MemoryStore>, TaskQueueClient) {
        let store = Arc::new(MemoryStore::new());
        let client = TaskQueueClient::new(store.clone(), QueueConfig::default());
        (store, client)
    }

    #[tokio::test]
    async fn status_right_after_enqueue_is_queued() {
        let (_store, client) = client_with_store();
        let task_id = client
            .enqueue("echo", json!({"x": 1}), TaskPriority::Normal, 60)
            .await
            .unwrap();

        match client.get_task_status(&task_id).await {
            TaskLookup::Active(task) => assert_eq!(task.status, TaskStatus::Queued),
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pop_returns_highest_priority_entry() {
        let (_store, client) = client_with_store();
        let low = client
            .enqueue("gen", json!({}), TaskPriority::Low, 60)
            .await
            .unwrap();
        let critical = client
            .enqueue("gen", json!({}), TaskPriority::Critical, 60)
            .await
            .unwrap();

        let (first, score) = client.pop_highest("gen").await.unwrap().unwrap();
        assert_eq!(first, critical);
        assert_eq!(score, TaskPriority::Critical.score());
        let (second, _) = client.pop_highest("gen").await.unwrap().unwrap();
        assert_eq!(second, low);
        assert!(client.pop_highest("gen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let (_store, client) = client_with_store();
        assert!(client.acquire_lock("T1", "host-a").await.unwrap());
        assert!(!client.acquire_lock("T1", "host-b").await.unwrap());

        client.release_lock("T1").await.unwrap();
        assert!(client.acquire_lock("T1", "host-b").await.unwrap());
    }

    #[tokio::test]
    async fn stored_result_is_returned_by_both_retrieval_modes() {
        let (_store, client) = client_with_store();
        let stored = TaskOutcome::completed("echo:1.000001", json!({"x": 1}));

        // Subscribe-mode waiter started before the result lands
        let client = Arc::new(client);
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .get_result_pubsub("echo:1.000001", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.store_result(&stored).await.unwrap();

        let via_pubsub = waiter.await.unwrap();
        let via_poll = client
            .get_result("echo:1.000001", Duration::from_secs(1))
            .await;
        assert_eq!(via_pubsub, stored);
        assert_eq!(via_poll, stored);
    }

    #[tokio::test]
    async fn pubsub_pre_check_covers_already_completed_tasks() {
        let (_store, client) = client_with_store();
        let stored = TaskOutcome::completed("t:1.0", json!(42));
        client.store_result(&stored).await.unwrap();

        let fetched = client.get_result_pubsub("t:1.0", Duration::from_secs(1)).await;
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn zero_wait_yields_timeout_status_not_error() {
        let (_store, client) = client_with_store();
        client.connect().await.unwrap();

        let polled = client.get_result("missing:1.0", Duration::ZERO).await;
        assert_eq!(polled.status, OutcomeStatus::Timeout);

        let subscribed = client
            .get_result_pubsub("missing:1.0", Duration::ZERO)
            .await;
        assert_eq!(subscribed.status, OutcomeStatus::Timeout);
    }

    #[tokio::test]
    async fn status_survives_metadata_expiry_via_result_key() {
        let (_store, client) = client_with_store();
        // No metadata was ever written; only the result exists
        client
            .store_result(&TaskOutcome::completed("t:2.0", json!(null)))
            .await
            .unwrap();

        match client.get_task_status("t:2.0").await {
            TaskLookup::Finished(outcome) => {
                assert_eq!(outcome.status, OutcomeStatus::Completed)
            }
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_id_reports_not_found() {
        let (_store, client) = client_with_store();
        client.connect().await.unwrap();
        assert!(matches!(
            client.get_task_status("ghost:0.0").await,
            TaskLookup::NotFound
        ));
    }

    #[tokio::test]
    async fn mutating_calls_raise_when_store_is_down() {
        let (store, client) = client_with_store();
        store.go_offline();

        let err = client
            .enqueue("echo", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Connection { .. }));
    }

    #[tokio::test]
    async fn reads_degrade_to_structured_payloads_when_store_is_down() {
        let (store, client) = client_with_store();
        store.go_offline();

        let outcome = client.get_result("t:1.0", Duration::from_millis(10)).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error_type.as_deref(), Some("connection_error"));

        assert!(matches!(
            client.get_task_status("t:1.0").await,
            TaskLookup::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn health_check_reconnects_within_one_interval() {
        let store = Arc::new(MemoryStore::new());
        let config = QueueConfig {
            health_check_interval: Duration::from_millis(20),
            ..QueueConfig::default()
        };
        let client = TaskQueueClient::new(store.clone(), config);
        client.connect().await.unwrap();

        store.go_offline();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.reconnect_count() >= 1);

        // Enqueues succeed again with no manual intervention
        client
            .enqueue("echo", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn metrics_track_lifecycle_counts() {
        let (_store, client) = client_with_store();
        client
            .enqueue("echo", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        client
            .store_result(&TaskOutcome::completed("a:1.0", json!(1)))
            .await
            .unwrap();
        client
            .store_result(&TaskOutcome::failed("b:1.0", "boom", "handler_error"))
            .await
            .unwrap();
        client.get_result("missing:1.0", Duration::ZERO).await;

        let metrics = client.get_metrics();
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.timeout, 1);
    }

    #[tokio::test]
    async fn queue_length_reflects_unclaimed_entries() {
        let (_store, client) = client_with_store();
        assert_eq!(client.get_queue_length("gen").await.unwrap(), 0);
        client
            .enqueue("gen", json!({}), TaskPriority::Normal, 60)
            .await
            .unwrap();
        client
            .enqueue("gen", json!({}), TaskPriority::High, 60)
            .await
            .unwrap();
        assert_eq!(client.get_queue_length("gen").await.unwrap(), 2);

        client.pop_highest("gen").await.unwrap();
        assert_eq!(client.get_queue_length("gen").await.unwrap(), 1);
    }
}
