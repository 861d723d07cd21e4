//! # DevSkyy Task Queue
//!
//! A Redis-backed priority task queue with a polling worker loop, used for
//! long-running background jobs (generation tasks and the like).
//!
//! ## Features
//!
//! - Per-type priority queues (sorted sets, highest score pops first)
//! - Result delivery by polling or pub/sub notification
//! - Best-effort distributed locking per task id
//! - Dead-letter records for failed tasks (7-day retention)
//! - Background health check with transparent reconnect
//! - Pluggable store backend; in-memory fake for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devskyy_task_queue::{
//!     HandlerRegistry, QueueConfig, RedisStore, TaskPriority, TaskQueueClient, Worker,
//!     WorkerConfig,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> devskyy_task_queue::QueueResult<()> {
//! let config = QueueConfig::default();
//! let store = Arc::new(RedisStore::open_with_limits(
//!     &config.url,
//!     config.pool_size,
//!     config.connect_timeout,
//! )?);
//! let client = Arc::new(TaskQueueClient::new(store, config));
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("echo", |data| async move { Ok(data) })?;
//!
//! let task_id = client
//!     .enqueue("echo", json!({"x": 1}), TaskPriority::High, 60)
//!     .await?;
//!
//! let worker = Worker::new(client.clone(), registry, WorkerConfig::default())?;
//! worker.install_signal_handlers();
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The lock is a best-effort TTL key, not a consensus primitive: under a
//! network partition a task can be processed twice. Handlers that need
//! at-most-once effects must be idempotent at the deployment level.

pub mod error;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use error::{QueueError, QueueResult};
pub use queue::{KeySpace, QueueConfig, QueueMetrics, TaskQueueClient};
pub use store::{MemoryStore, RedisStore, Store, Subscription};
pub use task::{
    DeadLetterEntry, OutcomeStatus, ResultNotification, Task, TaskLookup, TaskOutcome,
    TaskPriority, TaskStatus,
};
pub use worker::{
    FnHandler, HandlerError, HandlerRegistry, ShutdownHandle, TaskHandler, Worker, WorkerConfig,
};

/// Version of the task queue library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
