//! Backing store abstraction
//!
//! The queue only needs a small slice of Redis semantics: string get/set
//! with TTL, sorted-set add/pop-max/cardinality, pub/sub channels, and
//! atomic set-if-not-exists for locking. [`Store`] captures exactly that
//! slice so the client and worker can run against the real Redis backend
//! or the in-memory fake in tests.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::QueueResult;

/// Minimal key/value + sorted-set + pub/sub surface the queue relies on
#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> QueueResult<()>;

    /// Re-establish connectivity after a failed ping; used by the
    /// client's health-check loop, never by callers directly
    async fn reconnect(&self) -> QueueResult<()>;

    /// Set a string key with a TTL in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> QueueResult<()>;

    /// Get a string key
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    /// Delete a key
    async fn delete(&self, key: &str) -> QueueResult<()>;

    /// Atomic set-if-not-exists with TTL; returns true if the key was set
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> QueueResult<bool>;

    /// Add a member to a sorted set, replacing its score if present
    async fn zadd(&self, key: &str, member: &str, score: i64) -> QueueResult<()>;

    /// Pop the highest-scored member, if any
    async fn zpopmax(&self, key: &str) -> QueueResult<Option<(String, f64)>>;

    /// Sorted-set cardinality
    async fn zcard(&self, key: &str) -> QueueResult<u64>;

    /// Fire-and-forget broadcast on a channel
    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()>;

    /// Open a subscription on a channel
    async fn subscribe(&self, channel: &str) -> QueueResult<Box<dyn Subscription>>;
}

/// Live subscription on a pub/sub channel
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `wait` for the next message; `None` on timeout
    async fn next_message(&mut self, wait: Duration) -> QueueResult<Option<String>>;

    /// Tear down the subscription; must be called on every exit path
    async fn unsubscribe(&mut self) -> QueueResult<()>;
}
