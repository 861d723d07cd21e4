//! Redis implementation of the backing store

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{Connection, PubSub};
use redis::Client;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::store::{Store, Subscription};

/// Redis-backed [`Store`]
///
/// Connections are opened per operation from the shared [`Client`], with a
/// semaphore bounding how many are open at once; the permit travels with
/// the connection until it is dropped. Reconnection swaps
/// in a freshly opened client, so in-flight operations on the old one
/// finish or fail on their own.
pub struct RedisStore {
    url: String,
    client: RwLock<Client>,
    permits: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl RedisStore {
    /// Open a store against the given Redis URL with default limits
    /// (50 concurrent connections, 5s connect timeout)
    pub fn open(url: &str) -> QueueResult<Self> {
        Self::open_with_limits(url, 50, Duration::from_secs(5))
    }

    /// Open a store with explicit concurrency and connect-timeout limits
    pub fn open_with_limits(
        url: &str,
        pool_size: usize,
        connect_timeout: Duration,
    ) -> QueueResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            url: url.to_string(),
            client: RwLock::new(client),
            permits: Arc::new(Semaphore::new(pool_size)),
            connect_timeout,
        })
    }

    async fn connection(&self) -> QueueResult<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::connection("connection pool closed"))?;

        let client = self.client.read().await.clone();
        let conn = tokio::time::timeout(self.connect_timeout, client.get_async_connection())
            .await
            .map_err(|_| QueueError::connection(format!("connect to {} timed out", self.url)))?
            .map_err(QueueError::from)?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }
}

/// A live connection bundled with its pool permit. The permit is returned
/// to the pool only when the connection is dropped, so `pool_size` bounds
/// how many connections are open at once, not just how many are being
/// established.
struct PooledConnection {
    conn: Connection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn reconnect(&self) -> QueueResult<()> {
        let fresh = Client::open(self.url.as_str())?;
        *self.client.write().await = fresh;
        self.ping().await?;
        info!("Reconnected to Redis at {}", self.url);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        // SET ... NX EX returns OK when the key was set, nil when not
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn zpopmax(&self, key: &str) -> QueueResult<Option<(String, f64)>> {
        let mut conn = self.connection().await?;
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMAX")
            .arg(key)
            .arg(1)
            .query_async(&mut *conn)
            .await?;
        Ok(popped.into_iter().next())
    }

    async fn zcard(&self, key: &str) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut *conn).await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut *conn)
            .await?;
        debug!("Published on {} to {} subscribers", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<Box<dyn Subscription>> {
        let PooledConnection { conn, _permit } = self.connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
            _permit,
        }))
    }
}

// Holds its pool permit for as long as the subscription connection is open
struct RedisSubscription {
    pubsub: PubSub,
    channel: String,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, wait: Duration) -> QueueResult<Option<String>> {
        let mut stream = self.pubsub.on_message();
        match tokio::time::timeout(wait, stream.next()).await {
            Ok(Some(msg)) => Ok(Some(msg.get_payload()?)),
            // Stream ended: the subscription connection dropped
            Ok(None) => Err(QueueError::connection(format!(
                "subscription on {} closed by the server",
                self.channel
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> QueueResult<()> {
        if let Err(e) = self.pubsub.unsubscribe(&self.channel).await {
            warn!("Unsubscribe from {} failed: {}", self.channel, e);
        }
        Ok(())
    }
}
