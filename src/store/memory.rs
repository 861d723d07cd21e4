//! In-memory fake store with Redis-equivalent semantics
//!
//! Used by the unit tests and handy for local development without a Redis
//! instance. TTLs are enforced lazily on read, pub/sub rides on tokio
//! broadcast channels, and an `offline` switch simulates an unreachable
//! store for exercising the health-check/reconnect path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::error::{QueueError, QueueResult};
use crate::store::{Store, Subscription};

#[derive(Default)]
struct State {
    strings: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, Vec<(String, i64)>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// In-process [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    offline: AtomicBool,
    reconnects: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a connection error until
    /// [`Store::reconnect`] is called
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    /// Number of reconnect attempts observed
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> QueueResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(QueueError::connection("memory store is offline"))
        } else {
            Ok(())
        }
    }

    fn live_string(state: &mut State, key: &str) -> Option<String> {
        match state.strings.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                state.strings.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> QueueResult<()> {
        self.check_online()
    }

    async fn reconnect(&self) -> QueueResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.offline.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> QueueResult<()> {
        self.check_online()?;
        let expiry = Instant::now() + Duration::from_secs(ttl_secs);
        let mut state = self.state.lock().expect("store lock poisoned");
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expiry)));
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        self.check_online()?;
        let mut state = self.state.lock().expect("store lock poisoned");
        Ok(Self::live_string(&mut state, key))
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        self.check_online()?;
        let mut state = self.state.lock().expect("store lock poisoned");
        state.strings.remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().expect("store lock poisoned");
        if Self::live_string(&mut state, key).is_some() {
            return Ok(false);
        }
        let expiry = Instant::now() + Duration::from_secs(ttl_secs);
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expiry)));
        Ok(true)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> QueueResult<()> {
        self.check_online()?;
        let mut state = self.state.lock().expect("store lock poisoned");
        let set = state.zsets.entry(key.to_string()).or_default();
        if let Some(entry) = set.iter_mut().find(|(m, _)| m == member) {
            entry.1 = score;
        } else {
            set.push((member.to_string(), score));
        }
        Ok(())
    }

    async fn zpopmax(&self, key: &str) -> QueueResult<Option<(String, f64)>> {
        self.check_online()?;
        let mut state = self.state.lock().expect("store lock poisoned");
        let Some(set) = state.zsets.get_mut(key) else {
            return Ok(None);
        };
        // Ties break on the member string, matching Redis ordering
        let top = set
            .iter()
            .enumerate()
            .max_by(|(_, (ma, sa)), (_, (mb, sb))| sa.cmp(sb).then_with(|| ma.cmp(mb)))
            .map(|(idx, _)| idx);
        Ok(top.map(|idx| {
            let (member, score) = set.remove(idx);
            (member, score as f64)
        }))
    }

    async fn zcard(&self, key: &str) -> QueueResult<u64> {
        self.check_online()?;
        let state = self.state.lock().expect("store lock poisoned");
        Ok(state.zsets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
        self.check_online()?;
        let state = self.state.lock().expect("store lock poisoned");
        if let Some(sender) = state.channels.get(channel) {
            // No subscribers is not an error, same as Redis PUBLISH
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<Box<dyn Subscription>> {
        self.check_online()?;
        let mut state = self.state.lock().expect("store lock poisoned");
        let sender = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(Box::new(MemorySubscription {
            receiver: Some(sender.subscribe()),
        }))
    }
}

struct MemorySubscription {
    receiver: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, wait: Duration) -> QueueResult<Option<String>> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(QueueError::connection("subscription already closed"));
        };
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Ok(payload)) => return Ok(Some(payload)),
                // Missed messages under lag; keep draining until the deadline
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(QueueError::connection("channel closed"))
                }
                Err(_) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&mut self) -> QueueResult<()> {
        self.receiver = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zpopmax_returns_highest_score_first() {
        let store = MemoryStore::new();
        store.zadd("q", "low", 5).await.unwrap();
        store.zadd("q", "critical", 20).await.unwrap();
        store.zadd("q", "normal", 10).await.unwrap();

        let (member, score) = store.zpopmax("q").await.unwrap().unwrap();
        assert_eq!(member, "critical");
        assert_eq!(score, 20.0);
        let (member, _) = store.zpopmax("q").await.unwrap().unwrap();
        assert_eq!(member, "normal");
        assert_eq!(store.zcard("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_nx_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", "host-a", 300).await.unwrap());
        assert!(!store.set_nx_ex("lock", "host-b", 300).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("host-a"));

        store.delete("lock").await.unwrap();
        assert!(store.set_nx_ex("lock", "host-b", 300).await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 0).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_store_fails_until_reconnect() {
        let store = MemoryStore::new();
        store.go_offline();
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.is_err());

        store.reconnect().await.unwrap();
        assert!(store.ping().await.is_ok());
        assert_eq!(store.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn publish_reaches_open_subscriptions() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("ch").await.unwrap();
        store.publish("ch", "hello").await.unwrap();
        let msg = sub
            .next_message(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, "hello");
        sub.unsubscribe().await.unwrap();
    }
}
