//! In-process policy cache backed by DashMap and broadcast channels

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::{MessageStream, PolicyCache};
use crate::error::{AuthzError, Result};

/// Buffered messages per topic before slow subscribers start lagging
const TOPIC_CAPACITY: usize = 1024;

/// Stored value with optional expiry
#[derive(Debug, Clone)]
struct CachedEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// Single-process policy cache
///
/// Suitable for one gateway instance and for tests. Clones share the same
/// storage and topics, so several gateways built from clones of one cache
/// behave like instances attached to one shared store.
#[derive(Clone)]
pub struct InMemoryPolicyCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    leader: Arc<AtomicBool>,
    available: Arc<AtomicBool>,
}

impl InMemoryPolicyCache {
    /// Create an empty cache that considers itself leader
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            topics: Arc::new(DashMap::new()),
            leader: Arc::new(AtomicBool::new(true)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Override the leadership answer
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Simulate an outage: every operation fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AuthzError::cache("policy cache unavailable"))
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }
}

impl Default for InMemoryPolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyCache for InMemoryPolicyCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.live_value(key))
    }

    async fn get_and_refresh(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.check_available()?;
        let Some(value) = self.live_value(key) else {
            return Ok(None);
        };
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), CachedEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut written = false;
        self.entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.is_expired() {
                    *entry = CachedEntry::new(value.to_string(), Some(ttl));
                    written = true;
                }
            })
            .or_insert_with(|| {
                written = true;
                CachedEntry::new(value.to_string(), Some(ttl))
            });
        Ok(written)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        self.check_available()?;
        // no subscribers is not an error
        let _ = self.sender(topic).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        self.check_available()?;
        let topic_name = topic.to_string();
        let receiver = self.sender(topic).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |message| {
            let topic_name = topic_name.clone();
            async move {
                match message {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn is_leader(&self) -> Result<bool> {
        self.check_available()?;
        Ok(self.leader.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_del() {
        let cache = InMemoryPolicyCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = InMemoryPolicyCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_and_refresh_extends_ttl() {
        let cache = InMemoryPolicyCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(40)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        let value = cache
            .get_and_refresh("k", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let cache = InMemoryPolicyCache::new();
        let ttl = Duration::from_secs(10);
        assert!(cache.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(!cache.set_if_absent("k", "2", ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let cache = InMemoryPolicyCache::new();
        cache.set("p:a:1", "x", None).await.unwrap();
        cache.set("p:a:2", "x", None).await.unwrap();
        cache.set("p:b:1", "x", None).await.unwrap();

        let keys = cache.scan_prefix("p:a:").await.unwrap();
        assert_eq!(keys, vec!["p:a:1".to_string(), "p:a:2".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let cache = InMemoryPolicyCache::new();
        let mut stream = cache.subscribe("topic").await.unwrap();

        cache.publish("topic", "hello").await.unwrap();
        cache.publish("other", "ignored").await.unwrap();

        assert_eq!(stream.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unavailable_cache_errors() {
        let cache = InMemoryPolicyCache::new();
        cache.set_available(false);
        assert!(matches!(cache.get("k").await, Err(AuthzError::Cache(_))));
        assert!(cache.publish("t", "m").await.is_err());

        cache.set_available(true);
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_leadership_override() {
        let cache = InMemoryPolicyCache::new();
        assert!(cache.is_leader().await.unwrap());
        cache.set_leader(false);
        assert!(!cache.is_leader().await.unwrap());
    }
}
