//! Shared policy cache access layer
//!
//! The policy cache is the single store every gateway instance reads
//! policies, token identities and app credentials from. It also carries the
//! pub/sub topic used by the exchange channel.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryPolicyCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisPolicyCache;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::Result;

/// Messages delivered on a subscribed topic
pub type MessageStream = BoxStream<'static, String>;

/// Key/value + pub/sub contract of the shared cache
///
/// All operations are asynchronous; a failure means the cache itself is
/// unreachable and surfaces as [`crate::AuthzError::Cache`].
#[async_trait]
pub trait PolicyCache: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read a value and, when present, reset its TTL
    async fn get_and_refresh(&self, key: &str, ttl: Duration) -> Result<Option<String>>;

    /// Write a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key does not exist; returns whether it was written
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove a key (absent keys are not an error)
    async fn del(&self, key: &str) -> Result<()>;

    /// All live keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Publish a message on a topic
    async fn publish(&self, topic: &str, message: &str) -> Result<()>;

    /// Subscribe to a topic; messages published afterwards are delivered
    async fn subscribe(&self, topic: &str) -> Result<MessageStream>;

    /// Whether this instance currently holds cluster leadership
    async fn is_leader(&self) -> Result<bool>;
}
