//! Redis-backed policy cache shared by every gateway instance

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use super::{MessageStream, PolicyCache};
use crate::config::CacheConfig;
use crate::error::{AuthzError, Result};

impl From<RedisError> for AuthzError {
    fn from(err: RedisError) -> Self {
        AuthzError::Cache(err.to_string())
    }
}

/// Policy cache over a Redis connection manager
///
/// Key/value commands share one multiplexed connection; each subscription
/// opens a dedicated pub/sub connection. Leadership is a `SET NX` lease on
/// the configured leader key holding this instance's id.
#[derive(Clone)]
pub struct RedisPolicyCache {
    client: Client,
    conn: ConnectionManager,
    instance_id: String,
    leader_key: String,
    leader_ttl: Duration,
}

impl RedisPolicyCache {
    /// Connect using the `cache` configuration section
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| AuthzError::Config("cache.redis_url is not set".to_string()))?;
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let instance_id = uuid::Uuid::new_v4().to_string();

        info!(instance_id = %instance_id, "Connected to Redis policy cache");

        Ok(Self {
            client,
            conn,
            instance_id,
            leader_key: config.leader_key.clone(),
            leader_ttl: Duration::from_secs(config.leader_ttl_secs.max(1)),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Escape glob metacharacters so a prefix matches literally in SCAN
fn escape_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// Extend the leader lease only while this instance still holds it
const RENEW_LEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl PolicyCache for RedisPolicyCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn get_and_refresh(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GETEX")
            .arg(key)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(key, value, ttl_millis(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter: ::redis::AsyncIter<String> = conn.scan_match(escape_pattern(prefix)).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(topic, message).await?;
        debug!(topic = %topic, "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!(topic = %topic, "Subscribed to policy cache topic");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }

    async fn is_leader(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ttl = ttl_millis(self.leader_ttl);

        let acquired: Option<String> = ::redis::cmd("SET")
            .arg(&self.leader_key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;
        if acquired.is_some() {
            info!(instance_id = %self.instance_id, "Acquired gateway leadership");
            return Ok(true);
        }

        let renewed: i64 = ::redis::Script::new(RENEW_LEASE_SCRIPT)
            .key(&self.leader_key)
            .arg(&self.instance_id)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }
}
