//! Gateway configuration
//!
//! Every field has a default so a partial TOML file (or none at all) is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthzError, Result};

/// Environment variable naming the TOML configuration file
pub const CONFIG_ENV: &str = "TOLLGATE_CONFIG";

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub security: SecurityConfig,
    pub policy: PolicyConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

/// Credential headers, identity cache keys and signature tolerances
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub token_header: String,
    pub ak_sk_header: String,
    pub ak_sk_date_header: String,
    pub app_id_header: String,

    /// Key prefix for `token -> IdentityContext`
    pub token_key_prefix: String,
    /// Key prefix for `app id -> AppSigningRecord`
    pub app_info_key_prefix: String,
    /// Key prefix for `access key -> AccessKeyRecord`
    pub access_key_prefix: String,
    /// Key prefix for used signatures
    pub replay_key_prefix: String,

    /// TTL re-applied to a token entry on every successful read
    pub token_cache_expire_secs: u64,
    /// Lifetime of app records memoized locally
    pub app_info_cache_expire_secs: u64,
    /// Allowed age of a signed request
    pub request_date_offset_ms: u64,
    /// Reject a second use of the same signature
    pub replay_protection: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_header: "X-Token".to_string(),
            ak_sk_header: "Authorization".to_string(),
            ak_sk_date_header: "X-Request-Date".to_string(),
            app_id_header: "X-App-Id".to_string(),
            token_key_prefix: "tollgate:auth:token:".to_string(),
            app_info_key_prefix: "tollgate:auth:app:info:".to_string(),
            access_key_prefix: "tollgate:auth:app:ak:".to_string(),
            replay_key_prefix: "tollgate:auth:replay:".to_string(),
            token_cache_expire_secs: 60 * 60 * 24,
            app_info_cache_expire_secs: 60 * 60,
            request_date_offset_ms: 5 * 60 * 1000,
            replay_protection: true,
        }
    }
}

impl SecurityConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_expire_secs)
    }

    pub fn app_info_ttl(&self) -> Duration {
        Duration::from_secs(self.app_info_cache_expire_secs)
    }

    pub fn request_date_offset(&self) -> Duration {
        Duration::from_millis(self.request_date_offset_ms)
    }
}

/// Policy storage and evaluation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub policy_key_prefix: String,
    /// Width of one group-node code segment
    pub group_node_length: usize,
    /// TTL of the evaluator's local resource snapshots
    pub resource_cache_expire_secs: u64,
    /// How many `**` ancestor levels a lookup may climb
    pub max_wildcard_levels: usize,
    /// Pub/sub topic carrying metadata change notifications
    pub exchange_topic: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_key_prefix: "tollgate:auth:policy:".to_string(),
            group_node_length: 5,
            resource_cache_expire_secs: 60,
            max_wildcard_levels: 32,
            exchange_topic: "tollgate:exchange:notify".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn resource_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resource_cache_expire_secs)
    }
}

/// Which shared cache backs the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

/// Shared cache connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
    /// Key holding the current leader's instance id
    pub leader_key: String,
    pub leader_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            leader_key: "tollgate:leader".to_string(),
            leader_ttl_secs: 30,
        }
    }
}

/// HTTP surface settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Query parameter carrying the target resource URI
    pub resource_uri_param: String,
    /// Query parameter carrying the target action
    pub resource_action_param: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            resource_uri_param: "__resource_uri__".to_string(),
            resource_action_param: "__resource_action__".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl GatewayConfig {
    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: GatewayConfig =
            toml::from_str(raw).map_err(|e| AuthzError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Load from the file named by `TOLLGATE_CONFIG`, or use defaults
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.policy.group_node_length == 0 {
            return Err(AuthzError::Config("policy.group_node_length must be > 0".to_string()));
        }
        if self.policy.resource_cache_expire_secs == 0 {
            return Err(AuthzError::Config(
                "policy.resource_cache_expire_secs must be > 0".to_string(),
            ));
        }
        if self.security.token_cache_expire_secs == 0 || self.security.app_info_cache_expire_secs == 0 {
            return Err(AuthzError::Config("security cache expiry must be > 0".to_string()));
        }
        let prefixes = [
            &self.policy.policy_key_prefix,
            &self.security.token_key_prefix,
            &self.security.app_info_key_prefix,
            &self.security.access_key_prefix,
            &self.security.replay_key_prefix,
        ];
        if prefixes.iter().any(|p| p.is_empty()) {
            return Err(AuthzError::Config("cache key prefixes must not be empty".to_string()));
        }
        if self.cache.backend == CacheBackendKind::Redis && self.cache.redis_url.is_none() {
            return Err(AuthzError::Config("cache.redis_url is required for the redis backend".to_string()));
        }
        Ok(())
    }
}
