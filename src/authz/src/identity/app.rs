//! App signing records and the registry that serves them
//!
//! Records live in the policy cache, written by the leader on startup and
//! by the exchange processor on app change events. Each gateway memoizes the
//! records it reads; exchange events invalidate the memo.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::PolicyCache;
use crate::config::SecurityConfig;
use crate::error::Result;
use crate::types::OwnerId;

/// Cached `app id -> (tenant, key pair)` mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSigningRecord {
    pub tenant_id: OwnerId,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub private_key: String,
}

/// Cached `access key -> (secret, tenant, app)` mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyRecord {
    pub secret_key: String,
    pub tenant_id: OwnerId,
    pub app_id: OwnerId,
}

/// One access key of an app as held by the system of record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyCredential {
    pub access_key: String,
    pub secret_key: String,
    /// The key stops being accepted after this instant
    pub valid_until: Option<DateTime<Utc>>,
}

/// App state as held by the system of record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub app_id: OwnerId,
    pub tenant_id: OwnerId,
    pub public_key: String,
    pub private_key: String,
    pub enabled: bool,
    pub access_keys: Vec<AccessKeyCredential>,
}

/// System of record for app credentials
#[async_trait]
pub trait AppMetadataSource: Send + Sync {
    /// Every enabled app with its credentials
    async fn enabled_apps(&self) -> Result<Vec<AppCredentials>>;

    /// A single app, `None` when it no longer exists
    async fn app(&self, app_id: OwnerId) -> Result<Option<AppCredentials>>;
}

/// Locally memoized record
#[derive(Debug, Clone)]
struct MemoEntry<T> {
    value: T,
    cached_at: Instant,
}

/// App signing record access with a local memo
pub struct AppCredentialRegistry {
    cache: Arc<dyn PolicyCache>,
    security: SecurityConfig,
    apps: DashMap<OwnerId, MemoEntry<AppSigningRecord>>,
    access_keys: DashMap<String, MemoEntry<AccessKeyRecord>>,
}

impl AppCredentialRegistry {
    pub fn new(cache: Arc<dyn PolicyCache>, security: SecurityConfig) -> Self {
        Self {
            cache,
            security,
            apps: DashMap::new(),
            access_keys: DashMap::new(),
        }
    }

    fn app_key(&self, app_id: OwnerId) -> String {
        format!("{}{}", self.security.app_info_key_prefix, app_id)
    }

    fn access_key_key(&self, access_key: &str) -> String {
        format!("{}{}", self.security.access_key_prefix, access_key)
    }

    fn is_fresh<T>(&self, entry: &MemoEntry<T>) -> bool {
        entry.cached_at.elapsed() < self.security.app_info_ttl()
    }

    /// Signing record of an app, `None` when the app is unknown
    pub async fn app_record(&self, app_id: OwnerId) -> Result<Option<AppSigningRecord>> {
        if let Some(entry) = self.apps.get(&app_id) {
            if self.is_fresh(&entry) {
                return Ok(Some(entry.value.clone()));
            }
        }

        let Some(raw) = self.cache.get(&self.app_key(app_id)).await? else {
            self.apps.remove(&app_id);
            return Ok(None);
        };
        let record: AppSigningRecord = serde_json::from_str(&raw)?;
        self.apps.insert(
            app_id,
            MemoEntry {
                value: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some(record))
    }

    /// Secret and owner of an access key, `None` when the key is unknown
    pub async fn access_key(&self, access_key: &str) -> Result<Option<AccessKeyRecord>> {
        if let Some(entry) = self.access_keys.get(access_key) {
            if self.is_fresh(&entry) {
                return Ok(Some(entry.value.clone()));
            }
        }

        let Some(raw) = self.cache.get(&self.access_key_key(access_key)).await? else {
            self.access_keys.remove(access_key);
            return Ok(None);
        };
        let record: AccessKeyRecord = serde_json::from_str(&raw)?;
        self.access_keys.insert(
            access_key.to_string(),
            MemoEntry {
                value: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some(record))
    }

    /// Write an app record to the shared cache
    pub async fn put_app(&self, app_id: OwnerId, record: &AppSigningRecord, ttl: Option<Duration>) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.cache.set(&self.app_key(app_id), &value, ttl).await?;
        self.apps.remove(&app_id);
        Ok(())
    }

    /// Write an access key record to the shared cache
    pub async fn put_access_key(&self, access_key: &str, record: &AccessKeyRecord, ttl: Option<Duration>) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.cache.set(&self.access_key_key(access_key), &value, ttl).await?;
        self.access_keys.remove(access_key);
        Ok(())
    }

    /// Drop an app and its access keys from the shared cache
    pub async fn remove_app(&self, app_id: OwnerId, access_keys: &[String]) -> Result<()> {
        self.cache.del(&self.app_key(app_id)).await?;
        for access_key in access_keys {
            self.cache.del(&self.access_key_key(access_key)).await?;
            self.access_keys.remove(access_key);
        }
        self.invalidate_app(app_id);
        Ok(())
    }

    /// Forget the local memo of an app and every access key it owns
    pub fn invalidate_app(&self, app_id: OwnerId) {
        self.apps.remove(&app_id);
        self.access_keys.retain(|_, entry| entry.value.app_id != app_id);
        debug!(app_id = %app_id, "Invalidated app credentials");
    }

    /// Forget the local memo of one access key
    pub fn invalidate_access_key(&self, access_key: &str) {
        self.access_keys.remove(access_key);
    }

    /// Write one app's current credentials, or remove them if it is disabled
    pub async fn store(&self, app: &AppCredentials) -> Result<usize> {
        if !app.enabled {
            let keys: Vec<String> = app.access_keys.iter().map(|k| k.access_key.clone()).collect();
            self.remove_app(app.app_id, &keys).await?;
            return Ok(0);
        }

        let record = AppSigningRecord {
            tenant_id: app.tenant_id,
            public_key: app.public_key.clone(),
            private_key: app.private_key.clone(),
        };
        self.put_app(app.app_id, &record, None).await?;

        let now = Utc::now();
        let mut written = 0;
        for credential in &app.access_keys {
            let ttl = match credential.valid_until {
                Some(until) if until <= now => {
                    self.cache.del(&self.access_key_key(&credential.access_key)).await?;
                    self.access_keys.remove(&credential.access_key);
                    continue;
                }
                Some(until) => (until - now).to_std().ok(),
                None => None,
            };
            let record = AccessKeyRecord {
                secret_key: credential.secret_key.clone(),
                tenant_id: app.tenant_id,
                app_id: app.app_id,
            };
            self.put_access_key(&credential.access_key, &record, ttl).await?;
            written += 1;
        }
        self.invalidate_app(app.app_id);
        Ok(written)
    }

    /// Populate the shared cache from the system of record
    ///
    /// Only the leader writes; other instances return `Ok(0)` immediately.
    /// Returns the number of access keys written.
    pub async fn warm_up(&self, source: &dyn AppMetadataSource) -> Result<usize> {
        if !self.cache.is_leader().await? {
            debug!("Not the leader, skipping app credential warm-up");
            return Ok(0);
        }

        let apps = source.enabled_apps().await?;
        let mut written = 0;
        for app in &apps {
            match self.store(app).await {
                Ok(count) => written += count,
                Err(e) => {
                    warn!(app_id = %app.app_id, error = %e, "Failed to cache app credentials");
                    return Err(e);
                }
            }
        }

        info!(apps = apps.len(), access_keys = written, "App credentials warmed up");
        Ok(written)
    }
}
