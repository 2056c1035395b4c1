//! Caller identity resolution
//!
//! Exactly one credential path runs per request, chosen by which headers are
//! present: session token, then AK/SK signature, then app id. A request with
//! none of them resolves to an anonymous identity carrying sentinel ids.

pub mod app;
pub mod signature;

pub use app::{
    AccessKeyCredential, AccessKeyRecord, AppCredentialRegistry, AppCredentials, AppMetadataSource,
    AppSigningRecord,
};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::PolicyCache;
use crate::config::SecurityConfig;
use crate::error::{AuthzError, Result};
use crate::types::{IdentityContext, IdentitySource, OwnerId};

/// The parts of an inbound request identity resolution looks at
#[derive(Debug, Clone, Default)]
pub struct CredentialRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    headers: HashMap<String, String>,
}

impl CredentialRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.is_empty() { None } else { Some(query) };
        self
    }

    /// Header names are case-insensitive
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn insert_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    /// Trimmed header value, `None` when absent or blank
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// Resolves an [`IdentityContext`] from request credentials
///
/// Only reads the policy cache, apart from the replay guard written after a
/// signature verifies.
pub struct IdentityResolver {
    cache: Arc<dyn PolicyCache>,
    apps: Arc<AppCredentialRegistry>,
    security: SecurityConfig,
}

impl IdentityResolver {
    pub fn new(cache: Arc<dyn PolicyCache>, apps: Arc<AppCredentialRegistry>, security: SecurityConfig) -> Self {
        Self { cache, apps, security }
    }

    pub fn apps(&self) -> &Arc<AppCredentialRegistry> {
        &self.apps
    }

    /// Resolve the caller identity
    pub async fn resolve(&self, request: &CredentialRequest) -> Result<IdentityContext> {
        self.resolve_at(request, Utc::now()).await
    }

    /// Resolve against an explicit clock
    pub async fn resolve_at(&self, request: &CredentialRequest, now: DateTime<Utc>) -> Result<IdentityContext> {
        if let Some(token) = request.header(&self.security.token_header) {
            return self.resolve_token(token).await;
        }
        if let Some(authorization) = request.header(&self.security.ak_sk_header) {
            return self.resolve_signature(request, authorization, now).await;
        }
        if let Some(app_id) = request.header(&self.security.app_id_header) {
            return self.resolve_app(app_id).await;
        }
        debug!("No credential headers, resolving anonymous identity");
        Ok(IdentityContext::anonymous())
    }

    async fn resolve_token(&self, token: &str) -> Result<IdentityContext> {
        let key = format!("{}{}", self.security.token_key_prefix, token);
        let Some(raw) = self.cache.get_and_refresh(&key, self.security.token_ttl()).await? else {
            warn!("Rejected request with unknown token");
            return Err(AuthzError::unauthorized("Invalid token"));
        };

        let mut identity: IdentityContext = serde_json::from_str(&raw)?;
        identity.token = Some(token.to_string());
        identity.source = IdentitySource::Token;
        debug!(tenant_id = %identity.tenant_id, app_id = %identity.app_id, "Resolved token identity");
        Ok(identity)
    }

    async fn resolve_signature(
        &self,
        request: &CredentialRequest,
        authorization: &str,
        now: DateTime<Utc>,
    ) -> Result<IdentityContext> {
        let (access_key, supplied) = signature::parse_authorization(authorization)?;
        let raw_date = request.header(&self.security.ak_sk_date_header).ok_or_else(|| {
            AuthzError::bad_request(format!(
                "Missing {} header for a signed request",
                self.security.ak_sk_date_header
            ))
        })?;
        let date = signature::parse_request_date(raw_date)?;
        let remaining = signature::remaining_validity(date, now, self.security.request_date_offset())
            .map_err(|e| {
                warn!(access_key = %access_key, "Rejected signed request with expired date");
                e
            })?;

        let Some(record) = self.apps.access_key(access_key).await? else {
            warn!(access_key = %access_key, "Rejected signed request with unknown access key");
            return Err(AuthzError::unauthorized("Access key not found"));
        };

        let canonical =
            signature::canonical_string(&request.method, raw_date, &request.path, request.query.as_deref());
        if !signature::verify(&record.secret_key, &canonical, supplied) {
            warn!(access_key = %access_key, "Rejected request with invalid signature");
            return Err(AuthzError::unauthorized("Invalid signature"));
        }

        if self.security.replay_protection {
            let guard_key = format!(
                "{}{}:{}",
                self.security.replay_key_prefix,
                access_key,
                supplied.to_ascii_lowercase()
            );
            let ttl = remaining.max(std::time::Duration::from_millis(1));
            if !self.cache.set_if_absent(&guard_key, "1", ttl).await? {
                warn!(access_key = %access_key, "Rejected replayed signed request");
                return Err(AuthzError::unauthorized("Replayed request"));
            }
        }

        debug!(tenant_id = %record.tenant_id, app_id = %record.app_id, "Resolved signed identity");
        Ok(IdentityContext::for_app(record.tenant_id, record.app_id, IdentitySource::Signature))
    }

    async fn resolve_app(&self, raw_app_id: &str) -> Result<IdentityContext> {
        let app_id: OwnerId = raw_app_id.parse()?;
        let Some(record) = self.apps.app_record(app_id).await? else {
            warn!(app_id = %app_id, "Rejected request with unknown app id");
            return Err(AuthzError::unauthorized("Invalid app id"));
        };
        Ok(IdentityContext::for_app(record.tenant_id, app_id, IdentitySource::App))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryPolicyCache;
    use std::time::Duration;

    fn resolver(cache: &InMemoryPolicyCache) -> IdentityResolver {
        let cache: Arc<dyn PolicyCache> = Arc::new(cache.clone());
        let apps = Arc::new(AppCredentialRegistry::new(cache.clone(), SecurityConfig::default()));
        IdentityResolver::new(cache, apps, SecurityConfig::default())
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = CredentialRequest::new("GET", "/exec")
            .with_header("x-token", " abc ")
            .with_header("X-App-Id", "  ");
        assert_eq!(request.header("X-Token"), Some("abc"));
        assert_eq!(request.header("x-app-id"), None);
    }

    #[tokio::test]
    async fn test_anonymous_without_headers() {
        let cache = InMemoryPolicyCache::new();
        let identity = resolver(&cache)
            .resolve(&CredentialRequest::new("GET", "/exec"))
            .await
            .unwrap();
        assert!(identity.tenant_id.is_undefined());
        assert!(identity.app_id.is_undefined());
        assert_eq!(identity.source, IdentitySource::Anonymous);
    }

    #[tokio::test]
    async fn test_token_takes_precedence() {
        let cache = InMemoryPolicyCache::new();
        cache
            .set("tollgate:auth:token:t1", r#"{"tenantId":1,"appId":2,"roles":["r01"]}"#, None)
            .await
            .unwrap();

        let request = CredentialRequest::new("GET", "/exec")
            .with_header("X-Token", "t1")
            .with_header("Authorization", "garbage");
        let identity = resolver(&cache).resolve(&request).await.unwrap();
        assert_eq!(identity.token.as_deref(), Some("t1"));
        assert_eq!(identity.roles, vec!["r01".to_string()]);
        assert_eq!(identity.source, IdentitySource::Token);
    }

    #[tokio::test]
    async fn test_token_ttl_slides_on_read_then_lapses() {
        let cache = InMemoryPolicyCache::new();
        let security = SecurityConfig {
            token_cache_expire_secs: 1,
            ..SecurityConfig::default()
        };
        let shared: Arc<dyn PolicyCache> = Arc::new(cache.clone());
        let apps = Arc::new(AppCredentialRegistry::new(shared.clone(), security.clone()));
        let resolver = IdentityResolver::new(shared, apps, security);
        cache
            .set(
                "tollgate:auth:token:t1",
                r#"{"tenantId":1,"appId":2}"#,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let request = CredentialRequest::new("GET", "/exec").with_header("X-Token", "t1");

        tokio::time::sleep(Duration::from_millis(600)).await;
        resolver.resolve(&request).await.unwrap();

        // past the original expiry, alive only through the read above
        tokio::time::sleep(Duration::from_millis(600)).await;
        let identity = resolver.resolve(&request).await.unwrap();
        assert_eq!(identity.source, IdentitySource::Token);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        let err = resolver.resolve(&request).await.unwrap_err();
        assert!(matches!(err, AuthzError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_malformed_authorization_is_bad_request() {
        let cache = InMemoryPolicyCache::new();
        let request = CredentialRequest::new("GET", "/exec").with_header("Authorization", "no-separator");
        let err = resolver(&cache).resolve(&request).await.unwrap_err();
        assert!(matches!(err, AuthzError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_date_is_bad_request() {
        let cache = InMemoryPolicyCache::new();
        let request = CredentialRequest::new("GET", "/exec").with_header("Authorization", "ak:sig");
        let err = resolver(&cache).resolve(&request).await.unwrap_err();
        assert!(matches!(err, AuthzError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_app_id_path() {
        let cache = InMemoryPolicyCache::new();
        cache
            .set("tollgate:auth:app:info:5", r#"{"tenantId":9}"#, None)
            .await
            .unwrap();
        let resolver = resolver(&cache);

        let request = CredentialRequest::new("GET", "/exec").with_header("X-App-Id", "5");
        let identity = resolver.resolve(&request).await.unwrap();
        assert_eq!(identity.tenant_id, OwnerId(9));
        assert_eq!(identity.app_id, OwnerId(5));

        let unknown = CredentialRequest::new("GET", "/exec").with_header("X-App-Id", "6");
        assert!(matches!(resolver.resolve(&unknown).await, Err(AuthzError::Unauthorized(_))));

        let malformed = CredentialRequest::new("GET", "/exec").with_header("X-App-Id", "abc");
        assert!(matches!(resolver.resolve(&malformed).await, Err(AuthzError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_cache_outage_is_internal() {
        let cache = InMemoryPolicyCache::new();
        cache.set_available(false);
        let request = CredentialRequest::new("GET", "/exec").with_header("X-Token", "t1");
        let err = resolver(&cache).resolve(&request).await.unwrap_err();
        assert!(err.is_internal());
    }
}
