//! # Tollgate Authorization Engine
//!
//! Identity resolution and policy evaluation for a multi-tenant access
//! gateway.
//!
//! ## Features
//!
//! - **Three credential paths**: session token, AK/SK HMAC-SHA1 signature, app id
//! - **Cache-resident policies** keyed by resource URI, action, operator and subject kind
//! - **Wildcard scopes**: a `/**` policy covers a path and everything under it
//! - **Hierarchical group nodes** matched by code prefix
//! - **Open by default**: resources without policies are accepted
//! - **Pub/sub synchronization** of policy and app changes across instances
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate_authz::{
//!     ActionKind, AddPolicyRequest, AuthResult, CredentialRequest, Gateway, GatewayConfig,
//!     InMemoryPolicyCache, ResourceKind, SubjectKind, SubjectOperator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::new(GatewayConfig::default(), Arc::new(InMemoryPolicyCache::new()))?;
//!
//!     gateway
//!         .admin()
//!         .add_policy(&AddPolicyRequest {
//!             resource_kind: ResourceKind::Http,
//!             resource_uri: "http://orders/api/**".to_string(),
//!             action: ActionKind::Create,
//!             subject_kind: SubjectKind::Role,
//!             subject_id: "clerk".to_string(),
//!             operator: SubjectOperator::Eq,
//!             decision: AuthResult::Accept,
//!             exclusive: false,
//!             expires_at: None,
//!         })
//!         .await?;
//!
//!     let request = CredentialRequest::new("POST", "/exec");
//!     let decision = gateway
//!         .check(&request, "http://orders/api/items", ActionKind::Create)
//!         .await?;
//!
//!     // anonymous callers hold no role
//!     assert!(!decision.is_allowed());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod group;
pub mod identity;
pub mod policy;
pub mod types;
pub mod uri;

// Re-export commonly used types
pub use cache::{InMemoryPolicyCache, PolicyCache};
#[cfg(feature = "redis")]
pub use cache::RedisPolicyCache;
pub use config::GatewayConfig;
pub use engine::{DecisionReason, Gateway, GatewayDecision, MetricsCollector};
pub use error::{AuthzError, ErrorKind, Result};
pub use exchange::{ExchangeChannel, ExchangeData, ExchangeProcessor};
pub use identity::{AppCredentialRegistry, AppMetadataSource, CredentialRequest, IdentityResolver};
pub use policy::{AddPolicyRequest, PolicyAdmin, PolicyEntry, PolicyEvaluator, PolicyKey, RemovePolicyRequest};
pub use types::{
    ActionKind, AuthResult, IdentityContext, OwnerId, ResourceKind, SubjectKind, SubjectOperator, SubjectSets,
};
pub use uri::ResourceUri;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
