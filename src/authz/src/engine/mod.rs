//! Gateway orchestration
//!
//! Wires the identity resolver, policy evaluator, policy admin and exchange
//! processor around one shared policy cache and runs the per-request check.
//!
//! ```text
//! request → IdentityResolver → SubjectSets → PolicyEvaluator → GatewayDecision
//!                 ↓                                 ↑
//!          [policy cache] ── exchange topic ── ExchangeProcessor
//! ```

pub mod decision;
pub mod metrics;

pub use decision::{DecisionReason, GatewayDecision};
pub use metrics::{GatewayMetrics, MetricsCollector};

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::PolicyCache;
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, Result};
use crate::exchange::{ExchangeChannel, ExchangeProcessor};
use crate::identity::{AppCredentialRegistry, AppMetadataSource, CredentialRequest, IdentityResolver};
use crate::policy::{PolicyAdmin, PolicyEvaluator};
use crate::types::ActionKind;
use crate::uri::ResourceUri;

/// One gateway instance
///
/// Each instance owns its components; instances share state only through
/// the policy cache they are built on.
pub struct Gateway {
    config: GatewayConfig,
    cache: Arc<dyn PolicyCache>,
    apps: Arc<AppCredentialRegistry>,
    resolver: IdentityResolver,
    evaluator: Arc<PolicyEvaluator>,
    admin: PolicyAdmin,
    exchange: ExchangeChannel,
    metrics: Arc<MetricsCollector>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, cache: Arc<dyn PolicyCache>) -> Result<Self> {
        config.validate()?;

        let apps = Arc::new(AppCredentialRegistry::new(cache.clone(), config.security.clone()));
        let resolver = IdentityResolver::new(cache.clone(), apps.clone(), config.security.clone());
        let evaluator = Arc::new(PolicyEvaluator::new(cache.clone(), config.policy.clone())?);
        let exchange = ExchangeChannel::new(cache.clone(), config.policy.exchange_topic.clone());
        let admin = PolicyAdmin::new(cache.clone(), config.policy.clone(), exchange.clone())?;

        Ok(Self {
            config,
            cache,
            apps,
            resolver,
            evaluator,
            admin,
            exchange,
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn PolicyCache> {
        &self.cache
    }

    pub fn apps(&self) -> &Arc<AppCredentialRegistry> {
        &self.apps
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn evaluator(&self) -> &Arc<PolicyEvaluator> {
        &self.evaluator
    }

    pub fn admin(&self) -> &PolicyAdmin {
        &self.admin
    }

    pub fn exchange(&self) -> &ExchangeChannel {
        &self.exchange
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Resolve the caller and decide whether it may perform `action` on
    /// `resource_uri`
    ///
    /// Identity failures and cache faults are errors; a policy rejection is
    /// a decision with result REJECT.
    pub async fn check(
        &self,
        request: &CredentialRequest,
        resource_uri: &str,
        action: ActionKind,
    ) -> Result<GatewayDecision> {
        let start = Instant::now();
        match self.run_check(request, resource_uri, action).await {
            Ok(mut decision) => {
                let elapsed = start.elapsed();
                decision.latency_us = elapsed.as_micros() as u64;
                self.metrics.record_decision(decision.is_allowed()).await;
                self.metrics.record_latency(elapsed).await;
                self.metrics
                    .record_snapshot_stats(self.evaluator.snapshot_stats())
                    .await;
                Ok(decision)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal => error!(uri = %resource_uri, error = %e, "Gateway check failed"),
                    _ => warn!(uri = %resource_uri, error = %e, "Gateway check refused"),
                }
                self.metrics.record_failure(e.kind()).await;
                Err(e)
            }
        }
    }

    async fn run_check(
        &self,
        request: &CredentialRequest,
        resource_uri: &str,
        action: ActionKind,
    ) -> Result<GatewayDecision> {
        let uri = ResourceUri::parse(resource_uri)?;
        let identity = self.resolver.resolve(request).await?;
        let evaluation = self
            .evaluator
            .evaluate(&uri, action, &identity.subject_sets())
            .await?;

        debug!(
            uri = %uri,
            action = %action,
            tenant_id = %identity.tenant_id,
            app_id = %identity.app_id,
            result = %evaluation.result,
            "Gateway check complete"
        );
        Ok(GatewayDecision::new(&identity, uri.to_string(), action, &evaluation))
    }

    /// Exchange processor bound to this gateway's components
    pub fn processor(&self, source: Option<Arc<dyn AppMetadataSource>>) -> Arc<ExchangeProcessor> {
        Arc::new(ExchangeProcessor::new(
            self.exchange.clone(),
            self.evaluator.clone(),
            self.apps.clone(),
            source,
        ))
    }

    /// Warm up app credentials (leader only) and start the exchange processor
    pub async fn start(&self, source: Option<Arc<dyn AppMetadataSource>>) -> Result<JoinHandle<()>> {
        if let Some(source) = &source {
            let written = self.apps.warm_up(source.as_ref()).await?;
            info!(access_keys = written, "App credential warm-up finished");
        }
        self.processor(source).start().await
    }
}
