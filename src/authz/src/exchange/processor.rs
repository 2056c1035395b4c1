//! Applies exchange events to this gateway's local state

use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{ExchangeChannel, ExchangeData, APP_CATEGORY, RESOURCE_CATEGORY};
use crate::error::{AuthzError, Result};
use crate::identity::{AppCredentialRegistry, AppMetadataSource};
use crate::policy::PolicyEvaluator;
use crate::types::{ActionKind, OwnerId};
use crate::uri::ResourceUri;

/// Subscriber that keeps resource snapshots and app credentials current
///
/// A `resource` event reloads the one snapshot it names. An `app` event
/// rewrites that app's records from the system of record when one is
/// attached, and otherwise drops the local memo so the next request reads
/// the shared cache again.
pub struct ExchangeProcessor {
    channel: ExchangeChannel,
    evaluator: Arc<PolicyEvaluator>,
    apps: Arc<AppCredentialRegistry>,
    source: Option<Arc<dyn AppMetadataSource>>,
}

impl ExchangeProcessor {
    pub fn new(
        channel: ExchangeChannel,
        evaluator: Arc<PolicyEvaluator>,
        apps: Arc<AppCredentialRegistry>,
        source: Option<Arc<dyn AppMetadataSource>>,
    ) -> Self {
        Self {
            channel,
            evaluator,
            apps,
            source,
        }
    }

    /// Apply one event
    pub async fn handle(&self, data: &ExchangeData) -> Result<()> {
        match data.subject_category.as_str() {
            RESOURCE_CATEGORY => self.handle_resource(data).await,
            APP_CATEGORY => self.handle_app(data).await,
            other => {
                debug!(category = %other, "Ignoring exchange event");
                Ok(())
            }
        }
    }

    async fn handle_resource(&self, data: &ExchangeData) -> Result<()> {
        let raw = data
            .detail_data
            .resource_uri
            .as_deref()
            .unwrap_or(data.subject_id.as_str());
        let uri = ResourceUri::parse(raw)?;
        self.evaluator
            .refresh_resource(uri.kind(), &uri.cache_form(), data.detail_data.resource_action_kind)
            .await?;
        Ok(())
    }

    async fn handle_app(&self, data: &ExchangeData) -> Result<()> {
        let app_id: OwnerId = data.subject_id.parse()?;
        for access_key in &data.detail_data.access_keys {
            self.apps.invalidate_access_key(access_key);
        }

        match (&self.source, data.action_kind) {
            (_, ActionKind::Delete) => {
                self.apps.remove_app(app_id, &data.detail_data.access_keys).await?;
                info!(app_id = %app_id, "App removed");
            }
            (Some(source), _) => match source.app(app_id).await? {
                Some(app) => {
                    self.apps.store(&app).await?;
                    info!(app_id = %app_id, enabled = app.enabled, "App credentials reloaded");
                }
                None => {
                    self.apps.remove_app(app_id, &data.detail_data.access_keys).await?;
                    info!(app_id = %app_id, "App no longer exists, removed");
                }
            },
            (None, _) => self.apps.invalidate_app(app_id),
        }
        Ok(())
    }

    /// Subscribe and process events on a background task
    ///
    /// The subscription is established before this returns, so events
    /// published afterwards are never missed.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let mut events = self
            .channel
            .subscribe(&[RESOURCE_CATEGORY, APP_CATEGORY])
            .await?;
        info!(topic = %self.channel.topic(), "Exchange processor subscribed");

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = self.handle(&event).await {
                    log_failure(&event, &e);
                }
            }
            info!("Exchange subscription closed");
        }))
    }
}

fn log_failure(event: &ExchangeData, err: &AuthzError) {
    error!(
        category = %event.subject_category,
        subject_id = %event.subject_id,
        error = %err,
        "Failed to apply exchange event"
    );
}
