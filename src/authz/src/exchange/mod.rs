//! Metadata change notifications between gateway instances
//!
//! Messages travel over one pub/sub topic as `<category>#<json>`. The
//! category is checked before the payload is decoded so subscribers skip
//! categories they do not handle without parsing JSON.

pub mod processor;

pub use processor::ExchangeProcessor;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::PolicyCache;
use crate::error::{AuthzError, Result};
use crate::types::ActionKind;
use crate::uri::ResourceUri;

/// Category of resource (policy) changes
pub const RESOURCE_CATEGORY: &str = "resource";
/// Category of app enable/disable/credential changes
pub const APP_CATEGORY: &str = "app";

/// Category-specific details of a change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_action_kind: Option<ActionKind>,
    /// Access keys affected by an app change
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_keys: Vec<String>,
}

/// One change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeData {
    /// What happened to the subject
    pub action_kind: ActionKind,
    pub subject_category: String,
    pub subject_id: String,
    #[serde(default)]
    pub detail_data: ExchangeDetail,
}

impl ExchangeData {
    /// Policies of a resource level changed
    pub fn resource_changed(uri: &ResourceUri, action: Option<ActionKind>) -> Self {
        Self {
            action_kind: ActionKind::Modify,
            subject_category: RESOURCE_CATEGORY.to_string(),
            subject_id: uri.to_string(),
            detail_data: ExchangeDetail {
                resource_uri: Some(uri.to_string()),
                resource_action_kind: action,
                access_keys: Vec::new(),
            },
        }
    }

    /// An app was created, modified or deleted
    pub fn app_changed(action_kind: ActionKind, app_id: impl ToString, access_keys: Vec<String>) -> Self {
        Self {
            action_kind,
            subject_category: APP_CATEGORY.to_string(),
            subject_id: app_id.to_string(),
            detail_data: ExchangeDetail {
                access_keys,
                ..ExchangeDetail::default()
            },
        }
    }

    /// `<category>#<json>`
    pub fn encode(&self) -> Result<String> {
        Ok(format!("{}#{}", self.subject_category, serde_json::to_string(self)?))
    }

    pub fn decode(message: &str) -> Result<Self> {
        let (_, payload) = split_message(message)?;
        Ok(serde_json::from_str(payload)?)
    }
}

/// Split a wire message into category and undecoded payload
pub fn split_message(message: &str) -> Result<(&str, &str)> {
    message
        .split_once('#')
        .filter(|(category, _)| !category.is_empty())
        .ok_or_else(|| AuthzError::bad_request("Exchange message lacks a category"))
}

/// Publish/subscribe access to the exchange topic
#[derive(Clone)]
pub struct ExchangeChannel {
    cache: Arc<dyn PolicyCache>,
    topic: String,
}

impl ExchangeChannel {
    pub fn new(cache: Arc<dyn PolicyCache>, topic: impl Into<String>) -> Self {
        Self {
            cache,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, data: &ExchangeData) -> Result<()> {
        let message = data.encode()?;
        self.cache.publish(&self.topic, &message).await?;
        debug!(
            category = %data.subject_category,
            subject_id = %data.subject_id,
            action = %data.action_kind,
            "Published exchange event"
        );
        Ok(())
    }

    /// Events of the given categories, decoded
    ///
    /// Messages of other categories are dropped undecoded; undecodable
    /// messages are logged and skipped.
    pub async fn subscribe(&self, categories: &[&str]) -> Result<BoxStream<'static, ExchangeData>> {
        let categories: Arc<Vec<String>> = Arc::new(categories.iter().map(|c| c.to_string()).collect());
        let messages = self.cache.subscribe(&self.topic).await?;

        let stream = messages.filter_map(move |message| {
            let categories = categories.clone();
            async move {
                let (category, payload) = match split_message(&message) {
                    Ok(parts) => parts,
                    Err(_) => {
                        warn!(message = %message, "Dropped exchange message without category");
                        return None;
                    }
                };
                if !categories.iter().any(|c| c == category) {
                    return None;
                }
                match serde_json::from_str::<ExchangeData>(payload) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        warn!(category = %category, error = %e, "Dropped undecodable exchange message");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
