//! Administrative policy mutations
//!
//! Adds and removals are read-modify-write on one entry's subject list.
//! Concurrent writers to the same key race and the last write wins; a lost
//! update is possible and accepted. Every mutation publishes a `resource`
//! exchange event so gateways reload exactly the affected snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{PolicyEntry, PolicyKey};
use crate::cache::PolicyCache;
use crate::config::PolicyConfig;
use crate::error::{AuthzError, Result};
use crate::exchange::{ExchangeChannel, ExchangeData};
use crate::group::GroupNodeCodec;
use crate::types::{ActionKind, AuthResult, ResourceKind, SubjectKind, SubjectOperator};
use crate::uri::ResourceUri;

/// Grant or deny a subject on a resource action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPolicyRequest {
    pub resource_kind: ResourceKind,
    pub resource_uri: String,
    pub action: ActionKind,
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub operator: SubjectOperator,
    pub decision: AuthResult,
    #[serde(default)]
    pub exclusive: bool,
    /// Entry disappears at this instant; permanent when absent
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Withdraw a subject from a resource action entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePolicyRequest {
    pub resource_kind: ResourceKind,
    pub resource_uri: String,
    pub action: ActionKind,
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub operator: SubjectOperator,
}

/// Writes policy entries through the shared cache
pub struct PolicyAdmin {
    cache: Arc<dyn PolicyCache>,
    config: PolicyConfig,
    codec: GroupNodeCodec,
    exchange: ExchangeChannel,
}

impl PolicyAdmin {
    pub fn new(cache: Arc<dyn PolicyCache>, config: PolicyConfig, exchange: ExchangeChannel) -> Result<Self> {
        let codec = GroupNodeCodec::new(config.group_node_length)?;
        Ok(Self {
            cache,
            config,
            codec,
            exchange,
        })
    }

    fn validate_subject(&self, kind: SubjectKind, operator: SubjectOperator, subject_id: &str) -> Result<()> {
        if !operator.applies_to(kind) {
            return Err(AuthzError::bad_request(format!(
                "Operator {} is only valid for subject kind {}",
                operator,
                SubjectKind::GroupNode
            )));
        }
        if subject_id.trim().is_empty() {
            return Err(AuthzError::bad_request("Subject id must not be empty"));
        }
        if kind == SubjectKind::GroupNode && !self.codec.is_valid(subject_id) {
            return Err(AuthzError::bad_request(format!(
                "Group node code {} is not a whole number of {}-character segments",
                subject_id,
                self.codec.segment_len()
            )));
        }
        Ok(())
    }

    async fn read_entry(&self, key: &str) -> Result<Option<PolicyEntry>> {
        match self.cache.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn notify(&self, uri: &ResourceUri, action: Option<ActionKind>) -> Result<()> {
        self.exchange
            .publish(&ExchangeData::resource_changed(uri, action))
            .await
    }

    /// Add a subject id to the entry named by the request
    ///
    /// The entry takes the request's decision, exclusivity and expiry.
    pub async fn add_policy(&self, request: &AddPolicyRequest) -> Result<PolicyKey> {
        let subject_id = request.subject_id.trim();
        self.validate_subject(request.subject_kind, request.operator, subject_id)?;
        let now = Utc::now();
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(AuthzError::bad_request("Policy expiry must be in the future"));
            }
        }

        let uri = ResourceUri::parse_with_kind(request.resource_kind, &request.resource_uri)?;
        let policy_key = PolicyKey::new(
            request.resource_kind,
            uri.cache_form(),
            request.action,
            request.operator,
            request.subject_kind,
        );
        let key = policy_key.to_cache_key(&self.config.policy_key_prefix);

        let mut entry = self
            .read_entry(&key)
            .await?
            .filter(|entry| !entry.is_expired(now))
            .unwrap_or_else(|| PolicyEntry::new(request.decision, request.exclusive));
        entry.decision = request.decision;
        entry.exclusive = request.exclusive;
        entry.expires_at = request.expires_at;
        entry.add_subject(subject_id);

        let value = serde_json::to_string(&entry)?;
        self.cache.set(&key, &value, entry.remaining_ttl(now)).await?;
        info!(
            policy = %policy_key,
            subject_id = %subject_id,
            decision = %entry.decision,
            exclusive = entry.exclusive,
            "Policy added"
        );

        self.notify(&uri, Some(request.action)).await?;
        Ok(policy_key)
    }

    /// Remove a subject id; returns whether it was listed
    ///
    /// The entry is deleted once its last subject is gone.
    pub async fn remove_policy(&self, request: &RemovePolicyRequest) -> Result<bool> {
        let subject_id = request.subject_id.trim();
        self.validate_subject(request.subject_kind, request.operator, subject_id)?;

        let uri = ResourceUri::parse_with_kind(request.resource_kind, &request.resource_uri)?;
        let policy_key = PolicyKey::new(
            request.resource_kind,
            uri.cache_form(),
            request.action,
            request.operator,
            request.subject_kind,
        );
        let key = policy_key.to_cache_key(&self.config.policy_key_prefix);

        let Some(mut entry) = self.read_entry(&key).await? else {
            debug!(policy = %policy_key, "No entry to remove from");
            return Ok(false);
        };
        let removed = entry.remove_subject(subject_id);

        let now = Utc::now();
        if entry.is_empty() || entry.is_expired(now) {
            self.cache.del(&key).await?;
        } else if removed {
            let value = serde_json::to_string(&entry)?;
            self.cache.set(&key, &value, entry.remaining_ttl(now)).await?;
        }
        info!(policy = %policy_key, subject_id = %subject_id, removed, "Policy removed");

        self.notify(&uri, Some(request.action)).await?;
        Ok(removed)
    }

    /// Delete every entry of a resource and of the resources beneath it
    ///
    /// Returns the number of keys deleted.
    pub async fn remove_all_policies(&self, kind: ResourceKind, resource_uri: &str) -> Result<usize> {
        let uri = ResourceUri::parse_with_kind(kind, resource_uri)?;
        let form = uri.cache_form();
        let key_prefix = &self.config.policy_key_prefix;
        let prefix = PolicyKey::resource_prefix(key_prefix, kind, &form);

        // `svc/a` must not take `svc/ab` with it, nor `db` take `db:5432/x`
        let beneath = [format!("{}/", form), format!("{}?", form)];
        let keys: Vec<(String, PolicyKey)> = self
            .cache
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                let parsed = PolicyKey::parse(key_prefix, &key)?;
                let covered = parsed.kind == kind
                    && (parsed.uri == form || beneath.iter().any(|p| parsed.uri.starts_with(p.as_str())));
                covered.then_some((key, parsed))
            })
            .collect();

        let mut affected: BTreeSet<(String, ActionKind)> = BTreeSet::new();
        for (key, parsed) in &keys {
            self.cache.del(key).await?;
            affected.insert((parsed.uri.clone(), parsed.action));
        }
        info!(kind = %kind, uri = %uri, deleted = keys.len(), "All policies removed");

        for (level, action) in affected {
            let level_uri = ResourceUri::parse_with_kind(kind, &level)?;
            self.notify(&level_uri, Some(action)).await?;
        }
        Ok(keys.len())
    }
}
