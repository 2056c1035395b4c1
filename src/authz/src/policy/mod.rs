//! Policy entries and their cache keys
//!
//! One entry exists per `(resource kind, uri, action, operator, subject kind)`.
//! Its value lists the subject ids the entry covers together with the
//! decision it yields and whether a match ends evaluation.

pub mod admin;
pub mod evaluator;

pub use admin::{AddPolicyRequest, PolicyAdmin, RemovePolicyRequest};
pub use evaluator::{Evaluation, EvaluationReason, MatchedPolicy, PolicyEvaluator, SnapshotStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::{ActionKind, AuthResult, ResourceKind, SubjectKind, SubjectOperator};

/// Stored value of a policy key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    /// Subject ids in insertion order
    pub subject_ids: Vec<String>,
    pub decision: AuthResult,
    #[serde(default)]
    pub exclusive: bool,
    /// Absolute expiry mirrored from the cache TTL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PolicyEntry {
    pub fn new(decision: AuthResult, exclusive: bool) -> Self {
        Self {
            subject_ids: Vec::new(),
            decision,
            exclusive,
            expires_at: None,
        }
    }

    /// Append a subject id; returns false if it was already listed
    pub fn add_subject(&mut self, subject_id: &str) -> bool {
        if self.contains(subject_id) {
            return false;
        }
        self.subject_ids.push(subject_id.to_string());
        true
    }

    /// Remove a subject id; returns false if it was not listed
    pub fn remove_subject(&mut self, subject_id: &str) -> bool {
        let before = self.subject_ids.len();
        self.subject_ids.retain(|id| id != subject_id);
        self.subject_ids.len() != before
    }

    pub fn contains(&self, subject_id: &str) -> bool {
        self.subject_ids.iter().any(|id| id == subject_id)
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// TTL to write the entry back with, `None` for a permanent entry
    ///
    /// Callers check [`PolicyEntry::is_expired`] first.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let at = self.expires_at?;
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Dimensions of a policy cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub kind: ResourceKind,
    /// Resource URI in cache form (`host/path`, no scheme)
    pub uri: String,
    pub action: ActionKind,
    pub operator: SubjectOperator,
    pub subject_kind: SubjectKind,
}

impl PolicyKey {
    pub fn new(
        kind: ResourceKind,
        uri: impl Into<String>,
        action: ActionKind,
        operator: SubjectOperator,
        subject_kind: SubjectKind,
    ) -> Self {
        Self {
            kind,
            uri: uri.into(),
            action,
            operator,
            subject_kind,
        }
    }

    /// `{prefix}{kind}:{uri}:{action}:{OPERATOR}:{SUBJECT_KIND}`
    pub fn to_cache_key(&self, prefix: &str) -> String {
        format!(
            "{}{}:{}:{}:{}:{}",
            prefix, self.kind, self.uri, self.action, self.operator, self.subject_kind
        )
    }

    /// Prefix shared by every key of a resource (all actions, all subjects)
    pub fn resource_prefix(prefix: &str, kind: ResourceKind, uri: &str) -> String {
        format!("{}{}:{}", prefix, kind, uri)
    }

    /// Recover the dimensions from a cache key
    ///
    /// Splits the trailing fields from the right so URIs containing `:`
    /// (host ports) survive.
    pub fn parse(prefix: &str, key: &str) -> Option<Self> {
        let rest = key.strip_prefix(prefix)?;
        let (kind, rest) = rest.split_once(':')?;
        let mut fields = rest.rsplitn(4, ':');
        let subject_kind = fields.next()?.parse().ok()?;
        let operator = fields.next()?.parse().ok()?;
        let action = fields.next()?.parse().ok()?;
        let uri = fields.next()?;
        if uri.is_empty() {
            return None;
        }
        Some(Self {
            kind: kind.parse().ok()?,
            uri: uri.to_string(),
            action,
            operator,
            subject_kind,
        })
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}:{}:{}",
            self.kind, self.uri, self.action, self.operator, self.subject_kind
        )
    }
}
