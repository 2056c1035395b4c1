//! Gateway decision types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthzError, Result};
use crate::policy::{Evaluation, EvaluationReason};
use crate::types::{ActionKind, AuthResult, IdentityContext, OwnerId, SubjectKind, SubjectOperator};

/// Outcome of one gateway check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDecision {
    /// Unique decision ID
    pub id: String,

    pub result: AuthResult,

    /// Canonical resource URI that was checked
    pub resource_uri: String,

    pub action: ActionKind,

    pub tenant_id: OwnerId,
    pub app_id: OwnerId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    pub reason: DecisionReason,

    /// Evaluation time in microseconds
    pub latency_us: u64,

    /// Decision timestamp (milliseconds since epoch)
    pub timestamp: i64,
}

impl GatewayDecision {
    pub fn new(
        identity: &IdentityContext,
        resource_uri: String,
        action: ActionKind,
        evaluation: &Evaluation,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            result: evaluation.result,
            resource_uri,
            action,
            tenant_id: identity.tenant_id,
            app_id: identity.app_id,
            account_id: identity.account_id.clone(),
            reason: DecisionReason::from(evaluation),
            latency_us: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.result.is_accept()
    }

    /// `Unauthorized` for a rejected decision
    pub fn ensure_allowed(&self) -> Result<()> {
        if self.is_allowed() {
            Ok(())
        } else {
            Err(AuthzError::unauthorized(format!(
                "Access to {} ({}) rejected",
                self.resource_uri, self.action
            )))
        }
    }
}

/// Reason for a gateway decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DecisionReason {
    /// An entry matched and supplied the decision
    PolicyMatch {
        level: String,
        operator: SubjectOperator,
        subject_kind: SubjectKind,
        exclusive: bool,
    },

    /// Nothing is registered for the resource
    Unprotected,

    /// Entries exist but none matched the caller
    NoMatch { level: Option<String> },

    /// Policy cache failure on a protected resource
    CacheFault,
}

impl From<&Evaluation> for DecisionReason {
    fn from(evaluation: &Evaluation) -> Self {
        if let Some(matched) = &evaluation.matched {
            return DecisionReason::PolicyMatch {
                level: matched.level.clone(),
                operator: matched.operator,
                subject_kind: matched.subject_kind,
                exclusive: matched.exclusive,
            };
        }
        match evaluation.reason {
            EvaluationReason::Unprotected => DecisionReason::Unprotected,
            EvaluationReason::CacheFault => DecisionReason::CacheFault,
            _ => DecisionReason::NoMatch {
                level: evaluation.level.clone(),
            },
        }
    }
}
