//! Core gateway types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{AuthzError, Result};

/// Tenant or application identifier
///
/// Never null: an identity that carries no tenant/app holds
/// [`OwnerId::UNDEFINED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl OwnerId {
    /// Sentinel for "no tenant / no app"
    pub const UNDEFINED: OwnerId = OwnerId(-1);

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(OwnerId)
            .map_err(|_| AuthzError::bad_request(format!("Invalid numeric id: {}", s)))
    }
}

/// Which credential path produced an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentitySource {
    /// Session token
    Token,
    /// AK/SK signed request
    Signature,
    /// App id header only
    App,
    /// No identifying header
    #[default]
    Anonymous,
}

/// Caller identity resolved per request, never persisted by the gateway
///
/// Token identities are stored JSON-encoded in the policy cache by the
/// identity service; `token` and `source` are attached by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    #[serde(default)]
    pub tenant_id: OwnerId,

    #[serde(default)]
    pub app_id: OwnerId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub group_nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip)]
    pub source: IdentitySource,
}

impl IdentityContext {
    /// Identity with sentinel tenant/app, for pre-authentication operations
    pub fn anonymous() -> Self {
        Self {
            tenant_id: OwnerId::UNDEFINED,
            app_id: OwnerId::UNDEFINED,
            account_id: None,
            roles: Vec::new(),
            group_nodes: Vec::new(),
            token: None,
            source: IdentitySource::Anonymous,
        }
    }

    /// App-level identity (signature or app-id path)
    pub fn for_app(tenant_id: OwnerId, app_id: OwnerId, source: IdentitySource) -> Self {
        Self {
            tenant_id,
            app_id,
            source,
            ..Self::anonymous()
        }
    }

    /// Subject ids this identity holds, in evaluation precedence order
    pub fn subject_sets(&self) -> SubjectSets {
        let mut sets = SubjectSets::new();
        sets.extend(SubjectKind::Role, self.roles.iter().cloned());
        sets.extend(SubjectKind::GroupNode, self.group_nodes.iter().cloned());
        if let Some(account) = &self.account_id {
            sets.insert(SubjectKind::Account, account.clone());
        }
        if !self.tenant_id.is_undefined() {
            sets.insert(SubjectKind::Tenant, self.tenant_id.to_string());
        }
        if !self.app_id.is_undefined() {
            sets.insert(SubjectKind::App, self.app_id.to_string());
        }
        sets
    }
}

/// Backend category named by a resource URI's scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Http,
    Reldb,
    Cache,
    Mq,
    Object,
    Menu,
    Element,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Http,
        ResourceKind::Reldb,
        ResourceKind::Cache,
        ResourceKind::Mq,
        ResourceKind::Object,
        ResourceKind::Menu,
        ResourceKind::Element,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Http => "http",
            ResourceKind::Reldb => "reldb",
            ResourceKind::Cache => "cache",
            ResourceKind::Mq => "mq",
            ResourceKind::Object => "object",
            ResourceKind::Menu => "menu",
            ResourceKind::Element => "element",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        // https shares the http policy space
        let code = s.trim().to_ascii_lowercase();
        let code = if code == "https" { "http".to_string() } else { code };
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == code)
            .ok_or_else(|| AuthzError::bad_request(format!("Resource kind {{{}}} does not exist", s)))
    }
}

/// Operation performed on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Fetch,
    Create,
    Modify,
    Patch,
    Delete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Fetch,
        ActionKind::Create,
        ActionKind::Modify,
        ActionKind::Patch,
        ActionKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Fetch => "fetch",
            ActionKind::Create => "create",
            ActionKind::Modify => "modify",
            ActionKind::Patch => "patch",
            ActionKind::Delete => "delete",
        }
    }

    /// Map an HTTP method onto the action it performs
    pub fn from_http_method(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" | "HEAD" => Some(ActionKind::Fetch),
            "POST" => Some(ActionKind::Create),
            "PUT" => Some(ActionKind::Modify),
            "PATCH" => Some(ActionKind::Patch),
            "DELETE" => Some(ActionKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        let code = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(code))
            .ok_or_else(|| AuthzError::bad_request(format!("Action kind {{{}}} does not exist", s)))
    }
}

/// Category of principal a policy can reference
///
/// Declaration order is the evaluation precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectKind {
    Role,
    GroupNode,
    Account,
    Tenant,
    App,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 5] = [
        SubjectKind::Role,
        SubjectKind::GroupNode,
        SubjectKind::Account,
        SubjectKind::Tenant,
        SubjectKind::App,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Role => "ROLE",
            SubjectKind::GroupNode => "GROUP_NODE",
            SubjectKind::Account => "ACCOUNT",
            SubjectKind::Tenant => "TENANT",
            SubjectKind::App => "APP",
        }
    }

    /// Operators that may be configured for this kind, in evaluation order
    pub fn operators(&self) -> &'static [SubjectOperator] {
        match self {
            SubjectKind::GroupNode => &[
                SubjectOperator::Eq,
                SubjectOperator::Neq,
                SubjectOperator::Include,
                SubjectOperator::Like,
            ],
            _ => &[SubjectOperator::Eq, SubjectOperator::Neq],
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        let code = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(code))
            .ok_or_else(|| AuthzError::bad_request(format!("Subject kind {{{}}} does not exist", s)))
    }
}

/// Comparison applied between a policy's subject ids and the caller's ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubjectOperator {
    /// Caller holds one of the listed ids
    Eq,
    /// Caller holds ids of the kind, none of them listed
    Neq,
    /// Group nodes only: caller node is under the listed node
    Include,
    /// Group nodes only: caller node matches the listed node as a code prefix
    Like,
}

impl SubjectOperator {
    pub const ALL: [SubjectOperator; 4] = [
        SubjectOperator::Eq,
        SubjectOperator::Neq,
        SubjectOperator::Include,
        SubjectOperator::Like,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectOperator::Eq => "EQ",
            SubjectOperator::Neq => "NEQ",
            SubjectOperator::Include => "INCLUDE",
            SubjectOperator::Like => "LIKE",
        }
    }

    /// Whether this operator may be used with the given subject kind
    pub fn applies_to(&self, kind: SubjectKind) -> bool {
        kind.operators().contains(self)
    }
}

impl fmt::Display for SubjectOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectOperator {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        let code = s.trim();
        Self::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(code))
            .ok_or_else(|| {
                AuthzError::bad_request(format!("Auth subject operator kind {{{}}} does not exist", s))
            })
    }
}

/// Accept/reject outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthResult {
    Accept,
    Reject,
}

impl AuthResult {
    pub fn is_accept(&self) -> bool {
        matches!(self, AuthResult::Accept)
    }
}

impl fmt::Display for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthResult::Accept => f.write_str("ACCEPT"),
            AuthResult::Reject => f.write_str("REJECT"),
        }
    }
}

/// Ordered mapping from subject kind to the ids a caller holds
///
/// Iteration follows [`SubjectKind`] precedence regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectSets {
    sets: BTreeMap<SubjectKind, Vec<String>>,
}

impl SubjectSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, kind: SubjectKind, id: impl Into<String>) -> Self {
        self.insert(kind, id);
        self
    }

    pub fn insert(&mut self, kind: SubjectKind, id: impl Into<String>) {
        let ids = self.sets.entry(kind).or_default();
        let id = id.into();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, kind: SubjectKind, ids: I) {
        for id in ids {
            self.insert(kind, id);
        }
    }

    /// Ids held for a kind (empty when none)
    pub fn get(&self, kind: SubjectKind) -> &[String] {
        self.sets.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(Vec::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubjectKind, &[String])> {
        self.sets.iter().map(|(kind, ids)| (*kind, ids.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_json_round_trip() {
        let identity = IdentityContext {
            tenant_id: OwnerId(10),
            app_id: OwnerId(20),
            account_id: Some("a01".to_string()),
            roles: vec!["r01".to_string()],
            group_nodes: vec!["10000".to_string()],
            token: None,
            source: IdentitySource::Token,
        };

        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"tenantId\":10"));
        assert!(json.contains("\"groupNodes\":[\"10000\"]"));

        let decoded: IdentityContext = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.tenant_id, OwnerId(10));
        assert_eq!(decoded.account_id.as_deref(), Some("a01"));
        assert_eq!(decoded.source, IdentitySource::Anonymous);
    }

    #[test]
    fn test_missing_ids_default_to_sentinel() {
        let decoded: IdentityContext = serde_json::from_str(r#"{"roles":["r01"]}"#).unwrap();
        assert!(decoded.tenant_id.is_undefined());
        assert!(decoded.app_id.is_undefined());
    }

    #[test]
    fn test_subject_sets_precedence() {
        let identity = IdentityContext {
            account_id: Some("a01".to_string()),
            roles: vec!["r01".to_string(), "r02".to_string()],
            group_nodes: vec!["10000".to_string()],
            ..IdentityContext::for_app(OwnerId(1), OwnerId(2), IdentitySource::Token)
        };

        let kinds: Vec<SubjectKind> = identity.subject_sets().iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![
                SubjectKind::Role,
                SubjectKind::GroupNode,
                SubjectKind::Account,
                SubjectKind::Tenant,
                SubjectKind::App
            ]
        );
    }

    #[test]
    fn test_anonymous_has_no_subjects() {
        assert!(IdentityContext::anonymous().subject_sets().is_empty());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("HTTP".parse::<ResourceKind>().unwrap(), ResourceKind::Http);
        assert_eq!("https".parse::<ResourceKind>().unwrap(), ResourceKind::Http);
        assert!("ftp".parse::<ResourceKind>().is_err());
        assert_eq!("Create".parse::<ActionKind>().unwrap(), ActionKind::Create);
        assert_eq!("group_node".parse::<SubjectKind>().unwrap(), SubjectKind::GroupNode);
        assert_eq!("like".parse::<SubjectOperator>().unwrap(), SubjectOperator::Like);
    }

    #[test]
    fn test_operator_applicability() {
        assert!(SubjectOperator::Include.applies_to(SubjectKind::GroupNode));
        assert!(!SubjectOperator::Like.applies_to(SubjectKind::Role));
        assert!(SubjectOperator::Neq.applies_to(SubjectKind::App));
    }

    #[test]
    fn test_http_method_mapping() {
        assert_eq!(ActionKind::from_http_method("get"), Some(ActionKind::Fetch));
        assert_eq!(ActionKind::from_http_method("PUT"), Some(ActionKind::Modify));
        assert_eq!(ActionKind::from_http_method("OPTIONS"), None);
    }
}
