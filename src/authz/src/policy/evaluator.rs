//! Policy evaluation
//!
//! A resource URI is looked up level by level, from the exact URI out to the
//! host-wide `host/**`. The first level holding any entry for the action
//! decides; when no level holds one the resource is unprotected and the
//! request is accepted.
//!
//! Within the deciding level entries are visited in subject-kind precedence
//! (role, group node, account, tenant, app) and operator order (EQ, NEQ,
//! INCLUDE, LIKE). A matching exclusive entry decides at once; otherwise the
//! first matching entry decides; otherwise the request is rejected.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{PolicyEntry, PolicyKey};
use crate::cache::PolicyCache;
use crate::config::PolicyConfig;
use crate::error::Result;
use crate::group::GroupNodeCodec;
use crate::types::{ActionKind, AuthResult, ResourceKind, SubjectKind, SubjectOperator, SubjectSets};
use crate::uri::ResourceUri;

/// Why an evaluation ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    /// No level holds an entry for the action
    Unprotected,
    /// An exclusive entry matched
    ExclusiveMatch,
    /// The first non-exclusive matching entry decided
    FirstMatch,
    /// The resource is protected and nothing matched
    NoMatch,
    /// The cache failed for a resource previously seen protected
    CacheFault,
}

/// The entry that decided an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedPolicy {
    /// Lookup level in cache form, e.g. `svc/a/**`
    pub level: String,
    pub operator: SubjectOperator,
    pub subject_kind: SubjectKind,
    pub exclusive: bool,
}

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub result: AuthResult,
    pub reason: EvaluationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<MatchedPolicy>,
    /// Level whose entries were consulted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl Evaluation {
    fn unprotected() -> Self {
        Self {
            result: AuthResult::Accept,
            reason: EvaluationReason::Unprotected,
            matched: None,
            level: None,
        }
    }

    fn rejected(reason: EvaluationReason, level: Option<String>) -> Self {
        Self {
            result: AuthResult::Reject,
            reason,
            matched: None,
            level,
        }
    }

    fn matched(entry: &SnapshotEntry, level: &str) -> Self {
        let reason = if entry.entry.exclusive {
            EvaluationReason::ExclusiveMatch
        } else {
            EvaluationReason::FirstMatch
        };
        Self {
            result: entry.entry.decision,
            reason,
            matched: Some(MatchedPolicy {
                level: level.to_string(),
                operator: entry.operator,
                subject_kind: entry.subject_kind,
                exclusive: entry.entry.exclusive,
            }),
            level: Some(level.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    operator: SubjectOperator,
    subject_kind: SubjectKind,
    entry: PolicyEntry,
}

/// Every entry registered at one `(kind, level, action)`, in precedence order
#[derive(Debug, Clone)]
struct ResourceSnapshot {
    entries: Vec<SnapshotEntry>,
    loaded_at: Instant,
    /// Earliest entry expiry; the snapshot is stale from then on
    expires_at: Option<DateTime<Utc>>,
}

impl ResourceSnapshot {
    fn new(entries: Vec<SnapshotEntry>) -> Self {
        let expires_at = entries.iter().filter_map(|candidate| candidate.entry.expires_at).min();
        Self {
            entries,
            loaded_at: Instant::now(),
            expires_at,
        }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.loaded_at.elapsed() < ttl && self.expires_at.map(|at| at > now).unwrap_or(true)
    }

    fn live_entries(&self, now: DateTime<Utc>) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter().filter(move |candidate| !candidate.entry.is_expired(now))
    }

    fn is_protected(&self, now: DateTime<Utc>) -> bool {
        self.live_entries(now).next().is_some()
    }
}

/// Local snapshot cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Loads of one key before giving up on installing the result
const MAX_LOAD_ATTEMPTS: usize = 3;

/// Evaluates identities against the registered policies
pub struct PolicyEvaluator {
    cache: Arc<dyn PolicyCache>,
    config: PolicyConfig,
    codec: GroupNodeCodec,
    snapshots: DashMap<String, Arc<ResourceSnapshot>>,
    /// Bumped on every refresh of a key; a load that straddles a bump is discarded
    generations: DashMap<String, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PolicyEvaluator {
    pub fn new(cache: Arc<dyn PolicyCache>, config: PolicyConfig) -> Result<Self> {
        let codec = GroupNodeCodec::new(config.group_node_length)?;
        Ok(Self {
            cache,
            config,
            codec,
            snapshots: DashMap::new(),
            generations: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn codec(&self) -> &GroupNodeCodec {
        &self.codec
    }

    /// Accept or reject `action` on `resource_uri` for the given subjects
    pub async fn authenticate(
        &self,
        resource_uri: &str,
        action: ActionKind,
        subjects: &SubjectSets,
    ) -> Result<AuthResult> {
        let uri = ResourceUri::parse(resource_uri)?;
        Ok(self.evaluate(&uri, action, subjects).await?.result)
    }

    /// Evaluate and report which entry decided
    pub async fn evaluate(
        &self,
        uri: &ResourceUri,
        action: ActionKind,
        subjects: &SubjectSets,
    ) -> Result<Evaluation> {
        let levels = uri.lookup_levels(self.config.max_wildcard_levels);

        for level in &levels {
            let snapshot = match self.snapshot(uri.kind(), level, action).await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_internal() && self.known_protected(uri.kind(), &levels, action) => {
                    warn!(uri = %uri, action = %action, error = %e, "Policy cache fault on protected resource, rejecting");
                    return Ok(Evaluation::rejected(EvaluationReason::CacheFault, None));
                }
                Err(e) => return Err(e),
            };
            let now = Utc::now();
            if !snapshot.is_protected(now) {
                continue;
            }

            let evaluation = self.decide(&snapshot, level, subjects, now);
            debug!(
                uri = %uri,
                action = %action,
                level = %level,
                result = %evaluation.result,
                reason = ?evaluation.reason,
                "Policy evaluated"
            );
            return Ok(evaluation);
        }

        debug!(uri = %uri, action = %action, "No policy registered, resource is open");
        Ok(Evaluation::unprotected())
    }

    fn decide(
        &self,
        snapshot: &ResourceSnapshot,
        level: &str,
        subjects: &SubjectSets,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let mut first: Option<&SnapshotEntry> = None;
        for candidate in snapshot.live_entries(now) {
            if !self.matches(candidate, subjects.get(candidate.subject_kind)) {
                continue;
            }
            if candidate.entry.exclusive {
                return Evaluation::matched(candidate, level);
            }
            first.get_or_insert(candidate);
        }
        match first {
            Some(candidate) => Evaluation::matched(candidate, level),
            None => Evaluation::rejected(EvaluationReason::NoMatch, Some(level.to_string())),
        }
    }

    fn matches(&self, candidate: &SnapshotEntry, held: &[String]) -> bool {
        let listed = &candidate.entry;
        match candidate.operator {
            SubjectOperator::Eq => held.iter().any(|id| listed.contains(id)),
            SubjectOperator::Neq => !held.is_empty() && held.iter().all(|id| !listed.contains(id)),
            // the policy node is the caller's node or one of its ancestors
            SubjectOperator::Include => held.iter().any(|node| {
                self.codec
                    .self_and_ancestors(node)
                    .into_iter()
                    .any(|ancestor| listed.contains(ancestor))
            }),
            SubjectOperator::Like => held.iter().any(|node| {
                listed
                    .subject_ids
                    .iter()
                    .any(|policy_node| self.codec.is_descendant_or_self(node, policy_node))
            }),
        }
    }

    fn snapshot_key(kind: ResourceKind, level: &str, action: ActionKind) -> String {
        format!("{}:{}:{}", kind, level, action)
    }

    async fn snapshot(&self, kind: ResourceKind, level: &str, action: ActionKind) -> Result<Arc<ResourceSnapshot>> {
        let key = Self::snapshot_key(kind, level, action);
        if let Some(snapshot) = self.snapshots.get(&key) {
            if snapshot.is_fresh(self.config.resource_cache_ttl(), Utc::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(snapshot.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 1;
        loop {
            let generation = self.generation(&key);
            let snapshot = Arc::new(self.load(kind, level, action).await?);
            if self.install(&key, generation, &snapshot) || attempt == MAX_LOAD_ATTEMPTS {
                return Ok(snapshot);
            }
            debug!(key = %key, attempt, "Resource refreshed during load, reloading");
            attempt += 1;
        }
    }

    fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).map(|generation| *generation).unwrap_or(0)
    }

    /// Store `snapshot` unless `key` was refreshed after `generation` was read
    fn install(&self, key: &str, generation: u64, snapshot: &Arc<ResourceSnapshot>) -> bool {
        // the generation shard stays locked until the snapshot is in place
        let current = self.generations.entry(key.to_string()).or_insert(0);
        if *current != generation {
            return false;
        }
        self.snapshots.insert(key.to_string(), snapshot.clone());
        true
    }

    async fn load(&self, kind: ResourceKind, level: &str, action: ActionKind) -> Result<ResourceSnapshot> {
        let prefix = &self.config.policy_key_prefix;
        let slots: Vec<(SubjectOperator, SubjectKind)> = SubjectKind::ALL
            .iter()
            .flat_map(|subject_kind| subject_kind.operators().iter().map(move |op| (*op, *subject_kind)))
            .collect();

        let fetches = slots.iter().map(|(operator, subject_kind)| {
            let key = PolicyKey::new(kind, level, action, *operator, *subject_kind).to_cache_key(prefix);
            async move { self.cache.get(&key).await }
        });
        let values = try_join_all(fetches).await?;

        let now = Utc::now();
        let mut entries = Vec::new();
        for ((operator, subject_kind), raw) in slots.into_iter().zip(values) {
            let Some(raw) = raw else { continue };
            let entry: PolicyEntry = serde_json::from_str(&raw)?;
            if entry.is_empty() || entry.is_expired(now) {
                continue;
            }
            entries.push(SnapshotEntry {
                operator,
                subject_kind,
                entry,
            });
        }

        Ok(ResourceSnapshot::new(entries))
    }

    /// Whether any level of the URI was seen protected, however stale
    fn known_protected(&self, kind: ResourceKind, levels: &[String], action: ActionKind) -> bool {
        let now = Utc::now();
        levels.iter().any(|level| {
            self.snapshots
                .get(&Self::snapshot_key(kind, level, action))
                .map(|snapshot| snapshot.is_protected(now))
                .unwrap_or(false)
        })
    }

    /// Reload the local snapshot of one resource level
    ///
    /// `uri` is in cache form. With no action, every action is refreshed.
    /// Loads of the level already in flight are invalidated; only levels
    /// held locally are reloaded here.
    pub async fn refresh_resource(&self, kind: ResourceKind, uri: &str, action: Option<ActionKind>) -> Result<usize> {
        let actions: Vec<ActionKind> = match action {
            Some(action) => vec![action],
            None => ActionKind::ALL.to_vec(),
        };

        let mut refreshed = 0;
        for action in actions {
            let key = Self::snapshot_key(kind, uri, action);
            let generation = {
                let mut current = self.generations.entry(key.clone()).or_insert(0);
                *current += 1;
                *current
            };
            if !self.snapshots.contains_key(&key) {
                continue;
            }
            let snapshot = Arc::new(self.load(kind, uri, action).await?);
            // a newer refresh installs its own load
            self.install(&key, generation, &snapshot);
            refreshed += 1;
        }
        debug!(kind = %kind, uri = %uri, refreshed, "Refreshed resource snapshots");
        Ok(refreshed)
    }

    pub fn snapshot_stats(&self) -> SnapshotStats {
        SnapshotStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.snapshots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryPolicyCache;
    use std::sync::atomic::AtomicBool;

    const PREFIX: &str = "tollgate:auth:policy:";

    async fn put(
        cache: &InMemoryPolicyCache,
        uri: &str,
        action: ActionKind,
        operator: SubjectOperator,
        subject_kind: SubjectKind,
        ids: &[&str],
        decision: AuthResult,
        exclusive: bool,
    ) {
        let mut entry = PolicyEntry::new(decision, exclusive);
        for id in ids {
            entry.add_subject(id);
        }
        let key = PolicyKey::new(ResourceKind::Http, uri, action, operator, subject_kind).to_cache_key(PREFIX);
        cache
            .set(&key, &serde_json::to_string(&entry).unwrap(), None)
            .await
            .unwrap();
    }

    fn evaluator(cache: &InMemoryPolicyCache) -> PolicyEvaluator {
        PolicyEvaluator::new(Arc::new(cache.clone()), PolicyConfig::default()).unwrap()
    }

    fn roles(ids: &[&str]) -> SubjectSets {
        let mut sets = SubjectSets::new();
        sets.extend(SubjectKind::Role, ids.iter().map(|s| s.to_string()));
        sets
    }

    #[tokio::test]
    async fn test_unregistered_resource_is_open() {
        let cache = InMemoryPolicyCache::new();
        let evaluator = evaluator(&cache);
        let evaluation = evaluator
            .evaluate(&ResourceUri::parse("http://svc/a").unwrap(), ActionKind::Fetch, &SubjectSets::new())
            .await
            .unwrap();
        assert_eq!(evaluation.result, AuthResult::Accept);
        assert_eq!(evaluation.reason, EvaluationReason::Unprotected);
    }

    #[tokio::test]
    async fn test_most_specific_level_decides() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/**", ActionKind::Delete, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        put(&cache, "svc/1", ActionKind::Delete, SubjectOperator::Neq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        let evaluator = evaluator(&cache);

        // svc/1 only admits callers without r01
        let result = evaluator.authenticate("http://svc/1", ActionKind::Delete, &roles(&["r01"])).await.unwrap();
        assert_eq!(result, AuthResult::Reject);
        let result = evaluator.authenticate("http://svc/1", ActionKind::Delete, &roles(&["r02"])).await.unwrap();
        assert_eq!(result, AuthResult::Accept);

        // other resources fall through to svc/**
        let result = evaluator.authenticate("http://svc/2", ActionKind::Delete, &roles(&["r01"])).await.unwrap();
        assert_eq!(result, AuthResult::Accept);
    }

    #[tokio::test]
    async fn test_exclusive_beats_earlier_match() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Account, &["a01"], AuthResult::Reject, true).await;
        let evaluator = evaluator(&cache);

        let subjects = roles(&["r01"]).with(SubjectKind::Account, "a01");
        let evaluation = evaluator
            .evaluate(&ResourceUri::parse("http://svc/a").unwrap(), ActionKind::Fetch, &subjects)
            .await
            .unwrap();
        assert_eq!(evaluation.result, AuthResult::Reject);
        assert_eq!(evaluation.reason, EvaluationReason::ExclusiveMatch);
        assert_eq!(evaluation.matched.unwrap().subject_kind, SubjectKind::Account);
    }

    #[tokio::test]
    async fn test_first_match_in_precedence_order() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Tenant, &["1"], AuthResult::Reject, false).await;
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        let evaluator = evaluator(&cache);

        let subjects = roles(&["r01"]).with(SubjectKind::Tenant, "1");
        let evaluation = evaluator
            .evaluate(&ResourceUri::parse("http://svc/a").unwrap(), ActionKind::Fetch, &subjects)
            .await
            .unwrap();
        assert_eq!(evaluation.result, AuthResult::Accept);
        assert_eq!(evaluation.reason, EvaluationReason::FirstMatch);
    }

    #[tokio::test]
    async fn test_neq_requires_held_ids() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Neq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        let evaluator = evaluator(&cache);

        let result = evaluator.authenticate("http://svc/a", ActionKind::Fetch, &SubjectSets::new()).await.unwrap();
        assert_eq!(result, AuthResult::Reject);
    }

    #[tokio::test]
    async fn test_include_and_like() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/inc", ActionKind::Fetch, SubjectOperator::Include, SubjectKind::GroupNode, &["10000"], AuthResult::Accept, false).await;
        put(&cache, "svc/like", ActionKind::Fetch, SubjectOperator::Like, SubjectKind::GroupNode, &["1000010000"], AuthResult::Accept, false).await;
        let evaluator = evaluator(&cache);
        let node = |code: &str| SubjectSets::new().with(SubjectKind::GroupNode, code);

        assert!(evaluator.authenticate("http://svc/inc", ActionKind::Fetch, &node("1000010000")).await.unwrap().is_accept());
        assert!(!evaluator.authenticate("http://svc/inc", ActionKind::Fetch, &node("10001")).await.unwrap().is_accept());
        assert!(evaluator.authenticate("http://svc/like", ActionKind::Fetch, &node("100001000010000")).await.unwrap().is_accept());
        assert!(!evaluator.authenticate("http://svc/like", ActionKind::Fetch, &node("10000")).await.unwrap().is_accept());
    }

    #[tokio::test]
    async fn test_like_ignores_malformed_caller_nodes() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/like", ActionKind::Fetch, SubjectOperator::Like, SubjectKind::GroupNode, &["10000"], AuthResult::Accept, false).await;
        let evaluator = evaluator(&cache);
        let node = |code: &str| SubjectSets::new().with(SubjectKind::GroupNode, code);

        // six digits is not a whole number of segments
        assert!(!evaluator.authenticate("http://svc/like", ActionKind::Fetch, &node("100005")).await.unwrap().is_accept());
        assert!(evaluator.authenticate("http://svc/like", ActionKind::Fetch, &node("1000050000")).await.unwrap().is_accept());
    }

    #[tokio::test]
    async fn test_expired_entry_stops_protecting_level() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/**", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r00"], AuthResult::Accept, false).await;
        let mut entry = PolicyEntry::new(AuthResult::Accept, false);
        entry.add_subject("r01");
        entry.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(500));
        let key = PolicyKey::new(ResourceKind::Http, "svc/tmp", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role)
            .to_cache_key(PREFIX);
        cache
            .set(&key, &serde_json::to_string(&entry).unwrap(), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        let evaluator = evaluator(&cache);
        let uri = ResourceUri::parse("http://svc/tmp").unwrap();
        let subjects = roles(&["r00"]);

        let evaluation = evaluator.evaluate(&uri, ActionKind::Fetch, &subjects).await.unwrap();
        assert_eq!(evaluation.result, AuthResult::Reject);
        assert_eq!(evaluation.level.as_deref(), Some("svc/tmp"));

        tokio::time::sleep(Duration::from_millis(800)).await;

        // no exchange event fires on expiry; the wildcard level now decides
        let evaluation = evaluator.evaluate(&uri, ActionKind::Fetch, &subjects).await.unwrap();
        assert_eq!(evaluation.result, AuthResult::Accept);
        assert_eq!(evaluation.level.as_deref(), Some("svc/**"));
    }

    /// Answers reads with the value seen before a delay, while `slow` is set
    struct DelayedReads {
        inner: InMemoryPolicyCache,
        delay: Duration,
        slow: Arc<AtomicBool>,
    }

    impl DelayedReads {
        fn new(inner: &InMemoryPolicyCache, slow: &Arc<AtomicBool>) -> Self {
            Self {
                inner: inner.clone(),
                delay: Duration::from_millis(300),
                slow: slow.clone(),
            }
        }
    }

    #[async_trait::async_trait]
    impl PolicyCache for DelayedReads {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let value = self.inner.get(key).await?;
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(self.delay).await;
            }
            Ok(value)
        }

        async fn get_and_refresh(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
            self.inner.get_and_refresh(key, ttl).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.inner.del(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.scan_prefix(prefix).await
        }

        async fn publish(&self, topic: &str, message: &str) -> Result<()> {
            self.inner.publish(topic, message).await
        }

        async fn subscribe(&self, topic: &str) -> Result<crate::cache::MessageStream> {
            self.inner.subscribe(topic).await
        }

        async fn is_leader(&self) -> Result<bool> {
            self.inner.is_leader().await
        }
    }

    #[tokio::test]
    async fn test_refresh_during_load_discards_older_read() {
        let cache = InMemoryPolicyCache::new();
        let slow = Arc::new(AtomicBool::new(true));
        let delayed = DelayedReads::new(&cache, &slow);
        let evaluator = Arc::new(PolicyEvaluator::new(Arc::new(delayed), PolicyConfig::default()).unwrap());
        let subjects = roles(&["r00"]);

        let inflight = {
            let evaluator = evaluator.clone();
            let subjects = subjects.clone();
            tokio::spawn(async move { evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // protect the resource while the first load still holds the empty read
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        evaluator
            .refresh_resource(ResourceKind::Http, "svc/a", Some(ActionKind::Fetch))
            .await
            .unwrap();

        inflight.await.unwrap().unwrap();
        let result = evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap();
        assert_eq!(result, AuthResult::Reject);
    }

    #[tokio::test]
    async fn test_refresh_is_not_overwritten_by_older_load() {
        let cache = InMemoryPolicyCache::new();
        let slow = Arc::new(AtomicBool::new(true));
        let delayed = DelayedReads::new(&cache, &slow);
        let config = PolicyConfig {
            resource_cache_expire_secs: 1,
            ..PolicyConfig::default()
        };
        let evaluator = Arc::new(PolicyEvaluator::new(Arc::new(delayed), config).unwrap());
        let subjects = roles(&["r00"]);

        // seed a negative snapshot, then let it go stale
        assert!(evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap().is_accept());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let inflight = {
            let evaluator = evaluator.clone();
            let subjects = subjects.clone();
            tokio::spawn(async move { evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the refresh reads fast and lands before the older load finishes
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        slow.store(false, Ordering::SeqCst);
        let refreshed = evaluator
            .refresh_resource(ResourceKind::Http, "svc/a", Some(ActionKind::Fetch))
            .await
            .unwrap();
        assert_eq!(refreshed, 1);

        inflight.await.unwrap().unwrap();
        let result = evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap();
        assert_eq!(result, AuthResult::Reject);
    }

    #[tokio::test]
    async fn test_snapshots_served_locally_until_refreshed() {
        let cache = InMemoryPolicyCache::new();
        let evaluator = evaluator(&cache);
        let subjects = roles(&["r00"]);

        assert!(evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap().is_accept());
        let misses = evaluator.snapshot_stats().misses;

        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        // stale negative snapshot still answers
        assert!(evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap().is_accept());
        assert_eq!(evaluator.snapshot_stats().misses, misses);

        let refreshed = evaluator
            .refresh_resource(ResourceKind::Http, "svc/a", Some(ActionKind::Fetch))
            .await
            .unwrap();
        assert_eq!(refreshed, 1);
        assert!(!evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap().is_accept());
    }

    #[tokio::test]
    async fn test_cache_fault_handling() {
        let cache = InMemoryPolicyCache::new();
        put(&cache, "svc/a", ActionKind::Fetch, SubjectOperator::Eq, SubjectKind::Role, &["r01"], AuthResult::Accept, false).await;
        let config = PolicyConfig {
            resource_cache_expire_secs: 1,
            ..PolicyConfig::default()
        };
        let evaluator = PolicyEvaluator::new(Arc::new(cache.clone()), config).unwrap();
        let subjects = roles(&["r01"]);

        assert!(evaluator.authenticate("http://svc/a", ActionKind::Fetch, &subjects).await.unwrap().is_accept());
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        cache.set_available(false);

        // seen protected: fail closed
        let evaluation = evaluator
            .evaluate(&ResourceUri::parse("http://svc/a").unwrap(), ActionKind::Fetch, &subjects)
            .await
            .unwrap();
        assert_eq!(evaluation.result, AuthResult::Reject);
        assert_eq!(evaluation.reason, EvaluationReason::CacheFault);

        // never seen: surface the fault
        let err = evaluator.authenticate("http://svc/b", ActionKind::Fetch, &subjects).await.unwrap_err();
        assert!(err.is_internal());
    }
}
