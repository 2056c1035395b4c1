//! Resource URI canonicalization
//!
//! A resource URI names its backend kind in the scheme and the concrete
//! resource in host + path: `reldb://orders-db/customers/42`. A trailing
//! `/**` segment widens a policy to the path and everything under it.

use std::fmt;
use std::str::FromStr;

use crate::error::{AuthzError, Result};
use crate::types::ResourceKind;

/// Wildcard marker segment
pub const WILDCARD: &str = "**";

/// Canonical resource URI
///
/// Canonical form lower-cases scheme and host, collapses duplicate `/`,
/// drops a trailing `/` and sorts query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUri {
    kind: ResourceKind,
    host: String,
    segments: Vec<String>,
    query: Option<String>,
}

impl ResourceUri {
    /// Parse and canonicalize a URI of the form `scheme://host[/path][?query]`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| AuthzError::bad_request(format!("Resource URI lacks a scheme: {}", raw)))?;
        let kind = ResourceKind::from_str(scheme)?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (host, path) = match location.find('/') {
            Some(idx) => (&location[..idx], &location[idx..]),
            None => (location, ""),
        };
        if host.is_empty() {
            return Err(AuthzError::bad_request(format!("Resource URI lacks a host: {}", raw)));
        }

        let segments: Vec<String> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(idx) = segments.iter().position(|s| s == WILDCARD) {
            if idx != segments.len() - 1 {
                return Err(AuthzError::bad_request(format!(
                    "Wildcard '**' can only be the last path segment: {}",
                    raw
                )));
            }
        }

        Ok(Self {
            kind,
            host: host.to_ascii_lowercase(),
            segments,
            query: query.and_then(sort_query),
        })
    }

    /// Parse a URI given together with an explicit resource kind
    ///
    /// The URI may omit its scheme; when present it must agree with `kind`.
    pub fn parse_with_kind(kind: ResourceKind, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let uri = if raw.contains("://") {
            Self::parse(raw)?
        } else {
            Self::parse(&format!("{}://{}", kind, raw))?
        };
        if uri.kind != kind {
            return Err(AuthzError::bad_request(format!(
                "Resource URI scheme {} does not match resource kind {}",
                uri.kind, kind
            )));
        }
        Ok(uri)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Whether the URI ends in the `**` wildcard segment
    pub fn is_wildcard(&self) -> bool {
        self.segments.last().map(|s| s == WILDCARD).unwrap_or(false)
    }

    /// Canonical path, `""` for the host root
    pub fn path(&self) -> String {
        self.segments.iter().map(|s| format!("/{}", s)).collect()
    }

    /// Scheme-less form used inside cache keys: `host/path[?query]`
    pub fn cache_form(&self) -> String {
        let mut form = format!("{}{}", self.host, self.path());
        if let Some(query) = &self.query {
            form.push('?');
            form.push_str(query);
        }
        form
    }

    /// Lookup levels from most to least specific, in cache form
    ///
    /// For `http://svc/a/b` this yields `svc/a/b`, `svc/a/b/**`, `svc/a/**`,
    /// `svc/**`. At most `max_wildcard_levels` wildcard levels are produced.
    pub fn lookup_levels(&self, max_wildcard_levels: usize) -> Vec<String> {
        let mut levels = Vec::new();
        levels.push(self.cache_form());
        if self.query.is_some() {
            levels.push(format!("{}{}", self.host, self.path()));
        }

        let base: &[String] = if self.is_wildcard() {
            &self.segments[..self.segments.len() - 1]
        } else {
            &self.segments
        };
        // the wildcard form of a wildcard uri is already the exact level
        let skip_first = usize::from(self.is_wildcard());

        let wildcard_levels = (0..=base.len())
            .rev()
            .skip(skip_first)
            .take(max_wildcard_levels)
            .map(|depth| {
                let prefix: String = base[..depth].iter().map(|s| format!("/{}", s)).collect();
                format!("{}{}/{}", self.host, prefix, WILDCARD)
            });
        levels.extend(wildcard_levels);
        levels
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.cache_form())
    }
}

impl FromStr for ResourceUri {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Sort `k=v` pairs by their raw text; `None` when nothing remains
fn sort_query(query: &str) -> Option<String> {
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    if params.is_empty() {
        return None;
    }
    params.sort_unstable();
    Some(params.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonical_form() {
        let uri = ResourceUri::parse("HTTP://IAM.Service//console///tenant/").unwrap();
        assert_eq!(uri.kind(), ResourceKind::Http);
        assert_eq!(uri.to_string(), "http://iam.service/console/tenant");
        assert_eq!(uri.cache_form(), "iam.service/console/tenant");
    }

    #[test]
    fn test_path_case_preserved() {
        let uri = ResourceUri::parse("object://Bucket/Reports/Q1").unwrap();
        assert_eq!(uri.cache_form(), "bucket/Reports/Q1");
    }

    #[test]
    fn test_query_sorted() {
        let uri = ResourceUri::parse("reldb://db/users?z=1&a=2&&m=3").unwrap();
        assert_eq!(uri.query(), Some("a=2&m=3&z=1"));
    }

    #[test]
    fn test_invalid_uris() {
        assert!(matches!(ResourceUri::parse("iam.service/a"), Err(AuthzError::BadRequest(_))));
        assert!(matches!(ResourceUri::parse("ftp://host/a"), Err(AuthzError::BadRequest(_))));
        assert!(matches!(ResourceUri::parse("http:///a"), Err(AuthzError::BadRequest(_))));
        assert!(matches!(ResourceUri::parse("http://h/**/a"), Err(AuthzError::BadRequest(_))));
    }

    #[test]
    fn test_lookup_levels() {
        let uri = ResourceUri::parse("http://svc/a/b").unwrap();
        assert_eq!(
            uri.lookup_levels(16),
            vec!["svc/a/b", "svc/a/b/**", "svc/a/**", "svc/**"]
        );
    }

    #[test]
    fn test_lookup_levels_of_wildcard_uri() {
        let uri = ResourceUri::parse("http://svc/a/**").unwrap();
        assert_eq!(uri.lookup_levels(16), vec!["svc/a/**", "svc/**"]);
    }

    #[test]
    fn test_lookup_levels_bounded() {
        let uri = ResourceUri::parse("http://svc/a/b/c/d").unwrap();
        assert_eq!(
            uri.lookup_levels(2),
            vec!["svc/a/b/c/d", "svc/a/b/c/d/**", "svc/a/b/c/**"]
        );
    }

    #[test]
    fn test_lookup_levels_with_query() {
        let uri = ResourceUri::parse("http://svc/a?x=1").unwrap();
        assert_eq!(uri.lookup_levels(16), vec!["svc/a?x=1", "svc/a", "svc/a/**", "svc/**"]);
    }

    #[test]
    fn test_parse_with_kind() {
        let uri = ResourceUri::parse_with_kind(ResourceKind::Reldb, "db/orders").unwrap();
        assert_eq!(uri.to_string(), "reldb://db/orders");
        assert!(ResourceUri::parse_with_kind(ResourceKind::Cache, "http://svc/a").is_err());
    }

    proptest! {
        #[test]
        fn prop_canonicalization_is_idempotent(
            host in "[a-zA-Z][a-zA-Z0-9.]{0,10}",
            segments in proptest::collection::vec("[a-z0-9]{1,6}", 0..5),
        ) {
            let raw = format!("http://{}//{}/", host, segments.join("//"));
            let once = ResourceUri::parse(&raw).unwrap();
            let twice = ResourceUri::parse(&once.to_string()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
