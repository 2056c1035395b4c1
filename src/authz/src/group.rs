//! Hierarchical group-node codes
//!
//! A node code is the concatenation of fixed-width segments, one per tree
//! level: with a segment width of 5, `10000` is a root, `1000010000` its
//! first child and `100001000010000` a grandchild. Ancestors are the code's
//! proper prefixes cut at segment boundaries; descendants share the code as
//! a prefix. Ancestry checks are therefore plain string operations.

use crate::error::{AuthzError, Result};

/// Group-node code arithmetic for a fixed segment width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupNodeCodec {
    segment_len: usize,
}

impl GroupNodeCodec {
    /// Create a codec; the segment width must be non-zero
    pub fn new(segment_len: usize) -> Result<Self> {
        if segment_len == 0 {
            return Err(AuthzError::Config(
                "group node segment length must be greater than zero".to_string(),
            ));
        }
        Ok(Self { segment_len })
    }

    pub fn segment_len(&self) -> usize {
        self.segment_len
    }

    /// Whether `code` is a non-empty whole number of segments
    pub fn is_valid(&self, code: &str) -> bool {
        !code.is_empty() && code.len() % self.segment_len == 0 && code.is_ascii()
    }

    /// Tree depth of a code (roots are depth 1)
    pub fn depth(&self, code: &str) -> usize {
        code.len() / self.segment_len
    }

    /// Parent code, `None` for roots and malformed codes
    pub fn parent<'a>(&self, code: &'a str) -> Option<&'a str> {
        if !self.is_valid(code) || code.len() == self.segment_len {
            return None;
        }
        Some(&code[..code.len() - self.segment_len])
    }

    /// The code itself followed by each ancestor up to the root
    ///
    /// ```
    /// use tollgate_authz::group::GroupNodeCodec;
    ///
    /// let codec = GroupNodeCodec::new(5).unwrap();
    /// let chain = codec.self_and_ancestors("100001000010000");
    /// assert_eq!(chain, vec!["100001000010000", "1000010000", "10000"]);
    /// ```
    pub fn self_and_ancestors<'a>(&self, code: &'a str) -> Vec<&'a str> {
        if !self.is_valid(code) {
            return Vec::new();
        }
        (1..=self.depth(code))
            .rev()
            .map(|level| &code[..level * self.segment_len])
            .collect()
    }

    /// `ancestor` is `node` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: &str, node: &str) -> bool {
        self.is_valid(ancestor) && self.is_valid(node) && node.starts_with(ancestor)
    }

    /// `descendant` is `node` or one of its descendants
    pub fn is_descendant_or_self(&self, descendant: &str, node: &str) -> bool {
        self.is_ancestor_or_self(node, descendant)
    }
}
