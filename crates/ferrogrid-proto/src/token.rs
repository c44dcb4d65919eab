//! Token descriptors and selection interests

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use crate::ProtocolError;

/// A matching rule evaluated against one attribute value.
///
/// The pattern is a regular expression that must match the whole value.
/// With `must_match` set the attribute has to be present and match; without it
/// the attribute has to be absent or not match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interest {
    /// Regular expression, anchored on both ends when evaluated
    pub selection_pattern: String,
    /// Required-present (`true`) or required-absent (`false`)
    pub must_match: bool,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl Interest {
    /// Create an interest, validating the pattern
    pub fn new(selection_pattern: impl Into<String>, must_match: bool) -> Result<Self, ProtocolError> {
        let interest = Self::unchecked(selection_pattern.into(), must_match);
        if interest.regex().is_none() {
            return Err(ProtocolError::InvalidPattern(interest.selection_pattern));
        }
        Ok(interest)
    }

    /// Required interest matching exactly `value`
    pub fn exact(value: &str) -> Self {
        Self::unchecked(regex::escape(value), true)
    }

    fn unchecked(selection_pattern: String, must_match: bool) -> Self {
        Self {
            selection_pattern,
            must_match,
            compiled: OnceLock::new(),
        }
    }

    fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| Regex::new(&format!("^(?:{})$", self.selection_pattern)).ok())
            .as_ref()
    }

    /// Whether the pattern matches the attribute value. A missing value or an
    /// invalid pattern never matches.
    pub fn pattern_matches(&self, value: Option<&str>) -> bool {
        match (value, self.regex()) {
            (Some(value), Some(regex)) => regex.is_match(value),
            _ => false,
        }
    }

    /// Whether the interest is satisfied by the attribute value
    pub fn is_satisfied_by(&self, value: Option<&str>) -> bool {
        self.pattern_matches(value) == self.must_match
    }
}

impl PartialEq for Interest {
    fn eq(&self, other: &Self) -> bool {
        self.selection_pattern == other.selection_pattern && self.must_match == other.must_match
    }
}

impl Eq for Interest {}

/// Attribute every agent adds to its tokens, naming the kind of agent
pub const AGENT_TYPE_KEY: &str = "$agenttype";

/// Value of [`AGENT_TYPE_KEY`] for standard agents
pub const DEFAULT_AGENT_TYPE: &str = "default";

/// A token as advertised by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDescriptor {
    /// Token identity
    pub uid: String,
    /// Owning agent
    pub agent_id: String,
    /// Capability attributes
    pub attributes: HashMap<String, String>,
    /// Interests the token itself places on requesters
    pub selection_patterns: HashMap<String, Interest>,
    /// Number of tokens declared by this token's group
    pub capacity: u32,
}

/// A token as currently seen by its agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStatus {
    /// Token configuration
    pub descriptor: TokenDescriptor,
    /// Whether a call is executing on the token
    pub reserved: bool,
}

/// Announcement of all tokens hosted by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Agent identity
    pub agent_id: String,
    /// Address the grid can use to reach the agent, for diagnostics
    pub agent_url: String,
    /// Hosted tokens
    pub tokens: Vec<TokenDescriptor>,
}
