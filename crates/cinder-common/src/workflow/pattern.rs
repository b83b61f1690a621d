use crate::error::ConfigurationError;
use std::fmt;

const REF_HEADS_PREFIX: &str = "refs/heads/";

/// A branch filter from a trigger rule.
///
/// Only two shapes exist: an exact branch name, or a prefix written with a
/// single trailing `*`. A lone `*` is the empty prefix and matches every branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BranchPattern {
    Exact(String),
    Prefix(String),
}

impl BranchPattern {
    /// Pattern that matches every branch.
    pub fn any() -> Self {
        BranchPattern::Prefix(String::new())
    }

    /// Parse a pattern as written in a workflow document.
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &'static str| ConfigurationError::InvalidPattern {
            pattern: raw.to_string(),
            reason,
        };

        let trimmed = normalize_branch(raw.trim());
        if trimmed.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if trimmed.starts_with('!') {
            return Err(invalid("negated patterns are not supported"));
        }
        if trimmed.contains(['?', '[', ']', '{', '}']) {
            return Err(invalid("only a trailing '*' wildcard is supported"));
        }

        match trimmed.find('*') {
            None => Ok(BranchPattern::Exact(trimmed.to_string())),
            Some(pos) if pos == trimmed.len() - 1 => {
                Ok(BranchPattern::Prefix(trimmed[..pos].to_string()))
            }
            Some(_) => Err(invalid("only a trailing '*' wildcard is supported")),
        }
    }

    /// Whether `branch` (with or without a `refs/heads/` prefix) satisfies the pattern.
    pub fn matches(&self, branch: &str) -> bool {
        let branch = normalize_branch(branch);
        match self {
            BranchPattern::Exact(name) => branch == name,
            BranchPattern::Prefix(prefix) => branch.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for BranchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchPattern::Exact(name) => write!(f, "{name}"),
            BranchPattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Strip a leading `refs/heads/` from a branch reference.
pub fn normalize_branch(name: &str) -> &str {
    name.strip_prefix(REF_HEADS_PREFIX).unwrap_or(name)
}
