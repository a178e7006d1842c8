//! Key patterns used by invalidation and `CacheManager::invalidate`.

use std::fmt;

use regex::Regex;

/// A key selector: either a regular expression or a literal substring.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Regex(Regex),
    Literal(String),
}

impl KeyPattern {
    /// Compile a regex pattern. Invalid expressions degrade to a literal
    /// substring match on the source text.
    pub fn regex(source: &str) -> Self {
        match Regex::new(source) {
            Ok(regex) => Self::Regex(regex),
            Err(_) => Self::Literal(source.to_string()),
        }
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// Parse user input: `/.../` selects a regex, anything else is literal.
    pub fn parse(input: &str) -> Self {
        match input
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(body) if !body.is_empty() => Self::regex(body),
            _ => Self::literal(input),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(key),
            Self::Literal(text) => key.contains(text.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Regex(regex) => regex.as_str(),
            Self::Literal(text) => text,
        }
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (Self::Literal(a), Self::Literal(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KeyPattern {}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regex(regex) => write!(f, "/{}/", regex.as_str()),
            Self::Literal(text) => f.write_str(text),
        }
    }
}

impl From<Regex> for KeyPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

impl From<&str> for KeyPattern {
    fn from(text: &str) -> Self {
        Self::literal(text)
    }
}
