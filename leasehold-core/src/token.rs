//! Lock tokens: opaque proof of ownership handed out on acquisition.

use std::fmt;
use uuid::Uuid;

/// Ownership token for a held lock. Equality is case-insensitive.
#[derive(Debug, Clone, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// Create a new random token
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a token previously handed out (e.g. read back from a CLI argument)
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// True when `stored` is this token, ignoring ASCII case.
    pub fn matches(&self, stored: &str) -> bool {
        self.0.eq_ignore_ascii_case(stored)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LockToken {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for LockToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for LockToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
