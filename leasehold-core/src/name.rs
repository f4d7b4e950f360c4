//! Hierarchical lock names.
//!
//! A lock is addressed by a namespace plus a dotted local name. The local name is
//! case-insensitive and stored lowercased. `a.b.c` expands to the path
//! `a`, `a.b`, `a.b.c`; every element becomes a shared resource and the last one
//! is the exclusive resource.

use std::fmt;

use crate::error::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockName {
    namespace: String,
    local_name: String,
}

impl LockName {
    pub fn new(namespace: impl Into<String>, local_name: impl AsRef<str>) -> Result<Self, LockError> {
        let namespace = namespace.into();
        let local_name = local_name.as_ref().trim().to_lowercase();
        if namespace.trim().is_empty() {
            return Err(LockError::InvalidName("namespace must not be empty".to_string()));
        }
        if local_name.is_empty() {
            return Err(LockError::InvalidName(format!(
                "lock name in namespace '{namespace}' must not be empty"
            )));
        }
        if local_name.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(LockError::InvalidName(format!(
                "lock name '{local_name}' contains an empty segment"
            )));
        }
        Ok(Self {
            namespace,
            local_name,
        })
    }

    /// Parse `namespace:local.name`, the form used on the command line.
    pub fn parse(qualified: &str) -> Result<Self, LockError> {
        let (namespace, local_name) = qualified.rsplit_once(':').ok_or_else(|| {
            LockError::InvalidName(format!(
                "'{qualified}' is not of the form namespace:name"
            ))
        })?;
        Self::new(namespace, local_name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Local names from the root of the hierarchy down to this lock, inclusive.
    pub fn hierarchy(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = String::new();
        for segment in self.local_name.split('.') {
            if !current.is_empty() {
                current.push('.');
            }
            current.push_str(segment);
            path.push(current.clone());
        }
        path
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.local_name)
    }
}
