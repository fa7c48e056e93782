/*!
 * Capability Policy
 * Static allow-list (with exposed operation subsets) and deny-list
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How the policy classifies a capability name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityDecision<'a> {
    /// Allowed, exposing only these operations
    Allowed(&'a BTreeSet<String>),
    /// Explicitly deny-listed
    Denied,
    /// Neither list mentions it (default-deny)
    Unlisted,
}

/// Named capability allow/deny lists
///
/// Capability names are module specifiers (`fs`, `path`) or dotted process
/// operations (`process.exit`). A `node:` prefix is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CapabilityPolicy {
    pub allowed: BTreeMap<String, BTreeSet<String>>,
    pub denied: BTreeSet<String>,
}

impl CapabilityPolicy {
    /// Policy that allows nothing and denies nothing explicitly
    pub fn empty() -> Self {
        Self {
            allowed: BTreeMap::new(),
            denied: BTreeSet::new(),
        }
    }

    /// Normalize a capability name (`node:fs` -> `fs`)
    pub fn normalize(name: &str) -> &str {
        let trimmed = name.trim();
        trimmed.strip_prefix("node:").unwrap_or(trimmed)
    }

    /// Classify a capability name; deny wins over allow
    pub fn decide(&self, name: &str) -> CapabilityDecision<'_> {
        let name = Self::normalize(name);
        if self.denied.contains(name) {
            return CapabilityDecision::Denied;
        }
        match self.allowed.get(name) {
            Some(operations) => CapabilityDecision::Allowed(operations),
            None => CapabilityDecision::Unlisted,
        }
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(Self::normalize(name))
    }

    /// Deny-listed module names (excludes dotted process operations)
    pub fn denied_modules(&self) -> impl Iterator<Item = &str> {
        self.denied
            .iter()
            .map(String::as_str)
            .filter(|name| !name.starts_with("process."))
    }

    pub fn allow(mut self, name: &str, operations: &[&str]) -> Self {
        self.allowed.insert(
            name.to_string(),
            operations.iter().map(|op| op.to_string()).collect(),
        );
        self
    }

    pub fn deny(mut self, name: &str) -> Self {
        self.denied.insert(name.to_string());
        self
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        let policy = Self::empty()
            .allow(
                "path",
                &["join", "basename", "dirname", "extname", "normalize", "isAbsolute"],
            )
            .allow("util", &["format", "inspect"])
            .allow("crypto", &["randomUUID"]);

        DEFAULT_DENIED.iter().fold(policy, |policy, name| policy.deny(name))
    }
}

const DEFAULT_DENIED: &[&str] = &[
    // Filesystem and process spawning
    "fs",
    "fs/promises",
    "child_process",
    "cluster",
    "worker_threads",
    // Network
    "dgram",
    "dns",
    "http",
    "http2",
    "https",
    "net",
    "tls",
    // Runtime internals
    "inspector",
    "module",
    "os",
    "process",
    "repl",
    "v8",
    "vm",
    // Process control
    "process.exit",
    "process.kill",
    "process.abort",
    "process.reallyExit",
    "process.binding",
    "process.dlopen",
    "process.chdir",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_decisions() {
        let policy = CapabilityPolicy::default();

        assert_eq!(policy.decide("fs"), CapabilityDecision::Denied);
        assert_eq!(policy.decide("node:child_process"), CapabilityDecision::Denied);
        assert_eq!(policy.decide("process.exit"), CapabilityDecision::Denied);
        assert_eq!(policy.decide("lodash"), CapabilityDecision::Unlisted);

        match policy.decide("path") {
            CapabilityDecision::Allowed(ops) => {
                assert!(ops.contains("join"));
                assert!(!ops.contains("resolve"));
            }
            other => panic!("expected path to be allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = CapabilityPolicy::empty().allow("fs", &["readFileSync"]).deny("fs");
        assert_eq!(policy.decide("fs"), CapabilityDecision::Denied);
    }

    #[test]
    fn test_denied_modules_skip_process_operations() {
        let policy = CapabilityPolicy::default();
        let modules: Vec<&str> = policy.denied_modules().collect();
        assert!(modules.contains(&"fs"));
        assert!(!modules.iter().any(|m| m.starts_with("process.")));
    }
}
