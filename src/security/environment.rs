/*!
 * Environment Gate
 * Filtered, read-only view of configuration values for one execution unit
 */

use crate::core::types::ExecutionId;
use crate::security::traits::ViolationSink;
use crate::security::types::{Severity, Violation, ViolationKind, ViolationSource};
use ahash::AHashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Refused environment access
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum EnvironmentDenied {
    #[error("Access to environment variable '{0}' is denied")]
    #[diagnostic(code(environment::sensitive))]
    Sensitive(String),

    #[error("Environment is read-only: cannot set '{0}'")]
    #[diagnostic(code(environment::read_only))]
    ReadOnly(String),
}

/// How the policy classifies a variable name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvAccess {
    Allowed,
    Denied,
    Unknown,
}

/// Allow/deny lists for configuration values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EnvironmentPolicy {
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
    /// Substrings marking a name as sensitive (matched case-insensitively)
    pub sensitive_markers: Vec<String>,
}

impl Default for EnvironmentPolicy {
    fn default() -> Self {
        Self {
            allowed: ["NODE_ENV", "TZ", "LANG", "LC_ALL"]
                .into_iter()
                .map(String::from)
                .collect(),
            denied: [
                "AWS_ACCESS_KEY_ID",
                "AWS_SECRET_ACCESS_KEY",
                "DATABASE_URL",
                "HOME",
                "USER",
                "SSH_AUTH_SOCK",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            sensitive_markers: [
                "KEY",
                "SECRET",
                "TOKEN",
                "PASSWORD",
                "PASSWD",
                "CREDENTIAL",
                "PRIVATE",
                "AUTH",
                "SESSION",
                "COOKIE",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl EnvironmentPolicy {
    /// Classify a name; deny and sensitivity win over allow
    pub fn classify(&self, name: &str) -> EnvAccess {
        if self.denied.contains(name) || self.is_sensitive(name) {
            EnvAccess::Denied
        } else if self.allowed.contains(name) {
            EnvAccess::Allowed
        } else {
            EnvAccess::Unknown
        }
    }

    fn is_sensitive(&self, name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        self.sensitive_markers
            .iter()
            .any(|marker| upper.contains(&marker.to_ascii_uppercase()))
    }

    /// Keep only allow-listed entries of `source`
    pub fn filter<'a, I>(&self, source: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        source
            .into_iter()
            .filter(|(name, _)| self.classify(name) == EnvAccess::Allowed)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Per-unit environment view
///
/// Holds only the allow-listed subset of the source snapshot; nothing else
/// ever reaches the unit.
pub struct EnvironmentGate {
    execution_id: ExecutionId,
    policy: Arc<EnvironmentPolicy>,
    visible: AHashMap<String, String>,
    sink: Arc<dyn ViolationSink>,
}

impl EnvironmentGate {
    pub fn new(
        execution_id: ExecutionId,
        policy: Arc<EnvironmentPolicy>,
        source: &HashMap<String, String>,
        sink: Arc<dyn ViolationSink>,
    ) -> Self {
        let visible = policy.filter(source).into_iter().collect();
        Self {
            execution_id,
            policy,
            visible,
            sink,
        }
    }

    /// Read a value
    ///
    /// `Ok(None)` is returned both for unset allow-listed names and for
    /// unknown names; only the latter records a violation.
    pub fn get(&self, name: &str) -> Result<Option<String>, EnvironmentDenied> {
        match self.policy.classify(name) {
            EnvAccess::Allowed => Ok(self.visible.get(name).cloned()),
            EnvAccess::Denied => {
                self.record(
                    ViolationKind::EnvironmentDenied,
                    Severity::Critical,
                    format!("Read of sensitive environment variable '{}'", name),
                    name,
                );
                Err(EnvironmentDenied::Sensitive(name.to_string()))
            }
            EnvAccess::Unknown => {
                self.record(
                    ViolationKind::EnvironmentDenied,
                    Severity::High,
                    format!("Read of non-allow-listed environment variable '{}'", name),
                    name,
                );
                Ok(None)
            }
        }
    }

    /// Writes always fail: the view is immutable
    pub fn set(&self, name: &str, _value: &str) -> Result<(), EnvironmentDenied> {
        self.record(
            ViolationKind::EnvironmentDenied,
            Severity::High,
            format!("Attempt to modify environment variable '{}'", name),
            name,
        );
        Err(EnvironmentDenied::ReadOnly(name.to_string()))
    }

    /// List visible names; enumeration is treated as reconnaissance
    pub fn enumerate(&self) -> Vec<String> {
        self.record(
            ViolationKind::EnvironmentEnumeration,
            Severity::High,
            "Enumeration of environment variables".to_string(),
            "process.env",
        );
        let mut names: Vec<String> = self.visible.keys().cloned().collect();
        names.sort();
        names
    }

    /// Concrete map of the allow-listed entries, for injection into the unit
    pub fn create_safe_subset(&self) -> HashMap<String, String> {
        self.visible
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn record(&self, kind: ViolationKind, severity: Severity, description: String, subject: &str) {
        warn!(
            execution_id = %self.execution_id,
            variable = subject,
            severity = %severity,
            "{}",
            description
        );
        self.sink.record(
            Violation::new(kind, severity, ViolationSource::EnvironmentGate, description)
                .with_subject(subject),
        );
    }
}
