/*!
 * Core Types
 * Common types used across the sandbox
 */

use super::errors::SandboxError;
use super::limits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of one execution request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Arc<str>);

impl ExecutionId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source languages the execution unit can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    JavaScript,
}

impl Language {
    /// Resolve a caller-supplied language tag
    pub fn from_tag(tag: &str) -> Result<Self, SandboxError> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" | "ecmascript" => Ok(Self::JavaScript),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run untrusted source code
///
/// Fields are private: once a request has been handed to the coordinator it
/// cannot change underneath the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionRequest {
    #[serde(default = "ExecutionId::generate")]
    id: ExecutionId,
    source_code: Arc<str>,
    language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory_limit_bytes: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<Arc<str>>, language: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::generate(),
            source_code: source_code.into(),
            language: language.into(),
            timeout_ms: None,
            memory_limit_bytes: None,
        }
    }

    /// Shorthand for a JavaScript request
    pub fn javascript(source_code: impl Into<Arc<str>>) -> Self {
        Self::new(source_code, Language::JavaScript.as_str())
    }

    pub fn with_id(mut self, id: impl Into<ExecutionId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    #[inline]
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    #[inline]
    pub fn source_code(&self) -> &Arc<str> {
        &self.source_code
    }

    #[inline]
    pub fn language_tag(&self) -> &str {
        &self.language
    }

    #[inline]
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    #[inline]
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_bytes
    }
}

/// Resource limits enforced on every execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ResourceLimits {
    pub max_execution_time_ms: u64,
    pub max_cpu_time_ms: u64,
    pub max_heap_bytes: u64,
    pub max_rss_bytes: u64,
    pub max_buffer_bytes: u64,
    /// Memory sampling period
    pub sample_interval_ms: u64,
    /// Time sampling period
    pub timeout_sample_interval_ms: u64,
    pub growth_threshold_bytes: u64,
    pub growth_window_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time_ms: limits::DEFAULT_MAX_EXECUTION_TIME_MS,
            max_cpu_time_ms: limits::DEFAULT_MAX_CPU_TIME_MS,
            max_heap_bytes: limits::DEFAULT_MAX_HEAP_BYTES,
            max_rss_bytes: limits::DEFAULT_MAX_RSS_BYTES,
            max_buffer_bytes: limits::DEFAULT_MAX_BUFFER_BYTES,
            sample_interval_ms: limits::DEFAULT_MEMORY_SAMPLE_INTERVAL_MS,
            timeout_sample_interval_ms: limits::DEFAULT_TIMEOUT_SAMPLE_INTERVAL_MS,
            growth_threshold_bytes: limits::DEFAULT_GROWTH_THRESHOLD_BYTES,
            growth_window_ms: limits::DEFAULT_GROWTH_WINDOW_MS,
        }
    }
}

impl ResourceLimits {
    /// Apply a request's overrides, clamped to the caller's ceilings
    ///
    /// A timeout override also caps CPU time, since CPU time can never
    /// legitimately exceed wall time for a single-threaded unit.
    pub fn resolve(&self, request: &ExecutionRequest, ceilings: &LimitCeilings) -> Self {
        let mut resolved = *self;

        if let Some(timeout_ms) = request.timeout_ms() {
            let clamped = timeout_ms.clamp(limits::MIN_EXECUTION_TIME_MS, ceilings.max_execution_time_ms);
            resolved.max_execution_time_ms = clamped;
            resolved.max_cpu_time_ms = resolved.max_cpu_time_ms.min(clamped);
        }

        if let Some(bytes) = request.memory_limit_bytes() {
            resolved.max_heap_bytes = bytes.clamp(limits::MIN_HEAP_BYTES, ceilings.max_heap_bytes);
        }

        resolved
    }

    #[inline]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    #[inline]
    pub fn cpu_timeout(&self) -> Duration {
        Duration::from_millis(self.max_cpu_time_ms)
    }

    #[inline]
    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    #[inline]
    pub fn timeout_sample_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sample_interval_ms.max(1))
    }

    #[inline]
    pub fn growth_window(&self) -> Duration {
        Duration::from_millis(self.growth_window_ms)
    }
}

/// Upper bounds a request override may never exceed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LimitCeilings {
    pub max_execution_time_ms: u64,
    pub max_heap_bytes: u64,
}

impl Default for LimitCeilings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: limits::CEILING_EXECUTION_TIME_MS,
            max_heap_bytes: limits::CEILING_HEAP_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_tags() {
        assert_eq!(Language::from_tag("JavaScript").unwrap(), Language::JavaScript);
        assert_eq!(Language::from_tag(" js ").unwrap(), Language::JavaScript);
        assert!(matches!(
            Language::from_tag("cobol"),
            Err(SandboxError::UnsupportedLanguage(tag)) if tag == "cobol"
        ));
    }

    #[test]
    fn test_overrides_are_clamped_to_ceilings() {
        let defaults = ResourceLimits::default();
        let ceilings = LimitCeilings {
            max_execution_time_ms: 10_000,
            max_heap_bytes: 64 * 1024 * 1024,
        };

        let request = ExecutionRequest::javascript("1")
            .with_timeout_ms(999_999)
            .with_memory_limit_bytes(u64::MAX);
        let resolved = defaults.resolve(&request, &ceilings);

        assert_eq!(resolved.max_execution_time_ms, 10_000);
        assert_eq!(resolved.max_cpu_time_ms, 10_000);
        assert_eq!(resolved.max_heap_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_overrides_lower_limits() {
        let defaults = ResourceLimits::default();
        let request = ExecutionRequest::javascript("1")
            .with_timeout_ms(1_000)
            .with_memory_limit_bytes(16 * 1024 * 1024);
        let resolved = defaults.resolve(&request, &LimitCeilings::default());

        assert_eq!(resolved.max_execution_time_ms, 1_000);
        assert_eq!(resolved.max_cpu_time_ms, 1_000);
        assert_eq!(resolved.max_heap_bytes, 16 * 1024 * 1024);
        assert_eq!(resolved.max_rss_bytes, defaults.max_rss_bytes);
    }

    #[test]
    fn test_request_without_overrides_keeps_defaults() {
        let defaults = ResourceLimits::default();
        let request = ExecutionRequest::javascript("1");
        assert_eq!(defaults.resolve(&request, &LimitCeilings::default()), defaults);
    }

    #[test]
    fn test_request_deserializes_with_generated_id() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"source_code":"1+1","language":"js"}"#).unwrap();
        assert!(!request.id().as_str().is_empty());
        assert_eq!(request.timeout_ms(), None);
    }
}
