/*!
 * Security Report
 * Immutable per-execution aggregation of violations and resource usage
 */

use super::types::{
    is_safe, security_score, RiskLevel, SeverityCounts, Violation, ViolationKind,
};
use crate::core::serde::{is_false, system_time_micros};
use crate::core::types::ExecutionId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Memory usage summary of one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MemoryUsage {
    pub peak_heap_bytes: u64,
    pub peak_rss_bytes: u64,
    pub peak_buffer_bytes: u64,
    pub samples: usize,
    /// No memory ceiling was exceeded during the run
    pub safe: bool,
}

/// Security report for one execution
///
/// Built exactly once by [`ReportBuilder::build`] after the unit has
/// terminated; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SecurityReport {
    pub execution_id: ExecutionId,
    pub violations: Vec<Violation>,
    pub risk_level: RiskLevel,
    pub score: u8,
    pub safe: bool,
    pub peak_memory: u64,
    pub execution_time_ms: u64,
    pub cpu_time_ms: u64,
    pub timed_out: bool,
    pub memory_usage: MemoryUsage,
    #[serde(default, skip_serializing_if = "is_false")]
    pub static_rejection: bool,
    pub recommendations: Vec<String>,
    #[serde(with = "system_time_micros")]
    pub generated_at: SystemTime,
}

impl SecurityReport {
    pub fn counts(&self) -> SeverityCounts {
        SeverityCounts::of(&self.violations)
    }

    pub fn has_kind(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

/// Collects the inputs of a report
#[derive(Debug)]
pub struct ReportBuilder {
    execution_id: ExecutionId,
    violations: Vec<Violation>,
    execution_time_ms: u64,
    cpu_time_ms: u64,
    timed_out: bool,
    memory_usage: MemoryUsage,
    static_rejection: bool,
}

impl ReportBuilder {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            violations: Vec::new(),
            execution_time_ms: 0,
            cpu_time_ms: 0,
            timed_out: false,
            memory_usage: MemoryUsage {
                safe: true,
                ..MemoryUsage::default()
            },
            static_rejection: false,
        }
    }

    pub fn violations(mut self, violations: impl IntoIterator<Item = Violation>) -> Self {
        self.violations.extend(violations);
        self
    }

    pub fn timing(mut self, execution_time_ms: u64, cpu_time_ms: u64, timed_out: bool) -> Self {
        self.execution_time_ms = execution_time_ms;
        self.cpu_time_ms = cpu_time_ms;
        self.timed_out = timed_out;
        self
    }

    pub fn memory(mut self, memory_usage: MemoryUsage) -> Self {
        self.memory_usage = memory_usage;
        self
    }

    pub fn static_rejection(mut self) -> Self {
        self.static_rejection = true;
        self
    }

    pub fn build(mut self) -> SecurityReport {
        // Deterministic ordering regardless of the order channels were drained
        self.violations.sort_by_key(|v| v.timestamp);

        let risk_level = RiskLevel::assess(&self.violations);
        let score = security_score(&self.violations);
        let safe = is_safe(&self.violations);
        if self.violations.iter().any(|v| v.kind == ViolationKind::MemoryExceeded) {
            self.memory_usage.safe = false;
        }
        let recommendations = recommendations(&self.violations, self.timed_out);

        SecurityReport {
            execution_id: self.execution_id,
            risk_level,
            score,
            safe,
            peak_memory: self.memory_usage.peak_heap_bytes,
            execution_time_ms: self.execution_time_ms,
            cpu_time_ms: self.cpu_time_ms,
            timed_out: self.timed_out,
            memory_usage: self.memory_usage,
            static_rejection: self.static_rejection,
            recommendations,
            generated_at: SystemTime::now(),
            violations: self.violations,
        }
    }
}

fn recommendations(violations: &[Violation], timed_out: bool) -> Vec<String> {
    let mut out = Vec::new();
    let any = |kind: ViolationKind| violations.iter().any(|v| v.kind == kind);

    if any(ViolationKind::CapabilityDenied) {
        out.push("Remove use of restricted modules and process controls".to_string());
    }
    if any(ViolationKind::PatternDetected) {
        out.push("Avoid dynamic code generation and prototype manipulation".to_string());
    }
    if timed_out || any(ViolationKind::Timeout) {
        out.push("Bound loops and recursion so execution finishes within the time limit".to_string());
    }
    if any(ViolationKind::MemoryExceeded) || any(ViolationKind::GrowthAnomaly) {
        out.push("Reduce memory allocation or process data in smaller chunks".to_string());
    }
    if any(ViolationKind::EnvironmentDenied) || any(ViolationKind::EnvironmentEnumeration) {
        out.push("Read only allow-listed configuration values by name".to_string());
    }
    out
}

/// Outcome of one execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub output: String,
    pub errors: Vec<String>,
    pub timed_out: bool,
    pub report: SecurityReport,
}

impl ExecutionResult {
    /// Failed result carrying a single error and an otherwise empty report
    pub fn rejected(execution_id: ExecutionId, error: impl Into<String>) -> Self {
        let report = ReportBuilder::new(execution_id.clone()).build();
        Self {
            execution_id,
            success: false,
            output: String::new(),
            errors: vec![error.into()],
            timed_out: false,
            report,
        }
    }
}
