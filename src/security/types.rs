/*!
 * Security Types
 * Violations, severities and risk classification shared by every gate and supervisor
 */

use crate::core::serde::{is_none, system_time_micros};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Severity of a recorded violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Score penalty applied per violation of this severity
    #[inline]
    pub const fn penalty(self) -> u32 {
        match self {
            Severity::Critical => 50,
            Severity::High => 20,
            Severity::Medium => 10,
            Severity::Low => 0,
        }
    }

    #[inline]
    pub fn is_severe(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What kind of policy breach a violation records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    CapabilityDenied,
    PatternDetected,
    Timeout,
    MemoryExceeded,
    GrowthAnomaly,
    EnvironmentDenied,
    EnvironmentEnumeration,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ViolationKind::CapabilityDenied => write!(f, "capability-denied"),
            ViolationKind::PatternDetected => write!(f, "pattern-detected"),
            ViolationKind::Timeout => write!(f, "timeout"),
            ViolationKind::MemoryExceeded => write!(f, "memory-exceeded"),
            ViolationKind::GrowthAnomaly => write!(f, "growth-anomaly"),
            ViolationKind::EnvironmentDenied => write!(f, "environment-denied"),
            ViolationKind::EnvironmentEnumeration => write!(f, "environment-enumeration"),
        }
    }
}

/// Component that recorded a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationSource {
    StaticAnalyzer,
    CapabilityGate,
    EnvironmentGate,
    TimeoutSupervisor,
    MemorySupervisor,
    ExecutionUnit,
}

/// A recorded policy breach or suspicious pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub description: String,
    #[serde(with = "system_time_micros")]
    pub timestamp: SystemTime,
    pub source: ViolationSource,
    /// Capability, variable or resource the violation concerns
    #[serde(default, skip_serializing_if = "is_none")]
    pub subject: Option<String>,
    /// 1-based source line, for static findings
    #[serde(default, skip_serializing_if = "is_none")]
    pub line: Option<u32>,
}

impl Violation {
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        source: ViolationSource,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            timestamp: SystemTime::now(),
            source,
            subject: None,
            line: None,
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    #[inline]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.description)
    }
}

/// Aggregate risk classification of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a violation multiset
    ///
    /// Critical if any critical; high if more than two highs; medium if any
    /// high or more than three mediums; low otherwise.
    pub fn assess(violations: &[Violation]) -> Self {
        let counts = SeverityCounts::of(violations);
        if counts.critical > 0 {
            RiskLevel::Critical
        } else if counts.high > 2 {
            RiskLevel::High
        } else if counts.high > 0 || counts.medium > 3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Per-severity violation counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn of(violations: &[Violation]) -> Self {
        violations.iter().fold(Self::default(), |mut acc, v| {
            match v.severity {
                Severity::Critical => acc.critical += 1,
                Severity::High => acc.high += 1,
                Severity::Medium => acc.medium += 1,
                Severity::Low => acc.low += 1,
            }
            acc
        })
    }
}

/// Security score: 100 minus per-severity penalties, floored at 0
pub fn security_score(violations: &[Violation]) -> u8 {
    let penalty: u32 = violations.iter().map(|v| v.severity.penalty()).sum();
    100u32.saturating_sub(penalty) as u8
}

/// Safe iff no critical and no high violations
pub fn is_safe(violations: &[Violation]) -> bool {
    !violations.iter().any(|v| v.severity.is_severe())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(severity: Severity) -> Violation {
        Violation::new(
            ViolationKind::PatternDetected,
            severity,
            ViolationSource::StaticAnalyzer,
            "test",
        )
    }

    fn many(severity: Severity, n: usize) -> Vec<Violation> {
        (0..n).map(|_| violation(severity)).collect()
    }

    #[test]
    fn test_score_penalties() {
        assert_eq!(security_score(&[]), 100);
        assert_eq!(security_score(&many(Severity::Critical, 1)), 50);
        assert_eq!(security_score(&many(Severity::High, 2)), 60);
        assert_eq!(security_score(&many(Severity::Medium, 3)), 70);
        assert_eq!(security_score(&many(Severity::Low, 10)), 100);
        assert_eq!(security_score(&many(Severity::Critical, 3)), 0);
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::assess(&[]), RiskLevel::Low);
        assert_eq!(RiskLevel::assess(&many(Severity::Low, 5)), RiskLevel::Low);
        assert_eq!(RiskLevel::assess(&many(Severity::Medium, 3)), RiskLevel::Low);
        assert_eq!(RiskLevel::assess(&many(Severity::Medium, 4)), RiskLevel::Medium);
        assert_eq!(RiskLevel::assess(&many(Severity::High, 1)), RiskLevel::Medium);
        assert_eq!(RiskLevel::assess(&many(Severity::High, 2)), RiskLevel::Medium);
        assert_eq!(RiskLevel::assess(&many(Severity::High, 3)), RiskLevel::High);
        assert_eq!(RiskLevel::assess(&many(Severity::Critical, 1)), RiskLevel::Critical);
    }

    #[test]
    fn test_safety() {
        assert!(is_safe(&many(Severity::Medium, 10)));
        assert!(!is_safe(&many(Severity::High, 1)));
        assert!(!is_safe(&many(Severity::Critical, 1)));
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ViolationKind::CapabilityDenied).unwrap();
        assert_eq!(json, "\"capability-denied\"");
        let json = serde_json::to_string(&RiskLevel::Low).unwrap();
        assert_eq!(json, "\"LOW\"");
    }
}
