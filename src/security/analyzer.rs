/*!
 * Static Analyzer
 *
 * Heuristic pre-execution scan of source text. It never executes the
 * candidate and has no side effects. This is defense in depth, not a
 * security boundary: obfuscated code will get past it, and the runtime gates
 * are what actually enforce policy.
 */

use super::capability::CapabilityPolicy;
use super::types::{Severity, Violation, ViolationKind, ViolationSource};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// A fixed pattern and the finding it produces
struct PatternRule {
    regex: Regex,
    severity: Severity,
    description: &'static str,
}

impl PatternRule {
    fn new(pattern: &str, severity: Severity, description: &'static str) -> Self {
        Self {
            regex: Regex::new(pattern).expect("static analyzer pattern must compile"),
            severity,
            description,
        }
    }
}

static RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule::new(
            r"\bprocess\s*\.\s*(?:binding|dlopen)\b",
            Severity::Critical,
            "Native binding access",
        ),
        PatternRule::new(
            r"\bprocess\s*\.\s*(?:exit|abort|kill|reallyExit)\s*\(",
            Severity::High,
            "Direct process termination call",
        ),
        PatternRule::new(r"\beval\s*\(", Severity::High, "Dynamic code generation via eval"),
        PatternRule::new(
            r"\bnew\s+Function\s*\(|(?:^|[^.\w$])Function\s*\(",
            Severity::High,
            "Dynamic code generation via Function constructor",
        ),
        PatternRule::new(
            r#"\b(?:setTimeout|setInterval|setImmediate)\s*\(\s*['"`]"#,
            Severity::High,
            "Timer scheduled with a string callback",
        ),
        PatternRule::new(
            r#"\bconstructor\s*\.\s*constructor\b|\[\s*['"]constructor['"]\s*\]"#,
            Severity::High,
            "Constructor-chain escape attempt",
        ),
        PatternRule::new(
            r#"\brequire\s*\(\s*[^'"`\s)]"#,
            Severity::Medium,
            "Non-literal require argument",
        ),
        PatternRule::new(r"__proto__", Severity::Medium, "Prototype manipulation"),
    ]
});

/// `require("x")`, `import("x")`, `import a from "x"`, `import "x"`
static MODULE_ACQUISITION: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"\b(?:require|import)\s*\(\s*['"`]([^'"`]+)['"`]\s*\)"#,
        r#"\bimport\b[^;'"`]*?\bfrom\s*['"]([^'"]+)['"]"#,
        r#"\bimport\s*['"]([^'"]+)['"]"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("module acquisition pattern must compile"))
    .collect()
});

/// Pre-execution heuristic scanner
#[derive(Clone)]
pub struct StaticAnalyzer {
    policy: Arc<CapabilityPolicy>,
    max_source_bytes: usize,
}

impl StaticAnalyzer {
    pub fn new(policy: Arc<CapabilityPolicy>, max_source_bytes: usize) -> Self {
        Self {
            policy,
            max_source_bytes,
        }
    }

    /// Scan source text; findings are ordered by position
    pub fn scan(&self, code: &str) -> Vec<Violation> {
        let mut findings: Vec<(usize, Violation)> = Vec::new();

        if code.len() > self.max_source_bytes {
            findings.push((
                0,
                Violation::new(
                    ViolationKind::PatternDetected,
                    Severity::Medium,
                    ViolationSource::StaticAnalyzer,
                    format!(
                        "Source size {} bytes exceeds {} byte limit",
                        code.len(),
                        self.max_source_bytes
                    ),
                ),
            ));
        }

        for regex in MODULE_ACQUISITION.iter() {
            for captures in regex.captures_iter(code) {
                let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                    continue;
                };
                let module = CapabilityPolicy::normalize(name.as_str());
                if self.is_denied_module(module) {
                    findings.push((
                        whole.start(),
                        Violation::new(
                            ViolationKind::CapabilityDenied,
                            Severity::Critical,
                            ViolationSource::StaticAnalyzer,
                            format!("Acquisition of deny-listed capability '{}'", module),
                        )
                        .with_subject(module)
                        .with_line(line_of(code, whole.start())),
                    ));
                }
            }
        }

        for rule in RULES.iter() {
            for found in rule.regex.find_iter(code) {
                findings.push((
                    found.start(),
                    Violation::new(
                        ViolationKind::PatternDetected,
                        rule.severity,
                        ViolationSource::StaticAnalyzer,
                        rule.description,
                    )
                    .with_subject(found.as_str().trim())
                    .with_line(line_of(code, found.start())),
                ));
            }
        }

        findings.sort_by_key(|(offset, _)| *offset);
        findings.into_iter().map(|(_, violation)| violation).collect()
    }

    /// Whether any finding would block execution in strict mode
    pub fn is_blocking(findings: &[Violation]) -> bool {
        findings.iter().any(|v| v.severity.is_severe())
    }

    fn is_denied_module(&self, module: &str) -> bool {
        self.policy.denied_modules().any(|denied| {
            module == denied
                || module
                    .strip_prefix(denied)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// 1-based line number of a byte offset
fn line_of(code: &str, offset: usize) -> u32 {
    let end = offset.min(code.len());
    code.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> StaticAnalyzer {
        StaticAnalyzer::new(Arc::new(CapabilityPolicy::default()), 1024)
    }

    #[test]
    fn test_clean_code_has_no_findings() {
        assert!(analyzer().scan("console.log(2 + 2)").is_empty());
        assert!(analyzer().scan("const evaluate = (x) => x; evaluate(1)").is_empty());
    }

    #[test]
    fn test_denied_require_is_critical() {
        let findings = analyzer().scan("const fs = require('fs');");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].kind, ViolationKind::CapabilityDenied);
        assert_eq!(findings[0].subject.as_deref(), Some("fs"));
        assert_eq!(findings[0].line, Some(1));
    }

    #[test]
    fn test_node_prefix_and_subpath_are_denied() {
        let findings = analyzer().scan("import { readFile } from 'node:fs/promises'");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_allowed_require_is_not_flagged() {
        assert!(analyzer().scan("const path = require('path')").is_empty());
    }

    #[test]
    fn test_dynamic_code_patterns() {
        let findings = analyzer().scan("eval('1');\nnew Function('return 1');\nsetTimeout(\"x()\", 1)");
        let lines: Vec<u32> = findings.iter().filter_map(|f| f.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert!(findings.iter().all(|f| f.severity == Severity::High));
    }

    #[test]
    fn test_process_termination() {
        let findings = analyzer().scan("process.exit(1)");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[test]
    fn test_non_literal_require_is_medium() {
        let findings = analyzer().scan("const m = require(name)");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Medium);
        assert!(!StaticAnalyzer::is_blocking(&findings));
    }

    #[test]
    fn test_oversized_input() {
        let code = "1;".repeat(600);
        let findings = analyzer().scan(&code);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[0].line, None);
    }
}
