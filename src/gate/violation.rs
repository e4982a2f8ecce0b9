//! The shared finding/report shapes produced by every scanner layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Advisory,
    Warning,
    Error,
}

impl Severity {
    /// Violations at or above this severity count toward a blocking layer's
    /// blocking count.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::Error | Severity::Warning)
    }
}

/// One finding from a scanner. `(code, file_path, line)` is the
/// deduplication key used by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub layer: u8,
    pub severity: Severity,
    pub service: String,
    pub file_path: String,
    pub line: u32,
    pub message: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub suggested_fix: String,
}

impl Violation {
    pub fn dedup_key(&self) -> (String, String, u32) {
        (self.code.clone(), self.file_path.clone(), self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    AdvisoryOnly,
}

impl Verdict {
    /// `fail` > `advisory_only` > `pass`.
    fn rank(self) -> u8 {
        match self {
            Verdict::Fail => 2,
            Verdict::AdvisoryOnly => 1,
            Verdict::Pass => 0,
        }
    }

    pub fn combine(self, other: Verdict) -> Verdict {
        if self.rank() >= other.rank() { self } else { other }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerResult {
    pub layer: u8,
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub blocking_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub verdict: Verdict,
    pub layer_results: Vec<LayerResult>,
    pub violations: Vec<Violation>,
    pub fix_attempt: u32,
    pub recommendations: Vec<String>,
}

/// Collapses duplicate `(code, file_path, line)` tuples across all layers,
/// keeping the highest-severity copy of each.
pub fn dedup_violations(violations: Vec<Violation>) -> Vec<Violation> {
    use std::collections::HashMap;

    let mut by_key: HashMap<(String, String, u32), Violation> = HashMap::new();
    for violation in violations {
        let key = violation.dedup_key();
        match by_key.get(&key) {
            Some(existing) if existing.severity >= violation.severity => {}
            _ => {
                by_key.insert(key, violation);
            }
        }
    }
    let mut out: Vec<Violation> = by_key.into_values().collect();
    out.sort_by(|a, b| (&a.code, &a.file_path, a.line).cmp(&(&b.code, &b.file_path, &b.line)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(code: &str, severity: Severity) -> Violation {
        Violation {
            code: code.to_string(),
            layer: 3,
            severity,
            service: "auth".to_string(),
            file_path: "auth/src/main.rs".to_string(),
            line: 10,
            message: "finding".to_string(),
            evidence: String::new(),
            suggested_fix: String::new(),
        }
    }

    #[test]
    fn dedup_collapses_same_key_keeping_highest_severity() {
        let violations = vec![
            violation("SEC-001", Severity::Warning),
            violation("SEC-001", Severity::Error),
        ];
        let deduped = dedup_violations(violations);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].severity, Severity::Error);
    }

    #[test]
    fn dedup_keeps_distinct_keys() {
        let mut b = violation("SEC-002", Severity::Warning);
        b.line = 20;
        let deduped = dedup_violations(vec![violation("SEC-001", Severity::Warning), b]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn verdict_precedence_is_fail_over_advisory_over_pass() {
        assert_eq!(Verdict::Fail.combine(Verdict::Pass), Verdict::Fail);
        assert_eq!(Verdict::AdvisoryOnly.combine(Verdict::Pass), Verdict::AdvisoryOnly);
        assert_eq!(Verdict::Pass.combine(Verdict::Fail), Verdict::Fail);
    }

    #[test]
    fn blocking_severities_are_error_and_warning() {
        assert!(Severity::Error.is_blocking());
        assert!(Severity::Warning.is_blocking());
        assert!(!Severity::Advisory.is_blocking());
        assert!(!Severity::Info.is_blocking());
    }
}
