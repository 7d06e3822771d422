//! Ward gate results and their pure analysis.
//!
//! The gate itself runs in [`crate::io::ward`]; this module only sorts, groups
//! and compares its diagnostics.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Rule id for a gate command that exited non-zero without parseable errors.
pub const RULE_COMMAND_EXIT: &str = "ward/exit";
/// Rule id for a gate command that exceeded its timeout.
pub const RULE_COMMAND_TIMEOUT: &str = "ward/timeout";
/// Rule id for an error line with no rule code.
pub const RULE_UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warning" | "warn" => Severity::Warning,
            "info" | "note" | "hint" => Severity::Info,
            _ => Severity::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// One reported problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub severity: Severity,
    pub rule: String,
    pub message: String,
}

impl Diagnostic {
    /// Diagnostic with no source location.
    pub fn general(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            column: None,
            severity: Severity::Error,
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// `file:line:column`, with missing parts omitted.
    pub fn location(&self) -> String {
        let mut out = self.file.clone().unwrap_or_else(|| "<general>".to_string());
        if let Some(line) = self.line {
            out.push_str(&format!(":{}", line));
            if let Some(column) = self.column {
                out.push_str(&format!(":{}", column));
            }
        }
        out
    }
}

/// File, then line, then column. Located diagnostics sort before general ones.
fn by_position(a: &Diagnostic, b: &Diagnostic) -> Ordering {
    let file = match (&a.file, &b.file) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    file.then_with(|| a.line.cmp(&b.line))
        .then_with(|| a.column.cmp(&b.column))
        .then_with(|| a.message.cmp(&b.message))
}

/// Outcome of one gate run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardResult {
    pub passed: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// All diagnostics sharing one rule id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGroup {
    pub rule: String,
    /// Occurrences ordered by file, line, column.
    pub occurrences: Vec<Diagnostic>,
}

impl RuleGroup {
    pub fn count(&self) -> usize {
        self.occurrences.len()
    }
}

impl WardResult {
    pub fn passing() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn failing(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            passed: false,
            diagnostics,
        }
    }

    pub fn sorted_diagnostics(&self) -> Vec<Diagnostic> {
        let mut sorted = self.diagnostics.clone();
        sorted.sort_by(by_position);
        sorted
    }

    /// Diagnostics grouped by rule id, groups in rule order.
    pub fn by_rule(&self) -> Vec<RuleGroup> {
        let mut groups: BTreeMap<&str, Vec<Diagnostic>> = BTreeMap::new();
        for diagnostic in &self.diagnostics {
            groups
                .entry(diagnostic.rule.as_str())
                .or_default()
                .push(diagnostic.clone());
        }
        groups
            .into_iter()
            .map(|(rule, mut occurrences)| {
                occurrences.sort_by(by_position);
                RuleGroup {
                    rule: rule.to_string(),
                    occurrences,
                }
            })
            .collect()
    }

    /// Diagnostics keyed by file, files sorted, located diagnostics only.
    pub fn by_file(&self) -> BTreeMap<String, Vec<Diagnostic>> {
        let mut files: BTreeMap<String, Vec<Diagnostic>> = BTreeMap::new();
        for diagnostic in self.sorted_diagnostics() {
            if let Some(file) = &diagnostic.file {
                files.entry(file.clone()).or_default().push(diagnostic);
            }
        }
        files
    }

    /// Diagnostics without a file path.
    pub fn general(&self) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.file.is_none()).collect()
    }

    /// One-line description for logs and `executionLog` entries.
    pub fn summary(&self) -> String {
        if self.passed {
            return "passed".to_string();
        }
        let rules: Vec<String> = self
            .by_rule()
            .iter()
            .map(|group| format!("{} x{}", group.rule, group.count()))
            .collect();
        if rules.is_empty() {
            "failed".to_string()
        } else {
            format!("failed: {}", rules.join(", "))
        }
    }
}

/// Rule-level comparison of a gate run against a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WardDiff {
    /// Rules absent from the baseline.
    pub introduced: Vec<RuleGroup>,
    /// Rules already present in the baseline.
    pub preexisting: Vec<RuleGroup>,
}

impl WardDiff {
    /// True if the run introduced a rule violation the baseline did not have.
    pub fn blocks(&self) -> bool {
        !self.introduced.is_empty()
    }
}

/// Split `current` diagnostics into introduced and pre-existing rule groups.
pub fn diff_against_baseline(baseline: &WardResult, current: &WardResult) -> WardDiff {
    let known: BTreeSet<&str> = baseline.diagnostics.iter().map(|d| d.rule.as_str()).collect();
    let mut diff = WardDiff::default();
    for group in current.by_rule() {
        if known.contains(group.rule.as_str()) {
            diff.preexisting.push(group);
        } else {
            diff.introduced.push(group);
        }
    }
    diff
}

/// Whether a gate run lets the quest complete.
///
/// Without a baseline the run must pass outright. With one, only rules the
/// baseline did not already report block completion.
pub fn gate_passes(current: &WardResult, baseline: Option<&WardResult>) -> bool {
    if current.passed {
        return true;
    }
    match baseline {
        Some(baseline) => !diff_against_baseline(baseline, current).blocks(),
        None => false,
    }
}
