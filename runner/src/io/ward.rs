//! Ward gate adapter: runs the project's check commands and parses findings.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::ward::{
    Diagnostic, RULE_COMMAND_EXIT, RULE_COMMAND_TIMEOUT, RULE_UNKNOWN, Severity, WardResult,
};
use crate::io::agent::resolve_executable;
use crate::io::process::run_captured;

/// Lines of output kept in a synthetic `ward/exit` diagnostic.
const EXIT_TAIL_LINES: usize = 20;

/// Parameters for one gate run.
#[derive(Debug, Clone)]
pub struct WardRequest {
    pub workdir: PathBuf,
    /// Files the quest changed, appended to gate commands when scoping is on.
    pub scope: Vec<String>,
}

/// Abstraction over the project's check pipeline.
///
/// `Err` is reserved for failures of the runner itself; a failing or hung
/// check command is a failed [`WardResult`].
pub trait WardGate: Send + Sync {
    fn run(&self, request: &WardRequest) -> Result<WardResult>;
}

/// Gate that runs each configured command in order.
///
/// Passes iff every command exits 0.
#[derive(Debug, Clone)]
pub struct CommandWardGate {
    pub commands: Vec<Vec<String>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub pass_scope: bool,
}

impl WardGate for CommandWardGate {
    #[instrument(skip_all, fields(commands = self.commands.len(), scope = request.scope.len()))]
    fn run(&self, request: &WardRequest) -> Result<WardResult> {
        let mut passed = true;
        let mut diagnostics = Vec::new();

        for argv in &self.commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let label = argv.join(" ");
            let resolved = resolve_executable(program, &request.workdir)
                .unwrap_or_else(|| PathBuf::from(program));
            let mut cmd = Command::new(resolved);
            cmd.args(args).current_dir(&request.workdir);
            if self.pass_scope {
                cmd.args(&request.scope);
            }

            info!(command = %label, "running ward command");
            let output =
                match run_captured(cmd, self.timeout, self.output_limit_bytes) {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(command = %label, err = %err, "ward command failed to start");
                        passed = false;
                        diagnostics.push(Diagnostic::general(
                            RULE_COMMAND_EXIT,
                            format!("{} failed to start: {:#}", label, err),
                        ));
                        continue;
                    }
                };

            if output.timed_out {
                passed = false;
                diagnostics.push(Diagnostic::general(
                    RULE_COMMAND_TIMEOUT,
                    format!("{} timed out after {}ms", label, self.timeout.as_millis()),
                ));
                continue;
            }
            if output.status.success() {
                debug!(command = %label, "ward command passed");
                continue;
            }

            passed = false;
            let stdout = output.stdout.text();
            let stderr = output.stderr.text();
            let parsed = parse_ward_output(&stdout, &stderr, &request.workdir);
            if parsed.is_empty() {
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "a signal".to_string(), |c| format!("code {}", c));
                diagnostics.push(Diagnostic::general(
                    RULE_COMMAND_EXIT,
                    format!("{} exited with {}{}", label, code, output_tail(&stdout, &stderr)),
                ));
            } else {
                debug!(command = %label, diagnostics = parsed.len(), "parsed ward findings");
                diagnostics.extend(parsed);
            }
        }

        Ok(WardResult {
            passed,
            diagnostics,
        })
    }
}

fn output_tail(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }
    let start = lines.len().saturating_sub(EXIT_TAIL_LINES);
    format!("\n{}", lines[start..].join("\n"))
}

/// Structured report emitted by Ward-style runners (`--json`).
#[derive(Debug, Deserialize)]
struct WardReport {
    checks: Vec<CheckReport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport {
    #[serde(default)]
    check_type: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    project_results: Vec<ProjectResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<ReportedError>,
    #[serde(default)]
    test_failures: Vec<ReportedTestFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportedError {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    column: Option<u32>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default, alias = "ruleId", alias = "code")]
    rule: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportedTestFailure {
    #[serde(default, alias = "filePath")]
    suite_path: Option<String>,
    #[serde(default)]
    test_name: Option<String>,
    #[serde(default)]
    message: String,
}

/// Parse gate output: a JSON report on stdout first, else compiler-style lines.
pub fn parse_ward_output(stdout: &str, stderr: &str, workdir: &Path) -> Vec<Diagnostic> {
    if let Some(diagnostics) = parse_json_report(stdout, workdir) {
        return diagnostics;
    }
    let mut diagnostics = parse_text_lines(stdout, workdir);
    diagnostics.extend(parse_text_lines(stderr, workdir));
    diagnostics
}

fn parse_json_report(stdout: &str, workdir: &Path) -> Option<Vec<Diagnostic>> {
    let start = stdout.find('{')?;
    let report: WardReport = serde_json::from_str(stdout[start..].trim_end()).ok()?;

    let mut diagnostics = Vec::new();
    for check in report.checks {
        let check_rule = if check.check_type.is_empty() {
            "ward/check".to_string()
        } else {
            format!("ward/{}", check.check_type)
        };
        let mut reported = 0usize;
        for project in &check.project_results {
            for error in &project.errors {
                diagnostics.push(Diagnostic {
                    file: error.file_path.as_deref().map(|p| relativize(p, workdir)),
                    line: error.line,
                    column: error.column,
                    severity: error
                        .severity
                        .as_deref()
                        .map_or(Severity::Error, Severity::parse),
                    rule: error.rule.clone().unwrap_or_else(|| check_rule.clone()),
                    message: error.message.clone(),
                });
                reported += 1;
            }
            for failure in &project.test_failures {
                let message = match &failure.test_name {
                    Some(name) => format!("{}: {}", name, failure.message),
                    None => failure.message.clone(),
                };
                diagnostics.push(Diagnostic {
                    file: failure.suite_path.as_deref().map(|p| relativize(p, workdir)),
                    line: None,
                    column: None,
                    severity: Severity::Error,
                    rule: format!("{}/test-failure", check_rule),
                    message,
                });
                reported += 1;
            }
        }
        let failed = check.status == "fail"
            || check.project_results.iter().any(|p| p.status == "fail");
        if failed && reported == 0 {
            diagnostics.push(Diagnostic::general(
                check_rule,
                format!("{} check failed without details", check.check_type),
            ));
        }
    }
    Some(diagnostics)
}

/// `path/file.ts:10:5 - error TS2322: message` (tsc style).
static TSC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<file>[^\s:][^:]*):(?P<line>\d+):(?P<col>\d+)\s+-\s+(?P<sev>error|warning|info)\s+(?P<rule>[^\s:]+):\s*(?P<msg>.*)$",
    )
    .expect("tsc line pattern")
});

/// `path/file.ts:10:5: error: message [rule]` (gcc/eslint-unix style).
static UNIX_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<file>[^\s:][^:]*):(?P<line>\d+):(?P<col>\d+):\s*(?P<sev>error|warning|info)\s*:?\s*(?P<msg>.*?)(?:\s+\[(?P<rule>[^\]]+)\])?\s*$",
    )
    .expect("unix line pattern")
});

fn parse_text_lines(text: &str, workdir: &Path) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for line in text.lines() {
        let Some(caps) = TSC_LINE.captures(line).or_else(|| UNIX_LINE.captures(line)) else {
            continue;
        };
        let field = |name: &str| caps.name(name).map(|m| m.as_str());
        diagnostics.push(Diagnostic {
            file: field("file").map(|f| relativize(f.trim(), workdir)),
            line: field("line").and_then(|v| v.parse().ok()),
            column: field("col").and_then(|v| v.parse().ok()),
            severity: field("sev").map_or(Severity::Error, Severity::parse),
            rule: field("rule").unwrap_or(RULE_UNKNOWN).to_string(),
            message: field("msg").unwrap_or_default().trim().to_string(),
        });
    }
    diagnostics
}

/// Strip `workdir` from absolute paths inside the project.
fn relativize(path: &str, workdir: &Path) -> String {
    Path::new(path)
        .strip_prefix(workdir)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string())
}
