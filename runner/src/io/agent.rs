//! Agent spawning abstraction.
//!
//! The [`AgentSpawner`] trait decouples orchestration from the agent CLI.
//! Tests use scripted spawners that return predetermined exits (and may edit
//! the quest file the way a real agent would) without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::AgentRole;
use crate::io::process::{run_captured, run_inherited, write_output_log};

/// Parameters for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    /// Step being executed; `None` for repair runs.
    pub step_id: Option<String>,
    /// Fully rendered prompt.
    pub prompt: String,
    /// Project root; the agent's working directory.
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Where captured output goes when stdio is not inherited.
    pub log_path: PathBuf,
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// The process exited on its own. `-1` when killed by a signal.
    Exited { code: i32 },
    /// Killed after exceeding the request timeout.
    TimedOut { after: Duration },
    /// The process could not be started.
    SpawnFailed { reason: String },
}

impl AgentExit {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentExit::Exited { code: 0 })
    }

    /// Short description suitable for `errorMessage`.
    pub fn describe(&self) -> String {
        match self {
            AgentExit::Exited { code: 0 } => "exited successfully".to_string(),
            AgentExit::Exited { code } => format!("agent exited with code {}", code),
            AgentExit::TimedOut { after } => {
                format!("agent timed out after {}ms", after.as_millis())
            }
            AgentExit::SpawnFailed { reason } => format!("agent failed to start: {}", reason),
        }
    }
}

/// Abstraction over agent backends.
///
/// Implementations block until the agent ends; the orchestrator calls them
/// from blocking worker threads.
pub trait AgentSpawner: Send + Sync {
    fn spawn(&self, request: &AgentRequest) -> AgentExit;
}

/// Spawner that launches an agent CLI with the prompt as its last argument.
#[derive(Debug, Clone)]
pub struct ProcessAgentSpawner {
    pub command: String,
    pub args: Vec<String>,
    pub inherit_stdio: bool,
    pub output_limit_bytes: usize,
}

impl AgentSpawner for ProcessAgentSpawner {
    #[instrument(skip_all, fields(role = %request.role, step_id = ?request.step_id, timeout_secs = request.timeout.as_secs()))]
    fn spawn(&self, request: &AgentRequest) -> AgentExit {
        let Some(program) = resolve_executable(&self.command, &request.workdir) else {
            warn!(command = %self.command, "agent command not found");
            return AgentExit::SpawnFailed {
                reason: format!("command '{}' not found", self.command),
            };
        };

        info!(program = %program.display(), "starting agent");
        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .arg(&request.prompt)
            .current_dir(&request.workdir);

        if self.inherit_stdio {
            return match run_inherited(cmd, request.timeout) {
                Ok(outcome) if outcome.timed_out => AgentExit::TimedOut {
                    after: request.timeout,
                },
                Ok(outcome) => AgentExit::Exited {
                    code: outcome.status.code().unwrap_or(-1),
                },
                Err(err) => AgentExit::SpawnFailed {
                    reason: format!("{err:#}"),
                },
            };
        }

        let output = match run_captured(cmd, request.timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                return AgentExit::SpawnFailed {
                    reason: format!("{err:#}"),
                };
            }
        };
        if let Err(err) = write_output_log(&request.log_path, &output, "agent") {
            warn!(err = %err, path = %request.log_path.display(), "failed to write agent log");
        }

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return AgentExit::TimedOut {
                after: request.timeout,
            };
        }
        let code = output.status.code().unwrap_or(-1);
        debug!(code, "agent finished");
        AgentExit::Exited { code }
    }
}

/// Resolve an agent command: an explicit path, then
/// `<project>/node_modules/.bin/<command>`, then `PATH`.
pub fn resolve_executable(command: &str, project: &Path) -> Option<PathBuf> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains(std::path::MAIN_SEPARATOR) || trimmed.contains('/') {
        let candidate = Path::new(trimmed);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            project.join(candidate)
        };
        return is_executable(&candidate).then_some(candidate);
    }

    let local_bin = project.join("node_modules").join(".bin");
    if let Some(found) = find_executable_in_dirs(trimmed, std::slice::from_ref(&local_bin)) {
        return Some(found);
    }
    let path_var = std::env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
    find_executable_in_dirs(trimmed, &dirs)
}

fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}
