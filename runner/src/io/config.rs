//! Orchestrator configuration stored under `<project>/.quests/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Relative location of the config file inside a project.
pub const CONFIG_RELATIVE_PATH: &str = ".quests/config.toml";

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuestConfig {
    /// Number of agents that may run at once.
    pub slot_count: usize,

    /// Wall-clock limit for one agent run, in milliseconds.
    pub timeout_ms: u64,

    /// Repair agent spawns allowed after a failing Ward gate. `0` disables repair.
    pub max_spirit_loop_iterations: u32,

    /// Upper bound on the arguments text substituted into a prompt.
    pub prompt_budget_bytes: usize,

    pub agent: AgentConfig,

    pub ward: WardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI to launch (resolved via `node_modules/.bin` then `PATH`).
    pub command: String,

    /// Arguments placed before the rendered prompt.
    pub args: Vec<String>,

    /// Give agents the terminal. When false, output goes to
    /// `<quest folder>/agent-logs/<step id>.log`.
    pub inherit_stdio: bool,

    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardConfig {
    /// Gate commands, run in order (e.g. `[["npm","run","ward:all"]]`).
    pub commands: Vec<Vec<String>>,

    /// Per-command timeout in milliseconds.
    pub timeout_ms: u64,

    /// Truncate captured gate output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Append the quest's changed files to each gate command.
    pub pass_scope: bool,

    /// Take a gate snapshot before execution and only block on new rule violations.
    pub baseline: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            inherit_stdio: true,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for WardConfig {
    fn default() -> Self {
        Self {
            commands: vec![vec![
                "npm".to_string(),
                "run".to_string(),
                "ward:all".to_string(),
            ]],
            timeout_ms: 10 * 60 * 1000,
            output_limit_bytes: 1_000_000,
            pass_scope: false,
            baseline: false,
        }
    }
}

impl Default for QuestConfig {
    fn default() -> Self {
        Self {
            slot_count: 3,
            timeout_ms: 30 * 60 * 1000,
            max_spirit_loop_iterations: 3,
            prompt_budget_bytes: 64 * 1024,
            agent: AgentConfig::default(),
            ward: WardConfig::default(),
        }
    }
}

impl QuestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(anyhow!("slot_count must be > 0"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.ward.commands.is_empty() {
            return Err(anyhow!("ward.commands must contain at least one command"));
        }
        for (index, command) in self.ward.commands.iter().enumerate() {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("ward.commands[{}] must be a non-empty array", index));
            }
        }
        if self.ward.timeout_ms == 0 {
            return Err(anyhow!("ward.timeout_ms must be > 0"));
        }
        if self.ward.output_limit_bytes == 0 {
            return Err(anyhow!("ward.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ward_timeout(&self) -> Duration {
        Duration::from_millis(self.ward.timeout_ms)
    }
}

/// Config path for a project root.
pub fn config_path(project: &Path) -> PathBuf {
    project.join(CONFIG_RELATIVE_PATH)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `QuestConfig::default()`.
pub fn load_config(path: &Path) -> Result<QuestConfig> {
    if !path.exists() {
        let cfg = QuestConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: QuestConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &QuestConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
