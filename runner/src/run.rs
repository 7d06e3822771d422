//! Orchestration entry point: one quest from `approved` to a terminal status.
//!
//! Phases run in order: Executing (drive the step graph), Validating (Ward
//! gate), Repairing (bounded repair loop). Only a stalled graph or an
//! exhausted repair budget ends a run as failed; per-step failures are
//! absorbed by the graph.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::readiness::StallReport;
use crate::core::types::AgentRole;
use crate::core::ward::{WardResult, gate_passes};
use crate::error::QuestError;
use crate::io::agent::{AgentExit, ProcessAgentSpawner};
use crate::io::config::QuestConfig;
use crate::io::prompt::PromptRegistry;
use crate::io::quest_store::{load_quest, set_quest_status, set_step_status};
use crate::io::ward::CommandWardGate;
use crate::orchestrate::{ExecutionOutcome, Orchestrator};
use crate::quest::{LogEntry, QuestStatus, StepStatus};
use crate::slots::SlotPool;

/// Inputs for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub project_path: PathBuf,
    pub quest_path: PathBuf,
    pub slot_count: usize,
    /// Per-dispatch limit.
    pub timeout: Duration,
    /// `0` disables repair.
    pub max_spirit_loop_iterations: u32,
    pub prompt_budget_bytes: usize,
    /// Snapshot the gate before execution and block only on new rules.
    pub ward_baseline: bool,
}

impl RunRequest {
    pub fn from_config(project_path: &Path, quest_path: &Path, cfg: &QuestConfig) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            quest_path: quest_path.to_path_buf(),
            slot_count: cfg.slot_count,
            timeout: cfg.agent_timeout(),
            max_spirit_loop_iterations: cfg.max_spirit_loop_iterations,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
            ward_baseline: cfg.ward.baseline,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(anyhow!("slot count must be > 0"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt budget must be > 0"));
        }
        Ok(())
    }
}

/// Coarse run phase, reported through [`RunEvent::PhaseChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Executing,
    Validating,
    Repairing,
    Complete,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Executing => "executing",
            Phase::Validating => "validating",
            Phase::Repairing => "repairing",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notifications for observers (the CLI prints them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    PhaseChanged(Phase),
    StepDispatched {
        step_id: String,
        role: AgentRole,
        lane: usize,
        round: u32,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
        exit: AgentExit,
    },
    WardFinished {
        label: String,
        passed: bool,
        diagnostics: usize,
    },
    RepairAttempt {
        attempt: u32,
        max: u32,
    },
}

/// Why a run ended as failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RunFailure {
    /// No step can make progress and some step is not complete.
    Stalled(StallReport),
    /// The repair budget ran out with the gate still failing.
    RepairExhausted { iterations: u32, last: WardResult },
}

impl RunFailure {
    pub fn summary(&self) -> String {
        match self {
            RunFailure::Stalled(report) => format!("stalled: {}", report.summary()),
            RunFailure::RepairExhausted { iterations, last } => format!(
                "repair exhausted after {} attempt(s): ward {}",
                iterations,
                last.summary()
            ),
        }
    }
}

/// Summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub completed: bool,
    pub failure: Option<RunFailure>,
    /// Dispatch rounds in the execution phase.
    pub rounds: u32,
    /// Step agents dispatched in the execution phase.
    pub dispatches: u32,
    pub repair_spawns: u32,
}

impl RunOutcome {
    fn completed(rounds: u32, dispatches: u32, repair_spawns: u32) -> Self {
        Self {
            completed: true,
            failure: None,
            rounds,
            dispatches,
            repair_spawns,
        }
    }
}

impl Orchestrator {
    /// Orchestrator backed by real processes, configured for `project`.
    pub fn from_config(project: &Path, cfg: &QuestConfig) -> Result<Self> {
        let spawner = ProcessAgentSpawner {
            command: cfg.agent.command.clone(),
            args: cfg.agent.args.clone(),
            inherit_stdio: cfg.agent.inherit_stdio,
            output_limit_bytes: cfg.agent.output_limit_bytes,
        };
        let ward = CommandWardGate {
            commands: cfg.ward.commands.clone(),
            timeout: cfg.ward_timeout(),
            output_limit_bytes: cfg.ward.output_limit_bytes,
            pass_scope: cfg.ward.pass_scope,
        };
        let prompts = PromptRegistry::load(project)?;
        Ok(Self::new(Arc::new(spawner), Arc::new(ward), Arc::new(prompts)))
    }

    /// Drive the quest at `request.quest_path` to `complete` or `failed`.
    ///
    /// Planning-phase quests are rejected with [`QuestError::NotApproved`];
    /// a quest already `in_progress` is resumed.
    #[instrument(skip_all, fields(quest = %request.quest_path.display()))]
    pub async fn run_quest<F: FnMut(&RunEvent)>(
        &self,
        request: &RunRequest,
        mut on_event: F,
    ) -> Result<RunOutcome> {
        request.validate()?;
        let emit: &mut dyn FnMut(&RunEvent) = &mut on_event;

        let quest = load_quest(&request.quest_path)?;
        match quest.status {
            QuestStatus::Approved => {
                set_quest_status(
                    &request.quest_path,
                    QuestStatus::InProgress,
                    Some(LogEntry::now("quest_started").detail(format!(
                        "{} slot(s), {} step(s)",
                        request.slot_count,
                        quest.steps.len()
                    ))),
                )?;
            }
            QuestStatus::InProgress => self.reset_orphaned_steps(request)?,
            QuestStatus::Complete => {
                info!("quest already complete");
                return Ok(RunOutcome::completed(0, 0, 0));
            }
            QuestStatus::Failed => {
                return Err(QuestError::InvalidTransition {
                    from: QuestStatus::Failed,
                    to: QuestStatus::InProgress,
                }
                .into());
            }
            status => return Err(QuestError::NotApproved { status }.into()),
        }

        let pool = SlotPool::new(request.slot_count)?;
        let baseline = if request.ward_baseline {
            Some(self.run_ward(request, "baseline", emit).await?)
        } else {
            None
        };

        emit(&RunEvent::PhaseChanged(Phase::Executing));
        let (rounds, dispatches) = match self.execute_graph(request, &pool, emit).await? {
            ExecutionOutcome::Converged { rounds, dispatches } => (rounds, dispatches),
            ExecutionOutcome::Stalled {
                report,
                rounds,
                dispatches,
            } => {
                let failure = RunFailure::Stalled(report);
                self.finish(request, QuestStatus::Failed, &failure.summary(), emit)?;
                return Ok(RunOutcome {
                    completed: false,
                    failure: Some(failure),
                    rounds,
                    dispatches,
                    repair_spawns: 0,
                });
            }
        };

        emit(&RunEvent::PhaseChanged(Phase::Validating));
        let validation = self.run_ward(request, "validation", emit).await?;
        if gate_passes(&validation, baseline.as_ref()) {
            self.finish(request, QuestStatus::Complete, "ward passed", emit)?;
            return Ok(RunOutcome::completed(rounds, dispatches, 0));
        }

        emit(&RunEvent::PhaseChanged(Phase::Repairing));
        let repaired = self
            .repair(request, &pool, validation, baseline.as_ref(), emit)
            .await?;
        if repaired.passed {
            let detail = format!("ward passed after {} repair attempt(s)", repaired.spawns);
            self.finish(request, QuestStatus::Complete, &detail, emit)?;
            return Ok(RunOutcome::completed(rounds, dispatches, repaired.spawns));
        }

        let failure = RunFailure::RepairExhausted {
            iterations: repaired.spawns,
            last: repaired.last,
        };
        self.finish(request, QuestStatus::Failed, &failure.summary(), emit)?;
        Ok(RunOutcome {
            completed: false,
            failure: Some(failure),
            rounds,
            dispatches,
            repair_spawns: repaired.spawns,
        })
    }

    /// Steps left `in_progress` by an earlier process have no live dispatch;
    /// put them back in the ready pool.
    fn reset_orphaned_steps(&self, request: &RunRequest) -> Result<()> {
        let quest = load_quest(&request.quest_path)?;
        let orphaned: Vec<String> = quest
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::InProgress)
            .map(|step| step.id.clone())
            .collect();
        for step_id in &orphaned {
            warn!(step_id = %step_id, "resetting orphaned step to pending");
            set_step_status(
                &request.quest_path,
                step_id,
                StepStatus::Pending,
                None,
                Some(
                    LogEntry::now("step_reset")
                        .step(step_id)
                        .detail("in_progress without a live dispatch"),
                ),
            )?;
        }
        info!(orphaned = orphaned.len(), "resuming quest");
        Ok(())
    }

    fn finish(
        &self,
        request: &RunRequest,
        status: QuestStatus,
        detail: &str,
        emit: &mut dyn FnMut(&RunEvent),
    ) -> Result<()> {
        let event = match status {
            QuestStatus::Complete => "quest_complete",
            _ => "quest_failed",
        };
        set_quest_status(
            &request.quest_path,
            status,
            Some(LogEntry::now(event).detail(detail)),
        )?;
        info!(status = %status, detail, "quest finished");
        emit(&RunEvent::PhaseChanged(match status {
            QuestStatus::Complete => Phase::Complete,
            _ => Phase::Failed,
        }));
        Ok(())
    }
}
