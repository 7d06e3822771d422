//! Execution phase: drive the step graph to convergence on a bounded pool.
//!
//! The loop reloads the quest before every decision, dispatches ready steps
//! while lanes are free, then waits on whichever in-flight agent finishes
//! first. It converges only when nothing is ready and nothing is in flight.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::core::readiness::{StallReport, ready_steps, stall_report};
use crate::core::types::AgentRole;
use crate::core::ward::WardResult;
use crate::io::agent::{AgentExit, AgentRequest, AgentSpawner};
use crate::io::prompt::{PromptRegistry, step_arguments};
use crate::io::quest_store::{append_log, load_quest, quest_folder, set_step_status};
use crate::io::ward::{WardGate, WardRequest};
use crate::io::ward_log::{WardRecord, write_ward_record};
use crate::quest::{LogEntry, Quest, Step, StepStatus, now_timestamp};
use crate::run::{RunEvent, RunRequest};
use crate::slots::{Lane, SlotPool};

/// Directory for captured agent output inside a quest folder.
pub const AGENT_LOG_DIR: &str = "agent-logs";

/// Collaborators for orchestration runs.
///
/// Cheap to clone; every run builds its own [`SlotPool`].
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) spawner: Arc<dyn AgentSpawner>,
    pub(crate) ward: Arc<dyn WardGate>,
    pub(crate) prompts: Arc<PromptRegistry>,
}

/// Result of one finished dispatch, carried back through the join set.
struct DispatchReport {
    step_id: String,
    role: AgentRole,
    lane: Lane,
    exit: AgentExit,
}

/// How the execution phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every step is `complete`.
    Converged { rounds: u32, dispatches: u32 },
    /// Nothing ready, nothing in flight, and some step is not `complete`.
    Stalled {
        report: StallReport,
        rounds: u32,
        dispatches: u32,
    },
}

impl Orchestrator {
    pub fn new(
        spawner: Arc<dyn AgentSpawner>,
        ward: Arc<dyn WardGate>,
        prompts: Arc<PromptRegistry>,
    ) -> Self {
        Self {
            spawner,
            ward,
            prompts,
        }
    }

    /// Run ready steps until the graph converges or stalls.
    #[instrument(skip_all, fields(quest = %request.quest_path.display(), slots = pool.slot_count()))]
    pub async fn execute_graph(
        &self,
        request: &RunRequest,
        pool: &SlotPool,
        emit: &mut dyn FnMut(&RunEvent),
    ) -> Result<ExecutionOutcome> {
        let mut in_flight: JoinSet<DispatchReport> = JoinSet::new();
        let mut rounds = 0u32;
        let mut dispatches = 0u32;

        loop {
            let quest = load_quest(&request.quest_path)?;
            let ready: Vec<Step> = ready_steps(&quest.steps).into_iter().cloned().collect();
            debug!(
                ready = ready.len(),
                in_flight = in_flight.len(),
                free = pool.available(),
                "evaluated ready set"
            );

            let mut dispatched_now = 0u32;
            for step in &ready {
                let Some(lane) = pool.try_acquire() else {
                    break;
                };
                if dispatched_now == 0 {
                    rounds += 1;
                }
                let job = self.dispatch(request, &quest, step, lane, rounds, emit)?;
                in_flight.spawn_blocking(job);
                dispatched_now += 1;
            }
            dispatches += dispatched_now;

            let Some(joined) = in_flight.join_next().await else {
                // Convergence barrier: empty ready set with zero in flight.
                if quest.all_steps_complete() {
                    info!(rounds, dispatches, "step graph converged");
                    return Ok(ExecutionOutcome::Converged { rounds, dispatches });
                }
                let report = stall_report(&quest.steps);
                warn!(summary = %report.summary(), "step graph stalled");
                return Ok(ExecutionOutcome::Stalled {
                    report,
                    rounds,
                    dispatches,
                });
            };

            let DispatchReport {
                step_id,
                role,
                lane,
                exit,
            } = joined.map_err(|err| anyhow!("agent task failed: {}", err))?;
            pool.release(lane);
            self.reconcile(request, &step_id, role, &exit, emit)?;
        }
    }

    /// Mark `step` in progress and return the blocking agent run for `lane`.
    fn dispatch(
        &self,
        request: &RunRequest,
        quest: &Quest,
        step: &Step,
        lane: Lane,
        round: u32,
        emit: &mut dyn FnMut(&RunEvent),
    ) -> Result<impl FnOnce() -> DispatchReport + Send + 'static> {
        let role = AgentRole::for_step(step.step_type);
        let arguments = step_arguments(
            quest,
            &request.quest_path,
            step,
            request.prompt_budget_bytes,
        );
        let prompt = self.prompts.render(role, &arguments)?;

        set_step_status(
            &request.quest_path,
            &step.id,
            StepStatus::InProgress,
            None,
            Some(
                LogEntry::now("step_dispatched")
                    .step(&step.id)
                    .role(role.as_str())
                    .detail(format!("round {}, lane {}", round, lane.index())),
            ),
        )?;
        info!(step_id = %step.id, role = %role, lane = lane.index(), round, "dispatching step");
        emit(&RunEvent::StepDispatched {
            step_id: step.id.clone(),
            role,
            lane: lane.index(),
            round,
        });

        let agent_request = AgentRequest {
            role,
            step_id: Some(step.id.clone()),
            prompt,
            workdir: request.project_path.clone(),
            timeout: request.timeout,
            log_path: agent_log_path(&request.quest_path, &step.id)?,
        };
        let spawner = Arc::clone(&self.spawner);
        let step_id = step.id.clone();
        Ok(move || {
            let exit = spawn_guarded(spawner.as_ref(), &agent_request);
            DispatchReport {
                step_id,
                role,
                lane,
                exit,
            }
        })
    }

    /// Settle a finished step. A terminal status written by the agent itself
    /// wins; otherwise the exit decides.
    fn reconcile(
        &self,
        request: &RunRequest,
        step_id: &str,
        role: AgentRole,
        exit: &AgentExit,
        emit: &mut dyn FnMut(&RunEvent),
    ) -> Result<()> {
        let quest = load_quest(&request.quest_path)?;
        let Some(step) = quest.step(step_id) else {
            warn!(step_id, "finished step no longer exists in quest");
            return Ok(());
        };

        let status = if step.status.is_terminal() {
            let status = step.status;
            append_log(
                &request.quest_path,
                &[LogEntry::now("step_reconciled")
                    .step(step_id)
                    .role(role.as_str())
                    .detail(format!("kept {} set by agent; {}", status, exit.describe()))],
            )?;
            status
        } else if exit.is_success() {
            set_step_status(
                &request.quest_path,
                step_id,
                StepStatus::Complete,
                None,
                Some(LogEntry::now("step_complete").step(step_id).role(role.as_str())),
            )?;
            StepStatus::Complete
        } else {
            let message = exit.describe();
            set_step_status(
                &request.quest_path,
                step_id,
                StepStatus::Failed,
                Some(&message),
                Some(
                    LogEntry::now("step_failed")
                        .step(step_id)
                        .role(role.as_str())
                        .detail(message.clone()),
                ),
            )?;
            StepStatus::Failed
        };

        info!(step_id, status = %status, exit = %exit.describe(), "step finished");
        emit(&RunEvent::StepFinished {
            step_id: step_id.to_string(),
            status,
            exit: exit.clone(),
        });
        Ok(())
    }

    /// Run the Ward gate over the quest's changed files, persist the run, and
    /// log it to the quest.
    #[instrument(skip_all, fields(label = %label))]
    pub async fn run_ward(
        &self,
        request: &RunRequest,
        label: &str,
        emit: &mut dyn FnMut(&RunEvent),
    ) -> Result<WardResult> {
        let quest = load_quest(&request.quest_path)?;
        let ward_request = WardRequest {
            workdir: request.project_path.clone(),
            scope: quest.changed_files(),
        };
        let gate = Arc::clone(&self.ward);
        let result = tokio::task::spawn_blocking(move || gate.run(&ward_request))
            .await
            .context("ward task failed")??;

        let folder = quest_folder(&request.quest_path)?;
        let path = write_ward_record(
            folder,
            &WardRecord {
                label: label.to_string(),
                recorded_at: now_timestamp(),
                result: result.clone(),
            },
        )?;
        append_log(
            &request.quest_path,
            &[LogEntry::now("ward_run").detail(format!("{}: {}", label, result.summary()))],
        )?;
        info!(label, passed = result.passed, diagnostics = result.diagnostics.len(), record = %path.display(), "ward finished");
        emit(&RunEvent::WardFinished {
            label: label.to_string(),
            passed: result.passed,
            diagnostics: result.diagnostics.len(),
        });
        Ok(result)
    }
}

/// Call the spawner, turning a panic into a failed dispatch.
pub(crate) fn spawn_guarded(spawner: &dyn AgentSpawner, request: &AgentRequest) -> AgentExit {
    catch_unwind(AssertUnwindSafe(|| spawner.spawn(request))).unwrap_or_else(|_| {
        AgentExit::SpawnFailed {
            reason: "agent spawner panicked".to_string(),
        }
    })
}

/// `<quest folder>/agent-logs/<name>.log`.
pub(crate) fn agent_log_path(quest_path: &Path, name: &str) -> Result<PathBuf> {
    Ok(quest_folder(quest_path)?
        .join(AGENT_LOG_DIR)
        .join(format!("{}.log", name)))
}
