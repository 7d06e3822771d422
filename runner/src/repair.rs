//! Bounded repair loop.
//!
//! Each attempt hands the latest Ward diagnostics to the repair role, waits
//! for it on a pool lane, and reruns the gate. The loop stops on the first
//! passing gate or after `max_spirit_loop_iterations` spawns.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::AgentRole;
use crate::core::ward::{WardResult, gate_passes};
use crate::io::agent::AgentRequest;
use crate::io::prompt::repair_arguments;
use crate::io::quest_store::{append_log, load_quest};
use crate::orchestrate::{Orchestrator, agent_log_path, spawn_guarded};
use crate::quest::LogEntry;
use crate::run::{RunEvent, RunRequest};
use crate::slots::SlotPool;

/// Result of the repair phase.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub passed: bool,
    /// Repair agents spawned; never more than the configured bound.
    pub spawns: u32,
    /// Gate result that ended the loop.
    pub last: WardResult,
}

impl Orchestrator {
    /// Run up to `request.max_spirit_loop_iterations` repair attempts against
    /// the failing `initial` gate result.
    #[instrument(skip_all, fields(max = request.max_spirit_loop_iterations))]
    pub async fn repair(
        &self,
        request: &RunRequest,
        pool: &SlotPool,
        initial: WardResult,
        baseline: Option<&WardResult>,
        emit: &mut dyn FnMut(&RunEvent),
    ) -> Result<RepairOutcome> {
        let max = request.max_spirit_loop_iterations;
        let mut current = initial;
        let mut previous: Vec<String> = Vec::new();
        let mut spawns = 0u32;

        for attempt in 1..=max {
            emit(&RunEvent::RepairAttempt { attempt, max });
            let quest = load_quest(&request.quest_path)?;
            let arguments = repair_arguments(
                &quest,
                &current,
                &previous,
                attempt,
                max,
                request.prompt_budget_bytes,
            );
            let prompt = self.prompts.render(AgentRole::Spiritmender, &arguments)?;

            let lane = pool.acquire().await?;
            append_log(
                &request.quest_path,
                &[LogEntry::now("repair_dispatched")
                    .role(AgentRole::Spiritmender.as_str())
                    .detail(format!(
                        "attempt {} of {}, lane {}",
                        attempt,
                        max,
                        lane.index()
                    ))],
            )?;
            info!(attempt, max, lane = lane.index(), "dispatching repair agent");

            let agent_request = AgentRequest {
                role: AgentRole::Spiritmender,
                step_id: None,
                prompt,
                workdir: request.project_path.clone(),
                timeout: request.timeout,
                log_path: agent_log_path(&request.quest_path, &format!("repair-{}", attempt))?,
            };
            let spawner = Arc::clone(&self.spawner);
            let exit =
                tokio::task::spawn_blocking(move || spawn_guarded(spawner.as_ref(), &agent_request))
                    .await
                    .context("repair task failed")?;
            pool.release(lane);
            spawns += 1;

            if !exit.is_success() {
                warn!(attempt, exit = %exit.describe(), "repair agent did not exit cleanly");
            }
            append_log(
                &request.quest_path,
                &[LogEntry::now("repair_finished")
                    .role(AgentRole::Spiritmender.as_str())
                    .detail(format!("attempt {}: {}", attempt, exit.describe()))],
            )?;

            previous.push(format!("attempt {}: {}", attempt, current.summary()));
            current = self
                .run_ward(request, &format!("repair-{}", attempt), emit)
                .await?;
            if gate_passes(&current, baseline) {
                info!(attempt, "ward passed after repair");
                return Ok(RepairOutcome {
                    passed: true,
                    spawns,
                    last: current,
                });
            }
        }

        warn!(spawns, summary = %current.summary(), "repair attempts exhausted");
        Ok(RepairOutcome {
            passed: false,
            spawns,
            last: current,
        })
    }
}
