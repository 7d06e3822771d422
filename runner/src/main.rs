//! `quest-runner` CLI.
//!
//! Quests live under `<project>/.quests/<NNN>-<slug>/quest.json`. Commands
//! that take a quest accept its id, its folder name, or a path to the file.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quest_runner::core::readiness::ready_steps;
use quest_runner::exit_codes;
use quest_runner::io::config::{config_path, load_config};
use quest_runner::io::init::{InitOptions, init_quests};
use quest_runner::io::quest_store::{QuestStore, load_quest, project_root};
use quest_runner::logging;
use quest_runner::orchestrate::Orchestrator;
use quest_runner::quest::{LogEntry, QUEST_FILE_NAME, QuestStatus};
use quest_runner::run::{RunEvent, RunFailure, RunRequest};
use serde_json::json;

#[derive(Parser)]
#[command(
    name = "quest-runner",
    version,
    about = "Dependency-ordered agent orchestration for quests"
)]
struct Cli {
    /// Project root holding `.quests/`.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.quests/` with a default config, schema and prompt notes.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a new quest in `created` status.
    Create {
        title: String,
        /// Original user request text.
        #[arg(long, default_value = "")]
        request: String,
    },
    /// List quests in the project.
    List,
    /// Check a quest against the schema and its step graph.
    Verify { quest: String },
    /// Print ready step ids, one per line, in step order.
    Ready { quest: String },
    /// Print the quest status, or move it to `status`.
    Status {
        quest: String,
        status: Option<QuestStatus>,
    },
    /// Execute an approved quest to completion or failure.
    Run {
        quest: String,
        /// Concurrent agent lanes (overrides config).
        #[arg(long)]
        slots: Option<usize>,
        /// Per-agent timeout in milliseconds (overrides config).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Repair attempts after a failing Ward gate; 0 disables repair.
        #[arg(long)]
        max_repair: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let project = cli.project;
    match cli.command {
        Command::Init { force } => cmd_init(&project, force),
        Command::Create { title, request } => cmd_create(&project, &title, &request),
        Command::List => cmd_list(&project),
        Command::Verify { quest } => cmd_verify(&project, &quest),
        Command::Ready { quest } => cmd_ready(&project, &quest),
        Command::Status { quest, status } => cmd_status(&project, &quest, status),
        Command::Run {
            quest,
            slots,
            timeout_ms,
            max_repair,
        } => cmd_run(&project, &quest, slots, timeout_ms, max_repair).await,
    }
}

fn cmd_init(project: &Path, force: bool) -> Result<i32> {
    let paths = init_quests(project, &InitOptions { force })?;
    println!("{}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_create(project: &Path, title: &str, request: &str) -> Result<i32> {
    let store = QuestStore::new(vec![project.to_path_buf()]);
    let location = store.create(project, title, request)?;
    let quest = load_quest(&location.path)?;
    println!("{}\t{}", quest.id, location.path.display());
    Ok(exit_codes::OK)
}

fn cmd_list(project: &Path) -> Result<i32> {
    let store = QuestStore::new(vec![project.to_path_buf()]);
    for summary in store.list()? {
        println!(
            "{}\t{}\t{}\t{}",
            summary.folder, summary.id, summary.status, summary.title
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_verify(project: &Path, quest: &str) -> Result<i32> {
    let path = resolve_quest(project, quest)?;
    let loaded = load_quest(&path)?;
    println!("ok: {} ({} steps)", loaded.id, loaded.steps.len());
    Ok(exit_codes::OK)
}

fn cmd_ready(project: &Path, quest: &str) -> Result<i32> {
    let path = resolve_quest(project, quest)?;
    let loaded = load_quest(&path)?;
    for step in ready_steps(&loaded.steps) {
        println!("{}", step.id);
    }
    Ok(exit_codes::OK)
}

fn cmd_status(project: &Path, quest: &str, status: Option<QuestStatus>) -> Result<i32> {
    let path = resolve_quest(project, quest)?;
    let current = load_quest(&path)?;
    let Some(status) = status else {
        println!("{}", current.status);
        return Ok(exit_codes::OK);
    };
    let root = project_root(&path).unwrap_or(project);
    let store = QuestStore::new(vec![root.to_path_buf()]);
    let patch = json!({
        "status": status,
        "executionLog": [LogEntry::now("status_changed").detail(status.as_str())],
    });
    let updated = store.upsert(&current.id, &patch)?;
    println!("{}", updated.status);
    Ok(exit_codes::OK)
}

async fn cmd_run(
    project: &Path,
    quest: &str,
    slots: Option<usize>,
    timeout_ms: Option<u64>,
    max_repair: Option<u32>,
) -> Result<i32> {
    let path = resolve_quest(project, quest)?;
    let mut cfg = load_config(&config_path(project))?;
    if let Some(slots) = slots {
        cfg.slot_count = slots;
    }
    if let Some(timeout_ms) = timeout_ms {
        cfg.timeout_ms = timeout_ms;
    }
    if let Some(max_repair) = max_repair {
        cfg.max_spirit_loop_iterations = max_repair;
    }
    cfg.validate()?;

    let request = RunRequest::from_config(project, &path, &cfg);
    let orchestrator = Orchestrator::from_config(project, &cfg)?;
    let outcome = orchestrator.run_quest(&request, print_event).await?;

    match &outcome.failure {
        None => {
            println!(
                "complete: {} round(s), {} dispatch(es), {} repair(s)",
                outcome.rounds, outcome.dispatches, outcome.repair_spawns
            );
            Ok(exit_codes::OK)
        }
        Some(failure) => {
            println!("failed: {}", failure.summary());
            Ok(match failure {
                RunFailure::Stalled(_) => exit_codes::STALLED,
                RunFailure::RepairExhausted { .. } => exit_codes::REPAIR_EXHAUSTED,
            })
        }
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::PhaseChanged(phase) => println!("== {}", phase),
        RunEvent::StepDispatched {
            step_id,
            role,
            lane,
            round,
        } => println!("-> {} [{}] lane {} round {}", step_id, role, lane, round),
        RunEvent::StepFinished {
            step_id,
            status,
            exit,
        } => println!("<- {} {} ({})", step_id, status, exit.describe()),
        RunEvent::WardFinished {
            label,
            passed,
            diagnostics,
        } => println!(
            "ward {}: {} ({} diagnostic(s))",
            label,
            if *passed { "pass" } else { "fail" },
            diagnostics
        ),
        RunEvent::RepairAttempt { attempt, max } => println!("repair {}/{}", attempt, max),
    }
}

/// Resolve a quest argument: a file path, a quest folder, a folder name, or an id.
fn resolve_quest(project: &Path, quest: &str) -> Result<PathBuf> {
    let candidate = Path::new(quest);
    if candidate.is_file() {
        return Ok(candidate.to_path_buf());
    }
    if candidate.join(QUEST_FILE_NAME).is_file() {
        return Ok(candidate.join(QUEST_FILE_NAME));
    }

    let store = QuestStore::new(vec![project.to_path_buf()]);
    let by_folder = store
        .list()
        .context("list quests")?
        .into_iter()
        .find(|summary| summary.folder == quest);
    if let Some(summary) = by_folder {
        return Ok(summary.location.path);
    }
    Ok(store.locate(quest)?.path)
}
