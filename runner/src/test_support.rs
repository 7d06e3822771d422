//! Test helpers: step and quest builders, throwaway projects, and scripted
//! stand-ins for the agent spawner and the Ward gate.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use crate::core::types::AgentRole;
use crate::core::ward::WardResult;
use crate::io::agent::{AgentExit, AgentRequest, AgentSpawner};
use crate::io::config::{QuestConfig, config_path, write_config};
use crate::io::quest_store::{QUESTS_DIR, load_quest, set_step_status, write_quest};
use crate::io::ward::{WardGate, WardRequest};
use crate::quest::{QUEST_FILE_NAME, Quest, QuestStatus, Step, StepStatus};

/// Pending implementation step with the given dependencies.
pub fn step(id: &str, depends_on: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        name: format!("{} name", id),
        description: format!("{} description", id),
        step_type: Default::default(),
        depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
        files_to_create: Vec::new(),
        files_to_modify: Vec::new(),
        status: StepStatus::Pending,
        started_at: None,
        completed_at: None,
        error_message: None,
        extra: Default::default(),
    }
}

pub fn step_with_status(id: &str, depends_on: &[&str], status: StepStatus) -> Step {
    let mut step = step(id, depends_on);
    step.status = status;
    step
}

/// Approved quest in folder `001-<id>` holding `steps`.
pub fn quest_with_steps(id: &str, steps: Vec<Step>) -> Quest {
    let mut quest = Quest::new(id, format!("001-{}", id), format!("{} title", id));
    quest.status = QuestStatus::Approved;
    quest.user_request = format!("{} request", id);
    quest.steps = steps;
    quest
}

/// Temporary project directory, removed on drop.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Write `quest` to `.quests/<folder>/quest.json` and return that path.
    pub fn write_quest(&self, quest: &Quest) -> PathBuf {
        let dir = self.root().join(QUESTS_DIR).join(&quest.folder);
        fs::create_dir_all(&dir).expect("create quest dir");
        let path = dir.join(QUEST_FILE_NAME);
        write_quest(&path, quest).expect("write quest");
        path
    }

    pub fn write_config(&self, cfg: &QuestConfig) {
        write_config(&config_path(self.root()), cfg).expect("write config");
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Behaviour of one scripted agent run.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub exit: AgentExit,
    pub delay: Duration,
    /// Status the "agent" writes to its own step before exiting.
    pub mark_step: Option<StepStatus>,
}

impl ScriptedRun {
    pub fn ok() -> Self {
        Self {
            exit: AgentExit::Exited { code: 0 },
            delay: Duration::ZERO,
            mark_step: None,
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit: AgentExit::Exited { code },
            ..Self::ok()
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            exit: AgentExit::TimedOut { after },
            ..Self::ok()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn marking(mut self, status: StepStatus) -> Self {
        self.mark_step = Some(status);
        self
    }
}

/// One recorded spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCall {
    pub role: AgentRole,
    pub step_id: Option<String>,
    pub prompt: String,
}

/// Spawner that plays back [`ScriptedRun`]s keyed by step id.
///
/// Unscripted steps and repair runs succeed immediately. Also tracks peak
/// concurrency, both as live spawns and as `in_progress` steps on disk.
pub struct ScriptedSpawner {
    quest_path: PathBuf,
    steps: Mutex<HashMap<String, VecDeque<ScriptedRun>>>,
    repairs: Mutex<VecDeque<ScriptedRun>>,
    calls: Mutex<Vec<SpawnCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    max_in_progress: AtomicUsize,
}

impl ScriptedSpawner {
    pub fn new(quest_path: &Path) -> Self {
        Self {
            quest_path: quest_path.to_path_buf(),
            steps: Mutex::new(HashMap::new()),
            repairs: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            max_in_progress: AtomicUsize::new(0),
        }
    }

    /// Queue a run for `step_id`; repeated calls script later dispatches.
    pub fn on_step(self, step_id: &str, run: ScriptedRun) -> Self {
        self.steps
            .lock()
            .expect("steps lock")
            .entry(step_id.to_string())
            .or_default()
            .push_back(run);
        self
    }

    pub fn on_repair(self, run: ScriptedRun) -> Self {
        self.repairs.lock().expect("repairs lock").push_back(run);
        self
    }

    pub fn calls(&self) -> Vec<SpawnCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Step ids in spawn order.
    pub fn step_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.step_id)
            .collect()
    }

    pub fn repair_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.role == AgentRole::Spiritmender)
            .count()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn max_in_progress(&self) -> usize {
        self.max_in_progress.load(Ordering::SeqCst)
    }

    fn next_run(&self, request: &AgentRequest) -> ScriptedRun {
        let next = match &request.step_id {
            Some(step_id) => self
                .steps
                .lock()
                .expect("steps lock")
                .get_mut(step_id)
                .and_then(VecDeque::pop_front),
            None => self.repairs.lock().expect("repairs lock").pop_front(),
        };
        next.unwrap_or_else(ScriptedRun::ok)
    }
}

impl AgentSpawner for ScriptedSpawner {
    fn spawn(&self, request: &AgentRequest) -> AgentExit {
        self.calls.lock().expect("calls lock").push(SpawnCall {
            role: request.role,
            step_id: request.step_id.clone(),
            prompt: request.prompt.clone(),
        });
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Ok(quest) = load_quest(&self.quest_path) {
            let in_progress = quest
                .steps
                .iter()
                .filter(|step| step.status == StepStatus::InProgress)
                .count();
            self.max_in_progress.fetch_max(in_progress, Ordering::SeqCst);
        }

        let run = self.next_run(request);
        if !run.delay.is_zero() {
            thread::sleep(run.delay);
        }
        if let (Some(status), Some(step_id)) = (run.mark_step, &request.step_id) {
            set_step_status(&self.quest_path, step_id, status, None, None)
                .expect("scripted agent writes its step");
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        run.exit
    }
}

/// Gate that returns queued results in order, repeating the last one.
pub struct ScriptedWard {
    results: Mutex<VecDeque<WardResult>>,
    last: Mutex<WardResult>,
    scopes: Mutex<Vec<Vec<String>>>,
}

impl ScriptedWard {
    pub fn new(results: Vec<WardResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            last: Mutex::new(WardResult::passing()),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![WardResult::passing()])
    }

    /// Scope of every run so far.
    pub fn scopes(&self) -> Vec<Vec<String>> {
        self.scopes.lock().expect("scopes lock").clone()
    }

    pub fn runs(&self) -> usize {
        self.scopes().len()
    }
}

impl WardGate for ScriptedWard {
    fn run(&self, request: &WardRequest) -> Result<WardResult> {
        self.scopes
            .lock()
            .expect("scopes lock")
            .push(request.scope.clone());
        let mut last = self.last.lock().expect("last lock");
        if let Some(next) = self.results.lock().expect("results lock").pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}
