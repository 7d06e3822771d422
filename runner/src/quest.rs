//! Quest document model (`<project>/.quests/<NNN>-<slug>/quest.json`).
//!
//! The document is shared state: spawned agents rewrite it through their own
//! side channel between orchestrator reads. Keys this crate does not model are
//! kept in `extra` so a save never drops fields another writer added.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed file name of the quest document inside its folder.
pub const QUEST_FILE_NAME: &str = "quest.json";

/// Collections that accept array-upsert patches (keyed by each item's `id`).
pub const UPSERT_COLLECTIONS: [&str; 9] = [
    "steps",
    "requirements",
    "designDecisions",
    "contexts",
    "observables",
    "contracts",
    "flows",
    "toolingRequirements",
    "clarifications",
];

/// Quest lifecycle status, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestStatus {
    Created,
    FlowsApproved,
    RequirementsApproved,
    Approved,
    InProgress,
    Complete,
    Failed,
}

impl QuestStatus {
    pub const ALL: [QuestStatus; 7] = [
        QuestStatus::Created,
        QuestStatus::FlowsApproved,
        QuestStatus::RequirementsApproved,
        QuestStatus::Approved,
        QuestStatus::InProgress,
        QuestStatus::Complete,
        QuestStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QuestStatus::Created => "created",
            QuestStatus::FlowsApproved => "flows_approved",
            QuestStatus::RequirementsApproved => "requirements_approved",
            QuestStatus::Approved => "approved",
            QuestStatus::InProgress => "in_progress",
            QuestStatus::Complete => "complete",
            QuestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QuestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown quest status '{s}'"))
    }
}

/// Kind of work a step represents; selects the agent role that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    #[default]
    Implementation,
    Testing,
    Discovery,
    Review,
    Documentation,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Implementation => "implementation",
            StepType::Testing => "testing",
            StepType::Discovery => "discovery",
            StepType::Review => "review",
            StepType::Documentation => "documentation",
        }
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schedulable unit of a quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One append-only `executionLog` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogEntry {
    pub fn now(event: impl Into<String>) -> Self {
        Self {
            timestamp: now_timestamp(),
            event: event.into(),
            step_id: None,
            role: None,
            detail: None,
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Untyped auxiliary collection item; only its `id` is interpreted.
pub type Item = Map<String, Value>;

/// The persistent unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub id: String,
    pub folder: String,
    #[serde(default)]
    pub title: String,
    pub status: QuestStatus,
    #[serde(default)]
    pub user_request: String,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub requirements: Vec<Item>,
    #[serde(default)]
    pub design_decisions: Vec<Item>,
    #[serde(default)]
    pub contexts: Vec<Item>,
    #[serde(default)]
    pub observables: Vec<Item>,
    #[serde(default)]
    pub contracts: Vec<Item>,
    #[serde(default)]
    pub flows: Vec<Item>,
    #[serde(default)]
    pub tooling_requirements: Vec<Item>,
    #[serde(default)]
    pub clarifications: Vec<Item>,
    #[serde(default)]
    pub execution_log: Vec<LogEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Quest {
    /// Empty quest in `created` status.
    pub fn new(id: impl Into<String>, folder: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_timestamp();
        Self {
            id: id.into(),
            folder: folder.into(),
            title: title.into(),
            status: QuestStatus::Created,
            user_request: String::new(),
            created_at: now.clone(),
            updated_at: now,
            steps: Vec::new(),
            requirements: Vec::new(),
            design_decisions: Vec::new(),
            contexts: Vec::new(),
            observables: Vec::new(),
            contracts: Vec::new(),
            flows: Vec::new(),
            tooling_requirements: Vec::new(),
            clarifications: Vec::new(),
            execution_log: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn all_steps_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.status == StepStatus::Complete)
    }

    /// Files named by any step, deduplicated in first-seen order.
    pub fn changed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for step in &self.steps {
            for file in step.files_to_create.iter().chain(&step.files_to_modify) {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }
}

/// RFC 3339 UTC timestamp used for every persisted time field.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
