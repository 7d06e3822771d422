//! Quest load/save helpers with schema + graph validation.
//!
//! Every mutation is a read-modify-write of `quest.json` followed by an atomic
//! replace. Writers in this process are serialized; writers in other processes
//! (spawned agents) may interleave between our reads, and the last write wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::graph::validate_step_graph;
use crate::core::transition::validate_transition;
use crate::core::upsert::apply_patch;
use crate::error::QuestError;
use crate::quest::{LogEntry, QUEST_FILE_NAME, Quest, QuestStatus, StepStatus, now_timestamp};

/// Directory holding quest folders inside a project.
pub const QUESTS_DIR: &str = ".quests";

pub const QUEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/quest/v1.schema.json"
));

static QUEST_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(QUEST_SCHEMA).map_err(|err| err.to_string())?;
    validator_for(&schema).map_err(|err| err.to_string())
});

static WRITE_LOCK: Mutex<()> = Mutex::new(());

fn write_lock() -> MutexGuard<'static, ()> {
    WRITE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn quests_dir(project: &Path) -> PathBuf {
    project.join(QUESTS_DIR)
}

/// Folder containing a quest file.
pub fn quest_folder(quest_path: &Path) -> Result<&Path> {
    quest_path
        .parent()
        .with_context(|| format!("quest path missing parent {}", quest_path.display()))
}

/// Project root of a quest stored at `<root>/.quests/<folder>/quest.json`.
pub fn project_root(quest_path: &Path) -> Option<&Path> {
    let dir = quest_path.parent()?.parent()?;
    if dir.file_name()? == QUESTS_DIR {
        dir.parent()
    } else {
        None
    }
}

/// Load and validate a quest from disk (schema + step graph).
pub fn load_quest(path: &Path) -> Result<Quest> {
    let value = read_quest_value(path)?;
    validate_schema(&value).with_context(|| format!("validate quest {}", path.display()))?;
    let quest: Quest = serde_json::from_value(value)
        .with_context(|| format!("deserialize quest {}", path.display()))?;
    validate_graph(&quest)?;
    Ok(quest)
}

/// Write a whole quest document (schema + step graph checked first).
pub fn write_quest(path: &Path, quest: &Quest) -> Result<()> {
    validate_graph(quest)?;
    let value = serde_json::to_value(quest).context("serialize quest")?;
    validate_schema(&value)?;
    let _guard = write_lock();
    write_value(path, &value)
}

/// Apply a partial document to the quest at `path` and persist it.
///
/// A `status` key must name the current status or an adjacent one; otherwise
/// [`QuestError::InvalidTransition`] is returned and nothing is written.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn upsert_quest(path: &Path, patch: &Value) -> Result<Quest> {
    let _guard = write_lock();

    let mut doc = read_quest_value(path)?;
    validate_schema(&doc).with_context(|| format!("validate quest {}", path.display()))?;
    let current: Quest = serde_json::from_value(doc.clone())
        .with_context(|| format!("deserialize quest {}", path.display()))?;

    if let Some(raw) = patch.get("status") {
        let requested: QuestStatus =
            serde_json::from_value(raw.clone()).context("parse requested quest status")?;
        validate_transition(current.status, requested)?;
    }

    let summary = apply_patch(&mut doc, patch).map_err(|err| anyhow!("invalid quest patch: {}", err))?;
    if let Some(fields) = doc.as_object_mut() {
        fields.insert("updatedAt".to_string(), Value::String(now_timestamp()));
    }

    validate_schema(&doc).context("patched quest fails schema")?;
    let next: Quest = serde_json::from_value(doc.clone()).context("deserialize patched quest")?;
    validate_graph(&next)?;

    write_value(path, &doc)?;
    debug!(
        updated = summary.updated.len(),
        appended = summary.appended.len(),
        replaced = summary.replaced.len(),
        log_entries = summary.log_entries,
        "quest upserted"
    );
    Ok(next)
}

/// Set one step's status, stamping `startedAt`/`completedAt` as appropriate.
pub fn set_step_status(
    path: &Path,
    step_id: &str,
    status: StepStatus,
    error_message: Option<&str>,
    entry: Option<LogEntry>,
) -> Result<Quest> {
    let quest = load_quest(path)?;
    if quest.step(step_id).is_none() {
        return Err(QuestError::StepNotFound {
            quest_id: quest.id,
            step_id: step_id.to_string(),
        }
        .into());
    }

    let mut update = json!({ "id": step_id, "status": status });
    let now = now_timestamp();
    match status {
        StepStatus::InProgress => update["startedAt"] = Value::String(now),
        StepStatus::Complete | StepStatus::Failed => update["completedAt"] = Value::String(now),
        StepStatus::Pending => {}
    }
    if let Some(message) = error_message {
        update["errorMessage"] = Value::String(message.to_string());
    }

    let mut patch = json!({ "steps": [update] });
    if let Some(entry) = entry {
        patch["executionLog"] = json!([entry]);
    }
    upsert_quest(path, &patch)
}

/// Move the quest to `status` if adjacent, optionally logging the change.
pub fn set_quest_status(path: &Path, status: QuestStatus, entry: Option<LogEntry>) -> Result<Quest> {
    let mut patch = json!({ "status": status });
    if let Some(entry) = entry {
        patch["executionLog"] = json!([entry]);
    }
    upsert_quest(path, &patch)
}

/// Append entries to `executionLog`.
pub fn append_log(path: &Path, entries: &[LogEntry]) -> Result<Quest> {
    upsert_quest(path, &json!({ "executionLog": entries }))
}

fn read_quest_value(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read quest {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse quest {}", path.display()))
}

fn write_value(path: &Path, value: &Value) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize quest")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

fn validate_schema(quest: &Value) -> Result<()> {
    let compiled = QUEST_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid quest schema: {}", err))?;
    if !compiled.is_valid(quest) {
        let messages = compiled
            .iter_errors(quest)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "quest schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_graph(quest: &Quest) -> Result<()> {
    let errors = validate_step_graph(&quest.steps);
    if errors.is_empty() {
        return Ok(());
    }
    Err(QuestError::InvalidGraph { errors }.into())
}

/// Where a quest lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestLocation {
    pub project: PathBuf,
    pub path: PathBuf,
}

/// Listing row for a quest folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestSummary {
    pub location: QuestLocation,
    pub id: String,
    pub folder: String,
    pub title: String,
    pub status: QuestStatus,
}

/// Id-addressed access to quests across one or more project roots.
#[derive(Debug, Clone)]
pub struct QuestStore {
    projects: Vec<PathBuf>,
}

impl QuestStore {
    pub fn new(projects: Vec<PathBuf>) -> Self {
        Self { projects }
    }

    /// Find a quest by id, scanning projects in order.
    ///
    /// Unreadable quest directories are skipped.
    pub fn locate(&self, quest_id: &str) -> Result<QuestLocation> {
        for summary in self.list()? {
            if summary.id == quest_id {
                return Ok(summary.location);
            }
        }
        Err(QuestError::NotFound {
            quest_id: quest_id.to_string(),
        }
        .into())
    }

    pub fn load(&self, quest_id: &str) -> Result<Quest> {
        let location = self.locate(quest_id)?;
        load_quest(&location.path)
    }

    pub fn upsert(&self, quest_id: &str, patch: &Value) -> Result<Quest> {
        let location = self.locate(quest_id)?;
        upsert_quest(&location.path, patch)
    }

    /// All quests in all projects, each project's folders in name order.
    pub fn list(&self) -> Result<Vec<QuestSummary>> {
        let mut out = Vec::new();
        for project in &self.projects {
            for path in quest_files(project)? {
                match read_summary(project, &path) {
                    Ok(summary) => out.push(summary),
                    Err(err) => warn!(path = %path.display(), err = %err, "skipping unreadable quest"),
                }
            }
        }
        Ok(out)
    }

    /// Create a new quest folder `<NNN>-<slug>` in `project`.
    pub fn create(&self, project: &Path, title: &str, user_request: &str) -> Result<QuestLocation> {
        let slug = slugify(title);
        let existing: Vec<String> = self.list()?.into_iter().map(|q| q.id).collect();
        let mut id = slug.clone();
        let mut suffix = 2;
        while existing.contains(&id) {
            id = format!("{}-{}", slug, suffix);
            suffix += 1;
        }

        let dir = quests_dir(project);
        let folder = format!("{:03}-{}", next_quest_number(&dir)?, slug);
        let path = dir.join(&folder).join(QUEST_FILE_NAME);
        if path.exists() {
            return Err(anyhow!("quest file already exists: {}", path.display()));
        }

        let mut quest = Quest::new(id, folder, title);
        quest.user_request = user_request.to_string();
        quest.execution_log.push(LogEntry::now("quest_created"));
        write_quest(&path, &quest)?;

        Ok(QuestLocation {
            project: project.to_path_buf(),
            path,
        })
    }
}

fn quest_files(project: &Path) -> Result<Vec<PathBuf>> {
    let dir = quests_dir(project);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), err = %err, "cannot read quests directory");
            return Ok(Vec::new());
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join(QUEST_FILE_NAME))
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn read_summary(project: &Path, path: &Path) -> Result<QuestSummary> {
    let value = read_quest_value(path)?;
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    let id = field("id").ok_or_else(|| anyhow!("quest has no id"))?;
    let status: QuestStatus = value
        .get("status")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .context("parse status")?
        .ok_or_else(|| anyhow!("quest has no status"))?;
    Ok(QuestSummary {
        location: QuestLocation {
            project: project.to_path_buf(),
            path: path.to_path_buf(),
        },
        id,
        folder: field("folder").unwrap_or_default(),
        title: field("title").unwrap_or_default(),
        status,
    })
}

fn next_quest_number(dir: &Path) -> Result<u32> {
    if !dir.is_dir() {
        return Ok(1);
    }
    let mut highest = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(number) = digits.parse::<u32>() {
            highest = highest.max(number);
        }
    }
    Ok(highest + 1)
}

/// Lowercase alphanumerics joined by single dashes, at most 50 chars.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(50);
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "quest".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestProject, quest_with_steps, step};

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Add  User/Auth!"), "add-user-auth");
        assert_eq!(slugify("***"), "quest");
    }

    /// Verifies create numbers folders sequentially and ids stay unique.
    #[test]
    fn create_sequences_folders() {
        let project = TestProject::new();
        let store = QuestStore::new(vec![project.root().to_path_buf()]);

        let first = store.create(project.root(), "Add auth", "please").expect("first");
        let second = store.create(project.root(), "Add auth", "again").expect("second");

        let first = load_quest(&first.path).expect("load first");
        let second = load_quest(&second.path).expect("load second");
        assert_eq!(first.folder, "001-add-auth");
        assert_eq!(second.folder, "002-add-auth");
        assert_eq!(first.id, "add-auth");
        assert_eq!(second.id, "add-auth-2");
        assert_eq!(first.status, QuestStatus::Created);
        assert_eq!(second.user_request, "again");
    }

    #[test]
    fn locate_reports_not_found() {
        let project = TestProject::new();
        let store = QuestStore::new(vec![project.root().to_path_buf()]);
        let err = store.locate("missing").expect_err("absent");
        assert_eq!(
            err.downcast_ref::<QuestError>(),
            Some(&QuestError::NotFound {
                quest_id: "missing".to_string()
            })
        );
    }

    #[test]
    fn locate_scans_every_project() {
        let first = TestProject::new();
        let second = TestProject::new();
        let path = second.write_quest(&quest_with_steps("far", vec![step("a", &[])]));
        let store = QuestStore::new(vec![first.root().to_path_buf(), second.root().to_path_buf()]);
        assert_eq!(store.locate("far").expect("found").path, path);
    }

    #[test]
    fn upsert_rejects_skipped_gate_without_writing() {
        let project = TestProject::new();
        let mut quest = quest_with_steps("q", vec![step("a", &[])]);
        quest.status = QuestStatus::Created;
        let path = project.write_quest(&quest);
        let before = fs::read_to_string(&path).expect("read");

        let err = upsert_quest(&path, &json!({"status": "approved"})).expect_err("skip");
        assert_eq!(
            err.downcast_ref::<QuestError>(),
            Some(&QuestError::InvalidTransition {
                from: QuestStatus::Created,
                to: QuestStatus::Approved,
            })
        );
        assert_eq!(fs::read_to_string(&path).expect("read"), before);
    }

    #[test]
    fn store_upsert_rejects_skipped_gate_by_id() {
        let project = TestProject::new();
        let mut quest = quest_with_steps("q", vec![step("a", &[])]);
        quest.status = QuestStatus::Created;
        let path = project.write_quest(&quest);
        let before = fs::read(&path).expect("read");
        let store = QuestStore::new(vec![project.root().to_path_buf()]);

        let err = store
            .upsert("q", &json!({"status": "requirements_approved"}))
            .expect_err("skip");
        assert_eq!(
            err.downcast_ref::<QuestError>(),
            Some(&QuestError::InvalidTransition {
                from: QuestStatus::Created,
                to: QuestStatus::RequirementsApproved,
            })
        );
        assert_eq!(fs::read(&path).expect("read"), before);

        let moved = store
            .upsert("q", &json!({"status": "flows_approved"}))
            .expect("adjacent");
        assert_eq!(moved.status, QuestStatus::FlowsApproved);
        assert_eq!(store.load("q").expect("load").status, QuestStatus::FlowsApproved);
    }

    #[test]
    fn store_reports_unknown_ids() {
        let project = TestProject::new();
        project.write_quest(&quest_with_steps("q", vec![step("a", &[])]));
        let store = QuestStore::new(vec![project.root().to_path_buf()]);
        let missing = Some(&QuestError::NotFound {
            quest_id: "nope".to_string(),
        });

        let err = store.upsert("nope", &json!({"title": "x"})).expect_err("upsert");
        assert_eq!(err.downcast_ref::<QuestError>(), missing);
        let err = store.load("nope").expect_err("load");
        assert_eq!(err.downcast_ref::<QuestError>(), missing);
    }

    #[test]
    fn store_load_matches_the_written_quest() {
        let project = TestProject::new();
        let quest = quest_with_steps("q", vec![step("a", &[]), step("b", &["a"])]);
        let path = project.write_quest(&quest);
        let store = QuestStore::new(vec![project.root().to_path_buf()]);

        let loaded = store.load("q").expect("load");
        assert_eq!(loaded.folder, "001-q");
        assert_eq!(loaded.status, QuestStatus::Approved);
        assert_eq!(
            loaded.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        assert_eq!(loaded.step("b").expect("b").depends_on, ["a"]);
        assert_eq!(project_root(&path), Some(project.root()));
        assert_eq!(project_root(Path::new("/tmp/quest.json")), None);
    }

    #[test]
    fn upsert_rejects_cycles_without_writing() {
        let project = TestProject::new();
        let path = project.write_quest(&quest_with_steps("q", vec![step("a", &[]), step("b", &["a"])]));
        let err = upsert_quest(&path, &json!({"steps": [{"id": "a", "dependsOn": ["b"]}]}))
            .expect_err("cycle");
        assert!(matches!(
            err.downcast_ref::<QuestError>(),
            Some(QuestError::InvalidGraph { .. })
        ));
        let quest = load_quest(&path).expect("load");
        assert!(quest.step("a").expect("a").depends_on.is_empty());
    }

    #[test]
    fn set_step_status_stamps_times_and_logs() {
        let project = TestProject::new();
        let path = project.write_quest(&quest_with_steps("q", vec![step("a", &[])]));

        set_step_status(&path, "a", StepStatus::InProgress, None, Some(LogEntry::now("step_dispatched").step("a")))
            .expect("start");
        let quest = set_step_status(&path, "a", StepStatus::Failed, Some("exit code 2"), None)
            .expect("fail");

        let a = quest.step("a").expect("a");
        assert_eq!(a.status, StepStatus::Failed);
        assert!(a.started_at.is_some());
        assert!(a.completed_at.is_some());
        assert_eq!(a.error_message.as_deref(), Some("exit code 2"));
        assert_eq!(quest.execution_log.len(), 1);
        assert_eq!(quest.execution_log[0].event, "step_dispatched");
    }

    #[test]
    fn set_step_status_reports_unknown_step() {
        let project = TestProject::new();
        let path = project.write_quest(&quest_with_steps("q", vec![step("a", &[])]));
        let err = set_step_status(&path, "zz", StepStatus::Complete, None, None).expect_err("unknown");
        assert!(matches!(
            err.downcast_ref::<QuestError>(),
            Some(QuestError::StepNotFound { step_id, .. }) if step_id == "zz"
        ));
    }

    #[test]
    fn load_rejects_schema_violations() {
        let project = TestProject::new();
        let path = project.write_quest(&quest_with_steps("q", vec![step("a", &[])]));
        fs::write(&path, r#"{"id": "q", "folder": "001-q", "status": "bogus", "createdAt": "t"}"#)
            .expect("write");
        let err = load_quest(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("schema"), "{err:#}");
    }
}
