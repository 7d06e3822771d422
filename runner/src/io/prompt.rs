//! Role prompt templates and the arguments substituted into them.
//!
//! Every role template has a single `{{ arguments }}` placeholder. Built-in
//! templates can be replaced per project with `.quests/prompts/<role>.md`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde_json::Value;
use tracing::debug;

use crate::core::types::{AgentRole, RepairStrategy};
use crate::core::ward::WardResult;
use crate::io::quest_store::quests_dir;
use crate::quest::{Item, Quest, Step, StepType};

const PATHSEEKER_TEMPLATE: &str = include_str!("prompts/pathseeker.md");
const CODEWEAVER_TEMPLATE: &str = include_str!("prompts/codeweaver.md");
const SIEGEMASTER_TEMPLATE: &str = include_str!("prompts/siegemaster.md");
const LAWBRINGER_TEMPLATE: &str = include_str!("prompts/lawbringer.md");
const CHRONICLER_TEMPLATE: &str = include_str!("prompts/chronicler.md");
const SPIRITMENDER_TEMPLATE: &str = include_str!("prompts/spiritmender.md");

/// Placeholder spelling accepted in override files for compatibility with
/// plain-text prompt packs.
const LEGACY_PLACEHOLDER: &str = "$ARGUMENTS";

const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Role templates for one orchestration run.
///
/// Built once per run and shared read-only, so concurrent runs (and tests)
/// never see each other's overrides.
#[derive(Debug)]
pub struct PromptRegistry {
    env: Environment<'static>,
    templates: BTreeMap<AgentRole, String>,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PromptRegistry {
    /// Registry with only the built-in templates.
    pub fn builtin() -> Self {
        let templates = AgentRole::ALL
            .into_iter()
            .map(|role| (role, builtin_template(role).to_string()))
            .collect();
        Self {
            env: Environment::new(),
            templates,
        }
    }

    /// Built-ins overlaid with any `<project>/.quests/prompts/<role>.md`.
    pub fn load(project: &Path) -> Result<Self> {
        let mut registry = Self::builtin();
        let dir = overrides_dir(project);
        for role in AgentRole::ALL {
            let path = dir.join(format!("{}.md", role.as_str()));
            if !path.is_file() {
                continue;
            }
            let source = fs::read_to_string(&path)
                .with_context(|| format!("read prompt override {}", path.display()))?;
            registry
                .set(role, &source)
                .with_context(|| format!("load prompt override {}", path.display()))?;
            debug!(role = %role, path = %path.display(), "using prompt override");
        }
        Ok(registry)
    }

    /// Replace one role's template after checking it compiles.
    pub fn set(&mut self, role: AgentRole, source: &str) -> Result<()> {
        let source = source.replace(LEGACY_PLACEHOLDER, "{{ arguments }}");
        self.env
            .template_from_str(&source)
            .map_err(|err| anyhow!("invalid {} template: {}", role, err))?;
        self.templates.insert(role, source);
        Ok(())
    }

    /// Render `role`'s template with `arguments` substituted.
    pub fn render(&self, role: AgentRole, arguments: &str) -> Result<String> {
        let source = self
            .templates
            .get(&role)
            .ok_or_else(|| anyhow!("no prompt template for role {}", role))?;
        let rendered = self
            .env
            .render_str(source, context! { arguments => arguments })
            .with_context(|| format!("render {} prompt", role))?;
        Ok(rendered)
    }
}

pub fn overrides_dir(project: &Path) -> PathBuf {
    quests_dir(project).join("prompts")
}

fn builtin_template(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Pathseeker => PATHSEEKER_TEMPLATE,
        AgentRole::Codeweaver => CODEWEAVER_TEMPLATE,
        AgentRole::Siegemaster => SIEGEMASTER_TEMPLATE,
        AgentRole::Lawbringer => LAWBRINGER_TEMPLATE,
        AgentRole::Chronicler => CHRONICLER_TEMPLATE,
        AgentRole::Spiritmender => SPIRITMENDER_TEMPLATE,
    }
}

/// Arguments for the agent that executes `step`, bounded by `budget` bytes.
pub fn step_arguments(quest: &Quest, quest_path: &Path, step: &Step, budget: usize) -> String {
    let mut lines = vec![
        format!("Quest ID: {}", quest.id),
        format!("Quest file: {}", quest_path.display()),
        format!("Step ID: {}", step.id),
        format!("Step: {}", step.name),
    ];
    if !step.description.trim().is_empty() {
        lines.push(format!("Description: {}", step.description.trim()));
    }

    match step.step_type {
        StepType::Discovery => {
            if !quest.user_request.trim().is_empty() {
                lines.push(format!("User request: {}", quest.user_request.trim()));
            }
            push_items(&mut lines, "Requirements:", &quest.requirements);
            push_items(&mut lines, "Design decisions:", &quest.design_decisions);
        }
        StepType::Implementation | StepType::Documentation => {
            push_list(&mut lines, "Files to Create:", &step.files_to_create);
            push_list(&mut lines, "Files to Modify:", &step.files_to_modify);
            push_items(&mut lines, "Related Requirements:", &related(step, &quest.requirements));
            push_items(&mut lines, "Related Contracts:", &related(step, &quest.contracts));
            push_items(&mut lines, "Related Observables:", &related(step, &quest.observables));
        }
        StepType::Testing => {
            push_list(&mut lines, "Files to Create:", &step.files_to_create);
            push_list(&mut lines, "Files to Modify:", &step.files_to_modify);
            push_items(&mut lines, "Observables:", &quest.observables);
            push_items(&mut lines, "Contexts:", &quest.contexts);
        }
        StepType::Review => {
            push_list(&mut lines, "Files to Review:", &review_files(quest, step));
        }
    }

    truncate_to_budget(lines.join("\n"), budget)
}

/// Arguments for a repair attempt (1-based `attempt` of `max`).
///
/// Diagnostics are grouped by file; when none carries a file path the quest's
/// step files are listed so the agent still knows where to look. `previous`
/// holds one-line summaries of the gate runs earlier attempts left behind.
pub fn repair_arguments(
    quest: &Quest,
    ward: &WardResult,
    previous: &[String],
    attempt: u32,
    max: u32,
    budget: usize,
) -> String {
    let strategy = RepairStrategy::for_attempt(attempt);
    let mut lines = vec![
        format!("Quest ID: {}", quest.id),
        format!("Repair attempt: {} of {}", attempt, max),
        format!("Strategy: {}", strategy.as_str()),
        strategy.guidance().to_string(),
    ];

    let by_file = ward.by_file();
    let files: Vec<String> = if by_file.is_empty() {
        quest.changed_files()
    } else {
        by_file.keys().cloned().collect()
    };
    push_list(&mut lines, "Files:", &files);

    if !by_file.is_empty() {
        lines.push("Errors:".to_string());
        for (file, diagnostics) in &by_file {
            lines.push(format!("  {}", file));
            for d in diagnostics {
                let position = match (d.line, d.column) {
                    (Some(line), Some(column)) => format!("{}:{} ", line, column),
                    (Some(line), None) => format!("{} ", line),
                    _ => String::new(),
                };
                lines.push(format!(
                    "    - {}{} {}: {}",
                    position,
                    d.severity.as_str(),
                    d.rule,
                    d.message
                ));
            }
        }
    }

    let general = ward.general();
    if !general.is_empty() {
        lines.push("General:".to_string());
        for d in general {
            lines.push(format!("  - [{}] {}", d.rule, d.message));
        }
    }

    if !previous.is_empty() {
        lines.push("Previous attempts left:".to_string());
        for (index, summary) in previous.iter().enumerate() {
            lines.push(format!("  {}. {}", index + 1, summary));
        }
    }

    lines.push("Re-run the project's checks on these files to verify fixes.".to_string());
    truncate_to_budget(lines.join("\n"), budget)
}

/// Cut `text` to at most `budget` bytes on a char boundary, marking the cut.
pub fn truncate_to_budget(mut text: String, budget: usize) -> String {
    if text.len() <= budget {
        return text;
    }
    let keep = budget.saturating_sub(TRUNCATION_MARKER.len());
    let mut cut = keep.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    if budget >= TRUNCATION_MARKER.len() {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn push_list(lines: &mut Vec<String>, header: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    lines.push(header.to_string());
    for value in values {
        lines.push(format!("  - {}", value));
    }
}

fn push_items(lines: &mut Vec<String>, header: &str, items: &[Item]) {
    if items.is_empty() {
        return;
    }
    lines.push(header.to_string());
    for item in items {
        lines.push(format!("  - {}", describe_item(item)));
    }
}

/// `id: label` where label is the first of name/trigger/description present.
fn describe_item(item: &Item) -> String {
    let id = item.get("id").and_then(Value::as_str).unwrap_or("?");
    let label = ["name", "trigger", "title", "description"]
        .iter()
        .find_map(|key| item.get(*key).and_then(Value::as_str));
    match label {
        Some(label) => format!("{}: {}", id, label),
        None => id.to_string(),
    }
}

/// Collection items the step references through any string-array field
/// (e.g. `observablesSatisfied`, `relatedRequirements`).
fn related(step: &Step, items: &[Item]) -> Vec<Item> {
    let referenced: Vec<&str> = step
        .extra
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(Value::as_str)
        .collect();
    items
        .iter()
        .filter(|item| {
            item.get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| referenced.contains(&id))
        })
        .cloned()
        .collect()
}

/// Files of the step and of every step it depends on.
fn review_files(quest: &Quest, step: &Step) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut push = |file: &String| {
        if !files.contains(file) {
            files.push(file.clone());
        }
    };
    for file in step.files_to_create.iter().chain(&step.files_to_modify) {
        push(file);
    }
    for dep in &step.depends_on {
        if let Some(dep) = quest.step(dep) {
            for file in dep.files_to_create.iter().chain(&dep.files_to_modify) {
                push(file);
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ward::{Diagnostic, Severity};
    use crate::test_support::{quest_with_steps, step};
    use serde_json::json;

    fn diag(file: &str, line: u32, rule: &str, message: &str) -> Diagnostic {
        Diagnostic {
            file: Some(file.to_string()),
            line: Some(line),
            column: Some(1),
            severity: Severity::Error,
            rule: rule.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn builtin_templates_substitute_arguments() {
        let registry = PromptRegistry::builtin();
        for role in AgentRole::ALL {
            let prompt = registry.render(role, "ARGS-MARKER").expect("render");
            assert!(prompt.contains("ARGS-MARKER"), "{role} template lost arguments");
        }
    }

    #[test]
    fn overrides_replace_builtins_per_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = overrides_dir(temp.path());
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("codeweaver.md"), "custom weaver: $ARGUMENTS").expect("write");

        let registry = PromptRegistry::load(temp.path()).expect("load");
        assert_eq!(
            registry.render(AgentRole::Codeweaver, "x").expect("render"),
            "custom weaver: x"
        );
        let builtin = PromptRegistry::builtin();
        assert_ne!(
            builtin.render(AgentRole::Codeweaver, "x").expect("render"),
            "custom weaver: x"
        );
    }

    #[test]
    fn broken_override_is_rejected() {
        let mut registry = PromptRegistry::builtin();
        let err = registry
            .set(AgentRole::Lawbringer, "{% if %}")
            .expect_err("syntax error");
        assert!(err.to_string().contains("lawbringer"));
    }

    #[test]
    fn implementation_arguments_list_files_and_related_items() {
        let mut quest = quest_with_steps("q-1", Vec::new());
        quest.requirements = vec![
            json!({"id": "r-1", "name": "Login works"}).as_object().cloned().expect("obj"),
            json!({"id": "r-2", "name": "Unrelated"}).as_object().cloned().expect("obj"),
        ];
        let mut s = step("a", &[]);
        s.files_to_create = vec!["src/login.ts".to_string()];
        s.extra.insert("relatedRequirements".to_string(), json!(["r-1"]));

        let args = step_arguments(&quest, Path::new("/p/quest.json"), &s, 10_000);
        assert!(args.contains("Quest ID: q-1"));
        assert!(args.contains("Files to Create:\n  - src/login.ts"));
        assert!(args.contains("r-1: Login works"));
        assert!(!args.contains("Unrelated"));
    }

    #[test]
    fn review_arguments_include_dependency_files() {
        let mut a = step("a", &[]);
        a.files_to_modify = vec!["src/a.ts".to_string()];
        let mut review = step("r", &["a"]);
        review.step_type = StepType::Review;
        let quest = quest_with_steps("q", vec![a, review.clone()]);

        let args = step_arguments(&quest, Path::new("quest.json"), &review, 10_000);
        assert!(args.contains("Files to Review:\n  - src/a.ts"), "{args}");
    }

    #[test]
    fn repair_arguments_group_by_file_with_strategy() {
        let quest = quest_with_steps("q", vec![step("a", &[])]);
        let ward = WardResult::failing(vec![
            diag("src/b.ts", 3, "TS2322", "bad type"),
            diag("src/a.ts", 10, "TS7006", "implicit any"),
        ]);
        let args = repair_arguments(&quest, &ward, &["failed: TS2322 x3".to_string()], 2, 3, 10_000);
        assert!(args.contains("Repair attempt: 2 of 3"));
        assert!(args.contains("Strategy: deeper_analysis"));
        let a = args.find("  src/a.ts").expect("a");
        let b = args.find("  src/b.ts").expect("b");
        assert!(a < b);
        assert!(args.contains("10:1 error TS7006: implicit any"));
        assert!(args.contains("Previous attempts left:\n  1. failed: TS2322 x3"));
    }

    #[test]
    fn repair_arguments_fall_back_to_step_files() {
        let mut s = step("a", &[]);
        s.files_to_modify = vec!["src/only.ts".to_string()];
        let quest = quest_with_steps("q", vec![s]);
        let ward = WardResult::failing(vec![Diagnostic::general("ward/exit", "exited with 1")]);
        let args = repair_arguments(&quest, &ward, &[], 1, 3, 10_000);
        assert!(args.contains("Files:\n  - src/only.ts"));
        assert!(args.contains("[ward/exit] exited with 1"));
    }

    #[test]
    fn truncation_respects_budget_and_char_boundaries() {
        let text = "é".repeat(50);
        let cut = truncate_to_budget(text, 31);
        assert!(cut.len() <= 31);
        assert!(cut.ends_with("[truncated]"));
        assert_eq!(truncate_to_budget("short".to_string(), 100), "short");
    }
}
