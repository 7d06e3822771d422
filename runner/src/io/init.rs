//! Initialization helpers for `.quests/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{QuestConfig, config_path, write_config};
use super::prompt::overrides_dir;
use super::quest_store::{QUEST_SCHEMA, quests_dir};

/// Canonical paths within `.quests/` for a project root.
#[derive(Debug, Clone)]
pub struct QuestPaths {
    pub root: PathBuf,
    pub quests_dir: PathBuf,
    pub config_path: PathBuf,
    pub schema_path: PathBuf,
    pub prompts_dir: PathBuf,
    pub prompts_readme_path: PathBuf,
}

impl QuestPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let quests_dir = quests_dir(&root);
        let prompts_dir = overrides_dir(&root);
        Self {
            config_path: config_path(&root),
            schema_path: quests_dir.join("quest.schema.json"),
            prompts_readme_path: prompts_dir.join("README.md"),
            root,
            quests_dir,
            prompts_dir,
        }
    }
}

/// Options for `init_quests`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create `.quests/` scaffolding in `root`.
///
/// Existing quest folders are never touched. Fails if the config already
/// exists unless `options.force` is set.
pub fn init_quests(root: &Path, options: &InitOptions) -> Result<QuestPaths> {
    let paths = QuestPaths::new(root);
    if paths.quests_dir.exists() && !paths.quests_dir.is_dir() {
        return Err(anyhow!("init: .quests exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.prompts_dir)
        .with_context(|| format!("create directory {}", paths.prompts_dir.display()))?;
    write_config(&paths.config_path, &QuestConfig::default())?;
    write_file(&paths.schema_path, QUEST_SCHEMA)?;
    write_file(&paths.prompts_readme_path, PROMPTS_README)?;

    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const PROMPTS_README: &str = "# Prompt overrides\n\n\
Place `<role>.md` here to replace a built-in agent prompt. Roles: pathseeker,\n\
codeweaver, siegemaster, lawbringer, chronicler, spiritmender.\n\n\
Use `{{ arguments }}` where the step or repair arguments should go.\n";
