//! Persisted Ward runs under `<quest folder>/ward/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ward::WardResult;

pub const WARD_DIR: &str = "ward";

/// One gate run as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardRecord {
    pub label: String,
    pub recorded_at: String,
    #[serde(flatten)]
    pub result: WardResult,
}

/// Write `record` as `<quest folder>/ward/<NNN>-<label>.json`, numbering after
/// the highest existing record.
pub fn write_ward_record(quest_folder: &Path, record: &WardRecord) -> Result<PathBuf> {
    let dir = quest_folder.join(WARD_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("create ward dir {}", dir.display()))?;

    let next = next_record_number(&dir)?;
    let path = dir.join(format!("{:03}-{}.json", next, record.label));
    let mut buf = serde_json::to_string_pretty(record).context("serialize ward record")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write ward record {}", path.display()))?;
    Ok(path)
}

/// Records in write order.
pub fn read_ward_records(quest_folder: &Path) -> Result<Vec<WardRecord>> {
    let dir = quest_folder.join(WARD_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("read ward dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read ward record {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse ward record {}", path.display()))
        })
        .collect()
}

fn next_record_number(dir: &Path) -> Result<u32> {
    let mut highest = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("read ward dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let digits: String = name
            .to_string_lossy()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if let Ok(number) = digits.parse::<u32>() {
            highest = highest.max(number);
        }
    }
    Ok(highest + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ward::Diagnostic;

    fn record(label: &str, result: WardResult) -> WardRecord {
        WardRecord {
            label: label.to_string(),
            recorded_at: "2026-01-01T00:00:00.000Z".to_string(),
            result,
        }
    }

    #[test]
    fn records_are_numbered_in_write_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failing = WardResult::failing(vec![Diagnostic::general("ward/exit", "exited with 1")]);

        let first = write_ward_record(temp.path(), &record("validate", failing.clone())).expect("first");
        let second =
            write_ward_record(temp.path(), &record("repair-1", WardResult::passing())).expect("second");

        assert!(first.ends_with("ward/001-validate.json"));
        assert!(second.ends_with("ward/002-repair-1.json"));

        let records = read_ward_records(temp.path()).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].result, failing);
        assert!(records[1].result.passed);
    }
}
