//! Partial-update semantics for quest documents.
//!
//! Works on raw JSON so keys unknown to the typed model are merged too.
//! Collection entries are matched by `id`: matches are shallow-merged in
//! place, new ids are appended, absent ids are left alone. Nothing is ever
//! deleted through a patch.

use crate::quest::UPSERT_COLLECTIONS;
use serde_json::{Map, Value};

/// Keys a patch may not change.
pub const IMMUTABLE_KEYS: [&str; 3] = ["id", "folder", "createdAt"];

/// Append-only collection.
pub const EXECUTION_LOG_KEY: &str = "executionLog";

/// What a patch touched, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    /// `collection/id` of merged entries.
    pub updated: Vec<String>,
    /// `collection/id` of appended entries.
    pub appended: Vec<String>,
    /// Top-level keys replaced outright.
    pub replaced: Vec<String>,
    pub log_entries: usize,
}

/// Merge `updates` into `existing` by `id`.
pub fn upsert_items(
    collection: &str,
    existing: &mut Vec<Value>,
    updates: &[Value],
    summary: &mut PatchSummary,
) -> Result<(), String> {
    for (index, update) in updates.iter().enumerate() {
        let fields = update
            .as_object()
            .ok_or_else(|| format!("{}[{}]: entry must be an object", collection, index))?;
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("{}[{}]: entry needs a non-empty string id", collection, index))?;

        let position = existing
            .iter()
            .position(|item| item.get("id").and_then(Value::as_str) == Some(id));

        match position {
            Some(position) => {
                if let Some(target) = existing[position].as_object_mut() {
                    merge_shallow(target, fields);
                } else {
                    existing[position] = update.clone();
                }
                summary.updated.push(format!("{}/{}", collection, id));
            }
            None => {
                existing.push(update.clone());
                summary.appended.push(format!("{}/{}", collection, id));
            }
        }
    }
    Ok(())
}

fn merge_shallow(target: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (key, value) in fields {
        target.insert(key.clone(), value.clone());
    }
}

/// Apply a partial quest document to `document`.
///
/// Upsertable collections merge by id, `executionLog` appends, any other key
/// replaces the stored value. Status adjacency is the caller's concern.
pub fn apply_patch(document: &mut Value, patch: &Value) -> Result<PatchSummary, String> {
    let patch = patch
        .as_object()
        .ok_or_else(|| "patch must be a JSON object".to_string())?;
    let target = document
        .as_object_mut()
        .ok_or_else(|| "quest document must be a JSON object".to_string())?;

    for key in IMMUTABLE_KEYS {
        match patch.get(key) {
            Some(value) if target.get(key) != Some(value) => {
                return Err(format!("'{}' cannot be changed", key));
            }
            _ => {}
        }
    }

    let mut summary = PatchSummary::default();

    for (key, value) in patch {
        if IMMUTABLE_KEYS.contains(&key.as_str()) {
            continue;
        }

        if UPSERT_COLLECTIONS.contains(&key.as_str()) {
            let updates = value
                .as_array()
                .ok_or_else(|| format!("'{}' must be an array", key))?;
            let slot = target
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(existing) = slot {
                upsert_items(key, existing, updates, &mut summary)?;
            }
            continue;
        }

        if key == EXECUTION_LOG_KEY {
            let entries = value
                .as_array()
                .ok_or_else(|| format!("'{}' must be an array", key))?;
            let slot = target
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(log) = slot {
                log.extend(entries.iter().cloned());
            }
            summary.log_entries += entries.len();
            continue;
        }

        target.insert(key.clone(), value.clone());
        summary.replaced.push(key.clone());
    }

    Ok(summary)
}
