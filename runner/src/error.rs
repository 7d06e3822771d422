//! Typed failures callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context; these variants are
//! recovered with `err.downcast_ref::<QuestError>()`.

use std::fmt;

use crate::quest::QuestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestError {
    /// No quest with this id exists in any scanned project.
    NotFound { quest_id: String },
    /// The quest exists but has no step with this id.
    StepNotFound { quest_id: String, step_id: String },
    /// Requested status is not adjacent to the current one. The quest is unchanged.
    InvalidTransition { from: QuestStatus, to: QuestStatus },
    /// Steps do not form a valid dependency DAG.
    InvalidGraph { errors: Vec<String> },
    /// Execution was requested for a quest still in planning.
    NotApproved { status: QuestStatus },
}

impl fmt::Display for QuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestError::NotFound { quest_id } => write!(f, "quest not found: {quest_id}"),
            QuestError::StepNotFound { quest_id, step_id } => {
                write!(f, "step '{step_id}' not found in quest {quest_id}")
            }
            QuestError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            QuestError::InvalidGraph { errors } => {
                write!(f, "invalid step graph:\n- {}", errors.join("\n- "))
            }
            QuestError::NotApproved { status } => write!(
                f,
                "quest must be approved before execution (current status: {status})"
            ),
        }
    }
}

impl std::error::Error for QuestError {}
