//! Quest status adjacency.
//!
//! Planning moves forward one gate at a time; execution ends in exactly one of
//! `complete` or `failed`. Requesting the current status again is a no-op.

use crate::error::QuestError;
use crate::quest::QuestStatus;

/// Statuses reachable from `from` in one transition.
pub fn allowed_next(from: QuestStatus) -> &'static [QuestStatus] {
    match from {
        QuestStatus::Created => &[QuestStatus::FlowsApproved],
        QuestStatus::FlowsApproved => &[QuestStatus::RequirementsApproved],
        QuestStatus::RequirementsApproved => &[QuestStatus::Approved],
        QuestStatus::Approved => &[QuestStatus::InProgress],
        QuestStatus::InProgress => &[QuestStatus::Complete, QuestStatus::Failed],
        QuestStatus::Complete | QuestStatus::Failed => &[],
    }
}

/// Accept `from -> to` if adjacent or identical.
pub fn validate_transition(from: QuestStatus, to: QuestStatus) -> Result<(), QuestError> {
    if from == to || allowed_next(from).contains(&to) {
        Ok(())
    } else {
        Err(QuestError::InvalidTransition { from, to })
    }
}
