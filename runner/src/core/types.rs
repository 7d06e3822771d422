//! Shared deterministic types for orchestration logic.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::quest::StepType;

/// Agent persona spawned for a unit of work.
///
/// Each role has its own prompt template; the template name is [`AgentRole::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Discovery: maps the codebase before implementation.
    Pathseeker,
    /// Implementation.
    Codeweaver,
    /// Testing.
    Siegemaster,
    /// Review.
    Lawbringer,
    /// Documentation.
    Chronicler,
    /// Repair after a failed Ward gate.
    Spiritmender,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Pathseeker,
        AgentRole::Codeweaver,
        AgentRole::Siegemaster,
        AgentRole::Lawbringer,
        AgentRole::Chronicler,
        AgentRole::Spiritmender,
    ];

    /// Role that executes a step of the given type.
    pub fn for_step(step_type: StepType) -> Self {
        match step_type {
            StepType::Discovery => AgentRole::Pathseeker,
            StepType::Implementation => AgentRole::Codeweaver,
            StepType::Testing => AgentRole::Siegemaster,
            StepType::Review => AgentRole::Lawbringer,
            StepType::Documentation => AgentRole::Chronicler,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Pathseeker => "pathseeker",
            AgentRole::Codeweaver => "codeweaver",
            AgentRole::Siegemaster => "siegemaster",
            AgentRole::Lawbringer => "lawbringer",
            AgentRole::Chronicler => "chronicler",
            AgentRole::Spiritmender => "spiritmender",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalating guidance given to successive repair attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    BasicFixes,
    DeeperAnalysis,
    LastResort,
}

impl RepairStrategy {
    /// Strategy for a 1-based attempt number.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => RepairStrategy::BasicFixes,
            2 => RepairStrategy::DeeperAnalysis,
            _ => RepairStrategy::LastResort,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepairStrategy::BasicFixes => "basic_fixes",
            RepairStrategy::DeeperAnalysis => "deeper_analysis",
            RepairStrategy::LastResort => "last_resort",
        }
    }

    pub fn guidance(self) -> &'static str {
        match self {
            RepairStrategy::BasicFixes => {
                "Fix the reported errors directly. Prefer the smallest change that resolves each one."
            }
            RepairStrategy::DeeperAnalysis => {
                "Earlier fixes did not hold. Look for the shared root cause behind the remaining errors before editing."
            }
            RepairStrategy::LastResort => {
                "This is the final attempt. Simplify or revert the offending code if a targeted fix is not possible."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_types_map_to_distinct_roles() {
        assert_eq!(AgentRole::for_step(StepType::Discovery), AgentRole::Pathseeker);
        assert_eq!(AgentRole::for_step(StepType::Implementation), AgentRole::Codeweaver);
        assert_eq!(AgentRole::for_step(StepType::Testing), AgentRole::Siegemaster);
        assert_eq!(AgentRole::for_step(StepType::Review), AgentRole::Lawbringer);
        assert_eq!(AgentRole::for_step(StepType::Documentation), AgentRole::Chronicler);
    }

    #[test]
    fn repair_strategy_escalates_and_saturates() {
        assert_eq!(RepairStrategy::for_attempt(1), RepairStrategy::BasicFixes);
        assert_eq!(RepairStrategy::for_attempt(2), RepairStrategy::DeeperAnalysis);
        assert_eq!(RepairStrategy::for_attempt(3), RepairStrategy::LastResort);
        assert_eq!(RepairStrategy::for_attempt(9), RepairStrategy::LastResort);
    }
}
