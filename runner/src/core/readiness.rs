//! Step readiness and stall analysis.

use crate::quest::{Step, StepStatus};
use std::collections::{HashMap, HashSet};

/// Steps that may be dispatched now, in step-array order.
///
/// A step is ready when it is `pending` and every dependency is `complete`.
/// A dependency id that names no step is never satisfied.
pub fn ready_steps(steps: &[Step]) -> Vec<&Step> {
    let status: HashMap<&str, StepStatus> =
        steps.iter().map(|s| (s.id.as_str(), s.status)).collect();

    steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| {
            step.depends_on
                .iter()
                .all(|dep| status.get(dep.as_str()) == Some(&StepStatus::Complete))
        })
        .collect()
}

/// A failed step with the message it recorded, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    pub id: String,
    pub error_message: Option<String>,
}

/// Why no further step can run although the graph is not complete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StallReport {
    /// Failed steps in array order; the first one is the blocking failure.
    pub failed: Vec<FailedStep>,
    /// Pending steps that transitively depend on a failed step.
    pub blocked: Vec<String>,
    /// Non-terminal steps that are neither blocked by a failure nor running
    /// under this orchestrator (e.g. left `in_progress` by another writer).
    pub stranded: Vec<String>,
}

impl StallReport {
    pub fn first_failure(&self) -> Option<&FailedStep> {
        self.failed.first()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(first) = self.first_failure() {
            match &first.error_message {
                Some(message) => parts.push(format!("step '{}' failed: {}", first.id, message)),
                None => parts.push(format!("step '{}' failed", first.id)),
            }
        }
        if self.failed.len() > 1 {
            let rest: Vec<&str> = self.failed[1..].iter().map(|f| f.id.as_str()).collect();
            parts.push(format!("also failed: {}", rest.join(", ")));
        }
        if !self.blocked.is_empty() {
            parts.push(format!("blocked: {}", self.blocked.join(", ")));
        }
        if !self.stranded.is_empty() {
            parts.push(format!("stranded: {}", self.stranded.join(", ")));
        }
        if parts.is_empty() {
            return "no runnable steps".to_string();
        }
        parts.join("; ")
    }
}

/// Explain a stalled graph. Only meaningful when nothing is in flight and
/// [`ready_steps`] is empty.
pub fn stall_report(steps: &[Step]) -> StallReport {
    let failed: Vec<FailedStep> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .map(|s| FailedStep {
            id: s.id.clone(),
            error_message: s.error_message.clone(),
        })
        .collect();

    let mut tainted: HashSet<&str> = failed.iter().map(|f| f.id.as_str()).collect();
    loop {
        let mut grew = false;
        for step in steps {
            if step.status.is_terminal() || tainted.contains(step.id.as_str()) {
                continue;
            }
            if step.depends_on.iter().any(|dep| tainted.contains(dep.as_str())) {
                tainted.insert(step.id.as_str());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let mut blocked = Vec::new();
    let mut stranded = Vec::new();
    for step in steps {
        if step.status.is_terminal() {
            continue;
        }
        if tainted.contains(step.id.as_str()) {
            blocked.push(step.id.clone());
        } else {
            stranded.push(step.id.clone());
        }
    }

    StallReport {
        failed,
        blocked,
        stranded,
    }
}
