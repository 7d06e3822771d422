//! Structural checks on the step dependency graph.

use crate::quest::Step;
use std::collections::{HashMap, HashSet};

/// Check the step list forms a valid dependency DAG:
/// - Non-empty, unique ids
/// - No step depends on itself
/// - Every `dependsOn` entry names an existing step
/// - No dependency cycles
///
/// Returns a list of stable error messages (empty on success).
pub fn validate_step_graph(steps: &[Step]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            errors.push(format!("steps[{}]: id must be non-empty", index));
            continue;
        }
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }

    if let Some(cycle) = find_cycle(steps) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// First cycle found by depth-first search in step order, as a closed path.
///
/// Self-loops and unknown dependencies are reported separately and skipped here.
fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    let index: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for step in steps {
        if marks.contains_key(step.id.as_str()) {
            continue;
        }
        if let Some(cycle) = visit(step.id.as_str(), &index, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a Step>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Mark::Visiting);
    stack.push(id);

    if let Some(step) = index.get(id) {
        for dep in &step.depends_on {
            let dep = dep.as_str();
            if dep == id || !index.contains_key(dep) {
                continue;
            }
            match marks.get(dep) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(dep, index, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
    }

    stack.pop();
    marks.insert(id, Mark::Done);
    None
}
