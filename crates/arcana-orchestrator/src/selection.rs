//! Task selection: which pending task an agent should run next.
//!
//! Everything here is a pure function over a task map. The store performs the
//! `Pending -> InProgress` transition around [`select_next`] while holding its
//! write lock, so two callers can never claim the same task.

use crate::types::{Task, TaskStatus};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use uuid::Uuid;

/// True when every dependency resolves to a `Completed` task.
///
/// A dependency id that is not in the map counts as unmet.
pub fn dependencies_met(task: &Task, tasks: &BTreeMap<Uuid, Task>) -> bool {
    task.dependencies.iter().all(|dep| {
        tasks
            .get(dep)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
}

/// Whether `task` may be dispatched to `agent` right now.
pub fn is_eligible(
    task: &Task,
    agent: &str,
    exclude_tags: &[String],
    tasks: &BTreeMap<Uuid, Task>,
) -> bool {
    task.status == TaskStatus::Pending
        && task.agent == agent
        && !task.has_any_tag(exclude_tags)
        && dependencies_met(task, tasks)
}

/// Pick the best eligible task for `agent`: highest priority, then oldest.
///
/// The id is the final tie-break so the choice is deterministic.
pub fn select_next<'a>(
    tasks: &'a BTreeMap<Uuid, Task>,
    agent: &str,
    exclude_tags: &[String],
) -> Option<&'a Task> {
    tasks
        .values()
        .filter(|t| is_eligible(t, agent, exclude_tags, tasks))
        .min_by_key(|t| (Reverse(t.priority), t.created_at, t.id))
}

/// Pending tasks held back by at least one unmet dependency.
pub fn blocked_tasks(tasks: &BTreeMap<Uuid, Task>) -> Vec<&Task> {
    tasks
        .values()
        .filter(|t| t.status == TaskStatus::Pending && !dependencies_met(t, tasks))
        .collect()
}

/// Check for cycles in the dependency graph.
/// Returns true if a cycle is detected.
pub fn has_cycle(tasks: &BTreeMap<Uuid, Task>) -> bool {
    let mut visited = BTreeMap::new();
    tasks.keys().any(|&id| dfs_cycle(tasks, id, &mut visited))
}

fn dfs_cycle(tasks: &BTreeMap<Uuid, Task>, id: Uuid, visited: &mut BTreeMap<Uuid, u8>) -> bool {
    match visited.get(&id) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // finished
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(task) = tasks.get(&id) {
        for dep in &task.dependencies {
            if dfs_cycle(tasks, *dep, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}
