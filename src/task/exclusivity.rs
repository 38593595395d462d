//! Mutual exclusion across tasks.
//!
//! Tasks registered under a category are chained: each new task depends on
//! the task registered before it in the same category, so at most one task
//! per category runs at a time and they run in registration order. Tasks
//! leave the registry when they finish.
//!
//! One coordinator is shared by every queue that must honour the same
//! categories; [`crate::task::TaskQueue::with_coordinator`] takes it
//! explicitly.

use crate::task::operation::Task;
use crate::task::types::TaskId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Registry of running and waiting tasks per exclusivity category
#[derive(Debug, Default)]
pub struct ExclusivityCoordinator {
    categories: Mutex<HashMap<String, Vec<Task>>>,
}

impl ExclusivityCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under every category, making it depend on the task
    /// currently last in each category. The task must not be enqueued yet.
    pub fn register(&self, task: &Task, categories: &[String]) {
        let mut registry = self.registry();

        for category in categories {
            let tasks = registry.entry(category.clone()).or_default();
            if tasks.contains(task) {
                continue;
            }
            if let Some(last) = tasks.last() {
                debug!(
                    "Task {} waits for {} in category {}",
                    task.label(),
                    last.label(),
                    category
                );
                task.add_dependency(last);
            }
            tasks.push(task.clone());
        }
    }

    /// Remove `task` from every category
    pub fn unregister(&self, task: &Task, categories: &[String]) {
        let mut registry = self.registry();

        for category in categories {
            let Some(tasks) = registry.get_mut(category) else {
                continue;
            };
            tasks.retain(|registered| registered != task);
            if tasks.is_empty() {
                registry.remove(category);
            }
        }
        debug!("Task {} left {} category(ies)", task.id(), categories.len());
    }

    /// Ids of the tasks registered in `category`, oldest first
    pub fn registered(&self, category: &str) -> Vec<TaskId> {
        self.registry()
            .get(category)
            .map(|tasks| tasks.iter().map(Task::id).collect())
            .unwrap_or_default()
    }

    /// Categories with at least one registered task
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.registry().keys().cloned().collect();
        categories.sort();
        categories
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Vec<Task>>> {
        self.categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
