//! Preconditions gating a task's move to `Ready`.
//!
//! Every condition attached to a task is evaluated exactly once, concurrently
//! with its siblings, after the task's dependencies have finished. Failures
//! never stop sibling evaluation; they are collected and reported when the
//! task finishes.

use crate::task::operation::Task;
use crate::task::types::{ConditionResult, TaskError};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

/// A precondition for running a task
#[async_trait]
pub trait Condition: Send + Sync {
    /// Name used in diagnostics and, for mutually exclusive conditions, as
    /// the exclusivity category
    fn name(&self) -> String;

    /// Whether every task carrying this condition must run alone
    fn is_mutually_exclusive(&self) -> bool {
        false
    }

    /// A helper task that must finish before `task` may run. The queue
    /// enqueues it if nobody did yet.
    fn dependency(&self, _task: &Task) -> Option<Task> {
        None
    }

    async fn evaluate(&self, task: &Task) -> ConditionResult;
}

#[async_trait]
impl<C: Condition + ?Sized> Condition for Arc<C> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn is_mutually_exclusive(&self) -> bool {
        (**self).is_mutually_exclusive()
    }

    fn dependency(&self, task: &Task) -> Option<Task> {
        (**self).dependency(task)
    }

    async fn evaluate(&self, task: &Task) -> ConditionResult {
        (**self).evaluate(task).await
    }
}

/// Serializes every task carrying it, one category per type `T`.
///
/// ```rust
/// use taskflow::task::{MutuallyExclusive, Task};
///
/// enum Database {}
///
/// let task = Task::noop().with_condition(MutuallyExclusive::<Database>::new());
/// assert_eq!(task.conditions().len(), 1);
/// ```
pub struct MutuallyExclusive<T: ?Sized> {
    _category: PhantomData<fn() -> T>,
}

impl<T: ?Sized> MutuallyExclusive<T> {
    pub fn new() -> Self {
        Self {
            _category: PhantomData,
        }
    }
}

impl<T: ?Sized> Default for MutuallyExclusive<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: ?Sized + 'static> Condition for MutuallyExclusive<T> {
    fn name(&self) -> String {
        format!("MutuallyExclusive<{}>", std::any::type_name::<T>())
    }

    fn is_mutually_exclusive(&self) -> bool {
        true
    }

    async fn evaluate(&self, _task: &Task) -> ConditionResult {
        ConditionResult::Satisfied
    }
}

/// Like [`MutuallyExclusive`], with the category chosen at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveCategory {
    category: String,
}

impl ExclusiveCategory {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

#[async_trait]
impl Condition for ExclusiveCategory {
    fn name(&self) -> String {
        self.category.clone()
    }

    fn is_mutually_exclusive(&self) -> bool {
        true
    }

    async fn evaluate(&self, _task: &Task) -> ConditionResult {
        ConditionResult::Satisfied
    }
}

/// Requires a helper task to run first and to finish without errors
#[derive(Debug, Clone)]
pub struct DependencyCondition {
    name: String,
    dependency: Task,
}

impl DependencyCondition {
    pub fn new(dependency: Task) -> Self {
        Self {
            name: format!("Dependency<{}>", dependency.label()),
            dependency,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Condition for DependencyCondition {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependency(&self, _task: &Task) -> Option<Task> {
        Some(self.dependency.clone())
    }

    async fn evaluate(&self, _task: &Task) -> ConditionResult {
        let errors = self.dependency.errors();
        if errors.is_empty() {
            return ConditionResult::Satisfied;
        }

        let reason = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        ConditionResult::Failed(TaskError::ConditionNotSatisfied {
            condition: self.name.clone(),
            reason,
        })
    }
}
