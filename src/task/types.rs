use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Lifecycle state of a task.
///
/// States are ordered: a task only ever moves forward through this list, and
/// [`TaskState::can_transition_to`] decides which forward moves are legal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// Created but not yet handed to a queue
    Initialized,
    /// Enqueued, waiting for its dependencies to finish
    Pending,
    /// Dependencies finished, conditions are being evaluated
    EvaluatingConditions,
    /// Conditions evaluated, waiting to be started
    Ready,
    /// Work body is running
    Executing,
    /// Finish protocol in progress, observers are being notified
    Finishing,
    /// Terminal
    Finished,
}

impl TaskState {
    /// Whether the transition table allows moving from `self` to `target`
    pub fn can_transition_to(self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Initialized, Pending)
                | (Pending, EvaluatingConditions)
                | (EvaluatingConditions, Ready)
                | (Ready, Executing)
                | (Ready, Finishing)
                | (Executing, Finishing)
                | (Pending, Finishing)
                | (Finishing, Finished)
        )
    }

    /// Check if this is the terminal state
    pub fn is_terminal(self) -> bool {
        self == TaskState::Finished
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Initialized => "initialized",
            TaskState::Pending => "pending",
            TaskState::EvaluatingConditions => "evaluating_conditions",
            TaskState::Ready => "ready",
            TaskState::Executing => "executing",
            TaskState::Finishing => "finishing",
            TaskState::Finished => "finished",
        };
        f.write_str(label)
    }
}

/// Scheduling hint carried by a task. The queue does not reorder work by it;
/// it is exposed to bodies, observers and delegates.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    Background,
    Utility,
    #[default]
    Default,
    UserInitiated,
    UserInteractive,
}

/// Errors accumulated by a task and delivered to observers at finish
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled while its conditions were being evaluated
    #[error("condition evaluation failed due to cancellation")]
    ConditionFailed,

    #[error("condition '{condition}' not satisfied: {reason}")]
    ConditionNotSatisfied { condition: String, reason: String },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("network host unreachable: {host}")]
    UnreachableNetwork { host: String },

    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Wrap any error raised by a work body or collaborator
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Other(Arc::new(error))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled(_) | TaskError::ConditionFailed)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = error.into();
        TaskError::Other(Arc::from(boxed))
    }
}

/// Outcome of evaluating one condition for one task
#[derive(Debug, Clone)]
pub enum ConditionResult {
    Satisfied,
    Failed(TaskError),
}

impl ConditionResult {
    /// The failure carried by this result, if any
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            ConditionResult::Failed(error) => Some(error),
            ConditionResult::Satisfied => None,
        }
    }

    pub fn into_error(self) -> Option<TaskError> {
        match self {
            ConditionResult::Failed(error) => Some(error),
            ConditionResult::Satisfied => None,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, ConditionResult::Satisfied)
    }
}
