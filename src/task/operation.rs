//! The task state machine.
//!
//! A [`Task`] is a cheap, cloneable handle to one unit of work. All clones
//! refer to the same task; equality is identity. The task walks the states in
//! [`TaskState`] in order, evaluating its [`Condition`]s once its dependencies
//! have finished and notifying its [`Observer`]s when it starts, produces
//! follow-up work and finishes.
//!
//! What a task actually does lives in its [`TaskBody`]. A body must call
//! [`Task::finish`] (or [`Task::finish_with_error`]) exactly once, either
//! before `execute` returns or later from any thread.

use crate::task::condition::Condition;
use crate::task::observer::Observer;
use crate::task::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// The work performed by a task
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    /// Entry point, called once the task is ready and not cancelled.
    ///
    /// The default finishes immediately without errors.
    async fn execute(&self, task: &Task) {
        task.finish(Vec::new());
    }

    /// Called after the task moved to `Finishing` and before observers are
    /// notified. Follow-up work can be handed out with [`Task::produce`].
    fn did_finish(&self, _task: &Task, _errors: &[TaskError]) {}
}

/// Body that does nothing and finishes right away
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBody;

#[async_trait]
impl TaskBody for NoopBody {}

/// Body backed by an async closure. The task finishes with the closure's
/// outcome once the returned future resolves.
pub struct FnBody<F> {
    work: F,
}

impl<F> FnBody<F> {
    pub fn new(work: F) -> Self {
        Self { work }
    }
}

#[async_trait]
impl<F, Fut> TaskBody for FnBody<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn execute(&self, task: &Task) {
        let outcome = (self.work)(task.clone()).await;
        task.finish_with_error(outcome.err());
    }
}

/// One entry of a task's state history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

struct TaskCore {
    state: TaskState,
    name: Option<String>,
    quality_of_service: QualityOfService,
    conditions: Vec<Arc<dyn Condition>>,
    observers: Vec<Arc<dyn Observer>>,
    dependencies: Vec<Task>,
    errors: Vec<TaskError>,
    history: Vec<StateTransition>,
    finished_already: bool,
    enqueued: bool,
    runtime: Option<Handle>,
}

struct TaskInner {
    id: TaskId,
    body: Box<dyn TaskBody>,
    core: Mutex<TaskCore>,
    state_tx: watch::Sender<TaskState>,
    cancellation: CancellationToken,
}

/// Handle to a unit of work with a lifecycle
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a task running the given body
    pub fn new(body: impl TaskBody) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Initialized);
        let core = TaskCore {
            state: TaskState::Initialized,
            name: None,
            quality_of_service: QualityOfService::default(),
            conditions: Vec::new(),
            observers: Vec::new(),
            dependencies: Vec::new(),
            errors: Vec::new(),
            history: vec![StateTransition {
                state: TaskState::Initialized,
                at: Utc::now(),
            }],
            finished_already: false,
            enqueued: false,
            runtime: None,
        };

        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4(),
                body: Box::new(body),
                core: Mutex::new(core),
                state_tx,
                cancellation: CancellationToken::new(),
            }),
        }
    }

    /// Create a task that finishes as soon as it runs
    pub fn noop() -> Self {
        Self::new(NoopBody)
    }

    /// Create a task from an async closure
    pub fn from_fn<F, Fut>(work: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::new(FnBody::new(work))
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.set_name(name);
        self
    }

    pub fn with_condition(self, condition: impl Condition + 'static) -> Self {
        self.add_condition(condition);
        self
    }

    pub fn with_observer(self, observer: impl Observer + 'static) -> Self {
        self.add_observer(observer);
        self
    }

    pub fn with_dependency(self, dependency: &Task) -> Self {
        self.add_dependency(dependency);
        self
    }

    pub fn with_quality_of_service(self, quality_of_service: QualityOfService) -> Self {
        self.set_quality_of_service(quality_of_service);
        self
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> Option<String> {
        self.core().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.core().name = Some(name.into());
    }

    /// Name for log lines: the task name, or its id
    pub fn label(&self) -> String {
        self.name().unwrap_or_else(|| self.inner.id.to_string())
    }

    pub fn state(&self) -> TaskState {
        self.core().state
    }

    pub fn quality_of_service(&self) -> QualityOfService {
        self.core().quality_of_service
    }

    /// Change the quality of service. Only allowed before the task executes.
    pub fn set_quality_of_service(&self, quality_of_service: QualityOfService) {
        let mut core = self.core();
        assert!(
            core.state < TaskState::Executing,
            "quality of service of task {} changed while {}",
            self.inner.id,
            core.state
        );
        core.quality_of_service = quality_of_service;
    }

    pub fn is_user_initiated(&self) -> bool {
        self.quality_of_service() == QualityOfService::UserInitiated
    }

    pub fn set_user_initiated(&self, user_initiated: bool) {
        let quality_of_service = if user_initiated {
            QualityOfService::UserInitiated
        } else {
            QualityOfService::Default
        };
        self.set_quality_of_service(quality_of_service);
    }

    /// Attach a condition. Conditions are fixed once evaluation starts.
    pub fn add_condition(&self, condition: impl Condition + 'static) {
        let mut core = self.core();
        assert!(
            core.state < TaskState::EvaluatingConditions,
            "condition added to task {} while {}",
            self.inner.id,
            core.state
        );
        core.conditions.push(Arc::new(condition));
    }

    /// Attach an observer. Observers are fixed once the task executes.
    pub fn add_observer(&self, observer: impl Observer + 'static) {
        let mut core = self.core();
        assert!(
            core.state < TaskState::Executing,
            "observer added to task {} while {}",
            self.inner.id,
            core.state
        );
        core.observers.push(Arc::new(observer));
    }

    /// Declare that this task may only run after `dependency` has finished.
    /// Dependencies must be declared before the task is enqueued.
    pub fn add_dependency(&self, dependency: &Task) {
        assert!(self != dependency, "task {} cannot depend on itself", self.inner.id);

        let mut core = self.core();
        assert!(
            core.state == TaskState::Initialized,
            "dependency added to task {} while {}",
            self.inner.id,
            core.state
        );
        if !core.dependencies.contains(dependency) {
            core.dependencies.push(dependency.clone());
        }
    }

    pub fn conditions(&self) -> Vec<Arc<dyn Condition>> {
        self.core().conditions.clone()
    }

    /// Tasks this one waits for. Emptied once it finishes.
    pub fn dependencies(&self) -> Vec<Task> {
        self.core().dependencies.clone()
    }

    /// Errors accumulated so far; after finishing, the merged list observers saw
    pub fn errors(&self) -> Vec<TaskError> {
        self.core().errors.clone()
    }

    /// Every state the task has been in, with the time it entered it
    pub fn state_history(&self) -> Vec<StateTransition> {
        self.core().history.clone()
    }

    /// Receiver that sees the latest state after every transition
    pub fn state_changes(&self) -> watch::Receiver<TaskState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Resolves once the task is cancelled
    pub async fn cancelled(&self) {
        self.inner.cancellation.cancelled().await;
    }

    pub fn is_enqueued(&self) -> bool {
        self.core().enqueued
    }

    /// Whether every dependency has reached `Finished`
    pub fn dependencies_finished(&self) -> bool {
        self.dependencies().iter().all(Task::is_finished)
    }

    /// Readiness check used by the queue.
    ///
    /// In `Pending`, finding the dependencies finished starts condition
    /// evaluation and reports not ready; the task becomes ready once the
    /// evaluation moves it to `Ready`. Must be called from within a Tokio
    /// runtime when the task was not enqueued through a queue.
    pub fn is_ready(&self) -> bool {
        match self.state() {
            TaskState::Initialized => self.is_cancelled(),
            TaskState::Pending => {
                if self.is_cancelled() {
                    return true;
                }
                if self.dependencies_finished() {
                    self.evaluate_conditions();
                }
                false
            }
            TaskState::Ready => self.dependencies_finished() || self.is_cancelled(),
            TaskState::EvaluatingConditions
            | TaskState::Executing
            | TaskState::Finishing
            | TaskState::Finished => false,
        }
    }

    /// Cancel the task. Work that has not started is skipped; running work
    /// is only told, through [`Task::is_cancelled`].
    pub fn cancel(&self) {
        if self.inner.cancellation.is_cancelled() {
            return;
        }
        debug!("Cancelling task {} while {}", self.label(), self.state());
        self.inner.cancellation.cancel();
    }

    /// Record `error` and cancel the task
    pub fn cancel_with_error(&self, error: TaskError) {
        {
            let mut core = self.core();
            if core.finished_already {
                debug!("Ignoring cancellation of finished task {}", self.inner.id);
                return;
            }
            core.errors.push(error);
        }
        self.cancel();
    }

    /// Finish the task. Only the first call has any effect.
    pub fn finish(&self, errors: Vec<TaskError>) {
        let (combined, observers) = {
            let mut core = self.core();
            if core.finished_already {
                debug!("Ignoring repeated finish of task {}", self.inner.id);
                return;
            }
            core.finished_already = true;
            core.errors.extend(errors);
            self.transition(&mut core, TaskState::Finishing);
            (core.errors.clone(), core.observers.clone())
        };

        self.inner.body.did_finish(self, &combined);
        for observer in &observers {
            observer.task_did_finish(self, &combined);
        }

        {
            let mut core = self.core();
            core.observers.clear();
            core.dependencies.clear();
            self.transition(&mut core, TaskState::Finished);
        }

        if combined.is_empty() {
            info!("Task {} finished", self.label());
        } else {
            info!(
                "Task {} finished with {} error(s)",
                self.label(),
                combined.len()
            );
        }
    }

    pub fn finish_with_error(&self, error: Option<TaskError>) {
        self.finish(error.into_iter().collect());
    }

    /// Hand a new task to every observer; the owning queue enqueues it
    pub fn produce(&self, task: Task) {
        let observers = self.core().observers.clone();
        debug!(
            "Task {} produced task {} for {} observer(s)",
            self.label(),
            task.label(),
            observers.len()
        );
        for observer in &observers {
            observer.task_did_produce(self, &task);
        }
    }

    /// Resolves once the task is `Finished`
    pub async fn wait_until_finished(&self) {
        self.wait_for_state(TaskState::Finished).await;
    }

    /// Resolves once the task reached `state` or any later state
    pub async fn wait_for_state(&self, state: TaskState) {
        let mut changes = self.inner.state_tx.subscribe();
        // The sender lives as long as this handle, so this never errors.
        let _ = changes.wait_for(|current| *current >= state).await;
    }

    /// Claim the task for a queue; false if it was already claimed
    pub(crate) fn mark_enqueued(&self) -> bool {
        let mut core = self.core();
        if core.enqueued {
            return false;
        }
        core.enqueued = true;
        true
    }

    /// Move to `Pending` and remember the runtime conditions run on
    pub(crate) fn will_enqueue(&self, runtime: Handle) {
        let mut core = self.core();
        core.runtime = Some(runtime);
        self.transition(&mut core, TaskState::Pending);
    }

    /// Execution entry point, driven once by the owning queue
    pub(crate) async fn start(&self) {
        if self.is_cancelled() {
            self.finish(Vec::new());
            return;
        }

        let observers = {
            let mut core = self.core();
            if core.state >= TaskState::Finishing {
                return;
            }
            assert_eq!(
                core.state,
                TaskState::Ready,
                "task {} started outside the ready state",
                self.inner.id
            );
            if !core.errors.is_empty() {
                drop(core);
                self.finish(Vec::new());
                return;
            }
            self.transition(&mut core, TaskState::Executing);
            core.observers.clone()
        };

        for observer in &observers {
            observer.task_did_start(self);
        }

        self.inner.body.execute(self).await;
    }

    fn evaluate_conditions(&self) {
        let (conditions, runtime) = {
            let mut core = self.core();
            if core.state != TaskState::Pending {
                return;
            }
            self.transition(&mut core, TaskState::EvaluatingConditions);
            (core.conditions.clone(), core.runtime.clone())
        };

        debug!(
            "Evaluating {} condition(s) for task {}",
            conditions.len(),
            self.label()
        );

        let task = self.clone();
        let evaluation = async move {
            let results = join_all(conditions.iter().map(|condition| {
                AssertUnwindSafe(condition.evaluate(&task))
                    .catch_unwind()
                    .map(|result| {
                        result.unwrap_or_else(|payload| {
                            ConditionResult::Failed(TaskError::ConditionNotSatisfied {
                                condition: condition.name(),
                                reason: format!("panicked: {}", panic_message(payload.as_ref())),
                            })
                        })
                    })
                    .boxed()
            }))
            .await;

            let mut core = task.core();
            core.errors
                .extend(results.into_iter().filter_map(ConditionResult::into_error));
            if task.is_cancelled() {
                core.errors.push(TaskError::ConditionFailed);
            }
            task.transition(&mut core, TaskState::Ready);
        };

        runtime.unwrap_or_else(Handle::current).spawn(evaluation);
    }

    fn transition(&self, core: &mut TaskCore, target: TaskState) {
        if core.state == TaskState::Finished {
            return;
        }
        assert!(
            core.state.can_transition_to(target),
            "illegal state transition {} -> {} for task {}",
            core.state,
            target,
            self.inner.id
        );

        debug!("Task {} state: {} -> {}", self.inner.id, core.state, target);
        core.state = target;
        core.history.push(StateTransition {
            state: target,
            at: Utc::now(),
        });
        self.inner.state_tx.send_replace(target);
    }

    fn core(&self) -> MutexGuard<'_, TaskCore> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::noop()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &core.name)
            .field("state", &core.state)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
