//! The queue every task passes through before it runs.
//!
//! [`TaskQueue::add_task`] wires a task into the dependency graph (caller,
//! condition and exclusivity dependencies), tells the delegate, and spawns a
//! driver on the Tokio runtime. The driver waits for the dependencies,
//! triggers condition evaluation through the task's readiness check, takes a
//! concurrency permit once the task is ready and runs it to completion. A body
//! that panics is finished with an `ExecutionFailed` error, so its dependents
//! and categories are released.
//!
//! The queue observes every task it owns: tasks produced by a running task
//! are enqueued on the same queue, and finished tasks are reported to the
//! delegate.

use crate::task::exclusivity::ExclusivityCoordinator;
use crate::task::observer::{BlockObserver, Observer};
use crate::task::operation::{Task, panic_message};
use crate::task::types::*;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for a task queue
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Name used in log lines
    #[serde(default)]
    pub name: Option<String>,

    /// Upper bound on items executing at once; `None` is unbounded
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,

    /// Applied to tasks that still carry the default quality of service
    #[serde(default)]
    pub default_quality_of_service: Option<QualityOfService>,
}

/// Plain unit of work without a lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub id: Uuid,
    pub name: Option<String>,
}

/// Anything submitted to a queue
#[derive(Clone, Debug)]
pub enum QueueItem {
    Task(Task),
    Work(WorkItem),
}

impl QueueItem {
    pub fn id(&self) -> Uuid {
        match self {
            QueueItem::Task(task) => task.id(),
            QueueItem::Work(work) => work.id,
        }
    }

    pub fn name(&self) -> Option<String> {
        match self {
            QueueItem::Task(task) => task.name(),
            QueueItem::Work(work) => work.name.clone(),
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            QueueItem::Task(task) => Some(task),
            QueueItem::Work(_) => None,
        }
    }
}

/// Receives queue-level notifications.
///
/// Called from arbitrary runtime threads; implementations that touch shared
/// state must synchronize it themselves.
pub trait QueueDelegate: Send + Sync {
    fn will_add(&self, _queue: &TaskQueue, _item: &QueueItem) {}

    fn task_finished(&self, _queue: &TaskQueue, _item: &QueueItem, _errors: &[TaskError]) {}
}

struct QueueInner {
    config: QueueConfig,
    coordinator: Arc<ExclusivityCoordinator>,
    delegate: RwLock<Option<Arc<dyn QueueDelegate>>>,
    limiter: Option<Arc<Semaphore>>,
    in_flight: DashMap<Uuid, Task>,
    outstanding: watch::Sender<usize>,
    runtime: Handle,
}

/// Concurrent queue for tasks and plain work items
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue with its own exclusivity coordinator on the current
    /// Tokio runtime. Panics outside a runtime.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_coordinator(config, Arc::new(ExclusivityCoordinator::new()))
    }

    /// Create a queue sharing `coordinator` with other queues
    pub fn with_coordinator(config: QueueConfig, coordinator: Arc<ExclusivityCoordinator>) -> Self {
        Self::with_runtime(config, coordinator, Handle::current())
    }

    pub fn with_runtime(
        config: QueueConfig,
        coordinator: Arc<ExclusivityCoordinator>,
        runtime: Handle,
    ) -> Self {
        let limiter = config
            .max_concurrent_tasks
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        let (outstanding, _) = watch::channel(0);

        Self {
            inner: Arc::new(QueueInner {
                config,
                coordinator,
                delegate: RwLock::new(None),
                limiter,
                in_flight: DashMap::new(),
                outstanding,
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &Arc<ExclusivityCoordinator> {
        &self.inner.coordinator
    }

    pub fn set_delegate(&self, delegate: Arc<dyn QueueDelegate>) {
        *self
            .inner
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(delegate);
    }

    pub fn clear_delegate(&self) {
        *self
            .inner
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Submit a task.
    ///
    /// Dependencies declared by the task's conditions are enqueued too, and
    /// tasks carrying mutually exclusive conditions are chained behind the
    /// earlier tasks of the same categories. Submitting a task twice is
    /// ignored.
    pub fn add_task(&self, task: Task) {
        if !task.mark_enqueued() {
            warn!("Task {} was already enqueued, ignoring", task.label());
            return;
        }

        task.add_observer(QueueObserver {
            queue: Arc::downgrade(&self.inner),
        });

        let conditions = task.conditions();
        for condition in &conditions {
            if let Some(dependency) = condition.dependency(&task) {
                debug!(
                    "Condition {} adds dependency {} to task {}",
                    condition.name(),
                    dependency.label(),
                    task.label()
                );
                task.add_dependency(&dependency);
                if !dependency.is_enqueued() {
                    self.add_task(dependency);
                }
            }
        }

        let mut categories: Vec<String> = conditions
            .iter()
            .filter(|condition| condition.is_mutually_exclusive())
            .map(|condition| condition.name())
            .collect();
        categories.sort();
        categories.dedup();

        if !categories.is_empty() {
            self.inner.coordinator.register(&task, &categories);
            let coordinator = Arc::clone(&self.inner.coordinator);
            task.add_observer(
                BlockObserver::new()
                    .on_finish(move |task, _| coordinator.unregister(task, &categories)),
            );
        }

        if let Some(quality_of_service) = self.inner.config.default_quality_of_service {
            if task.quality_of_service() == QualityOfService::Default {
                task.set_quality_of_service(quality_of_service);
            }
        }

        task.will_enqueue(self.inner.runtime.clone());
        self.notify_will_add(&QueueItem::Task(task.clone()));
        self.inner.in_flight.insert(task.id(), task.clone());
        self.inner.outstanding.send_modify(|count| *count += 1);

        info!("Enqueued task {} on queue {}", task.label(), self.label());

        let queue = self.clone();
        self.inner.runtime.spawn(async move {
            queue.drive(task).await;
        });
    }

    /// Submit tasks in order. Order decides submission only, not completion.
    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.add_task(task);
        }
    }

    /// Submit a plain future. It respects the concurrency limit and is
    /// reported to the delegate with no errors once it completes, or with an
    /// `ExecutionFailed` error if it panics.
    pub fn add_work<F>(&self, name: impl Into<String>, work: F) -> WorkItem
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let item = WorkItem {
            id: Uuid::new_v4(),
            name: Some(name.into()),
        };

        self.notify_will_add(&QueueItem::Work(item.clone()));
        self.inner.outstanding.send_modify(|count| *count += 1);

        let queue = self.clone();
        let reported = item.clone();
        self.inner.runtime.spawn(async move {
            let permit = queue.acquire_permit().await;
            let outcome = AssertUnwindSafe(work).catch_unwind().await;
            drop(permit);

            let errors = match outcome {
                Ok(()) => Vec::new(),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Work item {} panicked: {}", reported.id, message);
                    vec![TaskError::ExecutionFailed(format!("panicked: {}", message))]
                }
            };
            queue.notify_finished(&QueueItem::Work(reported), &errors);
            queue.release_outstanding();
        });

        item
    }

    /// Cancel every task that has not finished yet
    pub fn cancel_all(&self) {
        let tasks = self.tasks();
        info!("Cancelling {} task(s) on queue {}", tasks.len(), self.label());
        for task in tasks {
            task.cancel();
        }
    }

    /// Tasks submitted and not finished yet
    pub fn tasks(&self) -> Vec<Task> {
        self.inner
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Resolves once every submitted item, including produced tasks, is done
    pub async fn wait_until_all_finished(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender lives as long as this queue, so this never errors.
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }

    async fn drive(&self, task: Task) {
        let dependencies = task.dependencies();
        let waiting = join_all(dependencies.iter().map(Task::wait_until_finished));

        tokio::select! {
            _ = waiting => {}
            _ = task.cancelled() => {}
            _ = task.wait_until_finished() => {}
        }

        if !task.is_ready() {
            task.wait_for_state(TaskState::Ready).await;
        }

        let permit = self.acquire_permit().await;
        if let Err(payload) = AssertUnwindSafe(task.start()).catch_unwind().await {
            let message = panic_message(payload.as_ref()).to_string();
            error!("Task {} panicked: {}", task.label(), message);
            task.finish(vec![TaskError::ExecutionFailed(format!("panicked: {}", message))]);
        }
        task.wait_until_finished().await;
        drop(permit);

        self.inner.in_flight.remove(&task.id());
        self.release_outstanding();
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        let limiter = self.inner.limiter.as_ref()?;
        Arc::clone(limiter).acquire_owned().await.ok()
    }

    fn release_outstanding(&self) {
        self.inner
            .outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    fn delegate(&self) -> Option<Arc<dyn QueueDelegate>> {
        self.inner
            .delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_will_add(&self, item: &QueueItem) {
        if let Some(delegate) = self.delegate() {
            delegate.will_add(self, item);
        }
    }

    fn notify_finished(&self, item: &QueueItem, errors: &[TaskError]) {
        if let Some(delegate) = self.delegate() {
            delegate.task_finished(self, item, errors);
        }
    }

    fn label(&self) -> &str {
        self.inner.config.name.as_deref().unwrap_or("default")
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.label())
            .field("in_flight", &self.task_count())
            .finish()
    }
}

/// The queue's own observer, attached to every task it owns
struct QueueObserver {
    queue: Weak<QueueInner>,
}

impl QueueObserver {
    fn queue(&self) -> Option<TaskQueue> {
        self.queue.upgrade().map(|inner| TaskQueue { inner })
    }
}

impl Observer for QueueObserver {
    fn task_did_produce(&self, _task: &Task, produced: &Task) {
        if let Some(queue) = self.queue() {
            queue.add_task(produced.clone());
        }
    }

    fn task_did_finish(&self, task: &Task, errors: &[TaskError]) {
        if let Some(queue) = self.queue() {
            queue.notify_finished(&QueueItem::Task(task.clone()), errors);
        }
    }
}
