use crate::task::operation::Task;
use crate::task::types::TaskError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Listener for the lifecycle events of a task.
///
/// Callbacks run on whichever thread drives the task and must not block.
pub trait Observer: Send + Sync {
    fn task_did_start(&self, _task: &Task) {}

    fn task_did_produce(&self, _task: &Task, _produced: &Task) {}

    fn task_did_finish(&self, _task: &Task, _errors: &[TaskError]) {}
}

impl<O: Observer + ?Sized> Observer for Arc<O> {
    fn task_did_start(&self, task: &Task) {
        (**self).task_did_start(task);
    }

    fn task_did_produce(&self, task: &Task, produced: &Task) {
        (**self).task_did_produce(task, produced);
    }

    fn task_did_finish(&self, task: &Task, errors: &[TaskError]) {
        (**self).task_did_finish(task, errors);
    }
}

type StartHandler = Box<dyn Fn(&Task) + Send + Sync>;
type ProduceHandler = Box<dyn Fn(&Task, &Task) + Send + Sync>;
type FinishHandler = Box<dyn Fn(&Task, &[TaskError]) + Send + Sync>;

/// Observer built from closures; missing handlers do nothing
#[derive(Default)]
pub struct BlockObserver {
    start_handler: Option<StartHandler>,
    produce_handler: Option<ProduceHandler>,
    finish_handler: Option<FinishHandler>,
}

impl BlockObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, handler: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn on_produce(mut self, handler: impl Fn(&Task, &Task) + Send + Sync + 'static) -> Self {
        self.produce_handler = Some(Box::new(handler));
        self
    }

    pub fn on_finish(
        mut self,
        handler: impl Fn(&Task, &[TaskError]) + Send + Sync + 'static,
    ) -> Self {
        self.finish_handler = Some(Box::new(handler));
        self
    }
}

impl Observer for BlockObserver {
    fn task_did_start(&self, task: &Task) {
        if let Some(handler) = &self.start_handler {
            handler(task);
        }
    }

    fn task_did_produce(&self, task: &Task, produced: &Task) {
        if let Some(handler) = &self.produce_handler {
            handler(task, produced);
        }
    }

    fn task_did_finish(&self, task: &Task, errors: &[TaskError]) {
        if let Some(handler) = &self.finish_handler {
            handler(task, errors);
        }
    }
}

impl fmt::Debug for BlockObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockObserver")
            .field("start_handler", &self.start_handler.is_some())
            .field("produce_handler", &self.produce_handler.is_some())
            .field("finish_handler", &self.finish_handler.is_some())
            .finish()
    }
}

/// Simple observer that logs lifecycle events
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn task_did_start(&self, task: &Task) {
        info!("Task started: {}", task.label());
    }

    fn task_did_produce(&self, task: &Task, produced: &Task) {
        debug!("Task {} produced {}", task.label(), produced.label());
    }

    fn task_did_finish(&self, task: &Task, errors: &[TaskError]) {
        if errors.is_empty() {
            info!("Task finished: {}", task.label());
        } else {
            for error in errors {
                warn!("Task failed: {} - {}", task.label(), error);
            }
        }
    }
}
