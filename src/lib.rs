//! # taskflow
//!
//! A cooperative task scheduler built on Tokio. Units of work carry an
//! explicit lifecycle, asynchronous preconditions, dependencies on other
//! tasks and mutual-exclusion categories, and report their progress to
//! observers.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: tasks, conditions, observers, the exclusivity coordinator
//!   and the queue that drives tasks through their lifecycle
//! - **[`cli`]**: the `taskflow` command line: arguments, configuration
//!   discovery and TOML task plans
//! - **[`env`]**: configuration paths and environment variable names
//!
//! ## Task Lifecycle
//!
//! ```text
//! Initialized -> Pending -> EvaluatingConditions -> Ready -> Executing -> Finishing -> Finished
//! ```
//!
//! A task enters `Pending` when it is enqueued, evaluates every condition
//! once its dependencies have finished, and runs its body only if no
//! condition failed and it was not cancelled. Finishing is idempotent:
//! observers hear about it exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskflow::task::{ExclusiveCategory, QueueConfig, Task, TaskQueue};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = TaskQueue::new(QueueConfig::default());
//!
//!     let download = Task::from_fn(|task| async move {
//!         println!("downloading in {}", task.label());
//!         Ok(())
//!     })
//!     .with_name("download")
//!     .with_condition(ExclusiveCategory::new("network"));
//!
//!     let report = Task::noop().with_name("report").with_dependency(&download);
//!
//!     queue.add_tasks(vec![download, report]);
//!     queue.wait_until_all_finished().await;
//! }
//! ```

/// Task scheduling: lifecycle, conditions, observers and queues.
pub mod task;

/// Environment constants and path utilities.
pub mod env;

/// Command line interface: arguments, configuration and task plans.
pub mod cli;

pub use task::{
    Condition, ExclusivityCoordinator, Observer, QueueConfig, Task, TaskError, TaskQueue,
    TaskState,
};
