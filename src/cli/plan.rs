//! Task plan loading, validation and execution
//!
//! A plan is a TOML file with one `[[tasks]]` table per task:
//!
//! ```toml
//! [[tasks]]
//! name = "fetch"
//! duration_ms = 200
//! requires_host = "https://example.com"
//! produces = ["parse"]
//!
//! [[tasks]]
//! name = "parse"
//! exclusive = ["disk"]
//!
//! [[tasks]]
//! name = "report"
//! depends_on = ["parse"]
//! ```
//!
//! Tasks named in another task's `produces` are not submitted directly: the
//! producing task hands them to the queue when it runs. If the producer never
//! runs, its produced tasks are drained as cancelled so nothing waits on them
//! forever.

use super::config::TaskflowConfig;
use crate::task::{
    ExclusiveCategory, LoggingObserver, QualityOfService, QueueDelegate, QueueItem,
    ReachabilityCondition, ReachabilityConfig, Task, TaskBody, TaskError, TaskQueue, TaskState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan file '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading plan '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Plan parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Plan contains no tasks")]
    Empty,

    #[error("Task name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{task}' produces unknown task '{produced}'")]
    UnknownProduced { task: String, produced: String },

    #[error("Task '{0}' is produced by more than one task")]
    ProducedTwice(String),

    #[error("Dependency cycle through task '{0}'")]
    Cycle(String),

    #[error("Task '{task}' requires invalid host '{host}': {reason}")]
    InvalidHost {
        task: String,
        host: String,
        reason: String,
    },
}

/// One `[[tasks]]` entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanTask {
    pub name: String,

    /// Simulated work time
    #[serde(default)]
    pub duration_ms: u64,

    /// Tasks that must finish before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Exclusivity categories
    #[serde(default)]
    pub exclusive: Vec<String>,

    /// URL that must be reachable before the task runs
    #[serde(default)]
    pub requires_host: Option<String>,

    /// Finish with this error message instead of succeeding
    #[serde(default)]
    pub fail: Option<String>,

    /// Cancel before submission
    #[serde(default)]
    pub cancel: bool,

    /// Tasks handed to the queue when this one runs
    #[serde(default)]
    pub produces: Vec<String>,

    #[serde(default)]
    pub quality_of_service: Option<QualityOfService>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

impl Plan {
    /// Load and validate a plan file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, PlanError> {
        let path = path.as_ref().to_path_buf();
        debug!("Loading plan file: {:?}", path);

        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PlanError::NotFound { path: path.clone() },
            _ => PlanError::IoError {
                path: path.clone(),
                source: e,
            },
        })?;

        let plan: Plan = toml::from_str(&content).map_err(|e| PlanError::ParseError {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        plan.validate()?;

        info!("Loaded plan with {} task(s) from {:?}", plan.tasks.len(), path);
        Ok(plan)
    }

    /// Check names, references and ordering constraints
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut names = HashSet::new();
        for entry in &self.tasks {
            if !names.insert(entry.name.as_str()) {
                return Err(PlanError::DuplicateName(entry.name.clone()));
            }
        }

        let mut producers = HashSet::new();
        for entry in &self.tasks {
            if let Some(dependency) = entry.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(PlanError::UnknownDependency {
                    task: entry.name.clone(),
                    dependency: dependency.clone(),
                });
            }
            for produced in &entry.produces {
                if !names.contains(produced.as_str()) {
                    return Err(PlanError::UnknownProduced {
                        task: entry.name.clone(),
                        produced: produced.clone(),
                    });
                }
                if !producers.insert(produced.as_str()) {
                    return Err(PlanError::ProducedTwice(produced.clone()));
                }
            }
        }

        self.check_cycles()
    }

    /// A task waits for its dependencies and a produced task waits for its
    /// producer to run. Directly submitted tasks join their categories in
    /// plan order, before anything is produced, so each waits for the earlier
    /// submitted entries of its categories and a produced task may wait for
    /// any submitted task sharing a category. Produced tasks of one producer
    /// join in `produces` order. Two produced tasks from different producers
    /// may join in either order, so neither may wait for the other.
    fn check_cycles(&self) -> Result<(), PlanError> {
        let mut producer_of: HashMap<&str, (&str, usize)> = HashMap::new();
        for entry in &self.tasks {
            for (position, produced) in entry.produces.iter().enumerate() {
                producer_of.insert(produced.as_str(), (entry.name.as_str(), position));
            }
        }

        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut submitted_in_category: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut produced_in_category: HashMap<&str, Vec<&str>> = HashMap::new();

        for entry in &self.tasks {
            let name = entry.name.as_str();
            let waits = edges.entry(name).or_default();
            waits.extend(entry.depends_on.iter().map(String::as_str));

            let mut seen = HashSet::new();
            let categories = entry
                .exclusive
                .iter()
                .map(String::as_str)
                .filter(|category| seen.insert(*category));

            match producer_of.get(name) {
                Some((producer, _)) => {
                    waits.push(*producer);
                    for category in categories {
                        produced_in_category.entry(category).or_default().push(name);
                    }
                }
                None => {
                    for category in categories {
                        let submitted = submitted_in_category.entry(category).or_default();
                        waits.extend(submitted.last());
                        submitted.push(name);
                    }
                }
            }
        }

        let mut unordered = Vec::new();
        for (category, produced) in &produced_in_category {
            for (index, name) in produced.iter().enumerate() {
                let (producer, _) = producer_of[name];
                let waits = edges.entry(*name).or_default();
                waits.extend(
                    submitted_in_category
                        .get(category)
                        .into_iter()
                        .flatten()
                        .filter(|submitted| **submitted != producer),
                );

                for other in &produced[index + 1..] {
                    let (first, second) = (producer_of[name], producer_of[other]);
                    if first.0 != second.0 {
                        unordered.push((*name, *other));
                    } else if first.1 < second.1 {
                        edges.entry(*other).or_default().push(*name);
                    } else {
                        edges.entry(*name).or_default().push(*other);
                    }
                }
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            name: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), PlanError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(PlanError::Cycle(name.to_string())),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            for next in edges.get(name).into_iter().flatten() {
                visit(*next, edges, marks)?;
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        fn reaches<'a>(from: &'a str, to: &str, edges: &HashMap<&'a str, Vec<&'a str>>) -> bool {
            let mut seen = HashSet::new();
            let mut pending = vec![from];
            while let Some(name) = pending.pop() {
                if name == to {
                    return true;
                }
                if seen.insert(name) {
                    pending.extend(edges.get(name).into_iter().flatten().copied());
                }
            }
            false
        }

        let mut marks = HashMap::new();
        for entry in &self.tasks {
            visit(&entry.name, &edges, &mut marks)?;
        }

        for (first, second) in unordered {
            if reaches(first, second, &edges) {
                return Err(PlanError::Cycle(first.to_string()));
            }
            if reaches(second, first, &edges) {
                return Err(PlanError::Cycle(second.to_string()));
            }
        }
        Ok(())
    }

    /// Build one task per entry. The plan must be valid.
    pub fn build(&self, reachability: &ReachabilityConfig) -> Result<PlanTasks, PlanError> {
        self.validate()?;

        let entries: HashMap<&str, &PlanTask> =
            self.tasks.iter().map(|entry| (entry.name.as_str(), entry)).collect();
        let (release, gate) = watch::channel(false);
        let mut built: HashMap<String, Task> = HashMap::new();
        for entry in &self.tasks {
            build_task(entry, &entries, reachability, &gate, &mut built)?;
        }

        for entry in &self.tasks {
            let task = &built[&entry.name];
            for dependency in &entry.depends_on {
                task.add_dependency(&built[dependency]);
            }
        }

        let produced: HashSet<&str> = self
            .tasks
            .iter()
            .flat_map(|entry| entry.produces.iter().map(String::as_str))
            .collect();

        let mut tasks = Vec::with_capacity(self.tasks.len());
        let mut roots = Vec::new();
        for entry in &self.tasks {
            let Some(task) = built.remove(&entry.name) else {
                continue;
            };
            if entry.cancel {
                task.cancel_with_error(TaskError::Cancelled("cancelled by plan".to_string()));
            }
            if !produced.contains(entry.name.as_str()) {
                roots.push(task.clone());
            }
            tasks.push((entry.name.clone(), task));
        }

        Ok(PlanTasks {
            tasks,
            roots,
            release,
        })
    }
}

/// Build `entry` after the tasks it produces, which its body needs
fn build_task(
    entry: &PlanTask,
    entries: &HashMap<&str, &PlanTask>,
    reachability: &ReachabilityConfig,
    gate: &watch::Receiver<bool>,
    built: &mut HashMap<String, Task>,
) -> Result<Task, PlanError> {
    if let Some(task) = built.get(&entry.name) {
        return Ok(task.clone());
    }

    let mut produces = Vec::with_capacity(entry.produces.len());
    for name in &entry.produces {
        produces.push(build_task(entries[name.as_str()], entries, reachability, gate, built)?);
    }

    let task = Task::new(PlanBody {
        duration: Duration::from_millis(entry.duration_ms),
        fail: entry.fail.clone(),
        produces,
        submitted: gate.clone(),
    })
    .with_name(entry.name.clone());

    for category in &entry.exclusive {
        task.add_condition(ExclusiveCategory::new(category.clone()));
    }
    if let Some(host) = &entry.requires_host {
        let condition = ReachabilityCondition::from_config(reachability, Some(host)).map_err(|e| {
            PlanError::InvalidHost {
                task: entry.name.clone(),
                host: host.clone(),
                reason: e.to_string(),
            }
        })?;
        task.add_condition(condition);
    }
    if let Some(quality_of_service) = entry.quality_of_service {
        task.set_quality_of_service(quality_of_service);
    }

    built.insert(entry.name.clone(), task.clone());
    Ok(task)
}

/// Tasks built from a plan
#[derive(Debug)]
pub struct PlanTasks {
    /// Every task in plan order
    pub tasks: Vec<(String, Task)>,
    /// Tasks submitted directly; the rest are produced at runtime
    pub roots: Vec<Task>,
    release: watch::Sender<bool>,
}

impl PlanTasks {
    /// Submit the roots. Producers hold their produced tasks back until every
    /// root has joined its exclusivity categories.
    pub fn submit(&self, queue: &TaskQueue) {
        queue.add_tasks(self.roots.iter().cloned());
        self.release.send_replace(true);
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|(task_name, _)| task_name == name)
            .map(|(_, task)| task)
    }
}

struct PlanBody {
    duration: Duration,
    fail: Option<String>,
    produces: Vec<Task>,
    submitted: watch::Receiver<bool>,
}

#[async_trait]
impl TaskBody for PlanBody {
    async fn execute(&self, task: &Task) {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = task.cancelled() => {
                task.finish_with_error(Some(TaskError::Cancelled(
                    "cancelled while running".to_string(),
                )));
                return;
            }
        }

        if !self.produces.is_empty() {
            // Closed only when the plan tasks were dropped, leaving no order to keep.
            let _ = self.submitted.clone().wait_for(|submitted| *submitted).await;
        }
        for produced in &self.produces {
            task.produce(produced.clone());
        }
        task.finish_with_error(self.fail.clone().map(TaskError::ExecutionFailed));
    }

    fn did_finish(&self, task: &Task, _errors: &[TaskError]) {
        for produced in self.produces.iter().filter(|produced| !produced.is_enqueued()) {
            produced.cancel_with_error(TaskError::Cancelled(format!(
                "producer {} did not run",
                task.label()
            )));
            task.produce(produced.clone());
        }
    }
}

/// How one task ended
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub state: TaskState,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskOutcome {
    fn from_task(name: &str, task: &Task) -> Self {
        let history = task.state_history();
        let entered = |state: TaskState| {
            history
                .iter()
                .find(|transition| transition.state == state)
                .map(|transition| transition.at)
        };

        Self {
            name: name.to_string(),
            state: task.state(),
            errors: task.errors().iter().map(ToString::to_string).collect(),
            started_at: entered(TaskState::Executing),
            finished_at: entered(TaskState::Finished),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Finished && self.errors.is_empty()
    }

    /// Time spent executing, if the task ran
    pub fn run_time(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Result of running a plan
#[derive(Debug, Clone)]
pub struct PlanReport {
    pub outcomes: Vec<TaskOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PlanReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(TaskOutcome::succeeded)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| !outcome.succeeded()).count()
    }

    pub fn outcome(&self, name: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|outcome| outcome.name == name)
    }

    pub fn print_summary(&self) {
        println!("Plan finished in {} ms", (self.finished_at - self.started_at).num_milliseconds());
        for outcome in &self.outcomes {
            let status = if outcome.succeeded() { "✓" } else { "✗" };
            match outcome.run_time() {
                Some(run_time) => println!(
                    "  {} {} ({} ms)",
                    status,
                    outcome.name,
                    run_time.num_milliseconds()
                ),
                None => println!("  {} {} (not run)", status, outcome.name),
            }
            for error in &outcome.errors {
                println!("      {}", error);
            }
        }
        println!(
            "{} of {} task(s) succeeded",
            self.outcomes.len() - self.failed_count(),
            self.outcomes.len()
        );
    }
}

/// Logs queue activity while a plan runs
struct ProgressDelegate;

impl QueueDelegate for ProgressDelegate {
    fn will_add(&self, queue: &TaskQueue, item: &QueueItem) {
        debug!(
            "Queue has {} task(s) in flight, adding {}",
            queue.task_count(),
            item.name().unwrap_or_default()
        );
    }

    fn task_finished(&self, _queue: &TaskQueue, item: &QueueItem, errors: &[TaskError]) {
        let name = item.name().unwrap_or_default();
        if errors.is_empty() {
            info!("{} succeeded", name);
        } else {
            for error in errors {
                warn!("{} failed: {}", name, error);
            }
        }
    }
}

/// Runs plans on a queue built from configuration
pub struct PlanRunner {
    config: TaskflowConfig,
    verbose: bool,
}

impl PlanRunner {
    pub fn new(config: TaskflowConfig) -> Self {
        Self {
            config,
            verbose: false,
        }
    }

    /// Attach a logging observer to every task
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub async fn run(&self, plan: &Plan) -> Result<PlanReport, PlanError> {
        let built = plan.build(&self.config.reachability)?;
        let queue = TaskQueue::new(self.config.queue.clone());
        queue.set_delegate(Arc::new(ProgressDelegate));

        if self.verbose {
            for (_, task) in &built.tasks {
                task.add_observer(LoggingObserver);
            }
        }

        let started_at = Utc::now();
        info!(
            "Running {} task(s), {} submitted directly",
            built.tasks.len(),
            built.roots.len()
        );
        built.submit(&queue);
        queue.wait_until_all_finished().await;

        Ok(PlanReport {
            outcomes: built
                .tasks
                .iter()
                .map(|(name, task)| TaskOutcome::from_task(name, task))
                .collect(),
            started_at,
            finished_at: Utc::now(),
        })
    }
}
