//! CLI-specific functionality for taskflow
//!
//! This module contains all CLI-related code including argument parsing,
//! plan loading and configuration discovery.

pub mod args;
pub mod config;
pub mod plan;

pub use args::{Args, Commands, ExecutionMode, RunConfig};
pub use config::{ConfigDiscovery, TaskflowConfig};
pub use plan::{Plan, PlanError, PlanReport, PlanRunner, PlanTask, PlanTasks, TaskOutcome};
