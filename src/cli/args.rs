//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `run`: Execute a task plan file
//! - `show-config`: Show configuration discovery information

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig,
}

#[derive(Debug)]
pub struct RunConfig {
    pub plan_file: PathBuf,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "taskflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run task plans with dependencies, preconditions and exclusivity categories")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a task plan
    Run {
        /// Path to the plan file (TOML)
        file: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
        /// Maximum number of tasks executing at once
        #[arg(long = "max-concurrent", value_name = "N")]
        max_concurrent: Option<usize>,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                file,
                config,
                verbose,
                max_concurrent,
            }) => {
                if *max_concurrent == Some(0) {
                    return Err("--max-concurrent must be at least 1".to_string());
                }

                Ok(ExecutionMode::Run(RunConfig {
                    plan_file: file.clone(),
                    config_override: config.clone(),
                    verbose: *verbose,
                    max_concurrent: *max_concurrent,
                }))
            }
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'taskflow --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}
