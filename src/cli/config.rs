//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./taskflow.toml or ./.taskflow/config.toml
//! 2. User config: ~/.taskflow/config.toml
//! 3. System config: /etc/taskflow/config.toml
//! 4. Built-in defaults
//!
//! `TASKFLOW_MAX_CONCURRENT` overrides the queue's concurrency limit of
//! whichever configuration was loaded.

use crate::env;
use crate::task::{QueueConfig, ReachabilityConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskflowConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
}

impl TaskflowConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        let config: TaskflowConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {:?}", path))?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file {:?}", path))?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = std_env::var(env::vars::MAX_CONCURRENT) else {
            return;
        };

        match raw.trim().parse::<usize>() {
            Ok(0) => {
                info!("{}=0, running without a concurrency limit", env::vars::MAX_CONCURRENT);
                self.queue.max_concurrent_tasks = None;
            }
            Ok(limit) => {
                info!("{} overrides concurrency limit to {}", env::vars::MAX_CONCURRENT, limit);
                self.queue.max_concurrent_tasks = Some(limit);
            }
            Err(e) => {
                warn!(
                    "Ignoring {}={:?}: {}",
                    env::vars::MAX_CONCURRENT,
                    raw,
                    e
                );
            }
        }
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy, then apply
    /// environment overrides
    pub fn discover_config() -> Result<TaskflowConfig> {
        let mut config = match Self::find_config_file() {
            Some(config_path) => {
                info!("Loading configuration from: {:?}", config_path);
                TaskflowConfig::from_toml_file(config_path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                TaskflowConfig::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load an explicit configuration file, then apply environment overrides
    pub fn load(path: &Path) -> Result<TaskflowConfig> {
        info!("Loading configuration override from: {:?}", path);
        let mut config = TaskflowConfig::from_toml_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = Self::get_config_candidates();

        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    pub fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(env::project_config_file_path(&current_dir));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_FILE));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(
                PathBuf::from(program_data)
                    .join("taskflow")
                    .join(env::CONFIG_FILE_NAME),
            );
        }

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let candidates = Self::get_config_candidates();
        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }

        if let Ok(value) = std_env::var(env::vars::MAX_CONCURRENT) {
            println!("Environment override: {}={}", env::vars::MAX_CONCURRENT, value);
        }
    }
}
