//! Environment constants and path utilities for taskflow.
//!
//! This module centralizes the directory names, file names and environment
//! variables used when discovering configuration.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const TASKFLOW_DIR_NAME: &str = ".taskflow";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name at a project root
pub const LOCAL_CONFIG_FILE_NAME: &str = "taskflow.toml";

/// System-wide configuration file (Unix-like systems)
pub const SYSTEM_CONFIG_FILE: &str = "/etc/taskflow/config.toml";

/// Environment variable names
pub mod vars {
    /// Overrides `queue.max_concurrent_tasks`
    pub const MAX_CONCURRENT: &str = "TASKFLOW_MAX_CONCURRENT";

    /// Log filter read by the binary
    pub const LOG_FILTER: &str = "RUST_LOG";

    /// Filter used when `RUST_LOG` is unset
    pub const DEFAULT_LOG_FILTER: &str = "taskflow=info";
}

/// Build the .taskflow directory path from a root directory
pub fn taskflow_dir_path(root: &Path) -> PathBuf {
    root.join(TASKFLOW_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    taskflow_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build config file path in the .taskflow directory of the current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    taskflow_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

/// Build the project-root config file path
pub fn project_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}
