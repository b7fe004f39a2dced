use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Verifier settings from the task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    /// Wall-clock limit for the verifier script, before the job-level
    /// multiplier and override/ceiling are applied.
    pub timeout_sec: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self { timeout_sec: 600.0 }
    }
}

/// Agent-related timeouts from the task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentTimeouts {
    pub install_timeout_sec: f64,
    pub timeout_sec: f64,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            install_timeout_sec: 300.0,
            timeout_sec: 600.0,
        }
    }
}

/// Environment resources and image settings from the task configuration.
///
/// Memory and storage are always represented in MB here; the legacy string
/// forms ("2G", "10G") are normalized at load time.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub build_timeout_sec: f64,
    /// Pre-built image to pull instead of building from `environment/`.
    pub docker_image: Option<String>,
    pub cpus: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            build_timeout_sec: 600.0,
            docker_image: None,
            cpus: 1,
            memory_mb: 2048,
            storage_mb: 10240,
        }
    }
}

/// Fully resolved task configuration. Every field has a default, so a task
/// without a `task.toml` is valid and gets the stock limits.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub version: String,
    pub metadata: Option<toml::Value>,
    pub verifier: VerifierConfig,
    pub agent: AgentTimeouts,
    pub environment: EnvironmentConfig,
}

impl TaskConfig {
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            metadata: None,
            verifier: VerifierConfig::default(),
            agent: AgentTimeouts::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully loaded benchmark task, ready for execution.
#[derive(Debug, Clone)]
pub struct Task {
    /// Task name, from the directory base name or the registry entry.
    pub name: String,
    /// Absolute path to the task directory.
    pub path: PathBuf,
    pub config: TaskConfig,
    /// HEAD commit of the task's repository, when it lives in one.
    pub git_commit_id: Option<String>,
}

impl Task {
    pub fn instruction_path(&self) -> PathBuf {
        self.path.join("instruction.md")
    }

    pub fn environment_dir(&self) -> PathBuf {
        self.path.join("environment")
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.path.join("tests")
    }

    pub fn solution_dir(&self) -> PathBuf {
        self.path.join("solution")
    }

    pub fn solve_script(&self) -> PathBuf {
        self.path.join("solution").join("solve.sh")
    }

    /// Creates a task with default config rooted at `path`, for tests.
    pub fn at(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            config: TaskConfig::new(),
            git_commit_id: None,
        }
    }
}
