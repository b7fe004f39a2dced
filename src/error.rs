//! Error types for rollout subsystems:
//! - Job and task configuration parsing
//! - Task and dataset loading
//! - Registry resolution
//! - Environment providers
//! - Job orchestration

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while reading job or task configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing job config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("parsing task config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("dataset[{index}]: {reason}")]
    InvalidDatasetRef { index: usize, reason: String },

    #[error("invalid quantity {value:?}: {reason}")]
    InvalidQuantity { value: String, reason: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Errors raised while loading a task from disk.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{task}': missing required {file}")]
    MissingFile { task: String, file: String },

    #[error("task '{task}': {source}")]
    Config {
        task: String,
        #[source]
        source: ConfigError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while resolving a dataset reference into tasks.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no tasks found in dataset {}", .0.display())]
    Empty(PathBuf),

    #[error("dataset ref must specify either 'path' or 'registry'")]
    UnresolvableRef,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or resolving a task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("dataset {name:?} not found in registry")]
    DatasetNotFound { name: String },

    #[error("dataset {name:?} version {version:?} not found in registry")]
    VersionNotFound { name: String, version: String },

    #[error("registry ref must specify either path or url")]
    MissingSource,

    #[error("fetching registry: {0}")]
    Http(#[from] reqwest::Error),

    #[error("parsing registry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cloning {url}: {reason}")]
    GitClone { url: String, reason: String },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by environment providers. The trial executor maps these
/// onto the phase-tagged trial error taxonomy.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("image build timed out after {0:?}")]
    BuildTimeout(Duration),

    #[error("image pull failed: {0}")]
    PullFailed(String),

    #[error("environment create failed: {0}")]
    CreateFailed(String),

    #[error("provider out of capacity: {0}")]
    ResourceExhausted(String),

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("invalid container path {0:?}: parent traversal is not allowed")]
    InvalidContainerPath(String),

    #[error("command failed to run: {0}")]
    ExecFailed(String),

    #[error("command timed out after {0:?}")]
    ExecTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// True when the error represents a deadline expiry rather than a
    /// plain failure. Timeouts map to distinct trial error kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProviderError::BuildTimeout(_) | ProviderError::ExecTimeout(_)
        )
    }
}

/// Fatal job-level errors. These abort the run before or outside any
/// trial; per-trial failures are recorded on the trial result instead.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("unsupported environment type: {0:?}")]
    UnknownProvider(String),

    #[error("job directory already exists: {} (will not overwrite existing results)", .0.display())]
    JobDirExists(PathBuf),

    #[error("trial output directory already exists: {} (will not overwrite existing results)", .0.display())]
    TrialDirExists(PathBuf),

    #[error("writing job output: {0}")]
    Io(#[from] std::io::Error),

    #[error("serializing job output: {0}")]
    Json(#[from] serde_json::Error),
}
