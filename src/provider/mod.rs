//! Environment provider abstraction: a small capability set that hides
//! the differences between container backends behind image-build,
//! container-create, file-copy, command-exec, and destroy operations.
//!
//! A provider is a factory; each backend returns its own environment
//! handle type and owns that handle's lifecycle. Backend-specific state
//! (container ids, sandbox references) lives in the private handle type.

pub mod docker;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;

pub use docker::DockerProvider;

/// Options for building an image from a context directory.
#[derive(Debug, Clone)]
pub struct BuildImageOptions {
    /// Directory containing the provider's build manifest (Dockerfile).
    pub context_dir: PathBuf,
    /// Deterministic tag for the built image.
    pub tag: String,
    /// Build deadline; `None` means unbounded.
    pub timeout: Option<Duration>,
    pub no_cache: bool,
}

/// Options for creating a running environment from an image.
#[derive(Debug, Clone, Default)]
pub struct CreateEnvironmentOptions {
    /// Sanitized human-readable name, for debugging across provider
    /// consoles. Lowercase alphanumerics and hyphens, at most 64 chars.
    pub name: String,
    /// Opaque image reference previously returned by the provider.
    pub image_ref: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    /// Environment variables injected into the container.
    pub env: HashMap<String, String>,
    /// Provider-specific configuration, forwarded untouched from the job
    /// config.
    pub provider_config: HashMap<String, serde_json::Value>,
}

/// Options for executing a command inside an environment.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub env: HashMap<String, String>,
    /// Exec deadline; expiry is reported as [`ProviderError::ExecTimeout`],
    /// distinguishable from a non-zero exit code.
    pub timeout: Option<Duration>,
    pub workdir: Option<String>,
}

/// A factory for container environments.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used for config selection.
    fn name(&self) -> &str;

    /// Builds an image and returns an opaque reference the provider can
    /// later resolve. The reference may be a registry tag, a path, or a
    /// provider-private identifier.
    async fn build_image(&self, opts: BuildImageOptions) -> Result<String, ProviderError>;

    /// Pulls a pre-built image. May be a no-op for providers that handle
    /// image transport internally.
    async fn pull_image(&self, image_ref: &str) -> Result<(), ProviderError>;

    /// Creates and starts a new environment.
    async fn create_environment(
        &self,
        opts: CreateEnvironmentOptions,
    ) -> Result<Box<dyn Environment>, ProviderError>;
}

/// A live container environment, exclusively owned by one trial.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Identifier for logging.
    fn id(&self) -> &str;

    /// Copies a local file or directory into the environment. Missing
    /// parent directories are created; `..` segments in the target path
    /// are rejected.
    async fn copy_to(&self, src: &Path, dst: &str) -> Result<(), ProviderError>;

    /// Copies a file or directory out of the environment.
    async fn copy_from(&self, src: &str, dst: &Path) -> Result<(), ProviderError>;

    /// Runs `cmd` through a shell, streaming stdout and stderr into the
    /// sinks incrementally. Both streams are fully drained before the
    /// call returns. A non-zero exit is a normal `Ok(code)` return.
    async fn exec(
        &self,
        cmd: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        opts: ExecOptions,
    ) -> Result<i64, ProviderError>;

    /// Stops the environment without removing it.
    async fn stop(&self) -> Result<(), ProviderError>;

    /// Removes the environment and its resources. Idempotent: destroying
    /// an already-gone environment is not an error.
    async fn destroy(&self) -> Result<(), ProviderError>;

    /// Monotonically non-decreasing cost estimate. 0 for local backends.
    fn cost(&self) -> f64;
}

/// Rejects container target paths with parent-directory traversal.
pub fn validate_container_path(path: &str) -> Result<(), ProviderError> {
    let has_traversal = Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if has_traversal {
        Err(ProviderError::InvalidContainerPath(path.to_string()))
    } else {
        Ok(())
    }
}
