//! Local Docker provider.
//!
//! Container lifecycle and command execution go through the Docker API
//! via bollard; image builds and file transfers shell out to the docker
//! CLI, which already handles build contexts and tar-pipe copies.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use super::{
    validate_container_path, BuildImageOptions, CreateEnvironmentOptions, Environment,
    ExecOptions, Provider,
};
use crate::error::ProviderError;

/// Docker provider backed by the local daemon.
pub struct DockerProvider {
    docker: Docker,
    network_mode: Option<String>,
}

impl DockerProvider {
    /// Creates a provider connected to the local Docker daemon.
    /// Recognized `provider_config` keys: `network_mode`.
    pub fn new(provider_config: &HashMap<String, serde_json::Value>) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::DaemonUnavailable(e.to_string()))?;
        let network_mode = provider_config
            .get("network_mode")
            .and_then(|v| v.as_str())
            .map(String::from);
        Ok(Self {
            docker,
            network_mode,
        })
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn build_image(&self, opts: BuildImageOptions) -> Result<String, ProviderError> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("build").arg("-t").arg(&opts.tag);
        if opts.no_cache {
            cmd.arg("--no-cache");
        }
        cmd.arg(&opts.context_dir);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(tag = %opts.tag, context = %opts.context_dir.display(), "building docker image");

        let output = match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| ProviderError::BuildTimeout(timeout))??,
            None => cmd.output().await?,
        };

        if !output.status.success() {
            return Err(ProviderError::BuildFailed(tail_of(&output.stderr)));
        }

        debug!(tag = %opts.tag, "docker build completed");
        Ok(opts.tag)
    }

    async fn pull_image(&self, image_ref: &str) -> Result<(), ProviderError> {
        debug!(image = %image_ref, "pulling docker image");

        let options = CreateImageOptions {
            from_image: image_ref,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| ProviderError::PullFailed(e.to_string()))?;
        }

        debug!(image = %image_ref, "docker image pulled");
        Ok(())
    }

    async fn create_environment(
        &self,
        opts: CreateEnvironmentOptions,
    ) -> Result<Box<dyn Environment>, ProviderError> {
        let host_config = HostConfig {
            memory: Some((opts.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some(opts.cpus as i64 * 1_000_000_000),
            network_mode: self.network_mode.clone(),
            ..Default::default()
        };

        let env: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let container_config = Config {
            image: Some(opts.image_ref.clone()),
            // Keep the container alive; all work happens through exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(host_config),
            tty: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: opts.name.clone(),
            platform: None,
        };

        debug!(
            name = %opts.name,
            image = %opts.image_ref,
            cpus = opts.cpus,
            memory_mb = opts.memory_mb,
            "creating docker container"
        );

        let response = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(classify_create_error)?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::CreateFailed(format!("starting container: {e}")))?;

        debug!(container_id = %response.id, "docker container started");

        Ok(Box::new(DockerEnvironment {
            docker: self.docker.clone(),
            container_id: response.id,
        }))
    }
}

/// Maps a container-create failure, distinguishing capacity exhaustion
/// from plain failures.
fn classify_create_error(err: bollard::errors::Error) -> ProviderError {
    let message = err.to_string();
    if message.contains("no space left on device") {
        ProviderError::ResourceExhausted(message)
    } else {
        ProviderError::CreateFailed(message)
    }
}

/// True for daemon responses that mean the container is already gone.
fn is_already_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// A running Docker container owned by one trial.
pub struct DockerEnvironment {
    docker: Docker,
    container_id: String,
}

impl DockerEnvironment {
    /// Runs a small helper command in the container, discarding output.
    async fn run_quiet(&self, cmd: &str) -> Result<i64, ProviderError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        self.exec(cmd, &mut stdout, &mut stderr, ExecOptions::default())
            .await
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn copy_to(&self, src: &Path, dst: &str) -> Result<(), ProviderError> {
        validate_container_path(dst)?;

        if let Some(parent) = Path::new(dst).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() && parent != "/" {
                let code = self.run_quiet(&format!("mkdir -p {parent}")).await?;
                if code != 0 {
                    return Err(ProviderError::CopyFailed(format!(
                        "creating directory {parent}"
                    )));
                }
            }
        }

        debug!(container_id = %self.container_id, src = %src.display(), dst, "copying to container");

        let output = tokio::process::Command::new("docker")
            .arg("cp")
            .arg(src)
            .arg(format!("{}:{}", self.container_id, dst))
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProviderError::CopyFailed(tail_of(&output.stderr)));
        }
        Ok(())
    }

    async fn copy_from(&self, src: &str, dst: &Path) -> Result<(), ProviderError> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }

        debug!(container_id = %self.container_id, src, dst = %dst.display(), "copying from container");

        let output = tokio::process::Command::new("docker")
            .arg("cp")
            .arg(format!("{}:{}", self.container_id, src))
            .arg(dst)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProviderError::CopyFailed(tail_of(&output.stderr)));
        }
        Ok(())
    }

    async fn exec(
        &self,
        cmd: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        opts: ExecOptions,
    ) -> Result<i64, ProviderError> {
        let env: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let exec_options = CreateExecOptions {
            cmd: Some(vec!["bash".to_string(), "-c".to_string(), cmd.to_string()]),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: opts.workdir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let mut preview: String = cmd.chars().take(100).collect();
        if preview.len() < cmd.len() {
            preview.push_str("...");
        }
        debug!(
            container_id = %self.container_id,
            command = %preview,
            timeout = ?opts.timeout,
            "executing command in container"
        );

        let exec = self
            .docker
            .create_exec(&self.container_id, exec_options)
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("creating exec: {e}")))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("starting exec: {e}")))?;

        let drain = async {
            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| ProviderError::ExecFailed(e.to_string()))? {
                        LogOutput::StdOut { message } => stdout.write_all(&message)?,
                        LogOutput::StdErr { message } => stderr.write_all(&message)?,
                        _ => {}
                    }
                }
            }
            Ok::<(), ProviderError>(())
        };

        match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, drain)
                .await
                .map_err(|_| ProviderError::ExecTimeout(timeout))??,
            None => drain.await?,
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("inspecting exec: {e}")))?;

        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        debug!(container_id = %self.container_id, "stopping docker container");

        let options = StopContainerOptions { t: 10 };
        match self.docker.stop_container(&self.container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(ProviderError::ExecFailed(format!("stopping container: {e}"))),
        }
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        debug!(container_id = %self.container_id, "destroying docker container");

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&self.container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => {
                debug!(container_id = %self.container_id, "container already removed");
                Ok(())
            }
            Err(e) => {
                warn!(container_id = %self.container_id, error = %e, "failed to remove container");
                Err(ProviderError::ExecFailed(format!(
                    "removing container: {e}"
                )))
            }
        }
    }

    fn cost(&self) -> f64 {
        0.0
    }
}

/// Last chunk of a process's stderr, for error messages.
fn tail_of(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    match text.char_indices().nth_back(500) {
        Some((idx, _)) => format!("...{}", &text[idx..]),
        None => text.to_string(),
    }
}
