//! The per-trial state machine.
//!
//! A trial moves through six phases in strict order: environment setup
//! (build or pull, create, stage files), agent install, agent execution,
//! verification, log collection, and teardown. Teardown runs on every
//! exit path; a phase failure skips the remaining work phases but never
//! the cleanup.

use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProviderError;
use crate::models::{
    seconds_between, Agent, ErrorKind, JobConfig, JobEnvironmentConfig, JobVerifierConfig,
    PreservePolicy, Trial, TrialError, TrialResult,
};
use crate::provider::{BuildImageOptions, CreateEnvironmentOptions, Environment, ExecOptions, Provider};

/// Environment variable pointing the agent at the in-container
/// instruction file. Reserved: it wins any collision with agent-declared
/// variables.
pub const INSTRUCTION_ENV_VAR: &str = "ROLLOUT_TASK_INSTRUCTION";

/// Maximum length of an environment name. The tightest limit across
/// supported providers; longer names are truncated.
const MAX_ENV_NAME_LEN: usize = 64;

/// Deadline for teardown. Independent of the job's cancellation signal,
/// since a leaked container is worse than a slow shutdown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes a single trial against a provider. Implementations must
/// always produce a result; failures are encoded on the result itself.
#[async_trait]
pub trait TrialExecutor: Send + Sync {
    async fn execute(
        &self,
        trial: &Trial,
        provider: Arc<dyn Provider>,
        cancel: &CancellationToken,
    ) -> TrialResult;
}

/// The standard six-phase trial executor.
pub struct TrialRunner {
    instruction_path: String,
    timeout_multiplier: f64,
    verifier: JobVerifierConfig,
    env_overrides: JobEnvironmentConfig,
}

impl TrialRunner {
    pub fn new(
        instruction_path: impl Into<String>,
        timeout_multiplier: f64,
        verifier: JobVerifierConfig,
        env_overrides: JobEnvironmentConfig,
    ) -> Self {
        Self {
            instruction_path: instruction_path.into(),
            timeout_multiplier,
            verifier,
            env_overrides,
        }
    }

    pub fn from_config(cfg: &JobConfig) -> Self {
        Self::new(
            cfg.instruction_path.clone(),
            cfg.timeout_multiplier,
            cfg.verifier.clone(),
            cfg.environment.clone(),
        )
    }

    /// Applies the job-level multiplier to a task-declared timeout.
    fn scaled_timeout(&self, seconds: f64) -> Duration {
        Duration::from_secs_f64((seconds * self.timeout_multiplier).max(0.0))
    }

    /// Effective verifier timeout: the job override (when set and > 0)
    /// replaces the task value before the multiplier; the ceiling (when
    /// set and > 0, itself scaled by the multiplier) clips the result.
    pub fn compute_verifier_timeout(&self, task_timeout_sec: f64) -> Duration {
        let mut timeout_sec = task_timeout_sec;

        if let Some(override_sec) = self.verifier.override_timeout_sec {
            if override_sec > 0.0 {
                timeout_sec = override_sec;
            }
        }

        timeout_sec *= self.timeout_multiplier;

        if let Some(max_sec) = self.verifier.max_timeout_sec {
            if max_sec > 0.0 {
                timeout_sec = timeout_sec.min(max_sec * self.timeout_multiplier);
            }
        }

        Duration::from_secs_f64(timeout_sec.max(0.0))
    }

    /// Environment map for the agent execution phase.
    fn execution_env(&self, agent: &Agent) -> HashMap<String, String> {
        let mut env = agent.env.clone();
        env.insert(INSTRUCTION_ENV_VAR.to_string(), self.instruction_path.clone());
        env
    }

    /// Phase 1: pull or build the image, then create the environment.
    async fn setup_environment(
        &self,
        trial: &Trial,
        provider: &dyn Provider,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Environment>, TrialError> {
        let env_cfg = &trial.task.config.environment;

        let image_ref = match &env_cfg.docker_image {
            Some(image) if !self.env_overrides.force_build => {
                debug!(image = %image, "using pre-built image");
                guarded(cancel, provider.pull_image(image)).await.map_err(|e| {
                    TrialError::new(
                        ErrorKind::EnvironmentImagePullFailed,
                        format!("pulling image: {e}"),
                    )
                })?;
                image.clone()
            }
            _ => {
                let tag = image_tag(&trial.dataset, &trial.task.name);
                let timeout = self.scaled_timeout(env_cfg.build_timeout_sec);
                debug!(tag = %tag, timeout = ?timeout, "building image");

                let build = provider.build_image(BuildImageOptions {
                    context_dir: trial.task.environment_dir(),
                    tag,
                    timeout: Some(timeout),
                    no_cache: false,
                });
                match guarded(cancel, build).await {
                    Ok(image_ref) => image_ref,
                    Err(e) if e.is_timeout() => {
                        return Err(TrialError::new(
                            ErrorKind::EnvironmentBuildTimeout,
                            e.to_string(),
                        ))
                    }
                    Err(e) => {
                        return Err(TrialError::new(
                            ErrorKind::EnvironmentBuildFailed,
                            format!("building image: {e}"),
                        ))
                    }
                }
            }
        };

        let cpus = self.env_overrides.override_cpus.unwrap_or(env_cfg.cpus);
        let memory_mb = self
            .env_overrides
            .override_memory_mb
            .unwrap_or(env_cfg.memory_mb);
        let storage_mb = self
            .env_overrides
            .override_storage_mb
            .unwrap_or(env_cfg.storage_mb);

        let name = format_environment_name(
            &trial.dataset,
            &trial.task.name,
            &trial.agent.name,
            trial.attempt,
        );
        debug!(name = %name, cpus, memory_mb, storage_mb, "creating environment");

        let create = provider.create_environment(CreateEnvironmentOptions {
            name,
            image_ref,
            cpus,
            memory_mb,
            storage_mb,
            env: trial.agent.env.clone(),
            provider_config: self.env_overrides.provider_config.clone(),
        });
        match guarded(cancel, create).await {
            Ok(env) => {
                debug!(env_id = %env.id(), "environment created");
                Ok(env)
            }
            Err(ProviderError::ResourceExhausted(msg)) => Err(TrialError::new(
                ErrorKind::EnvironmentResourceAllocationFailed,
                msg,
            )),
            Err(e) => Err(TrialError::new(
                ErrorKind::EnvironmentStartFailed,
                format!("creating environment: {e}"),
            )),
        }
    }

    /// Phase 1b: copy the instruction and tests into the live container
    /// and create the log directories. Still part of the setup boundary.
    async fn stage_environment(
        &self,
        trial: &Trial,
        env: &dyn Environment,
        cancel: &CancellationToken,
    ) -> Result<(), TrialError> {
        let instruction = std::fs::read(trial.task.instruction_path()).map_err(|e| {
            TrialError::new(ErrorKind::TaskInvalid, format!("reading instruction: {e}"))
        })?;

        let staged = tempfile::NamedTempFile::new().map_err(|e| {
            TrialError::new(
                ErrorKind::InternalError,
                format!("staging instruction: {e}"),
            )
        })?;
        std::fs::write(staged.path(), &instruction).map_err(|e| {
            TrialError::new(
                ErrorKind::InternalError,
                format!("staging instruction: {e}"),
            )
        })?;

        debug!(dest = %self.instruction_path, "copying instruction into container");
        guarded(cancel, env.copy_to(staged.path(), &self.instruction_path))
            .await
            .map_err(|e| {
                TrialError::new(
                    ErrorKind::EnvironmentStartFailed,
                    format!("copying instruction: {e}"),
                )
            })?;

        debug!("copying tests directory into container");
        guarded(cancel, env.copy_to(&trial.task.tests_dir(), "/tests"))
            .await
            .map_err(|e| {
                TrialError::new(
                    ErrorKind::EnvironmentStartFailed,
                    format!("copying tests: {e}"),
                )
            })?;

        let mut sink = Vec::new();
        let mut err_sink = Vec::new();
        let mkdir = env.exec(
            "mkdir -p /logs/verifier /logs/agent",
            &mut sink,
            &mut err_sink,
            ExecOptions::default(),
        );
        match guarded(cancel, mkdir).await {
            Ok(0) => Ok(()),
            Ok(code) => Err(TrialError::new(
                ErrorKind::EnvironmentStartFailed,
                format!("creating log dirs: exit code {code}"),
            )),
            Err(e) => Err(TrialError::new(
                ErrorKind::EnvironmentStartFailed,
                format!("creating log dirs: {e}"),
            )),
        }
    }

    /// Phase 2: copy the solution for the oracle, or run the agent's
    /// install script. Stdout/stderr land in `<trial>/setup/` on every
    /// path.
    async fn install_agent(
        &self,
        trial: &Trial,
        env: &dyn Environment,
        cancel: &CancellationToken,
    ) -> Result<(), TrialError> {
        if trial.agent.is_oracle() {
            debug!("copying oracle solution into container");
            return guarded(cancel, env.copy_to(&trial.task.solution_dir(), "/oracle"))
                .await
                .map_err(|e| {
                    TrialError::new(
                        ErrorKind::AgentInstallFailed,
                        format!("copying solution: {e}"),
                    )
                });
        }

        let Some(script) = trial.agent.install.as_deref().filter(|s| !s.is_empty()) else {
            debug!("no install script, skipping agent install");
            return Ok(());
        };

        let timeout = self.scaled_timeout(trial.task.config.agent.install_timeout_sec);
        debug!(timeout = ?timeout, "running agent install script");

        let setup_dir = trial.output_dir.join("setup");
        let (mut stdout, mut stderr) = open_log_pair(&setup_dir)?;

        let exec = env.exec(
            script,
            &mut stdout,
            &mut stderr,
            ExecOptions {
                env: trial.agent.env.clone(),
                timeout: Some(timeout),
                workdir: None,
            },
        );
        match guarded(cancel, exec).await {
            Err(e) if e.is_timeout() => {
                error!(timeout = ?timeout, "agent install timed out");
                Err(TrialError::new(ErrorKind::AgentInstallTimeout, e.to_string()))
            }
            Err(e) => {
                error!(error = %e, "agent install failed");
                Err(TrialError::new(ErrorKind::AgentInstallFailed, e.to_string()))
            }
            Ok(code) if code != 0 => {
                error!(exit_code = code, "agent install failed");
                Err(TrialError::new(
                    ErrorKind::AgentInstallFailed,
                    format!("install script exited with code {code}"),
                ))
            }
            Ok(_) => Ok(()),
        }
    }

    /// Phase 3: run the agent (or the oracle's solve script). Stdout and
    /// stderr land in `<trial>/command/` on every path.
    async fn execute_agent(
        &self,
        trial: &Trial,
        env: &dyn Environment,
        cancel: &CancellationToken,
    ) -> Result<(), TrialError> {
        let cmd = if trial.agent.is_oracle() {
            "bash /oracle/solve.sh"
        } else {
            match trial.agent.execute.as_deref().filter(|s| !s.is_empty()) {
                Some(cmd) => cmd,
                None => {
                    debug!("no execute script, skipping agent execution");
                    return Ok(());
                }
            }
        };

        let timeout = self.scaled_timeout(trial.task.config.agent.timeout_sec);
        debug!(timeout = ?timeout, "running agent command");

        let command_dir = trial.output_dir.join("command");
        let (mut stdout, mut stderr) = open_log_pair(&command_dir)?;

        let exec = env.exec(
            cmd,
            &mut stdout,
            &mut stderr,
            ExecOptions {
                env: self.execution_env(&trial.agent),
                timeout: Some(timeout),
                workdir: None,
            },
        );
        match guarded(cancel, exec).await {
            Err(e) if e.is_timeout() => {
                error!(timeout = ?timeout, "agent execution timed out");
                Err(TrialError::new(
                    ErrorKind::AgentExecutionTimeout,
                    e.to_string(),
                ))
            }
            Err(e) => {
                error!(error = %e, "agent execution failed");
                Err(TrialError::new(ErrorKind::AgentExecutionFailed, e.to_string()))
            }
            Ok(code) if code != 0 => {
                error!(exit_code = code, "agent execution failed");
                Err(TrialError::new(
                    ErrorKind::AgentExecutionFailed,
                    format!("agent exited with code {code}"),
                ))
            }
            Ok(_) => Ok(()),
        }
    }

    /// Phase 4: run the verifier and parse the reward file. The
    /// verifier's own stdout/stderr are placed into the container's
    /// `/logs/verifier/` so collection picks them up.
    async fn run_verifier(
        &self,
        trial: &Trial,
        env: &dyn Environment,
        cancel: &CancellationToken,
    ) -> Result<f64, TrialError> {
        let timeout = self.compute_verifier_timeout(trial.task.config.verifier.timeout_sec);
        debug!(timeout = ?timeout, "running verifier");

        let temp_err = |e: std::io::Error| {
            TrialError::new(ErrorKind::InternalError, format!("staging verifier logs: {e}"))
        };
        let mut stdout_file = tempfile::NamedTempFile::new().map_err(temp_err)?;
        let mut stderr_file = tempfile::NamedTempFile::new().map_err(temp_err)?;

        let exec = env.exec(
            "bash /tests/test.sh",
            stdout_file.as_file_mut(),
            stderr_file.as_file_mut(),
            ExecOptions {
                env: HashMap::new(),
                timeout: Some(timeout),
                workdir: None,
            },
        );
        let exec_result = guarded(cancel, exec).await;

        // Preserve the verifier's streams inside the container regardless
        // of outcome, so phase 5 collects them with the rest of /logs.
        for (file, name) in [(&mut stdout_file, "stdout.txt"), (&mut stderr_file, "stderr.txt")] {
            let _ = file.as_file_mut().flush();
            let dest = format!("/logs/verifier/{name}");
            if let Err(e) = guarded(cancel, env.copy_to(file.path(), &dest)).await {
                debug!(error = %e, dest = %dest, "could not preserve verifier stream");
            }
        }

        match exec_result {
            Err(e) if e.is_timeout() => {
                error!(timeout = ?timeout, "verifier timed out");
                return Err(TrialError::new(ErrorKind::VerifierTimeout, e.to_string()));
            }
            Err(e) => {
                error!(error = %e, "verifier failed");
                return Err(TrialError::new(ErrorKind::VerifierFailed, e.to_string()));
            }
            Ok(code) if code != 0 => {
                error!(exit_code = code, "verifier failed");
                return Err(TrialError::new(
                    ErrorKind::VerifierFailed,
                    format!("verifier exited with code {code}"),
                ));
            }
            Ok(_) => {}
        }

        debug!("reading reward file");
        let mut reward_buf = Vec::new();
        let mut discard = Vec::new();
        let read = env.exec(
            "cat /logs/verifier/reward.txt",
            &mut reward_buf,
            &mut discard,
            ExecOptions::default(),
        );
        match guarded(cancel, read).await {
            Ok(0) => {}
            Ok(_) | Err(_) => {
                error!("reward file missing");
                return Err(TrialError::new(
                    ErrorKind::VerifierRewardMissing,
                    "reward.txt not found",
                ));
            }
        }

        let reward_str = String::from_utf8_lossy(&reward_buf).trim().to_string();
        let reward: f64 = reward_str.parse().map_err(|_| {
            error!(value = %reward_str, "invalid reward value");
            TrialError::new(
                ErrorKind::VerifierRewardInvalid,
                format!("invalid reward value: {reward_str}"),
            )
        })?;

        debug!(reward, "reward parsed");
        Ok(reward)
    }

    /// Phase 5: mirror the container's `/logs` tree into the trial
    /// directory. Failures are logged but never change the outcome.
    async fn collect_logs(&self, trial: &Trial, env: &dyn Environment, cancel: &CancellationToken) {
        let logs_dir = trial.output_dir.join("logs");
        if let Err(e) = std::fs::create_dir_all(&logs_dir) {
            warn!(error = %e, "could not create logs directory");
            return;
        }
        debug!(dest = %logs_dir.display(), "collecting container logs");
        if let Err(e) = guarded(cancel, env.copy_from("/logs/.", &logs_dir)).await {
            warn!(error = %e, "could not collect container logs");
        }
    }

    /// Phase 6: destroy the environment unless the preserve policy keeps
    /// it. A destroy failure is recorded only when the trial has no
    /// earlier error, and never changes the reward.
    async fn teardown(&self, env: &dyn Environment, result: &mut TrialResult) {
        let preserve = match self.env_overrides.preserve_env {
            PreservePolicy::Never => false,
            PreservePolicy::Always => true,
            PreservePolicy::OnFailure => {
                !(result.error.is_none() && result.reward == Some(1.0))
            }
        };

        if preserve {
            info!(env_id = %env.id(), "preserving environment per policy");
            return;
        }

        debug!(env_id = %env.id(), "tearing down environment");
        let destroyed = tokio::time::timeout(TEARDOWN_TIMEOUT, env.destroy()).await;
        let failure = match destroyed {
            Ok(Ok(())) => {
                debug!(env_id = %env.id(), "environment destroyed");
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("destroy timed out after {TEARDOWN_TIMEOUT:?}")),
        };

        if let Some(message) = failure {
            error!(env_id = %env.id(), error = %message, "failed to destroy environment");
            if result.error.is_none() {
                result.error = Some(TrialError::new(
                    ErrorKind::EnvironmentTeardownFailed,
                    message,
                ));
            }
        }
    }
}

#[async_trait]
impl TrialExecutor for TrialRunner {
    async fn execute(
        &self,
        trial: &Trial,
        provider: Arc<dyn Provider>,
        cancel: &CancellationToken,
    ) -> TrialResult {
        info!(
            task = %trial.task.name,
            agent = %trial.agent.name,
            dataset = %trial.dataset,
            attempt = trial.attempt,
            "starting trial"
        );

        let mut result = TrialResult::started(trial, Utc::now());

        // Phase 1: environment setup + staging, one timestamp boundary.
        debug!("phase 1: setting up environment");
        let setup_started = Utc::now();
        result.timestamps.environment_setup_started_at = Some(setup_started);

        let env = match self.setup_environment(trial, provider.as_ref(), cancel).await {
            Ok(env) => Some(env),
            Err(e) => {
                result.error = Some(e);
                None
            }
        };

        let mut staged = false;
        if let Some(env) = &env {
            if result.error.is_none() {
                match self.stage_environment(trial, env.as_ref(), cancel).await {
                    Ok(()) => staged = true,
                    Err(e) => result.error = Some(e),
                }
            }
        }

        let setup_ended = Utc::now();
        result.timestamps.environment_setup_ended_at = Some(setup_ended);
        result.durations.environment_setup_sec = Some(seconds_between(setup_started, setup_ended));

        if let (Some(env_box), true) = (&env, staged) {
            let env_ref = env_box.as_ref();

            // Phase 2: agent install.
            debug!("phase 2: installing agent");
            let install_started = Utc::now();
            result.timestamps.agent_setup_started_at = Some(install_started);
            let install = self.install_agent(trial, env_ref, cancel).await;
            let install_ended = Utc::now();
            result.timestamps.agent_setup_ended_at = Some(install_ended);
            result.durations.agent_setup_sec = Some(seconds_between(install_started, install_ended));
            if let Err(e) = install {
                result.error = Some(e);
            }

            // Phase 3: agent execution.
            if result.error.is_none() {
                debug!("phase 3: executing agent");
                let exec_started = Utc::now();
                result.timestamps.agent_execution_started_at = Some(exec_started);
                let exec = self.execute_agent(trial, env_ref, cancel).await;
                let exec_ended = Utc::now();
                result.timestamps.agent_execution_ended_at = Some(exec_ended);
                result.durations.agent_execution_sec =
                    Some(seconds_between(exec_started, exec_ended));
                if let Err(e) = exec {
                    result.error = Some(e);
                }
            }

            // Phase 4: verification, unless disabled by the job config.
            if result.error.is_none() && !self.verifier.disable {
                debug!("phase 4: running verifier");
                let verify_started = Utc::now();
                result.timestamps.verifier_started_at = Some(verify_started);
                let verdict = self.run_verifier(trial, env_ref, cancel).await;
                let verify_ended = Utc::now();
                result.timestamps.verifier_ended_at = Some(verify_ended);
                result.durations.verifier_sec = Some(seconds_between(verify_started, verify_ended));
                match verdict {
                    Ok(reward) => result.reward = Some(reward),
                    Err(e) => result.error = Some(e),
                }
            } else if self.verifier.disable {
                debug!("verifier disabled, skipping verification");
            }

            // Phase 5: collect whatever /logs exists, even after failures.
            debug!("phase 5: collecting results");
            self.collect_logs(trial, env_ref, cancel).await;
        }

        // Phase 6: teardown, on every path that created an environment.
        if let Some(env) = &env {
            debug!("phase 6: tearing down environment");
            self.teardown(env.as_ref(), &mut result).await;
            result.cost = env.cost();
        }

        result.finish();

        match &result.error {
            Some(err) => error!(
                task = %trial.task.name,
                agent = %trial.agent.name,
                error_type = %err.kind,
                error = %err.message,
                duration_sec = result.durations.total_sec,
                "trial failed"
            ),
            None => info!(
                task = %trial.task.name,
                agent = %trial.agent.name,
                reward = ?result.reward,
                duration_sec = result.durations.total_sec,
                "trial completed"
            ),
        }

        result
    }
}

/// Runs a provider operation unless the cancellation signal fires first.
/// Dropping the operation future aborts the underlying work.
async fn guarded<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = operation => result,
    }
}

/// Creates `stdout.txt`/`stderr.txt` sinks inside a trial subdirectory.
fn open_log_pair(dir: &Path) -> Result<(File, File), TrialError> {
    let io_err = |e: std::io::Error| {
        TrialError::new(
            ErrorKind::InternalError,
            format!("creating log files in {}: {e}", dir.display()),
        )
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let stdout = File::create(dir.join("stdout.txt")).map_err(io_err)?;
    let stderr = File::create(dir.join("stderr.txt")).map_err(io_err)?;
    Ok((stdout, stderr))
}

/// Deterministic image tag for a task, so repeat runs share the
/// provider's build cache.
pub(crate) fn image_tag(dataset: &str, task: &str) -> String {
    format!("rollout-{}:latest", sanitize_env_name(&format!("{dataset}-{task}")))
}

/// Human-readable environment name: `dataset-task-agent-attempt-timestamp`,
/// sanitized for container/app naming across providers.
pub(crate) fn format_environment_name(
    dataset: &str,
    task: &str,
    agent: &str,
    attempt: u32,
) -> String {
    let ts = Utc::now().timestamp();
    sanitize_env_name(&format!("{dataset}-{task}-{agent}-{attempt}-{ts}"))
}

/// Lowercases, replaces invalid runs with single hyphens, trims edge
/// hyphens, and truncates to the provider name limit.
pub(crate) fn sanitize_env_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut prev_hyphen = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            sanitized.push(c);
            prev_hyphen = false;
        } else if !prev_hyphen {
            sanitized.push('-');
            prev_hyphen = true;
        }
    }

    let mut sanitized = sanitized.trim_matches('-').to_string();
    if sanitized.len() > MAX_ENV_NAME_LEN {
        sanitized.truncate(MAX_ENV_NAME_LEN);
        sanitized = sanitized.trim_end_matches('-').to_string();
    }
    sanitized
}
