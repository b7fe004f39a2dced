//! Job orchestration: expands a job configuration into trials, runs them
//! on a bounded worker pool, and aggregates the collected results.
//!
//! Fan-out/fan-in uses a rendezvous-style trial channel fed by a single
//! feeder and a result channel sized to the trial count. The collector is
//! the only reader of results, so aggregation needs no locks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::trial::{TrialExecutor, TrialRunner};
use crate::dataset::DatasetLoader;
use crate::error::{DatasetError, JobError};
use crate::models::{
    AgentSummary, Dataset, ErrorKind, JobConfig, JobEnvironmentConfig, JobResult, PreservePolicy,
    Trial, TrialResult, TrialSummary,
};
use crate::provider::{DockerProvider, Provider};
use crate::task::validate_oracle_support;

/// Builds a fresh trial executor for each worker, so executor state is
/// never shared across workers.
pub type ExecutorFactory = Arc<dyn Fn(&JobConfig) -> Arc<dyn TrialExecutor> + Send + Sync>;

/// The standard factory producing [`TrialRunner`]s.
pub fn default_executor_factory() -> ExecutorFactory {
    Arc::new(|cfg: &JobConfig| -> Arc<dyn TrialExecutor> {
        Arc::new(TrialRunner::from_config(cfg))
    })
}

/// Instantiates the provider named in the job config.
fn create_provider(cfg: &JobEnvironmentConfig) -> Result<Arc<dyn Provider>, JobError> {
    match cfg.kind.as_str() {
        "docker" => {
            let provider = DockerProvider::new(&cfg.provider_config)?;
            debug!("initialized docker environment provider");
            Ok(Arc::new(provider))
        }
        other => Err(JobError::UnknownProvider(other.to_string())),
    }
}

/// Coordinates the execution of all trials in a job.
pub struct JobOrchestrator {
    cfg: JobConfig,
    provider: Arc<dyn Provider>,
    new_executor: ExecutorFactory,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(cfg: JobConfig, new_executor: ExecutorFactory) -> Result<Self, JobError> {
        let provider = create_provider(&cfg.environment)?;
        Ok(Self {
            cfg,
            provider,
            new_executor,
        })
    }

    /// Runs every trial defined by the job configuration and writes the
    /// job directory, per-trial results, and the aggregate result.
    pub async fn run(&self, cancel: CancellationToken) -> Result<JobResult, JobError> {
        let started_at = Utc::now();

        if self.cfg.verifier.disable
            && self.cfg.environment.preserve_env == PreservePolicy::OnFailure
        {
            warn!(
                "verifier.disable with preserve_env=on_failure: no trial can reach reward 1.0, \
                 so every environment will be preserved"
            );
        }

        // Resolve datasets into tasks.
        info!(count = self.cfg.datasets.len(), "loading datasets");
        let mut loader = DatasetLoader::new();
        let mut datasets = Vec::with_capacity(self.cfg.datasets.len());
        for dataset_ref in &self.cfg.datasets {
            let dataset = loader.load(dataset_ref).await?;
            info!(name = %dataset.name, tasks = dataset.tasks.len(), "loaded dataset");
            datasets.push(dataset);
        }

        // The oracle runs each task's own solution; require it up front.
        if self.cfg.agents.iter().any(|a| a.is_oracle()) {
            for dataset in &datasets {
                for task in &dataset.tasks {
                    validate_oracle_support(task)
                        .map_err(|e| JobError::Dataset(DatasetError::Task(e)))?;
                }
            }
        }

        // Job directory: never overwrite an existing one.
        let job_name = self
            .cfg
            .name
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d__%H-%M-%S").to_string());
        let job_dir = Path::new(&self.cfg.jobs_dir).join(&job_name);
        if job_dir.exists() {
            return Err(JobError::JobDirExists(job_dir));
        }
        debug!(path = %job_dir.display(), "creating job output directory");
        std::fs::create_dir_all(&job_dir)?;

        let trials = enumerate_trials(&self.cfg, &datasets, &job_dir);
        info!(
            total = trials.len(),
            agents = self.cfg.agents.len(),
            attempts_per_task = self.cfg.n_attempts,
            "generated trials"
        );

        // Snapshot the effective config before any trial starts.
        std::fs::write(
            job_dir.join("config.json"),
            serde_json::to_vec_pretty(&self.cfg)?,
        )?;

        for trial in &trials {
            if trial.output_dir.exists() {
                return Err(JobError::TrialDirExists(trial.output_dir.clone()));
            }
        }

        let total = trials.len();
        let n_workers = self.cfg.n_concurrent_trials.max(1).min(total.max(1));
        info!(
            provider = %self.provider.name(),
            workers = n_workers,
            total_trials = total,
            "starting trial execution"
        );

        let results = self.run_pool(trials, n_workers, cancel).await;
        let skipped = total.saturating_sub(results.len());

        let mut job_result = aggregate_results(&job_name, &results, started_at);
        job_result.skipped_trials = skipped;
        if skipped > 0 {
            job_result.cancelled = true;
            info!(completed = results.len(), skipped, "job cancelled");
        }

        debug!(path = %job_dir.join("result.json").display(), "writing job result");
        std::fs::write(
            job_dir.join("result.json"),
            serde_json::to_vec_pretty(&job_result)?,
        )?;

        info!(
            duration_sec = job_result.total_duration_sec,
            completed = job_result.completed_trials,
            failed = job_result.failed_trials,
            pass_rate = format!("{:.2}%", job_result.pass_rate * 100.0),
            "job completed"
        );

        Ok(job_result)
    }

    /// Fan-out/fan-in over `n_workers` workers. Returns results in
    /// arrival order; trials never dequeued count as skipped.
    async fn run_pool(
        &self,
        trials: Vec<Trial>,
        n_workers: usize,
        cancel: CancellationToken,
    ) -> Vec<TrialResult> {
        let total = trials.len();
        let (trial_tx, trial_rx) = mpsc::channel::<Trial>(1);
        let (result_tx, mut result_rx) = mpsc::channel::<TrialResult>(total.max(1));
        let trial_rx = Arc::new(tokio::sync::Mutex::new(trial_rx));

        let mut workers = Vec::with_capacity(n_workers);
        for worker_id in 0..n_workers {
            let trial_rx = Arc::clone(&trial_rx);
            let result_tx = result_tx.clone();
            let executor = (self.new_executor)(&self.cfg);
            let provider = Arc::clone(&self.provider);
            let cancel = cancel.clone();

            workers.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    let trial = { trial_rx.lock().await.recv().await };
                    let Some(trial) = trial else { break };

                    if let Err(e) = std::fs::create_dir_all(&trial.output_dir) {
                        error!(trial = %trial.id, error = %e, "could not create trial directory");
                    }

                    let result = run_one_trial(
                        Arc::clone(&executor),
                        trial.clone(),
                        Arc::clone(&provider),
                        cancel.clone(),
                    )
                    .await;

                    persist_trial_result(&trial, &result);

                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
        drop(result_tx);

        // Feeder: a single task hands trials to workers until the list is
        // exhausted or cancellation is observed.
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for trial in trials {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => {
                        debug!("stopping trial feeder due to cancellation");
                        break;
                    }
                    sent = trial_tx.send(trial) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Single collector; arrival order is preserved.
        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }

        let _ = feeder.await;
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }

        results
    }
}

/// Executes one trial, converting an executor panic into an
/// `internal_error` result so trial-count invariants hold.
async fn run_one_trial(
    executor: Arc<dyn TrialExecutor>,
    trial: Trial,
    provider: Arc<dyn Provider>,
    cancel: CancellationToken,
) -> TrialResult {
    let guarded_trial = trial.clone();
    let handle = tokio::spawn(async move {
        executor
            .execute(&guarded_trial, provider, &cancel)
            .await
    });

    match handle.await {
        Ok(result) => result,
        Err(join_err) => {
            error!(
                task = %trial.task.name,
                agent = %trial.agent.name,
                error = %join_err,
                "trial execution died"
            );
            TrialResult::internal_error(&trial, format!("trial execution died: {join_err}"))
        }
    }
}

/// Writes `result.json` (and `error.txt` when failed) into the trial
/// directory. Runs before the result is published, so a crash after
/// publication still leaves the record on disk.
fn persist_trial_result(trial: &Trial, result: &TrialResult) {
    match serde_json::to_vec_pretty(result) {
        Ok(json) => {
            if let Err(e) = std::fs::write(trial.output_dir.join("result.json"), json) {
                error!(trial = %trial.id, error = %e, "could not write trial result");
            }
        }
        Err(e) => error!(trial = %trial.id, error = %e, "could not serialize trial result"),
    }

    if let Some(err) = &result.error {
        if let Err(e) = std::fs::write(trial.output_dir.join("error.txt"), &err.message) {
            error!(trial = %trial.id, error = %e, "could not write error.txt");
        }
    }
}

/// Expands the Cartesian product agents × datasets × tasks × attempts,
/// agents outermost and attempts innermost, with pre-computed output
/// directories under the job directory.
pub(crate) fn enumerate_trials(
    cfg: &JobConfig,
    datasets: &[Dataset],
    job_dir: &Path,
) -> Vec<Trial> {
    let mut trials = Vec::new();
    for agent in &cfg.agents {
        for dataset in datasets {
            for task in &dataset.tasks {
                for attempt in 1..=cfg.n_attempts {
                    let id = format!(
                        "{}__{}__{}__{}",
                        agent.name, dataset.name, task.name, attempt
                    );
                    let output_dir: PathBuf = job_dir
                        .join(&agent.name)
                        .join(&dataset.name)
                        .join(format!("{}__{}", task.name, attempt));
                    trials.push(Trial {
                        id,
                        task: task.clone(),
                        agent: agent.clone(),
                        dataset: dataset.name.clone(),
                        attempt,
                        output_dir,
                    });
                }
            }
        }
    }
    trials
}

/// Computes the aggregate job result over collected trial results.
///
/// A trial is failed iff its error is set, except that a teardown
/// failure does not count against success (it stays recorded on the
/// trial). A trial is completed iff it produced a reward.
pub(crate) fn aggregate_results(
    job_name: &str,
    results: &[TrialResult],
    started_at: chrono::DateTime<Utc>,
) -> JobResult {
    let ended_at = Utc::now();

    #[derive(Default)]
    struct AgentTally {
        total: usize,
        completed: usize,
        failed: usize,
        rewards: Vec<f64>,
        cost: f64,
    }

    let mut job = JobResult {
        job_name: job_name.to_string(),
        cancelled: false,
        total_trials: results.len(),
        completed_trials: 0,
        failed_trials: 0,
        skipped_trials: 0,
        pass_rate: 0.0,
        mean_reward: 0.0,
        total_cost: 0.0,
        total_duration_sec: (ended_at - started_at).num_milliseconds() as f64 / 1000.0,
        started_at,
        ended_at,
        agents: BTreeMap::new(),
        results: Vec::with_capacity(results.len()),
    };

    let mut tallies: BTreeMap<String, AgentTally> = BTreeMap::new();
    let mut total_reward = 0.0;
    let mut pass_count = 0usize;

    for result in results {
        let tally = tallies.entry(result.agent_name.clone()).or_default();
        tally.total += 1;
        tally.cost += result.cost;
        job.total_cost += result.cost;

        let failed = result
            .error
            .as_ref()
            .is_some_and(|e| e.kind != ErrorKind::EnvironmentTeardownFailed);

        if failed {
            job.failed_trials += 1;
            tally.failed += 1;
        } else if let Some(reward) = result.reward {
            job.completed_trials += 1;
            tally.completed += 1;
            tally.rewards.push(reward);
            total_reward += reward;
            if reward == 1.0 {
                pass_count += 1;
            }
        }

        job.results.push(TrialSummary {
            task_name: result.task_name.clone(),
            dataset_name: result.dataset_name.clone(),
            agent_name: result.agent_name.clone(),
            attempt: result.attempt,
            reward: result.reward,
        });
    }

    if job.completed_trials > 0 {
        job.mean_reward = total_reward / job.completed_trials as f64;
        job.pass_rate = pass_count as f64 / job.completed_trials as f64;
    }

    for (agent_name, tally) in tallies {
        let completed = tally.completed;
        let passes = tally.rewards.iter().filter(|r| **r == 1.0).count();
        let mean_reward = if completed > 0 {
            tally.rewards.iter().sum::<f64>() / completed as f64
        } else {
            0.0
        };
        let pass_rate = if completed > 0 {
            passes as f64 / completed as f64
        } else {
            0.0
        };

        job.agents.insert(
            agent_name,
            AgentSummary {
                total_trials: tally.total,
                completed_trials: completed,
                failed_trials: tally.failed,
                pass_rate,
                mean_reward,
                total_cost: tally.cost,
            },
        );
    }

    job
}

/// Loads a job config file and executes the job it describes.
pub async fn run_from_config(
    config_path: impl AsRef<Path>,
    cancel: CancellationToken,
) -> Result<JobResult, JobError> {
    info!(path = %config_path.as_ref().display(), "loading job config");
    let cfg = crate::config::load_job_config(config_path)?;
    let orchestrator = JobOrchestrator::new(cfg, default_executor_factory())?;
    orchestrator.run(cancel).await
}
