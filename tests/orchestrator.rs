//! Job-level integration tests using mock trial executors: enumeration,
//! aggregation, durability, overwrite protection, and cancellation.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rollout::executor::{
    default_executor_factory, ExecutorFactory, JobOrchestrator, TrialExecutor,
};
use rollout::models::{JobConfig, Trial, TrialResult};
use rollout::provider::Provider;
use rollout::JobError;

/// Writes a complete task directory (instruction, environment, tests,
/// solution) under `dataset_dir`.
fn write_task(dataset_dir: &Path, name: &str) {
    let dir = dataset_dir.join(name);
    std::fs::create_dir_all(dir.join("environment")).unwrap();
    std::fs::create_dir_all(dir.join("tests")).unwrap();
    std::fs::create_dir_all(dir.join("solution")).unwrap();
    std::fs::write(dir.join("instruction.md"), "# Say hello\n").unwrap();
    std::fs::write(dir.join("environment").join("Dockerfile"), "FROM alpine\n").unwrap();
    std::fs::write(
        dir.join("tests").join("test.sh"),
        "#!/bin/bash\necho 1.0 > /logs/verifier/reward.txt\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("solution").join("solve.sh"),
        "#!/bin/bash\ntrue\n",
    )
    .unwrap();
}

/// Builds a job config over a fresh dataset with the given task names.
/// Returns the config; `jobs_dir` and the dataset live under `root`.
fn job_config(root: &Path, agents: &[&str], task_names: &[&str], n_attempts: u32) -> JobConfig {
    let dataset_dir = root.join("tasks");
    std::fs::create_dir_all(&dataset_dir).unwrap();
    for name in task_names {
        write_task(&dataset_dir, name);
    }

    let agents_yaml: String = agents.iter().map(|a| format!("  - name: {a}\n")).collect();
    serde_yaml::from_str(&format!(
        r#"
name: test-job
jobs_dir: {}
n_attempts: {n_attempts}
environment:
  type: docker
agents:
{agents_yaml}
datasets:
  - path: {}
"#,
        root.join("jobs").display(),
        dataset_dir.display(),
    ))
    .unwrap()
}

/// Trial executor that immediately reports reward 1.0.
struct InstantSuccessExecutor;

#[async_trait]
impl TrialExecutor for InstantSuccessExecutor {
    async fn execute(
        &self,
        trial: &Trial,
        _provider: Arc<dyn Provider>,
        _cancel: &CancellationToken,
    ) -> TrialResult {
        let mut result = TrialResult::started(trial, chrono::Utc::now());
        result.reward = Some(1.0);
        result.finish();
        result
    }
}

fn instant_factory() -> ExecutorFactory {
    Arc::new(|_cfg: &JobConfig| -> Arc<dyn TrialExecutor> { Arc::new(InstantSuccessExecutor) })
}

/// Trial executor that sleeps, then fails with `internal_error` when the
/// cancellation signal fired during its sleep.
struct SlowExecutor {
    delay: Duration,
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl TrialExecutor for SlowExecutor {
    async fn execute(
        &self,
        trial: &Trial,
        _provider: Arc<dyn Provider>,
        cancel: &CancellationToken,
    ) -> TrialResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if cancel.is_cancelled() {
            return TrialResult::internal_error(trial, "cancelled");
        }

        let mut result = TrialResult::started(trial, chrono::Utc::now());
        result.reward = Some(1.0);
        result.finish();
        result
    }
}

fn slow_factory(delay: Duration, executions: Arc<AtomicU32>) -> ExecutorFactory {
    Arc::new(move |_cfg: &JobConfig| -> Arc<dyn TrialExecutor> {
        Arc::new(SlowExecutor {
            delay,
            executions: Arc::clone(&executions),
        })
    })
}

#[tokio::test]
async fn test_enumeration_and_aggregation() {
    let root = tempfile::TempDir::new().unwrap();
    let cfg = job_config(root.path(), &["oracle", "claude"], &["t1", "t2"], 3);

    let orchestrator = JobOrchestrator::new(cfg, instant_factory()).unwrap();
    let result = orchestrator.run(CancellationToken::new()).await.unwrap();

    // 2 agents x 2 tasks x 3 attempts
    assert_eq!(result.total_trials, 12);
    assert_eq!(result.completed_trials, 12);
    assert_eq!(result.failed_trials, 0);
    assert_eq!(result.skipped_trials, 0);
    assert!(!result.cancelled);
    assert_eq!(result.pass_rate, 1.0);
    assert_eq!(result.mean_reward, 1.0);

    // Every (agent, task, attempt) tuple appears exactly once.
    let mut tuples: Vec<_> = result
        .results
        .iter()
        .map(|r| (r.agent_name.clone(), r.task_name.clone(), r.attempt))
        .collect();
    tuples.sort();
    tuples.dedup();
    assert_eq!(tuples.len(), 12);
    for attempt in 1..=3 {
        assert!(tuples.contains(&("oracle".to_string(), "t2".to_string(), attempt)));
        assert!(tuples.contains(&("claude".to_string(), "t1".to_string(), attempt)));
    }

    // Per-agent summaries restrict the same formulas to the agent's rows.
    let oracle = &result.agents["oracle"];
    assert_eq!(oracle.total_trials, 6);
    assert_eq!(oracle.completed_trials, 6);
    assert_eq!(oracle.pass_rate, 1.0);
}

#[tokio::test]
async fn test_trial_results_written_before_publication() {
    let root = tempfile::TempDir::new().unwrap();
    let cfg = job_config(root.path(), &["oracle"], &["t1"], 2);

    let orchestrator = JobOrchestrator::new(cfg, instant_factory()).unwrap();
    let result = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(result.total_trials, 2);

    let job_dir = root.path().join("jobs").join("test-job");
    assert!(job_dir.join("config.json").exists());
    assert!(job_dir.join("result.json").exists());

    // Every collected result has its record on disk.
    for attempt in 1..=2 {
        let trial_dir = job_dir
            .join("oracle")
            .join("tasks")
            .join(format!("t1__{attempt}"));
        let result_path = trial_dir.join("result.json");
        assert!(result_path.exists(), "missing {}", result_path.display());

        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&result_path).unwrap()).unwrap();
        assert_eq!(parsed["reward"], 1.0);
        assert_eq!(parsed["attempt"], attempt);
        // No error, so no error.txt.
        assert!(!trial_dir.join("error.txt").exists());
    }

    // The config snapshot round-trips as a valid job config.
    let snapshot: JobConfig =
        serde_json::from_slice(&std::fs::read(job_dir.join("config.json")).unwrap()).unwrap();
    assert_eq!(snapshot.n_attempts, 2);
}

#[tokio::test]
async fn test_job_directory_overwrite_protection() {
    let root = tempfile::TempDir::new().unwrap();
    let cfg = job_config(root.path(), &["oracle"], &["t1"], 1);

    let orchestrator = JobOrchestrator::new(cfg.clone(), instant_factory()).unwrap();
    orchestrator.run(CancellationToken::new()).await.unwrap();

    let result_path = root.path().join("jobs").join("test-job").join("result.json");
    let first_contents = std::fs::read(&result_path).unwrap();

    // Second run with the same name fails fast and modifies nothing.
    let orchestrator2 = JobOrchestrator::new(cfg, instant_factory()).unwrap();
    let err = orchestrator2.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, JobError::JobDirExists(_)));
    assert!(err.to_string().contains("already exists"));

    assert_eq!(std::fs::read(&result_path).unwrap(), first_contents);
}

#[tokio::test]
async fn test_failed_trial_writes_error_txt() {
    struct FailingExecutor;

    #[async_trait]
    impl TrialExecutor for FailingExecutor {
        async fn execute(
            &self,
            trial: &Trial,
            _provider: Arc<dyn Provider>,
            _cancel: &CancellationToken,
        ) -> TrialResult {
            TrialResult::internal_error(trial, "boom")
        }
    }

    let root = tempfile::TempDir::new().unwrap();
    let cfg = job_config(root.path(), &["oracle"], &["t1"], 1);

    let factory: ExecutorFactory =
        Arc::new(|_cfg: &JobConfig| -> Arc<dyn TrialExecutor> { Arc::new(FailingExecutor) });
    let orchestrator = JobOrchestrator::new(cfg, factory).unwrap();
    let result = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(result.failed_trials, 1);
    assert_eq!(result.completed_trials, 0);

    let trial_dir = root
        .path()
        .join("jobs")
        .join("test-job")
        .join("oracle")
        .join("tasks")
        .join("t1__1");
    assert_eq!(
        std::fs::read_to_string(trial_dir.join("error.txt")).unwrap(),
        "boom"
    );
}

#[tokio::test]
async fn test_cancellation_skips_pending_trials() {
    let root = tempfile::TempDir::new().unwrap();
    let mut cfg = job_config(root.path(), &["oracle"], &["t1"], 10);
    cfg.n_concurrent_trials = 2;

    let executions = Arc::new(AtomicU32::new(0));
    let orchestrator = JobOrchestrator::new(
        cfg,
        slow_factory(Duration::from_millis(200), Arc::clone(&executions)),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = orchestrator.run(cancel).await.unwrap();

    assert!(result.cancelled, "expected cancellation to be observed");
    assert!(result.skipped_trials > 0, "expected skipped trials");
    assert_eq!(
        result.completed_trials + result.failed_trials + result.skipped_trials,
        10
    );
    // Not every trial was dequeued.
    assert!(executions.load(Ordering::SeqCst) < 10);

    // Completed trials keep their on-disk records.
    for row in &result.results {
        let trial_dir = root
            .path()
            .join("jobs")
            .join("test-job")
            .join(&row.agent_name)
            .join("tasks")
            .join(format!("{}__{}", row.task_name, row.attempt));
        assert!(trial_dir.join("result.json").exists());
    }
}

#[tokio::test]
async fn test_oracle_requires_solution_script() {
    let root = tempfile::TempDir::new().unwrap();
    let cfg = job_config(root.path(), &["oracle"], &["t1"], 1);
    std::fs::remove_file(root.path().join("tasks").join("t1").join("solution").join("solve.sh"))
        .unwrap();

    let orchestrator = JobOrchestrator::new(cfg, instant_factory()).unwrap();
    let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("solve.sh"));

    // Fatal before any trial: the job directory was created but holds no
    // trial output.
    let job_dir = root.path().join("jobs").join("test-job");
    assert!(!job_dir.join("result.json").exists());
}

#[tokio::test]
async fn test_workers_clamped_to_trial_count() {
    let root = tempfile::TempDir::new().unwrap();
    let mut cfg = job_config(root.path(), &["oracle"], &["t1"], 1);
    cfg.n_concurrent_trials = 64;

    let orchestrator = JobOrchestrator::new(cfg, instant_factory()).unwrap();
    let result = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(result.total_trials, 1);
    assert_eq!(result.completed_trials, 1);
}

#[test]
fn test_testdata_job_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join("job.yaml");
    let cfg = rollout::config::load_job_config(path).unwrap();
    assert_eq!(cfg.name.as_deref(), Some("test-oracle-hello-world"));
    assert_eq!(cfg.environment.kind, "docker");
    assert_eq!(cfg.agents.len(), 1);
    assert!(cfg.agents[0].is_oracle());
    assert_eq!(cfg.datasets[0].path.as_deref(), Some("testdata/datasets"));
}

/// Full end-to-end oracle run against the local Docker daemon.
#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn test_oracle_hello_world_e2e() {
    let root = tempfile::TempDir::new().unwrap();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));

    let mut cfg = rollout::config::load_job_config(manifest_dir.join("testdata").join("job.yaml"))
        .unwrap();
    cfg.jobs_dir = root.path().join("jobs").display().to_string();
    cfg.datasets[0].path = Some(
        manifest_dir
            .join("testdata")
            .join("datasets")
            .display()
            .to_string(),
    );

    let orchestrator = JobOrchestrator::new(cfg, default_executor_factory()).unwrap();
    let result = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(result.total_trials, 1);
    assert_eq!(result.completed_trials, 1);
    assert_eq!(result.failed_trials, 0);
    assert_eq!(result.pass_rate, 1.0);
    assert_eq!(result.mean_reward, 1.0);
}
