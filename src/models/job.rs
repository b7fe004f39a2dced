use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::Agent;
use super::task::Task;

/// Controls whether a trial's environment is destroyed during teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreservePolicy {
    /// Always destroy the environment.
    #[default]
    Never,
    /// Never destroy the environment.
    Always,
    /// Destroy only when the trial finished without error and with
    /// reward exactly 1.0; preserve every other outcome for debugging.
    OnFailure,
}

/// The parsed job configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name; a timestamp is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
    /// Attempts per (agent, task) pair.
    #[serde(default = "default_n_attempts")]
    pub n_attempts: u32,
    /// Worker pool size; clamped to [1, trial count] at run time.
    #[serde(default = "default_n_concurrent_trials")]
    pub n_concurrent_trials: usize,
    /// Scales every task-declared timeout.
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// In-container path the task instruction is copied to.
    #[serde(default = "default_instruction_path")]
    pub instruction_path: String,
    pub environment: JobEnvironmentConfig,
    #[serde(default)]
    pub verifier: JobVerifierConfig,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub datasets: Vec<DatasetRef>,
}

fn default_jobs_dir() -> String {
    "jobs".to_string()
}

fn default_n_attempts() -> u32 {
    1
}

fn default_n_concurrent_trials() -> usize {
    1
}

fn default_timeout_multiplier() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_instruction_path() -> String {
    "/tmp/instruction.md".to_string()
}

/// Retry policy shape. Reserved in the config format; no retry logic is
/// attached to it yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
        }
    }
}

/// Environment/provider section of the job configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEnvironmentConfig {
    /// Provider name ("docker", ...). Required; an unknown or empty name
    /// is a fatal configuration error.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Build from `environment/` even when the task names a pre-built image.
    #[serde(default)]
    pub force_build: bool,
    #[serde(default)]
    pub preserve_env: PreservePolicy,
    /// Opaque settings forwarded to the provider untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provider_config: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_storage_mb: Option<u64>,
}

/// Verifier section of the job configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobVerifierConfig {
    /// Replaces the task's verifier timeout (pre-multiplier) when set and > 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_timeout_sec: Option<f64>,
    /// Ceiling on the effective verifier timeout; itself scaled by the
    /// multiplier before clipping. Ignored when absent or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_sec: Option<f64>,
    /// Skip the verification phase entirely; trials finish without reward.
    #[serde(default)]
    pub disable: bool,
}

/// One dataset reference in the job configuration. Exactly one of `path`
/// and `registry` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Local directory whose subdirectories are tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Registry to resolve the dataset from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryRef>,
    /// Dataset name, required for registry refs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Dataset version; empty matches the first name match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Where a registry.json lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A named collection of loaded tasks.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub version: Option<String>,
    pub tasks: Vec<Task>,
}

/// Aggregate metrics across all trials of a job, written to the job-level
/// `result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_name: String,
    pub cancelled: bool,
    pub total_trials: usize,
    pub completed_trials: usize,
    pub failed_trials: usize,
    pub skipped_trials: usize,
    pub pass_rate: f64,
    pub mean_reward: f64,
    pub total_cost: f64,
    pub total_duration_sec: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentSummary>,
    pub results: Vec<TrialSummary>,
}

/// Per-agent aggregate, same formulas as the job-level metrics restricted
/// to that agent's trials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSummary {
    pub total_trials: usize,
    pub completed_trials: usize,
    pub failed_trials: usize,
    pub pass_rate: f64,
    pub mean_reward: f64,
    pub total_cost: f64,
}

/// Compact per-trial row in the job-level `results` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSummary {
    pub task_name: String,
    pub dataset_name: String,
    pub agent_name: String,
    pub attempt: u32,
    pub reward: Option<f64>,
}
