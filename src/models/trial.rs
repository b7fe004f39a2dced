use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::Agent;
use super::errors::{ErrorKind, TrialError};
use super::task::Task;

/// One element of the agents × datasets × tasks × attempts product.
/// A trial exclusively owns its `output_dir`.
#[derive(Debug, Clone)]
pub struct Trial {
    /// Deterministic identifier: `agent__dataset__task__attempt`.
    pub id: String,
    pub task: Task,
    pub agent: Agent,
    pub dataset: String,
    /// 1-indexed repetition counter within (agent, task).
    pub attempt: u32,
    /// Directory under the job directory that receives all trial output.
    pub output_dir: PathBuf,
}

/// The outcome of a single trial, written as `<trial>/result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub task_name: String,
    pub dataset_name: String,
    pub agent_name: String,
    pub attempt: u32,
    pub task_git_commit_id: Option<String>,
    /// Absent iff an error prevented the verifier from producing one, or
    /// the verifier was disabled.
    pub reward: Option<f64>,
    /// Cost reported by the environment handle; 0 for local backends.
    pub cost: f64,
    pub error: Option<TrialError>,
    pub durations: Durations,
    pub timestamps: Timestamps,
}

impl TrialResult {
    /// Creates a result shell for a trial, stamped with its start time.
    pub fn started(trial: &Trial, started_at: DateTime<Utc>) -> Self {
        Self {
            task_name: trial.task.name.clone(),
            dataset_name: trial.dataset.clone(),
            agent_name: trial.agent.name.clone(),
            attempt: trial.attempt,
            task_git_commit_id: trial.task.git_commit_id.clone(),
            reward: None,
            cost: 0.0,
            error: None,
            durations: Durations::default(),
            timestamps: Timestamps::at(started_at),
        }
    }

    /// Synthesizes a result for a trial whose executor died unexpectedly,
    /// so the job's trial-count invariants hold.
    pub fn internal_error(trial: &Trial, message: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut result = Self::started(trial, now);
        result.error = Some(TrialError::new(ErrorKind::InternalError, message));
        result.timestamps.ended_at = now;
        result
    }

    /// Closes the result: stamps the end time and total duration.
    pub fn finish(&mut self) {
        self.timestamps.ended_at = Utc::now();
        self.durations.total_sec = seconds_between(self.timestamps.started_at, self.timestamps.ended_at);
    }
}

/// Per-phase durations in seconds. A phase duration is present iff the
/// phase actually ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Durations {
    pub total_sec: f64,
    pub environment_setup_sec: Option<f64>,
    pub agent_setup_sec: Option<f64>,
    pub agent_execution_sec: Option<f64>,
    pub verifier_sec: Option<f64>,
}

/// Timestamps at every phase boundary. A boundary is null when the phase
/// never ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamps {
    pub started_at: DateTime<Utc>,
    pub environment_setup_started_at: Option<DateTime<Utc>>,
    pub environment_setup_ended_at: Option<DateTime<Utc>>,
    pub agent_setup_started_at: Option<DateTime<Utc>>,
    pub agent_setup_ended_at: Option<DateTime<Utc>>,
    pub agent_execution_started_at: Option<DateTime<Utc>>,
    pub agent_execution_ended_at: Option<DateTime<Utc>>,
    pub verifier_started_at: Option<DateTime<Utc>>,
    pub verifier_ended_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

impl Timestamps {
    pub fn at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            environment_setup_started_at: None,
            environment_setup_ended_at: None,
            agent_setup_started_at: None,
            agent_setup_ended_at: None,
            agent_execution_started_at: None,
            agent_execution_ended_at: None,
            verifier_started_at: None,
            verifier_ended_at: None,
            ended_at: started_at,
        }
    }
}

/// Fractional seconds between two timestamps.
pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trial() -> Trial {
        Trial {
            id: "oracle__ds__hello__1".to_string(),
            task: Task::at("hello", "/tmp/hello"),
            agent: Agent::named("oracle"),
            dataset: "ds".to_string(),
            attempt: 1,
            output_dir: PathBuf::from("/tmp/out"),
        }
    }

    #[test]
    fn test_result_json_shape() {
        let result = TrialResult::started(&sample_trial(), Utc::now());
        let json = serde_json::to_value(&result).unwrap();

        // Nullable fields serialize as explicit nulls, not omissions.
        assert!(json["reward"].is_null());
        assert!(json["error"].is_null());
        assert!(json["task_git_commit_id"].is_null());
        assert!(json["timestamps"]["verifier_started_at"].is_null());
        assert!(json["durations"]["agent_execution_sec"].is_null());
        assert_eq!(json["attempt"], 1);
        assert_eq!(json["agent_name"], "oracle");
    }

    #[test]
    fn test_internal_error_result() {
        let result = TrialResult::internal_error(&sample_trial(), "worker panicked");
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(result.reward.is_none());
    }

    #[test]
    fn test_seconds_between() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(2500);
        assert_eq!(seconds_between(start, end), 2.5);
    }
}
