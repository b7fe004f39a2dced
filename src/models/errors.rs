use serde::{Deserialize, Serialize};

/// Category of a trial-level failure, recorded as `error.type` in
/// `result.json`. This is a closed set; every failure path in the trial
/// executor maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Environment build
    EnvironmentBuildFailed,
    EnvironmentBuildTimeout,
    EnvironmentImagePullFailed,

    // Environment start
    EnvironmentStartFailed,
    EnvironmentResourceAllocationFailed,

    // Agent install
    AgentInstallFailed,
    AgentInstallTimeout,

    // Agent execution
    AgentExecutionFailed,
    AgentExecutionTimeout,

    // Verification
    VerifierFailed,
    VerifierTimeout,
    VerifierRewardMissing,
    VerifierRewardInvalid,

    // Teardown
    EnvironmentTeardownFailed,

    // Pre-execution
    TaskInvalid,
    TaskNotFound,

    // Catch-all
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EnvironmentBuildFailed => "environment_build_failed",
            ErrorKind::EnvironmentBuildTimeout => "environment_build_timeout",
            ErrorKind::EnvironmentImagePullFailed => "environment_image_pull_failed",
            ErrorKind::EnvironmentStartFailed => "environment_start_failed",
            ErrorKind::EnvironmentResourceAllocationFailed => {
                "environment_resource_allocation_failed"
            }
            ErrorKind::AgentInstallFailed => "agent_install_failed",
            ErrorKind::AgentInstallTimeout => "agent_install_timeout",
            ErrorKind::AgentExecutionFailed => "agent_execution_failed",
            ErrorKind::AgentExecutionTimeout => "agent_execution_timeout",
            ErrorKind::VerifierFailed => "verifier_failed",
            ErrorKind::VerifierTimeout => "verifier_timeout",
            ErrorKind::VerifierRewardMissing => "verifier_reward_missing",
            ErrorKind::VerifierRewardInvalid => "verifier_reward_invalid",
            ErrorKind::EnvironmentTeardownFailed => "environment_teardown_failed",
            ErrorKind::TaskInvalid => "task_invalid",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed trial failure, serialized into `result.json` and mirrored as a
/// plain-text `error.txt` next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl TrialError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
