//! Task loading: turns a task directory into a validated [`Task`] with
//! its configuration and, when available, the git commit it came from.

use std::path::Path;

use tracing::debug;

use crate::config::load_task_config;
use crate::error::TaskError;
use crate::models::Task;

/// Loads a single task from a filesystem path. The task name is the
/// directory base name.
pub async fn load_task(task_path: impl AsRef<Path>) -> Result<Task, TaskError> {
    let abs_path = std::path::absolute(task_path.as_ref())?;

    let name = abs_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let config = load_task_config(&abs_path).map_err(|source| TaskError::Config {
        task: name.clone(),
        source,
    })?;

    let git_commit_id = resolve_git_sha(&abs_path).await;
    debug!(task = %name, commit = ?git_commit_id, "loaded task");

    Ok(Task {
        name,
        path: abs_path,
        config,
        git_commit_id,
    })
}

/// Validates a task's on-disk structure. `instruction.md`, `environment/`
/// and `tests/test.sh` are always required; `solution/solve.sh` is
/// checked separately when the oracle agent participates.
pub fn validate_task(task: &Task) -> Result<(), TaskError> {
    require(task, &task.instruction_path(), "instruction.md")?;
    require(task, &task.environment_dir(), "environment/ directory")?;
    require(task, &task.tests_dir().join("test.sh"), "tests/test.sh")?;
    Ok(())
}

/// Validates that a task can be run by the oracle agent.
pub fn validate_oracle_support(task: &Task) -> Result<(), TaskError> {
    require(task, &task.solve_script(), "solution/solve.sh")
}

fn require(task: &Task, path: &Path, what: &str) -> Result<(), TaskError> {
    if path.exists() {
        Ok(())
    } else {
        Err(TaskError::MissingFile {
            task: task.name.clone(),
            file: what.to_string(),
        })
    }
}

/// Resolves the HEAD commit of the repository containing `path`, if any.
async fn resolve_git_sha(path: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        None
    } else {
        Some(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_task_skeleton(dir: &Path) {
        std::fs::write(dir.join("instruction.md"), "# Do the thing\n").unwrap();
        std::fs::create_dir_all(dir.join("environment")).unwrap();
        std::fs::write(dir.join("environment").join("Dockerfile"), "FROM alpine\n").unwrap();
        std::fs::create_dir_all(dir.join("tests")).unwrap();
        std::fs::write(dir.join("tests").join("test.sh"), "#!/bin/bash\n").unwrap();
    }

    #[tokio::test]
    async fn test_load_task_name_from_directory() {
        let root = TempDir::new().unwrap();
        let task_dir = root.path().join("count-lines");
        std::fs::create_dir_all(&task_dir).unwrap();
        write_task_skeleton(&task_dir);

        let task = load_task(&task_dir).await.unwrap();
        assert_eq!(task.name, "count-lines");
        assert!(task.path.is_absolute());
        assert_eq!(task.config.environment.memory_mb, 2048);
    }

    #[tokio::test]
    async fn test_validate_task_missing_pieces() {
        let root = TempDir::new().unwrap();
        let task_dir = root.path().join("broken");
        std::fs::create_dir_all(&task_dir).unwrap();

        let task = load_task(&task_dir).await.unwrap();
        let err = validate_task(&task).unwrap_err();
        assert!(matches!(err, TaskError::MissingFile { .. }));
        assert!(err.to_string().contains("instruction.md"));

        write_task_skeleton(&task_dir);
        assert!(validate_task(&task).is_ok());

        // No solution: fine for regular agents, an error for the oracle.
        let err = validate_oracle_support(&task).unwrap_err();
        assert!(err.to_string().contains("solve.sh"));

        std::fs::create_dir_all(task_dir.join("solution")).unwrap();
        std::fs::write(task_dir.join("solution").join("solve.sh"), "#!/bin/bash\n").unwrap();
        assert!(validate_oracle_support(&task).is_ok());
    }

    #[tokio::test]
    async fn test_task_config_is_loaded() {
        let root = TempDir::new().unwrap();
        let task_dir = root.path().join("configured");
        std::fs::create_dir_all(&task_dir).unwrap();
        write_task_skeleton(&task_dir);
        std::fs::write(task_dir.join("task.toml"), "[environment]\nmemory = \"4G\"\n").unwrap();

        let task = load_task(&task_dir).await.unwrap();
        assert_eq!(task.config.environment.memory_mb, 4096);
    }
}
