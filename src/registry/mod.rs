//! Task registries: a `registry.json` file (local or remote) lists
//! datasets whose tasks live in git repositories. Resolution clones each
//! unique (repository, commit) pair once and loads tasks from the clones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::models::Task;
use crate::task::{load_task, validate_task};

/// A task entry in a registry dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryTask {
    pub name: String,
    pub git_url: String,
    /// Commit to pin; empty/absent means the repository HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_id: Option<String>,
    /// Task directory inside the repository; absent means the repo root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A dataset defined in a registry.json file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDataset {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tasks: Vec<RegistryTask>,
}

/// Loads a registry.json from a local filesystem path.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Vec<RegistryDataset>, RegistryError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Loads a registry.json from a remote URL.
pub async fn load_from_url(url: &str) -> Result<Vec<RegistryDataset>, RegistryError> {
    let datasets = reqwest::get(url)
        .await?
        .error_for_status()?
        .json::<Vec<RegistryDataset>>()
        .await?;
    Ok(datasets)
}

/// Finds a dataset by name and optional version. An empty version matches
/// the first dataset with that name.
pub fn find_dataset<'a>(
    datasets: &'a [RegistryDataset],
    name: &str,
    version: &str,
) -> Result<&'a RegistryDataset, RegistryError> {
    for dataset in datasets {
        if dataset.name == name && (version.is_empty() || dataset.version == version) {
            return Ok(dataset);
        }
    }

    if version.is_empty() {
        Err(RegistryError::DatasetNotFound {
            name: name.to_string(),
        })
    } else {
        Err(RegistryError::VersionNotFound {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

/// Identifies a repository at a specific commit; the unit of clone
/// deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CloneKey {
    git_url: String,
    /// Empty means HEAD.
    git_commit_id: String,
}

/// Resolves registry tasks by cloning git repositories under a base
/// directory and loading each task from its clone.
pub struct Resolver {
    base_dir: PathBuf,
}

impl Resolver {
    /// Creates a resolver whose clones live under the system temp dir.
    pub fn new() -> std::io::Result<Self> {
        let base_dir = std::env::temp_dir().join(format!(
            "rollout-registry-{}",
            chrono::Utc::now().timestamp()
        ));
        std::fs::create_dir_all(&base_dir)?;
        debug!(path = %base_dir.display(), "created registry clone directory");
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolves every task in the dataset. Repositories are cloned once
    /// per (url, commit) pair, in parallel.
    pub async fn resolve(&self, dataset: &RegistryDataset) -> Result<Vec<Task>, RegistryError> {
        let mut groups: HashMap<CloneKey, Vec<&RegistryTask>> = HashMap::new();
        for task in &dataset.tasks {
            let key = CloneKey {
                git_url: task.git_url.clone(),
                git_commit_id: task.git_commit_id.clone().unwrap_or_default(),
            };
            groups.entry(key).or_default().push(task);
        }

        debug!(
            dataset = %dataset.name,
            unique_repos = groups.len(),
            total_tasks = dataset.tasks.len(),
            "resolving registry dataset"
        );

        let mut clone_jobs = JoinSet::new();
        for key in groups.keys().cloned() {
            let clone_path = self.base_dir.join(clone_dir_name(&key));
            clone_jobs.spawn(async move {
                let path = clone_repo(&key, &clone_path).await?;
                Ok::<(CloneKey, PathBuf), RegistryError>((key, path))
            });
        }

        let mut clones: HashMap<CloneKey, PathBuf> = HashMap::new();
        while let Some(joined) = clone_jobs.join_next().await {
            let (key, path) = joined.map_err(|e| RegistryError::GitClone {
                url: "<unknown>".to_string(),
                reason: format!("clone task failed: {e}"),
            })??;
            clones.insert(key, path);
        }

        let mut tasks = Vec::with_capacity(dataset.tasks.len());
        for reg_task in &dataset.tasks {
            let key = CloneKey {
                git_url: reg_task.git_url.clone(),
                git_commit_id: reg_task.git_commit_id.clone().unwrap_or_default(),
            };
            let clone_path = &clones[&key];
            let task_path = match reg_task.path.as_deref() {
                Some(sub) if !sub.is_empty() => clone_path.join(sub),
                _ => clone_path.clone(),
            };

            debug!(task = %reg_task.name, path = %task_path.display(), "loading task from clone");
            let mut task = load_task(&task_path).await?;
            validate_task(&task)?;

            // The registry entry names the task and may pin its commit.
            task.name = reg_task.name.clone();
            if let Some(commit) = &reg_task.git_commit_id {
                if !commit.is_empty() {
                    task.git_commit_id = Some(commit.clone());
                }
            }
            tasks.push(task);
        }

        info!(dataset = %dataset.name, count = tasks.len(), "resolved registry tasks");
        Ok(tasks)
    }
}

/// Clones a repository to `clone_path`. Shallow clone for HEAD, full
/// clone plus checkout for pinned commits. A pre-existing clone is
/// reused.
async fn clone_repo(key: &CloneKey, clone_path: &Path) -> Result<PathBuf, RegistryError> {
    if clone_path.exists() {
        debug!(url = %key.git_url, path = %clone_path.display(), "repository already cloned");
        return Ok(clone_path.to_path_buf());
    }

    let git_err = |reason: String| RegistryError::GitClone {
        url: key.git_url.clone(),
        reason,
    };

    if key.git_commit_id.is_empty() {
        run_git(
            &["clone", "--depth", "1", &key.git_url],
            Some(clone_path),
            None,
        )
        .await
        .map_err(git_err)?;
    } else {
        run_git(&["clone", &key.git_url], Some(clone_path), None)
            .await
            .map_err(git_err)?;
        run_git(&["checkout", &key.git_commit_id], None, Some(clone_path))
            .await
            .map_err(git_err)?;
    }

    debug!(url = %key.git_url, path = %clone_path.display(), "repository cloned");
    Ok(clone_path.to_path_buf())
}

async fn run_git(
    args: &[&str],
    dest: Option<&Path>,
    workdir: Option<&Path>,
) -> Result<(), String> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(args);
    if let Some(dest) = dest {
        cmd.arg(dest);
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    cmd.kill_on_drop(true);

    let output = cmd.output().await.map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(())
}

/// Directory name for a clone: readable repo name plus a URL hash and
/// commit marker, filesystem-safe and unique per clone key.
fn clone_dir_name(key: &CloneKey) -> String {
    let digest = Sha256::digest(key.git_url.as_bytes());
    let url_hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();

    let commit_part = if key.git_commit_id.is_empty() {
        "HEAD".to_string()
    } else {
        key.git_commit_id.chars().take(12).collect()
    };

    let repo_name = key
        .git_url
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .to_string();

    format!("{repo_name}-{url_hash}-{commit_part}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> Vec<RegistryDataset> {
        serde_json::from_str(
            r#"[
              {
                "name": "terminal-basics",
                "version": "1.0",
                "tasks": [
                  {"name": "hello", "git_url": "https://example.com/tasks.git", "path": "hello"},
                  {"name": "count", "git_url": "https://example.com/tasks.git",
                   "git_commit_id": "0123456789abcdef0123", "path": "count"}
                ]
              },
              {"name": "terminal-basics", "version": "2.0", "tasks": []}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_find_dataset_by_name_and_version() {
        let datasets = sample_registry();

        let first = find_dataset(&datasets, "terminal-basics", "").unwrap();
        assert_eq!(first.version, "1.0");

        let pinned = find_dataset(&datasets, "terminal-basics", "2.0").unwrap();
        assert_eq!(pinned.version, "2.0");

        assert!(matches!(
            find_dataset(&datasets, "missing", ""),
            Err(RegistryError::DatasetNotFound { .. })
        ));
        assert!(matches!(
            find_dataset(&datasets, "terminal-basics", "9.9"),
            Err(RegistryError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn test_clone_dir_name_is_stable_and_distinct() {
        let head = CloneKey {
            git_url: "https://example.com/org/tasks.git".to_string(),
            git_commit_id: String::new(),
        };
        let pinned = CloneKey {
            git_url: "https://example.com/org/tasks.git".to_string(),
            git_commit_id: "0123456789abcdef0123456789abcdef01234567".to_string(),
        };

        let head_name = clone_dir_name(&head);
        assert!(head_name.starts_with("tasks-"));
        assert!(head_name.ends_with("-HEAD"));
        assert_eq!(head_name, clone_dir_name(&head));

        let pinned_name = clone_dir_name(&pinned);
        assert!(pinned_name.ends_with("-0123456789ab"));
        assert_ne!(head_name, pinned_name);
    }

    #[test]
    fn test_registry_json_parsing() {
        let datasets = sample_registry();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].tasks.len(), 2);
        assert_eq!(
            datasets[0].tasks[1].git_commit_id.as_deref(),
            Some("0123456789abcdef0123")
        );
        assert!(datasets[0].tasks[0].git_commit_id.is_none());
    }
}
