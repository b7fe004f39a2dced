use std::path::Path;

use crate::error::ConfigError;
use crate::models::JobConfig;

/// Loads and validates a job configuration file. The file is parsed as
/// YAML, which also accepts JSON.
pub fn load_job_config(path: impl AsRef<Path>) -> Result<JobConfig, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    let mut cfg: JobConfig = serde_yaml::from_str(&data)?;
    normalize(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

/// Coerces zero/empty values back to their defaults, matching the
/// behavior of explicit `n_attempts: 0` meaning "use the default".
fn normalize(cfg: &mut JobConfig) {
    if cfg.jobs_dir.is_empty() {
        cfg.jobs_dir = "jobs".to_string();
    }
    if cfg.n_attempts == 0 {
        cfg.n_attempts = 1;
    }
    if cfg.n_concurrent_trials == 0 {
        cfg.n_concurrent_trials = 1;
    }
    if cfg.timeout_multiplier <= 0.0 {
        cfg.timeout_multiplier = 1.0;
    }
    if cfg.log_level.is_empty() {
        cfg.log_level = "info".to_string();
    }
    if cfg.instruction_path.is_empty() {
        cfg.instruction_path = "/tmp/instruction.md".to_string();
    }
}

fn validate(cfg: &JobConfig) -> Result<(), ConfigError> {
    for (i, dataset) in cfg.datasets.iter().enumerate() {
        let has_path = dataset.path.as_deref().is_some_and(|p| !p.is_empty());
        let has_registry = dataset.registry.is_some();
        if !has_path && !has_registry {
            return Err(ConfigError::InvalidDatasetRef {
                index: i,
                reason: "must specify either 'path' or 'registry'".to_string(),
            });
        }
        if has_path && has_registry {
            return Err(ConfigError::InvalidDatasetRef {
                index: i,
                reason: "cannot specify both 'path' and 'registry'".to_string(),
            });
        }
        if has_registry && dataset.name.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::InvalidDatasetRef {
                index: i,
                reason: "registry refs require a 'name'".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PreservePolicy;
    use std::io::Write;

    fn load_from_str(yaml: &str) -> Result<JobConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        load_job_config(file.path())
    }

    #[test]
    fn test_full_config() {
        let cfg = load_from_str(
            r#"
name: nightly
jobs_dir: runs
n_attempts: 3
n_concurrent_trials: 4
timeout_multiplier: 2.0
environment:
  type: docker
  force_build: true
  preserve_env: on_failure
  override_memory_mb: 4096
verifier:
  override_timeout_sec: 120
  max_timeout_sec: 300
agents:
  - name: oracle
datasets:
  - path: ./tasks
"#,
        )
        .unwrap();

        assert_eq!(cfg.name.as_deref(), Some("nightly"));
        assert_eq!(cfg.jobs_dir, "runs");
        assert_eq!(cfg.n_attempts, 3);
        assert_eq!(cfg.n_concurrent_trials, 4);
        assert_eq!(cfg.timeout_multiplier, 2.0);
        assert_eq!(cfg.environment.kind, "docker");
        assert!(cfg.environment.force_build);
        assert_eq!(cfg.environment.preserve_env, PreservePolicy::OnFailure);
        assert_eq!(cfg.environment.override_memory_mb, Some(4096));
        assert_eq!(cfg.verifier.override_timeout_sec, Some(120.0));
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.datasets[0].path.as_deref(), Some("./tasks"));
    }

    #[test]
    fn test_zero_values_normalize_to_defaults() {
        let cfg = load_from_str(
            "n_attempts: 0\nn_concurrent_trials: 0\ntimeout_multiplier: 0\nenvironment:\n  type: docker\n",
        )
        .unwrap();
        assert_eq!(cfg.n_attempts, 1);
        assert_eq!(cfg.n_concurrent_trials, 1);
        assert_eq!(cfg.timeout_multiplier, 1.0);
    }

    #[test]
    fn test_dataset_ref_requires_exactly_one_source() {
        let neither = load_from_str("environment:\n  type: docker\ndatasets:\n  - name: ds\n");
        assert!(matches!(
            neither,
            Err(ConfigError::InvalidDatasetRef { index: 0, .. })
        ));

        let both = load_from_str(
            "environment:\n  type: docker\ndatasets:\n  - path: ./tasks\n    name: ds\n    registry:\n      url: https://example.com/registry.json\n",
        );
        assert!(matches!(
            both,
            Err(ConfigError::InvalidDatasetRef { index: 0, .. })
        ));
    }

    #[test]
    fn test_registry_ref_requires_name() {
        let result = load_from_str(
            "environment:\n  type: docker\ndatasets:\n  - registry:\n      url: https://example.com/registry.json\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDatasetRef { index: 0, .. })
        ));
    }

    #[test]
    fn test_json_config_accepted() {
        let cfg = load_from_str(r#"{"environment": {"type": "docker"}, "n_attempts": 2}"#).unwrap();
        assert_eq!(cfg.n_attempts, 2);
        assert_eq!(cfg.environment.kind, "docker");
    }
}
