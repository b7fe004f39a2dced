use std::path::Path;

use serde::Deserialize;

use super::quantity::parse_quantity_mb;
use crate::error::ConfigError;
use crate::models::{AgentTimeouts, EnvironmentConfig, TaskConfig, VerifierConfig};

/// Raw `task.toml` shape before quantity normalization. The environment
/// section accepts both the `_mb` integer fields and the legacy string
/// forms (`memory = "2G"`).
#[derive(Debug, Default, Deserialize)]
struct RawTaskConfig {
    version: Option<String>,
    metadata: Option<toml::Value>,
    #[serde(default)]
    verifier: RawVerifierConfig,
    #[serde(default)]
    agent: RawAgentConfig,
    #[serde(default)]
    environment: RawEnvironmentConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawVerifierConfig {
    timeout_sec: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAgentConfig {
    install_timeout_sec: Option<f64>,
    timeout_sec: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnvironmentConfig {
    build_timeout_sec: Option<f64>,
    docker_image: Option<String>,
    cpus: Option<u32>,
    memory: Option<String>,
    storage: Option<String>,
    memory_mb: Option<u64>,
    storage_mb: Option<u64>,
}

/// Loads a task's `task.toml` from its directory. A missing file yields
/// the full default configuration.
pub fn load_task_config(task_dir: impl AsRef<Path>) -> Result<TaskConfig, ConfigError> {
    let path = task_dir.as_ref().join("task.toml");
    let raw = match std::fs::read_to_string(&path) {
        Ok(data) => toml::from_str::<RawTaskConfig>(&data)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawTaskConfig::default(),
        Err(e) => return Err(e.into()),
    };
    resolve(raw)
}

fn resolve(raw: RawTaskConfig) -> Result<TaskConfig, ConfigError> {
    let defaults = EnvironmentConfig::default();

    // Explicit `_mb` integers win over the legacy string forms.
    let memory_mb = match (raw.environment.memory_mb, raw.environment.memory) {
        (Some(mb), _) => mb,
        (None, Some(legacy)) => parse_quantity_mb(&legacy)?,
        (None, None) => defaults.memory_mb,
    };
    let storage_mb = match (raw.environment.storage_mb, raw.environment.storage) {
        (Some(mb), _) => mb,
        (None, Some(legacy)) => parse_quantity_mb(&legacy)?,
        (None, None) => defaults.storage_mb,
    };

    Ok(TaskConfig {
        version: raw.version.unwrap_or_else(|| "1.0".to_string()),
        metadata: raw.metadata,
        verifier: VerifierConfig {
            timeout_sec: raw.verifier.timeout_sec.unwrap_or(600.0),
        },
        agent: AgentTimeouts {
            install_timeout_sec: raw.agent.install_timeout_sec.unwrap_or(300.0),
            timeout_sec: raw.agent.timeout_sec.unwrap_or(600.0),
        },
        environment: EnvironmentConfig {
            build_timeout_sec: raw.environment.build_timeout_sec.unwrap_or(600.0),
            docker_image: raw.environment.docker_image,
            cpus: raw.environment.cpus.unwrap_or(1),
            memory_mb,
            storage_mb,
        },
    })
}
