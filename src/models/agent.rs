use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Reserved agent name that triggers oracle semantics: instead of an
/// install/execute script pair, the task's own `solution/solve.sh` is run.
pub const ORACLE_AGENT_NAME: &str = "oracle";

/// An agent definition from the job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Agent name, used in trial identifiers and output paths.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Shell script run once per trial before the agent executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<String>,
    /// Shell script that performs the actual task attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<String>,
    /// Environment variables injected into the agent's container.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Agent {
    /// Returns true if this is the reserved oracle agent.
    pub fn is_oracle(&self) -> bool {
        self.name == ORACLE_AGENT_NAME
    }

    /// Creates an agent with only a name, for the oracle and for tests.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            install: None,
            execute: None,
            env: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_detection() {
        assert!(Agent::named("oracle").is_oracle());
        assert!(!Agent::named("claude").is_oracle());
        assert!(!Agent::named("Oracle").is_oracle());
    }

    #[test]
    fn test_agent_yaml_roundtrip() {
        let yaml = r#"
name: claude
install: "pip install claude-cli"
execute: "claude --task $ROLLOUT_TASK_INSTRUCTION"
env:
  API_KEY: secret
"#;
        let agent: Agent = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(agent.name, "claude");
        assert_eq!(agent.install.as_deref(), Some("pip install claude-cli"));
        assert_eq!(agent.env.get("API_KEY").map(String::as_str), Some("secret"));
        assert!(agent.description.is_none());
    }
}
