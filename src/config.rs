use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::CommandSpec;
use crate::events::DEFAULT_CAPACITY;
use crate::execution::{ResourceLimits, SecurityPolicy, DEFAULT_RETENTION};

/// Default size of the worker pool
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 10;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of workers, and so of tasks executing at once
    pub max_concurrent_tasks: usize,
    /// Capacity of the event bus before slow observers lag
    pub event_capacity: usize,
    pub resource_limits: ResourceLimits,
    pub security_policy: SecurityPolicy,
    /// Finished executions kept for log and stats lookups
    pub finished_retention: usize,
    /// Command agents to register, by id
    pub agents: BTreeMap<String, CommandSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            event_capacity: DEFAULT_CAPACITY,
            resource_limits: ResourceLimits::default(),
            security_policy: SecurityPolicy::default(),
            finished_retention: DEFAULT_RETENTION,
            agents: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load the `orchestrator` section of `<dir>/config.json`, falling
    /// back to defaults when the file or section is missing
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.json");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: serde_json::Value =
                serde_json::from_str(&content).context("Failed to parse config.json")?;

            if let Some(orch) = config.get("orchestrator") {
                let parsed: Self = serde_json::from_value(orch.clone())
                    .context("Failed to parse orchestrator config")?;
                parsed.validate()?;
                return Ok(parsed);
            }
        }
        Ok(Self::default())
    }

    /// `<platform config dir>/taskforge`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("taskforge"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            bail!("max_concurrent_tasks must be at least 1");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be at least 1");
        }
        if self.resource_limits.wall_clock_timeout.is_zero() {
            bail!("resource_limits.wall_clock_timeout must be positive");
        }
        for (id, spec) in &self.agents {
            if spec.command.trim().is_empty() {
                bail!("agent {} has an empty command", id);
            }
        }
        Ok(())
    }

    pub fn with_max_concurrent_tasks(mut self, workers: usize) -> Self {
        self.max_concurrent_tasks = workers;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_security_policy(mut self, policy: SecurityPolicy) -> Self {
        self.security_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = OrchestratorConfig::load(dir.path()).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.max_concurrent_tasks, 10);
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"other": {}}"#).unwrap();
        let config = OrchestratorConfig::load(dir.path()).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_load_orchestrator_section() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "orchestrator": {
                    "max_concurrent_tasks": 4,
                    "resource_limits": {"wall_clock_timeout": 1.5},
                    "security_policy": {"allow_network": true},
                    "agents": {
                        "restart": {"command": "docker", "args": ["restart"], "task_types": ["restart"]}
                    }
                }
            }"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.event_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.resource_limits.wall_clock_timeout, Duration::from_millis(1500));
        assert!(config.security_policy.allow_network);
        assert_eq!(config.agents["restart"].args, vec!["restart"]);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"orchestrator": {"max_concurrent_tasks": 0}}"#,
        )
        .unwrap();
        assert!(OrchestratorConfig::load(dir.path()).is_err());

        std::fs::write(dir.path().join("config.json"), "not json").unwrap();
        let err = OrchestratorConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config.json"));
    }

    #[test]
    fn test_empty_agent_command_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.agents.insert("x".into(), CommandSpec::new(" "));
        assert!(config.validate().is_err());
    }
}
