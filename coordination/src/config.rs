//! `ProjectConfig` — the orchestration core's recognized configuration.
//!
//! Loaded from TOML via `ProjectConfig::from_file`; every numeric field
//! has a `Default` matching the spec's stated defaults, mirroring the
//! env-var-backed `Default` impl the teacher uses for its own config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::AgentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    Genesis,
    Evolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: u32,
    #[serde(default)]
    pub test_coverage_target: Option<f32>,
    #[serde(default = "default_max_task_minutes")]
    pub max_task_minutes: u32,
    #[serde(default = "default_qa_max_iterations")]
    pub qa_max_iterations: u32,
    #[serde(default)]
    pub checkpoint_interval_hours: Option<u32>,
}

fn default_max_parallel_agents() -> u32 {
    4
}

fn default_max_task_minutes() -> u32 {
    30
}

fn default_qa_max_iterations() -> u32 {
    50
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            test_coverage_target: None,
            max_task_minutes: default_max_task_minutes(),
            qa_max_iterations: default_qa_max_iterations(),
            checkpoint_interval_hours: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_id: String,
    pub project_path: PathBuf,
    pub mode: OrchestrationMode,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub settings: ProjectSettings,
    #[serde(default = "default_agent_capacity")]
    pub max_agents_by_type: HashMap<String, u32>,
}

fn default_agent_capacity() -> HashMap<String, u32> {
    let mut caps = HashMap::new();
    caps.insert(AgentType::Coder.as_str().to_string(), 4);
    caps.insert(AgentType::Tester.as_str().to_string(), 2);
    caps.insert(AgentType::Reviewer.as_str().to_string(), 2);
    caps.insert(AgentType::Merger.as_str().to_string(), 1);
    caps.insert(AgentType::Planner.as_str().to_string(), 1);
    caps
}

impl ProjectConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading project config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing project config at {}", path.display()))
    }

    pub fn capacity_for(&self, agent_type: AgentType) -> u32 {
        self.max_agents_by_type
            .get(agent_type.as_str())
            .copied()
            .unwrap_or_else(|| match agent_type {
                AgentType::Coder => 4,
                AgentType::Tester => 2,
                AgentType::Reviewer => 2,
                AgentType::Merger => 1,
                AgentType::Planner => 1,
            })
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            project_path: PathBuf::from("."),
            mode: OrchestrationMode::Genesis,
            features: Vec::new(),
            settings: ProjectSettings::default(),
            max_agents_by_type: default_agent_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_spec_defaults() {
        let settings = ProjectSettings::default();
        assert_eq!(settings.max_parallel_agents, 4);
        assert_eq!(settings.qa_max_iterations, 50);
    }

    #[test]
    fn capacity_falls_back_to_role_default() {
        let config = ProjectConfig::default();
        assert_eq!(config.capacity_for(AgentType::Coder), 4);
        assert_eq!(config.capacity_for(AgentType::Merger), 1);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            project_id = "p1"
            project_path = "/tmp/p1"
            mode = "genesis"
        "#;
        let config: ProjectConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.project_id, "p1");
        assert_eq!(config.settings.qa_max_iterations, 50);
    }
}
