//! Typed configuration for pools, cells, and infrastructure
//!
//! Three recognised YAML shapes feed a deployment: the *pool* declares
//! reusable agent types, *cells* declare concrete agent graphs over those
//! types, and *infra* carries process-level settings. Everything is
//! validated up front; a configuration that loads is a configuration the
//! orchestrator can run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binding::{Binding, BindingError};
use crate::domain_types::{
    HealthCheckIntervalSecs, MaxRetries, RetryDelaySecs, ShutdownTimeoutSecs, StartupTimeoutSecs,
};

/// Configuration loading and validation failures; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate agent type: {type_name}")]
    DuplicateAgentType { type_name: String },

    #[error("duplicate agent id {agent_id} in cell {cell_id}")]
    DuplicateAgentId { cell_id: String, agent_id: String },

    #[error("unknown agent type {type_name} for agent {agent_id}")]
    UnknownAgentType { agent_id: String, type_name: String },

    #[error("agent {agent_id} depends on unknown agent {dependency}")]
    UnknownDependency { agent_id: String, dependency: String },

    #[error("cyclic dependency involving agents: {agents:?}")]
    CyclicDependency { agents: Vec<String> },

    #[error("invalid binding for agent {agent_id}: {source}")]
    InvalidBinding {
        agent_id: String,
        #[source]
        source: BindingError,
    },

    #[error(
        "agent {agent_id} requires capability {capability:?} not offered by its dependencies"
    )]
    MissingCapability { agent_id: String, capability: String },

    #[error("cell {cell_id} not found")]
    UnknownCell { cell_id: String },

    #[error("configuration declares no cells")]
    NoCells,
}

/// Deployment strategy declared per agent type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Run as a task inside the orchestrator's process.
    Call,
    /// Fork the binary as a child process.
    Spawn,
    /// Wait for the agent to register itself; no spawning.
    Await,
}

/// One reusable agent type in the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeConfig {
    /// Unique type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Binary path or symbolic entry resolved by the deployer.
    pub binary: String,
    pub operator: Operator,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Config overlay applied beneath every instance's own config.
    #[serde(default)]
    pub defaults: serde_json::Value,
}

/// The pool: all deployable agent types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub agent_types: Vec<AgentTypeConfig>,
}

impl PoolConfig {
    /// Loads and validates a pool file
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let pool: Self = read_yaml(path)?;
        pool.validate()?;
        Ok(pool)
    }

    /// Checks type-name uniqueness
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for agent_type in &self.agent_types {
            if !seen.insert(agent_type.type_name.as_str()) {
                return Err(ConfigError::DuplicateAgentType {
                    type_name: agent_type.type_name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Looks up a type by name
    #[must_use]
    pub fn agent_type(&self, type_name: &str) -> Option<&AgentTypeConfig> {
        self.agent_types
            .iter()
            .find(|t| t.type_name == type_name)
    }
}

/// Orchestration parameters of one cell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub startup_timeout: StartupTimeoutSecs,
    #[serde(default)]
    pub shutdown_timeout: ShutdownTimeoutSecs,
    #[serde(default)]
    pub max_retries: MaxRetries,
    #[serde(default)]
    pub retry_delay: RetryDelaySecs,
    #[serde(default)]
    pub health_check_interval: HealthCheckIntervalSecs,
}

/// One concrete agent deployment inside a cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstanceConfig {
    /// Instance id, unique within the cell.
    pub id: String,
    pub agent_type: String,
    /// Where messages come from (`file:`/`sub:`/`pipe:`).
    #[serde(default)]
    pub ingress: Option<String>,
    /// Where replies go (`file:`/`pub:`/`pipe:`).
    #[serde(default)]
    pub egress: Option<String>,
    /// Agent ids that must be `Ready` before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Instance overrides merged over the type defaults.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Capabilities this agent requires of its dependencies.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Filesystem prefix override for this instance.
    #[serde(default)]
    pub vfs_root: Option<PathBuf>,
}

/// One cell: the atomic unit of deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub agents: Vec<AgentInstanceConfig>,
}

impl CellConfig {
    /// Validates the cell against the pool: references, bindings,
    /// dependencies, and required capabilities
    pub fn validate(&self, pool: &PoolConfig) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for agent in &self.agents {
            if !ids.insert(agent.id.as_str()) {
                return Err(ConfigError::DuplicateAgentId {
                    cell_id: self.id.clone(),
                    agent_id: agent.id.clone(),
                });
            }
        }

        for agent in &self.agents {
            if pool.agent_type(&agent.agent_type).is_none() {
                return Err(ConfigError::UnknownAgentType {
                    agent_id: agent.id.clone(),
                    type_name: agent.agent_type.clone(),
                });
            }

            if let Some(ingress) = &agent.ingress {
                Binding::parse_ingress(ingress).map_err(|source| ConfigError::InvalidBinding {
                    agent_id: agent.id.clone(),
                    source,
                })?;
            }
            if let Some(egress) = &agent.egress {
                Binding::parse_egress(egress).map_err(|source| ConfigError::InvalidBinding {
                    agent_id: agent.id.clone(),
                    source,
                })?;
            }

            for dependency in &agent.dependencies {
                if !ids.contains(dependency.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        agent_id: agent.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if !agent.requires.is_empty() {
                let mut offered = HashSet::new();
                for dependency in &agent.dependencies {
                    if let Some(dep) = self.agent(dependency) {
                        if let Some(dep_type) = pool.agent_type(&dep.agent_type) {
                            offered.extend(dep_type.capabilities.iter().cloned());
                        }
                    }
                }
                for capability in &agent.requires {
                    if !offered.contains(capability) {
                        return Err(ConfigError::MissingCapability {
                            agent_id: agent.id.clone(),
                            capability: capability.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up an agent instance by id
    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<&AgentInstanceConfig> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// The effective config of one instance: overrides merged over defaults
    #[must_use]
    pub fn effective_config(
        &self,
        pool: &PoolConfig,
        agent: &AgentInstanceConfig,
    ) -> serde_json::Value {
        let defaults = pool
            .agent_type(&agent.agent_type)
            .map(|t| t.defaults.clone())
            .unwrap_or(serde_json::Value::Null);
        deep_merge(defaults, agent.config.clone())
    }
}

/// All declared cells
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellsConfig {
    #[serde(default)]
    pub cells: Vec<CellConfig>,
}

impl CellsConfig {
    /// Loads and validates a cells file against the pool
    pub fn from_path(path: &Path, pool: &PoolConfig) -> Result<Self, ConfigError> {
        let cells: Self = read_yaml(path)?;
        if cells.cells.is_empty() {
            return Err(ConfigError::NoCells);
        }
        for cell in &cells.cells {
            cell.validate(pool)?;
        }
        Ok(cells)
    }

    /// Selects a cell by id, or the only cell when none is named
    pub fn select(&self, cell_id: Option<&str>) -> Result<&CellConfig, ConfigError> {
        match cell_id {
            Some(id) => self
                .cells
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| ConfigError::UnknownCell {
                    cell_id: id.to_owned(),
                }),
            None => self.cells.first().ok_or(ConfigError::NoCells),
        }
    }
}

/// Process-level infrastructure settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default = "default_support_port")]
    pub support_port: u16,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            support_port: default_support_port(),
            broker_port: default_broker_port(),
            debug: false,
            log_level: default_log_level(),
            data_root: default_data_root(),
        }
    }
}

impl InfraConfig {
    /// Loads an infra file
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        read_yaml(path)
    }

    /// Endpoint spawned agents use to reach the support service
    #[must_use]
    pub fn support_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.support_port)
    }

    /// Endpoint spawned agents use to reach the broker
    #[must_use]
    pub fn broker_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.broker_port)
    }
}

fn default_support_port() -> u16 {
    9920
}

fn default_broker_port() -> u16 {
    9921
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_owned(),
        source,
    })
}

/// Merges `overlay` onto `base`, recursing through objects
///
/// Scalars and arrays in the overlay replace the base value wholesale;
/// `Null` overlay entries leave the base untouched.
#[must_use]
pub fn deep_merge(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.remove(&key) {
                    Some(base_value) => {
                        base_map.insert(key, deep_merge(base_value, overlay_value));
                    }
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (Value::Null, overlay) => overlay,
        (_, overlay) => overlay,
    }
}
