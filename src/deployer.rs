//! Strategy-based agent instantiation
//!
//! The deployer turns one declared agent instance into a running thing,
//! according to its type's operator: `call` starts the agent as a task in
//! this process, `spawn` forks the type's binary with the colony
//! environment injected, and `await` registers an expectation with support
//! and waits for the agent to announce itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::dispatch::AgentRunner;
use crate::agent::{AgentError, AgentTypeRegistry};
use crate::binding::{Binding, BindingError};
use crate::broker::Broker;
use crate::config::{AgentInstanceConfig, AgentTypeConfig, InfraConfig, Operator};
use crate::support::SupportRegistry;

/// Deployment failures
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no embedded factory registered for agent type {type_name}")]
    FactoryMissing { type_name: String },

    #[error("failed to spawn {binary}: {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid binding: {source}")]
    InvalidBinding {
        #[from]
        source: BindingError,
    },
}

/// A deployed agent, by strategy
pub enum AgentHandle {
    /// Runs as a task in this process.
    Embedded {
        task: JoinHandle<Result<(), AgentError>>,
        cancel: CancellationToken,
    },
    /// Runs as a child process.
    Spawned { child: Child },
    /// Self-registered from outside; nothing to stop locally.
    External,
}

impl AgentHandle {
    /// Stops the agent, granting `grace` before force-stopping
    ///
    /// Returns `true` when the agent drained within the grace period.
    pub async fn stop(self, grace: Duration) -> bool {
        match self {
            Self::Embedded { mut task, cancel } => {
                cancel.cancel();
                match tokio::time::timeout(grace, &mut task).await {
                    Ok(_) => true,
                    Err(_) => {
                        warn!("embedded agent did not drain in time, aborting");
                        task.abort();
                        false
                    }
                }
            }
            Self::Spawned { mut child } => {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(_) => true,
                    Err(_) => {
                        warn!("spawned agent did not exit in time, killing");
                        let _ = child.kill().await;
                        false
                    }
                }
            }
            Self::External => true,
        }
    }

    /// Force-stops without a grace period
    pub async fn abort(self) {
        match self {
            Self::Embedded { task, cancel } => {
                cancel.cancel();
                task.abort();
            }
            Self::Spawned { mut child } => {
                let _ = child.kill().await;
            }
            Self::External => {}
        }
    }
}

/// Instantiates agents for one cell
pub struct Deployer {
    cell_id: String,
    infra: InfraConfig,
    registry: Arc<AgentTypeRegistry>,
    broker: Arc<Broker>,
    support: Arc<SupportRegistry>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl Deployer {
    #[must_use]
    pub fn new(
        cell_id: String,
        infra: InfraConfig,
        registry: Arc<AgentTypeRegistry>,
        broker: Arc<Broker>,
        support: Arc<SupportRegistry>,
        heartbeat_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cell_id,
            infra,
            registry,
            broker,
            support,
            heartbeat_interval,
            cancel,
        }
    }

    /// Deploys one instance of the given type with its effective config
    pub fn deploy(
        &self,
        agent_type: &AgentTypeConfig,
        instance: &AgentInstanceConfig,
        effective_config: serde_json::Value,
    ) -> Result<AgentHandle, DeployError> {
        self.support.admit(&instance.id, &agent_type.type_name);
        self.support.stage_config(&instance.id, effective_config);
        let vfs_root = self.vfs_root(instance);

        match agent_type.operator {
            Operator::Call => self.deploy_embedded(agent_type, instance, vfs_root),
            Operator::Spawn => self.deploy_spawned(agent_type, instance, &vfs_root),
            Operator::Await => {
                self.support.expect(&instance.id, &agent_type.type_name);
                info!(agent_id = %instance.id, "awaiting external agent");
                Ok(AgentHandle::External)
            }
        }
    }

    /// VFS root for an instance: its override, or the cell's data directory
    #[must_use]
    pub fn vfs_root(&self, instance: &AgentInstanceConfig) -> PathBuf {
        instance
            .vfs_root
            .clone()
            .unwrap_or_else(|| self.infra.data_root.join(&self.cell_id))
    }

    fn deploy_embedded(
        &self,
        agent_type: &AgentTypeConfig,
        instance: &AgentInstanceConfig,
        vfs_root: PathBuf,
    ) -> Result<AgentHandle, DeployError> {
        let agent =
            self.registry
                .create(&agent_type.type_name)
                .ok_or_else(|| DeployError::FactoryMissing {
                    type_name: agent_type.type_name.clone(),
                })?;

        let ingress = instance
            .ingress
            .as_deref()
            .map(Binding::parse_ingress)
            .transpose()?;
        let egress = instance
            .egress
            .as_deref()
            .map(Binding::parse_egress)
            .transpose()?;

        let cancel = self.cancel.child_token();
        let runner = AgentRunner::new(
            agent,
            instance.id.clone(),
            agent_type.type_name.clone(),
            self.cell_id.clone(),
            agent_type.capabilities.clone(),
            vfs_root,
            ingress,
            egress,
            self.heartbeat_interval,
            Arc::clone(&self.broker),
            Arc::clone(&self.support),
            cancel.clone(),
        );
        let task = tokio::spawn(runner.run());
        debug!(agent_id = %instance.id, "embedded agent task started");
        Ok(AgentHandle::Embedded { task, cancel })
    }

    fn deploy_spawned(
        &self,
        agent_type: &AgentTypeConfig,
        instance: &AgentInstanceConfig,
        vfs_root: &std::path::Path,
    ) -> Result<AgentHandle, DeployError> {
        let child = Command::new(&agent_type.binary)
            .env("AGENT_ID", &instance.id)
            .env("AGENT_TYPE", &agent_type.type_name)
            .env("SUPPORT_URL", self.infra.support_url())
            .env("BROKER_URL", self.infra.broker_url())
            .env("DATA_ROOT", vfs_root)
            .env("PROJECT_ID", &self.cell_id)
            .env("DEBUG", if self.infra.debug { "1" } else { "0" })
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeployError::SpawnFailed {
                binary: agent_type.binary.clone(),
                source,
            })?;
        info!(
            agent_id = %instance.id,
            binary = %agent_type.binary,
            pid = child.id(),
            "agent process spawned"
        );
        Ok(AgentHandle::Spawned { child })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentContext};
    use crate::envelope::Envelope;
    use async_trait::async_trait;

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        async fn init(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
            Ok(())
        }

        async fn process_message(
            &mut self,
            _envelope: Envelope,
            _ctx: &AgentContext,
        ) -> Result<Option<Envelope>, AgentError> {
            Ok(None)
        }

        async fn cleanup(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn deployer(registry: Arc<AgentTypeRegistry>) -> Deployer {
        Deployer::new(
            "test-cell".into(),
            InfraConfig::default(),
            registry,
            Arc::new(Broker::default()),
            Arc::new(SupportRegistry::new()),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
    }

    fn agent_type(operator: Operator) -> AgentTypeConfig {
        AgentTypeConfig {
            type_name: "noop".into(),
            binary: "builtin".into(),
            operator,
            capabilities: vec![],
            description: String::new(),
            defaults: serde_json::Value::Null,
        }
    }

    fn instance() -> AgentInstanceConfig {
        AgentInstanceConfig {
            id: "noop-1".into(),
            agent_type: "noop".into(),
            ingress: None,
            egress: None,
            dependencies: vec![],
            config: serde_json::Value::Null,
            requires: vec![],
            vfs_root: None,
        }
    }

    #[tokio::test]
    async fn embedded_deploy_requires_a_factory() {
        let registry = Arc::new(AgentTypeRegistry::new());
        let deployer = deployer(Arc::clone(&registry));
        let result = deployer.deploy(
            &agent_type(Operator::Call),
            &instance(),
            serde_json::json!({}),
        );
        assert!(matches!(result, Err(DeployError::FactoryMissing { .. })));

        registry.register("noop", || Box::new(NoopAgent));
        let handle = deployer
            .deploy(
                &agent_type(Operator::Call),
                &instance(),
                serde_json::json!({}),
            )
            .unwrap();
        assert!(handle.stop(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn await_deploy_registers_an_expectation() {
        let registry = Arc::new(AgentTypeRegistry::new());
        let deployer = deployer(registry);
        let handle = deployer
            .deploy(
                &agent_type(Operator::Await),
                &instance(),
                serde_json::json!({}),
            )
            .unwrap();
        assert!(matches!(handle, AgentHandle::External));
        let status = deployer.support.status("noop-1").unwrap();
        assert!(status.external);
    }

    #[tokio::test]
    async fn spawn_deploy_fails_on_missing_binary() {
        let registry = Arc::new(AgentTypeRegistry::new());
        let deployer = deployer(registry);
        let mut missing = agent_type(Operator::Spawn);
        missing.binary = "/definitely/not/a/binary".into();
        let result = deployer.deploy(&missing, &instance(), serde_json::json!({}));
        assert!(matches!(result, Err(DeployError::SpawnFailed { .. })));
    }

    #[test]
    fn vfs_root_prefers_instance_override() {
        let registry = Arc::new(AgentTypeRegistry::new());
        let deployer = deployer(registry);
        let mut inst = instance();
        assert_eq!(
            deployer.vfs_root(&inst),
            PathBuf::from("./data/test-cell")
        );
        inst.vfs_root = Some(PathBuf::from("/custom/root"));
        assert_eq!(deployer.vfs_root(&inst), PathBuf::from("/custom/root"));
    }
}
