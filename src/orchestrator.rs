//! The orchestrator: cell startup, health, shutdown, and re-planning
//!
//! A cell is started as a unit: the orchestrator owns the embedded broker
//! and support services, resolves the agents' dependency graph into strata,
//! deploys each stratum in parallel, and waits for every agent to report
//! `Ready` before the next stratum begins. Shutdown walks the strata in
//! reverse. Health reconciliation restarts failed agents under the cell's
//! retry policy and degrades the cell when the policy is exhausted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::AgentTypeRegistry;
use crate::broker::Broker;
use crate::config::{
    AgentInstanceConfig, CellConfig, ConfigError, InfraConfig, PoolConfig,
};
use crate::deployer::{AgentHandle, DeployError, Deployer};
use crate::events::{CellEvent, control_envelope};
use crate::support::{AgentState, SupportRegistry};

/// Orchestration failures
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("deployment error: {source}")]
    Deploy {
        #[from]
        source: DeployError,
    },

    #[error("agent {agent_id} did not become ready within the startup timeout")]
    StartupTimeout { agent_id: String },

    #[error("agent {agent_id} failed during startup: {reason}")]
    StartupFailed { agent_id: String, reason: String },

    #[error("cell is not running")]
    NotRunning,
}

/// Lifecycle state of the whole cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

/// Drives one cell from configuration to running graph and back
pub struct Orchestrator {
    pool: PoolConfig,
    cell: CellConfig,
    broker: Arc<Broker>,
    support: Arc<SupportRegistry>,
    deployer: Deployer,
    handles: HashMap<String, AgentHandle>,
    strata: Vec<Vec<String>>,
    state: CellState,
    retry_counts: HashMap<String, u32>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Builds an orchestrator for one cell, starting the embedded services
    ///
    /// The configuration is fully validated here; a constructed
    /// orchestrator will not discover config errors mid-startup.
    pub fn new(
        pool: PoolConfig,
        cell: CellConfig,
        infra: InfraConfig,
        registry: Arc<AgentTypeRegistry>,
    ) -> Result<Self, OrchestratorError> {
        pool.validate()?;
        cell.validate(&pool)?;
        let strata = dependency_strata(&cell)?;

        let broker = Arc::new(Broker::default());
        let support = Arc::new(SupportRegistry::new());
        let cancel = CancellationToken::new();
        // Agents heartbeat at twice the check frequency so a healthy agent
        // is never mistaken for a stale one.
        let heartbeat_interval = cell.orchestration.health_check_interval.as_duration() / 2;
        let deployer = Deployer::new(
            cell.id.clone(),
            infra,
            registry,
            Arc::clone(&broker),
            Arc::clone(&support),
            heartbeat_interval,
            cancel.clone(),
        );

        Ok(Self {
            pool,
            cell,
            broker,
            support,
            deployer,
            handles: HashMap::new(),
            strata,
            state: CellState::Idle,
            retry_counts: HashMap::new(),
            cancel,
        })
    }

    /// The embedded broker, for bridge construction and tests
    #[must_use]
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// The embedded support registry
    #[must_use]
    pub fn support(&self) -> Arc<SupportRegistry> {
        Arc::clone(&self.support)
    }

    /// Current cell state
    #[must_use]
    pub fn state(&self) -> CellState {
        self.state
    }

    /// The cell id
    #[must_use]
    pub fn cell_id(&self) -> &str {
        &self.cell.id
    }

    /// The computed startup strata, dependency-first
    #[must_use]
    pub fn strata(&self) -> &[Vec<String>] {
        &self.strata
    }

    /// Starts the cell: deploys every stratum, dependency order first
    ///
    /// On any failure or timeout the already-started agents are torn down
    /// in reverse order and the error is returned.
    #[instrument(name = "cell_start", skip(self), fields(cell_id = %self.cell.id))]
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        info!(cell_id = %self.cell.id, agents = self.cell.agents.len(), "starting cell");
        self.state = CellState::Starting;
        self.publish_cell_event(CellEvent::Starting);

        let startup_timeout = self.cell.orchestration.startup_timeout.as_duration();
        let strata = self.strata.clone();
        for stratum in &strata {
            if let Err(failure) = self.start_stratum(stratum, startup_timeout).await {
                error!(cell_id = %self.cell.id, %failure, "startup failed, tearing down");
                self.teardown().await;
                self.state = CellState::Stopped;
                return Err(failure);
            }
        }

        self.state = CellState::Running;
        self.publish_cell_event(CellEvent::Running);
        info!(cell_id = %self.cell.id, "cell running");
        Ok(())
    }

    /// Deploys one stratum and waits until every member is `Ready`
    async fn start_stratum(
        &mut self,
        stratum: &[String],
        startup_timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        debug!(agents = ?stratum, "starting stratum");
        for agent_id in stratum {
            let handle = self.deploy_agent(agent_id)?;
            self.handles.insert(agent_id.clone(), handle);
        }

        let waits = stratum
            .iter()
            .map(|agent_id| self.wait_ready(agent_id, startup_timeout));
        future::try_join_all(waits).await?;
        Ok(())
    }

    fn deploy_agent(&self, agent_id: &str) -> Result<AgentHandle, OrchestratorError> {
        let instance = self
            .cell
            .agent(agent_id)
            .ok_or_else(|| ConfigError::UnknownDependency {
                agent_id: self.cell.id.clone(),
                dependency: agent_id.to_owned(),
            })?;
        let agent_type = self
            .pool
            .agent_type(&instance.agent_type)
            .ok_or_else(|| ConfigError::UnknownAgentType {
                agent_id: instance.id.clone(),
                type_name: instance.agent_type.clone(),
            })?;
        let effective = self.cell.effective_config(&self.pool, instance);
        Ok(self.deployer.deploy(agent_type, instance, effective)?)
    }

    /// Blocks until the agent reports `Ready`, fails fast on `Error`
    async fn wait_ready(
        &self,
        agent_id: &str,
        startup_timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let mut ready = self.support.subscribe_ready(agent_id).map_err(|e| {
            OrchestratorError::StartupFailed {
                agent_id: agent_id.to_owned(),
                reason: e.to_string(),
            }
        })?;

        let wait = async {
            loop {
                if let Some(status) = self.support.status(agent_id) {
                    if status.state == AgentState::Error {
                        return Err(OrchestratorError::StartupFailed {
                            agent_id: agent_id.to_owned(),
                            reason: status
                                .last_error
                                .unwrap_or_else(|| "unknown error".to_owned()),
                        });
                    }
                }
                if *ready.borrow_and_update() {
                    return Ok(());
                }
                if ready.changed().await.is_err() {
                    return Err(OrchestratorError::StartupFailed {
                        agent_id: agent_id.to_owned(),
                        reason: "support record dropped".to_owned(),
                    });
                }
            }
        };

        match tokio::time::timeout(startup_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::StartupTimeout {
                agent_id: agent_id.to_owned(),
            }),
        }
    }

    /// Runs the health reconciliation loop until the signal fires
    ///
    /// Returns the state the cell ended in (`Running` or `Degraded`).
    pub async fn run(
        &mut self,
        shutdown_signal: CancellationToken,
    ) -> Result<CellState, OrchestratorError> {
        if self.state != CellState::Running {
            return Err(OrchestratorError::NotRunning);
        }
        let interval = self.cell.orchestration.health_check_interval.as_duration();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                () = shutdown_signal.cancelled() => break,
                _ = ticker.tick() => self.reconcile_health(interval).await,
            }
        }
        Ok(self.state)
    }

    /// One health pass: mark stale agents failed, restart per policy
    async fn reconcile_health(&mut self, health_interval: Duration) {
        for agent_id in self.support.stale_agents(health_interval) {
            warn!(agent_id, "heartbeat missing, marking agent failed");
            let _ = self.support.mark_error(&agent_id, "missed heartbeat");
        }

        let failed: Vec<String> = self
            .support
            .list()
            .into_iter()
            .filter(|status| status.state == AgentState::Error)
            .map(|status| status.agent_id)
            .collect();

        for agent_id in failed {
            self.retry_agent(&agent_id).await;
        }
    }

    /// Restarts one failed agent, degrading the cell when retries run out
    async fn retry_agent(&mut self, agent_id: &str) {
        let max_retries = self.cell.orchestration.max_retries.as_u32();
        let attempts = self.retry_counts.get(agent_id).copied().unwrap_or(0);
        if attempts >= max_retries {
            if self.state != CellState::Degraded {
                error!(agent_id, "retry policy exhausted, cell degraded");
                self.publish_cell_event(CellEvent::Error);
                self.publish_cell_event(CellEvent::Degraded);
                self.state = CellState::Degraded;
            }
            return;
        }
        let attempt = attempts + 1;
        self.retry_counts.insert(agent_id.to_owned(), attempt);
        info!(agent_id, attempt, max_retries, "restarting failed agent");

        tokio::time::sleep(self.cell.orchestration.retry_delay.as_duration()).await;

        if let Some(handle) = self.handles.remove(agent_id) {
            handle.abort().await;
        }
        if let Err(restart_error) = self.support.reset(agent_id) {
            warn!(agent_id, %restart_error, "failed to reset agent record");
        }
        match self.deploy_agent(agent_id) {
            Ok(handle) => {
                self.handles.insert(agent_id.to_owned(), handle);
                let timeout = self.cell.orchestration.startup_timeout.as_duration();
                if let Err(restart_error) = self.wait_ready(agent_id, timeout).await {
                    warn!(agent_id, %restart_error, "restarted agent did not become ready");
                } else {
                    self.retry_counts.insert(agent_id.to_owned(), 0);
                }
            }
            Err(restart_error) => {
                warn!(agent_id, %restart_error, "failed to redeploy agent");
            }
        }
    }

    /// Stops the cell: agents in reverse dependency order, then services
    #[instrument(name = "cell_shutdown", skip(self), fields(cell_id = %self.cell.id))]
    pub async fn shutdown(&mut self) {
        if matches!(self.state, CellState::Stopped | CellState::Stopping) {
            return;
        }
        self.state = CellState::Stopping;
        self.publish_cell_event(CellEvent::Stopping);
        info!(cell_id = %self.cell.id, "stopping cell");

        self.teardown().await;

        // Announced before the broker goes away so bridge subscribers can
        // observe it; the broker, then support, are released right after.
        self.publish_cell_event(CellEvent::Stopped);
        self.broker.close();
        self.cancel.cancel();
        self.state = CellState::Stopped;
        info!(cell_id = %self.cell.id, "cell stopped");
    }

    /// Stops every running agent, reverse stratum by reverse stratum
    ///
    /// Each agent gets the cell's shutdown grace to drain before it is
    /// force-stopped.
    async fn teardown(&mut self) {
        let grace = self.cell.orchestration.shutdown_timeout.as_duration();
        let strata = self.strata.clone();
        for stratum in strata.iter().rev() {
            let stops: Vec<_> = stratum
                .iter()
                .filter_map(|agent_id| self.handles.remove(agent_id))
                .map(|handle| handle.stop(grace))
                .collect();
            future::join_all(stops).await;
        }
    }

    /// Applies a changed cell definition to the running cell
    ///
    /// Removed agents stop first (reverse order), then additions deploy in
    /// dependency order, then modified agents restart.
    pub async fn replan(&mut self, new_cell: CellConfig) -> Result<(), OrchestratorError> {
        new_cell.validate(&self.pool)?;
        let new_strata = dependency_strata(&new_cell)?;

        let old_ids: HashSet<String> =
            self.cell.agents.iter().map(|a| a.id.clone()).collect();
        let new_ids: HashSet<String> =
            new_cell.agents.iter().map(|a| a.id.clone()).collect();

        let removed: Vec<String> = self
            .strata
            .iter()
            .rev()
            .flatten()
            .filter(|id| !new_ids.contains(*id))
            .cloned()
            .collect();
        let modified: Vec<String> = new_cell
            .agents
            .iter()
            .filter(|agent| {
                old_ids.contains(&agent.id)
                    && self
                        .cell
                        .agent(&agent.id)
                        .is_some_and(|old| instance_changed(old, agent))
            })
            .map(|agent| agent.id.clone())
            .collect();

        info!(
            cell_id = %self.cell.id,
            removed = removed.len(),
            added = new_ids.difference(&old_ids).count(),
            modified = modified.len(),
            "re-planning cell"
        );

        let grace = self.cell.orchestration.shutdown_timeout.as_duration();
        for agent_id in &removed {
            if let Some(handle) = self.handles.remove(agent_id) {
                handle.stop(grace).await;
            }
            self.support.deregister(agent_id);
        }

        // Additions and restarts run against the new definition.
        self.cell = new_cell;
        self.strata = new_strata;
        let startup_timeout = self.cell.orchestration.startup_timeout.as_duration();

        for stratum in self.strata.clone() {
            for agent_id in &stratum {
                let is_new = !old_ids.contains(agent_id);
                let needs_restart = modified.contains(agent_id);
                if !is_new && !needs_restart {
                    continue;
                }
                if needs_restart {
                    if let Some(handle) = self.handles.remove(agent_id) {
                        handle.stop(grace).await;
                    }
                    let _ = self.support.reset(agent_id);
                }
                let handle = self.deploy_agent(agent_id)?;
                self.handles.insert(agent_id.clone(), handle);
                self.wait_ready(agent_id, startup_timeout).await?;
            }
        }
        Ok(())
    }

    fn publish_cell_event(&self, event: CellEvent) {
        let envelope = control_envelope(
            &event.topic(),
            serde_json::json!({"cell": self.cell.id}),
        );
        if let Err(error) = self.broker.publish(&event.topic(), envelope) {
            debug!(cell_id = %self.cell.id, %error, "failed to publish cell event");
        }
    }
}

/// Whether a redefined instance requires a restart
fn instance_changed(old: &AgentInstanceConfig, new: &AgentInstanceConfig) -> bool {
    old.agent_type != new.agent_type
        || old.ingress != new.ingress
        || old.egress != new.egress
        || old.dependencies != new.dependencies
        || old.config != new.config
        || old.vfs_root != new.vfs_root
}

/// Layers the cell's agents into dependency strata
///
/// Every agent in stratum N depends only on agents in strata `< N`.
/// Rejects unknown references and cycles.
pub fn dependency_strata(cell: &CellConfig) -> Result<Vec<Vec<String>>, ConfigError> {
    let ids: HashSet<&str> = cell.agents.iter().map(|a| a.id.as_str()).collect();
    let mut remaining: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    for agent in &cell.agents {
        for dependency in &agent.dependencies {
            if !ids.contains(dependency.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    agent_id: agent.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        remaining.insert(
            agent.id.clone(),
            agent.dependencies.iter().cloned().collect(),
        );
    }

    let mut strata = Vec::new();
    let mut satisfied: HashSet<String> = HashSet::new();
    while !remaining.is_empty() {
        let stratum: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_subset(&satisfied))
            .map(|(id, _)| id.clone())
            .collect();
        if stratum.is_empty() {
            return Err(ConfigError::CyclicDependency {
                agents: remaining.keys().cloned().collect(),
            });
        }
        for agent_id in &stratum {
            remaining.remove(agent_id);
            satisfied.insert(agent_id.clone());
        }
        strata.push(stratum);
    }
    Ok(strata)
}
