//! Support registry: agent records, state tracking, config distribution
//!
//! Support is the cell's source of truth for which agents exist, what state
//! each is in, what capabilities it offers, and what configuration it should
//! run with. It enforces the lifecycle state machine and signals readiness
//! to whoever is waiting on it. Reads heavily outnumber writes, so records
//! live in a concurrent map rather than behind one big lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle state of one agent instance
///
/// Progression is monotonic (`Installed`, `Configured`, `Ready`, `Running`)
/// with `Paused`, `Stopped`, and `Error` reachable as documented on
/// [`AgentState::can_transition`]. Restart is modelled as an explicit
/// [`SupportRegistry::reset`], not a backward transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Installed,
    Configured,
    Ready,
    Running,
    Paused,
    Stopped,
    Error,
}

impl AgentState {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Installed => Some(0),
            Self::Configured => Some(1),
            Self::Ready => Some(2),
            Self::Running => Some(3),
            Self::Paused | Self::Stopped | Self::Error => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal
    ///
    /// Forward progression along the pipeline is always legal, as are
    /// `Running ↔ Paused`, and `Error`/`Stopped` from anywhere. `Stopped`
    /// and `Error` are terminal until an explicit reset.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        if self == to {
            return true;
        }
        match (self, to) {
            (Self::Stopped | Self::Error, _) => false,
            (_, Self::Error | Self::Stopped) => true,
            (Self::Running, Self::Paused) | (Self::Paused, Self::Running) => true,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// Whether egress publication is permitted in this state
    #[must_use]
    pub fn allows_egress(self) -> bool {
        self == Self::Running
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Installed => "installed",
            Self::Configured => "configured",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Support registry failures
#[derive(Debug, Error)]
pub enum SupportError {
    #[error("unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("invalid state transition for {agent_id}: {from} -> {to}")]
    InvalidStateTransition {
        agent_id: String,
        from: AgentState,
        to: AgentState,
    },

    #[error("no configuration staged for {agent_id}")]
    ConfigNotStaged { agent_id: String },
}

/// Public view of one agent record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub type_name: String,
    pub capabilities: Vec<String>,
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Deployed externally: the orchestrator awaits self-registration
    /// instead of spawning.
    pub external: bool,
}

struct AgentRecord {
    status: AgentStatus,
    ready_tx: watch::Sender<bool>,
}

impl AgentRecord {
    fn new(agent_id: &str, type_name: &str, external: bool) -> Self {
        let now = Utc::now();
        let (ready_tx, _) = watch::channel(false);
        Self {
            status: AgentStatus {
                agent_id: agent_id.to_owned(),
                type_name: type_name.to_owned(),
                capabilities: Vec::new(),
                state: AgentState::Installed,
                registered_at: now,
                last_heartbeat: now,
                last_error: None,
                external,
            },
            ready_tx,
        }
    }
}

/// The cell's agent registry and configuration distributor
#[derive(Default)]
pub struct SupportRegistry {
    agents: DashMap<String, AgentRecord>,
    configs: DashMap<String, serde_json::Value>,
}

impl SupportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-creates a record so readiness can be awaited before deployment
    pub fn admit(&self, agent_id: &str, type_name: &str) {
        self.agents
            .entry(agent_id.to_owned())
            .or_insert_with(|| AgentRecord::new(agent_id, type_name, false));
    }

    /// Registers an expectation for an externally deployed agent
    pub fn expect(&self, agent_id: &str, type_name: &str) {
        self.agents
            .entry(agent_id.to_owned())
            .or_insert_with(|| AgentRecord::new(agent_id, type_name, true));
        debug!(agent_id, "awaiting external registration");
    }

    /// Records an agent instance; idempotent
    ///
    /// A repeated registration leaves the record alone and returns its
    /// current state, so restarted agents re-attach instead of colliding.
    pub fn register(&self, agent_id: &str, type_name: &str, capabilities: &[String]) -> AgentState {
        let mut record = self
            .agents
            .entry(agent_id.to_owned())
            .or_insert_with(|| AgentRecord::new(agent_id, type_name, false));
        if record.status.capabilities.is_empty() {
            record.status.capabilities = capabilities.to_vec();
        }
        record.status.last_heartbeat = Utc::now();
        let state = record.status.state;
        info!(agent_id, type_name, state = %state, "agent registered");
        state
    }

    /// Removes an agent record and its staged configuration
    pub fn deregister(&self, agent_id: &str) {
        self.agents.remove(agent_id);
        self.configs.remove(agent_id);
        debug!(agent_id, "agent deregistered");
    }

    /// Stores the merged configuration an agent will fetch at startup
    pub fn stage_config(&self, agent_id: &str, config: serde_json::Value) {
        self.configs.insert(agent_id.to_owned(), config);
    }

    /// Returns the merged config: instance overrides on top of type defaults
    pub fn fetch_config(&self, agent_id: &str) -> Result<serde_json::Value, SupportError> {
        self.configs
            .get(agent_id)
            .map(|c| c.clone())
            .ok_or_else(|| SupportError::ConfigNotStaged {
                agent_id: agent_id.to_owned(),
            })
    }

    /// Applies a lifecycle transition, enforcing the state machine
    pub fn update_state(&self, agent_id: &str, to: AgentState) -> Result<AgentState, SupportError> {
        let mut record = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SupportError::UnknownAgent {
                agent_id: agent_id.to_owned(),
            })?;
        let from = record.status.state;
        if !from.can_transition(to) {
            return Err(SupportError::InvalidStateTransition {
                agent_id: agent_id.to_owned(),
                from,
                to,
            });
        }
        // Ready and Running require a staged configuration.
        if matches!(to, AgentState::Ready | AgentState::Running)
            && !self.configs.contains_key(agent_id)
        {
            return Err(SupportError::ConfigNotStaged {
                agent_id: agent_id.to_owned(),
            });
        }
        record.status.state = to;
        if to == AgentState::Ready {
            let _ = record.ready_tx.send(true);
        }
        debug!(agent_id, from = %from, to = %to, "state transition");
        Ok(to)
    }

    /// Transitions the agent to `Ready`, unblocking dependents
    pub fn signal_ready(&self, agent_id: &str) -> Result<(), SupportError> {
        self.update_state(agent_id, AgentState::Ready)?;
        Ok(())
    }

    /// Marks an agent failed, recording the reason
    pub fn mark_error(&self, agent_id: &str, reason: &str) -> Result<(), SupportError> {
        let mut record = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SupportError::UnknownAgent {
                agent_id: agent_id.to_owned(),
            })?;
        warn!(agent_id, reason, "agent marked as failed");
        record.status.state = AgentState::Error;
        record.status.last_error = Some(reason.to_owned());
        // Wake readiness watchers so a waiting orchestrator fails fast
        // instead of running into its startup timeout.
        let _ = record.ready_tx.send(false);
        Ok(())
    }

    /// Records a non-fatal processing error without a state change
    pub fn record_error(&self, agent_id: &str, reason: &str) {
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            record.status.last_error = Some(reason.to_owned());
        }
    }

    /// Returns an agent to `Installed` ahead of a restart
    pub fn reset(&self, agent_id: &str) -> Result<(), SupportError> {
        let mut record = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SupportError::UnknownAgent {
                agent_id: agent_id.to_owned(),
            })?;
        record.status.state = AgentState::Installed;
        record.status.last_error = None;
        record.status.last_heartbeat = Utc::now();
        let _ = record.ready_tx.send(false);
        Ok(())
    }

    /// Refreshes the liveness timestamp
    pub fn heartbeat(&self, agent_id: &str) -> Result<(), SupportError> {
        let mut record = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SupportError::UnknownAgent {
                agent_id: agent_id.to_owned(),
            })?;
        record.status.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Active agents whose last heartbeat is older than `max_age`
    #[must_use]
    pub fn stale_agents(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.agents
            .iter()
            .filter(|entry| {
                matches!(
                    entry.status.state,
                    AgentState::Ready | AgentState::Running
                ) && entry.status.last_heartbeat < cutoff
            })
            .map(|entry| entry.status.agent_id.clone())
            .collect()
    }

    /// Watch channel that flips to `true` when the agent reaches `Ready`
    pub fn subscribe_ready(&self, agent_id: &str) -> Result<watch::Receiver<bool>, SupportError> {
        self.agents
            .get(agent_id)
            .map(|record| record.ready_tx.subscribe())
            .ok_or_else(|| SupportError::UnknownAgent {
                agent_id: agent_id.to_owned(),
            })
    }

    /// Declared capabilities of an agent, for dependency validation
    #[must_use]
    pub fn capabilities_of(&self, agent_id: &str) -> Option<Vec<String>> {
        self.agents
            .get(agent_id)
            .map(|record| record.status.capabilities.clone())
    }

    /// Snapshot of every record
    #[must_use]
    pub fn list(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<AgentStatus> = self
            .agents
            .iter()
            .map(|entry| entry.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    /// Snapshot of one record
    #[must_use]
    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|record| record.status.clone())
    }
}
