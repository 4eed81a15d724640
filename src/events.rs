//! Control-topic vocabulary
//!
//! Lifecycle transitions are announced on a family of control topics so
//! host-side consumers (bridge subscribers, test harnesses) can observe a
//! cell without touching its internals. Topic shapes are part of the wire
//! contract: `agent:<id>:<event>` and `cell:<event>`.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Source id used on envelopes the orchestrator emits.
pub const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// Pattern matching every control event of a cell and its agents.
pub const CONTROL_PATTERN_AGENTS: &str = "agent:*";
/// Pattern matching every cell-level control event.
pub const CONTROL_PATTERN_CELL: &str = "cell:*";

/// Agent lifecycle events published on `agent:<id>:<event>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentEvent {
    Registered,
    Ready,
    Running,
    Error,
    Stopped,
}

impl AgentEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Renders the control topic for this event on the given agent
    #[must_use]
    pub fn topic(self, agent_id: &str) -> String {
        format!("agent:{agent_id}:{}", self.as_str())
    }
}

/// Cell lifecycle events published on `cell:<event>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellEvent {
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    /// Emitted when the retry policy is exhausted, ahead of `Degraded`.
    Error,
}

impl CellEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Renders the control topic for this event
    #[must_use]
    pub fn topic(self) -> String {
        format!("cell:{}", self.as_str())
    }
}

/// Dead-letter topic for one agent
#[must_use]
pub fn dlq_topic(agent_id: &str) -> String {
    format!("dlq:{agent_id}")
}

/// Builds a control envelope carrying a small JSON payload
#[must_use]
pub fn control_envelope(topic: &str, payload: serde_json::Value) -> Envelope {
    Envelope::new(
        ORCHESTRATOR_SOURCE,
        topic,
        "lifecycle_event",
        serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec()),
    )
}

/// Builds the envelope an agent publishes for one of its own transitions
#[must_use]
pub fn agent_event_envelope(agent_id: &str, event: AgentEvent) -> Envelope {
    let payload = serde_json::json!({
        "agent_id": agent_id,
        "event": event.as_str(),
    });
    Envelope::new(
        agent_id,
        event.topic(agent_id),
        "lifecycle_event",
        serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec()),
    )
}
