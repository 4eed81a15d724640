//! # Colony: embedded multi-agent cell orchestration
//!
//! Colony deploys a declared graph of cooperating agents, routes messages
//! among them through pattern-based ingress/egress bindings, and manages
//! their lifecycle as one atomic unit: the *cell*.
//!
//! ## Core components
//!
//! - **Envelope** ([`envelope`]): the uniform message wrapper carrying
//!   identity, correlation, tracing, routing history, and payload.
//! - **Chunker** ([`chunker`]): budget-aware splitting of oversized
//!   envelopes into ordered chunk groups, and their reassembly.
//! - **Broker** ([`broker`]): in-process pub/sub topics with wildcard
//!   subscriptions, plus point-to-point pipes.
//! - **Support** ([`support`]): agent registry, lifecycle state machine,
//!   config distribution, readiness signalling, heartbeats.
//! - **Agent framework** ([`agent`]): the `init` / `process_message` /
//!   `cleanup` contract and the dispatch loop behind it.
//! - **Deployer** ([`deployer`]): `call` / `spawn` / `await` deployment
//!   strategies with environment injection.
//! - **Orchestrator** ([`orchestrator`]): dependency-ordered startup,
//!   health reconciliation, reverse-ordered shutdown, re-planning.
//! - **File watcher** ([`watcher`]): poll-based glob ingress with digest
//!   deduplication.
//! - **Event bridge** ([`bridge`]): host-side subscriptions and
//!   publish-and-wait correlation.
//!
//! ## A minimal cell
//!
//! ```no_run
//! use std::sync::Arc;
//! use colony::agent::AgentTypeRegistry;
//! use colony::config::{CellsConfig, InfraConfig, PoolConfig};
//! use colony::orchestrator::Orchestrator;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pool = PoolConfig::from_path("pool.yaml".as_ref())?;
//! let cells = CellsConfig::from_path("cells.yaml".as_ref(), &pool)?;
//! let cell = cells.select(None)?.clone();
//!
//! let registry = Arc::new(AgentTypeRegistry::new());
//! let mut orchestrator = Orchestrator::new(pool, cell, InfraConfig::default(), registry)?;
//! orchestrator.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod binding;
pub mod bridge;
pub mod broker;
pub mod chunker;
pub mod config;
pub mod deployer;
pub mod domain_types;
pub mod envelope;
pub mod events;
pub mod orchestrator;
pub mod support;
pub mod watcher;

pub use agent::{Agent, AgentContext, AgentError, AgentTypeRegistry};
pub use binding::{Binding, BindingError};
pub use bridge::{BridgeError, EventBridge};
pub use broker::{Broker, BrokerError, Subscription, TopicPattern};
pub use chunker::{ChunkError, Chunker, TokenBudget, TokenCounter};
pub use config::{CellConfig, CellsConfig, ConfigError, InfraConfig, PoolConfig};
pub use deployer::{AgentHandle, DeployError, Deployer};
pub use envelope::{Envelope, EnvelopeError, EnvelopeId};
pub use orchestrator::{CellState, Orchestrator, OrchestratorError};
pub use support::{AgentState, SupportRegistry};
pub use watcher::FileWatcher;
