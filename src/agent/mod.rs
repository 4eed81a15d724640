//! Agent framework: the contract every agent implements and the context it
//! runs against
//!
//! An agent is three operations: `init`, `process_message`, `cleanup`.
//! Everything else (registration, config fetch, ingress dispatch, egress
//! publication, dead-lettering, lifecycle reporting) is the framework's
//! job and lives in [`dispatch`]. Agent implementations register
//! constructors in an [`AgentTypeRegistry`] at process start so embedded
//! deployments can instantiate them from pool configuration by type name.

pub mod dispatch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;

use crate::binding::{Binding, render_egress_path};
use crate::broker::{Broker, BrokerError};
use crate::envelope::Envelope;
use crate::support::{AgentState, SupportRegistry};

/// Transport send attempts before the failure is surfaced as an agent error.
const TRANSPORT_RETRY_ATTEMPTS: u32 = 3;
/// Base backoff between transport retries; doubles per attempt.
const TRANSPORT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Agent-level failures
#[derive(Debug, Error)]
pub enum AgentError {
    /// `init` failed; fatal for the agent and aborts cell startup.
    #[error("initialization failed: {reason}")]
    InitFailed { reason: String },

    /// `process_message` failed; non-fatal, the envelope is dead-lettered.
    #[error("processing failed: {reason}")]
    ProcessingFailed { reason: String },

    /// Unrecoverable condition declared by the agent itself.
    #[error("fatal agent error: {reason}")]
    Fatal { reason: String },

    /// Missing or ill-typed configuration value.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// No egress binding is declared but a reply was produced.
    #[error("agent has no egress binding")]
    NoEgress,

    /// Egress is only permitted while the agent is `Running`.
    #[error("egress not permitted in state {state}")]
    EgressNotPermitted { state: AgentState },

    /// Transport failure that survived its bounded retries.
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: BrokerError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl AgentError {
    /// Convenience constructor for a non-fatal processing failure
    #[must_use]
    pub fn processing(reason: impl Into<String>) -> Self {
        Self::ProcessingFailed {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for a fatal failure
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Whether this error should stop the agent rather than dead-letter
    /// the current envelope
    ///
    /// Transport errors count as fatal here: by the time one reaches this
    /// classification the framework has already exhausted its retries, and
    /// the agent surfaces as failed so the orchestrator's retry policy can
    /// take over.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InitFailed { .. }
                | Self::Fatal { .. }
                | Self::Config { .. }
                | Self::Transport { .. }
        )
    }
}

/// The sole interface an agent implements
///
/// The framework guarantees `init` completes before any
/// `process_message` call, that calls are serialized (one dispatch loop
/// per agent), and that `cleanup` runs once after the last message.
#[async_trait]
pub trait Agent: Send {
    /// One-time setup; `Ready` is only reported after this returns `Ok`
    async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError>;

    /// Handles one envelope, optionally producing a reply for the egress
    /// binding
    async fn process_message(
        &mut self,
        envelope: Envelope,
        ctx: &AgentContext,
    ) -> Result<Option<Envelope>, AgentError>;

    /// Releases resources on shutdown; failures are logged, never fatal
    async fn cleanup(&mut self, ctx: &AgentContext) -> Result<(), AgentError>;
}

/// Everything the framework exposes to an agent body
pub struct AgentContext {
    agent_id: String,
    type_name: String,
    cell_id: String,
    vfs_root: PathBuf,
    config: serde_json::Value,
    egress: Option<Binding>,
    broker: Arc<Broker>,
    support: Arc<SupportRegistry>,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        agent_id: String,
        type_name: String,
        cell_id: String,
        vfs_root: PathBuf,
        egress: Option<Binding>,
        broker: Arc<Broker>,
        support: Arc<SupportRegistry>,
    ) -> Self {
        Self {
            agent_id,
            type_name,
            cell_id,
            vfs_root,
            config: serde_json::Value::Null,
            egress,
            broker,
            support,
        }
    }

    pub(crate) fn set_config(&mut self, config: serde_json::Value) {
        self.config = config;
    }

    /// This instance's id
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The agent type this instance was deployed from
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The cell this instance belongs to
    #[must_use]
    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    /// The filesystem prefix this instance should confine itself to
    #[must_use]
    pub fn vfs_root(&self) -> &Path {
        &self.vfs_root
    }

    /// Rewrites a relative path under the VFS root
    ///
    /// Absolute paths are returned unchanged.
    #[must_use]
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.vfs_root.join(path)
        }
    }

    /// The merged configuration fetched from support
    #[must_use]
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// String config value
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(serde_json::Value::as_str)
    }

    /// Unsigned integer config value
    #[must_use]
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Float config value
    #[must_use]
    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Boolean config value
    #[must_use]
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(serde_json::Value::as_bool)
    }

    /// String config value that must be present
    pub fn require_str(&self, key: &str) -> Result<&str, AgentError> {
        self.config_str(key).ok_or_else(|| AgentError::Config {
            reason: format!("missing required config key {key:?}"),
        })
    }

    /// Publishes an envelope on this instance's egress binding
    ///
    /// The envelope's source is rewritten to this agent. Requires the
    /// instance to be `Running`; a non-running agent's egress is rejected.
    /// Transient transport failures are retried with exponential backoff;
    /// a `Transport` error out of here means the retries were exhausted.
    pub async fn publish_egress(&self, mut envelope: Envelope) -> Result<(), AgentError> {
        let state = self
            .support
            .status(&self.agent_id)
            .map(|s| s.state)
            .unwrap_or(AgentState::Stopped);
        if !state.allows_egress() {
            return Err(AgentError::EgressNotPermitted { state });
        }
        envelope.source = self.agent_id.clone();

        match self.egress.as_ref().ok_or(AgentError::NoEgress)? {
            Binding::Publish { topic } => {
                envelope.destination = topic.clone();
                self.send_with_retry(topic, || {
                    self.broker.publish(topic, envelope.clone()).map(|_| ())
                })
                .await?;
            }
            Binding::Pipe { name } => {
                envelope.destination = name.clone();
                self.send_with_retry(name, || self.broker.pipe_send(name, envelope.clone()))
                    .await?;
            }
            Binding::File { pattern } => {
                let path = render_egress_path(pattern, &envelope, &self.vfs_root);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &envelope.payload).await?;
            }
            Binding::Subscribe { .. } => {
                // parse_egress rejects sub: bindings at config load.
                warn!(agent_id = %self.agent_id, "subscribe binding reached egress, dropping");
            }
        }
        Ok(())
    }

    /// Retries a transport send with exponential backoff
    ///
    /// Only transient broker failures are retried; anything else, or a
    /// transient failure that outlives the attempt budget, is returned as
    /// a `Transport` error for the dispatch loop to surface.
    async fn send_with_retry<F>(&self, destination: &str, mut send: F) -> Result<(), AgentError>
    where
        F: FnMut() -> Result<(), BrokerError>,
    {
        let mut delay = TRANSPORT_RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match send() {
                Ok(()) => return Ok(()),
                Err(transport) if transport.is_transient() && attempt < TRANSPORT_RETRY_ATTEMPTS => {
                    warn!(
                        agent_id = %self.agent_id,
                        destination,
                        attempt,
                        %transport,
                        "transport send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(transport) => return Err(AgentError::Transport { source: transport }),
            }
        }
    }
}

/// Constructor for one agent type
pub type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Process-wide registry of embeddable agent constructors
///
/// The deployer consults this registry for `call`-operated types; pool
/// entries whose type name is absent cannot be embedded.
#[derive(Default, Clone)]
pub struct AgentTypeRegistry {
    factories: DashMap<String, AgentFactory>,
}

impl AgentTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under a type name, replacing any previous one
    pub fn register<F>(&self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
    }

    /// Instantiates an agent of the given type
    #[must_use]
    pub fn create(&self, type_name: &str) -> Option<Box<dyn Agent>> {
        self.factories.get(type_name).map(|factory| factory())
    }

    /// Whether a constructor is registered for the type
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// All registered type names, sorted
    #[must_use]
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAgent;

    #[async_trait]
    impl Agent for NullAgent {
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

    fn context(egress: Option<Binding>) -> AgentContext {
        let mut ctx = AgentContext::new(
            "worker-1".into(),
            "worker".into(),
            "cell-1".into(),
            PathBuf::from("/data/cell-1"),
            egress,
            Arc::new(Broker::default()),
            Arc::new(SupportRegistry::new()),
        );
        ctx.set_config(serde_json::json!({
            "name": "demo",
            "batch": 32,
            "ratio": 0.5,
            "enabled": true,
        }));
        ctx
    }

    #[test]
    fn typed_config_getters() {
        let ctx = context(None);
        assert_eq!(ctx.config_str("name"), Some("demo"));
        assert_eq!(ctx.config_u64("batch"), Some(32));
        assert_eq!(ctx.config_f64("ratio"), Some(0.5));
        assert_eq!(ctx.config_bool("enabled"), Some(true));
        assert!(ctx.config_str("missing").is_none());
        assert!(matches!(
            ctx.require_str("missing"),
            Err(AgentError::Config { .. })
        ));
    }

    #[test]
    fn vfs_rewrites_relative_paths_only() {
        let ctx = context(None);
        assert_eq!(
            ctx.resolve_path("out/result.json"),
            PathBuf::from("/data/cell-1/out/result.json")
        );
        assert_eq!(
            ctx.resolve_path("/absolute/kept.json"),
            PathBuf::from("/absolute/kept.json")
        );
    }

    #[tokio::test]
    async fn egress_requires_running_state() {
        let ctx = context(Some(Binding::Publish {
            topic: "data:out".into(),
        }));
        // Never registered, so never Running.
        let env = Envelope::new("x", "data:out", "t", b"p".to_vec());
        assert!(matches!(
            ctx.publish_egress(env).await,
            Err(AgentError::EgressNotPermitted { .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_transport_retries_surface_as_fatal() {
        let broker = Arc::new(Broker::default());
        let support = Arc::new(SupportRegistry::new());
        support.register("worker-1", "worker", &[]);
        support.stage_config("worker-1", serde_json::json!({}));
        support
            .update_state("worker-1", AgentState::Ready)
            .unwrap();
        support
            .update_state("worker-1", AgentState::Running)
            .unwrap();

        let mut ctx = AgentContext::new(
            "worker-1".into(),
            "worker".into(),
            "cell-1".into(),
            PathBuf::from("/tmp"),
            Some(Binding::Publish {
                topic: "data:out".into(),
            }),
            Arc::clone(&broker),
            support,
        );
        ctx.set_config(serde_json::json!({}));

        // A closed broker fails every attempt.
        broker.close();
        let started = std::time::Instant::now();
        let env = Envelope::new("x", "data:out", "t", b"p".to_vec());
        let error = ctx.publish_egress(env).await.unwrap_err();

        assert!(matches!(error, AgentError::Transport { .. }));
        assert!(error.is_fatal());
        // Three attempts with two doubling backoffs in between.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn registry_creates_by_type_name() {
        let registry = AgentTypeRegistry::new();
        registry.register("null", || Box::new(NullAgent));
        assert!(registry.contains("null"));
        assert!(registry.create("null").is_some());
        assert!(registry.create("other").is_none());
        assert_eq!(registry.type_names(), vec!["null".to_string()]);
    }

    #[test]
    fn fatality_classification() {
        assert!(AgentError::fatal("boom").is_fatal());
        assert!(
            AgentError::InitFailed {
                reason: "x".into()
            }
            .is_fatal()
        );
        assert!(
            AgentError::Transport {
                source: BrokerError::BrokerClosed
            }
            .is_fatal()
        );
        assert!(!AgentError::processing("soft").is_fatal());
    }
}
