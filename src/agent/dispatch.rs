//! The agent dispatch loop
//!
//! One [`AgentRunner`] drives one agent instance: it registers with
//! support, fetches config, runs `init`, reports `Ready`, then loops on
//! the ingress source until cancelled. Errors never escape
//! `process_message` raw: they are logged, reported to support, and the
//! offending envelope is surfaced on the agent's dead-letter topic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{Agent, AgentContext, AgentError};
use crate::binding::Binding;
use crate::broker::{Broker, PipeReceiver, Subscription};
use crate::envelope::{ERROR_MESSAGE_HEADER, ERROR_STAGE_HEADER, Envelope};
use crate::events::{AgentEvent, agent_event_envelope, dlq_topic};
use crate::support::{AgentState, SupportRegistry};
use crate::watcher::{FileWatcher, PostDispatch};

/// Default file-watch poll interval when the agent config does not set one.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Where the dispatch loop draws messages from
enum IngressSource {
    Subscription(Subscription),
    Pipe(PipeReceiver),
    File {
        events: mpsc::Receiver<Envelope>,
        poller: JoinHandle<()>,
        poller_cancel: CancellationToken,
    },
    /// No ingress declared: the agent idles until shutdown.
    Idle,
}

impl IngressSource {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Envelope> {
        match self {
            Self::Subscription(subscription) => tokio::select! {
                () = cancel.cancelled() => None,
                envelope = subscription.recv() => envelope,
            },
            Self::Pipe(receiver) => receiver.recv(cancel).await,
            Self::File { events, .. } => tokio::select! {
                () = cancel.cancelled() => None,
                envelope = events.recv() => envelope,
            },
            Self::Idle => {
                cancel.cancelled().await;
                None
            }
        }
    }

    async fn stop(self) {
        if let Self::File {
            poller,
            poller_cancel,
            ..
        } = self
        {
            poller_cancel.cancel();
            let _ = poller.await;
        }
    }
}

/// Drives one agent instance through its whole lifecycle
pub struct AgentRunner {
    agent: Box<dyn Agent>,
    ctx: AgentContext,
    agent_id: String,
    type_name: String,
    capabilities: Vec<String>,
    ingress: Option<Binding>,
    heartbeat_interval: Duration,
    broker: Arc<Broker>,
    support: Arc<SupportRegistry>,
    cancel: CancellationToken,
}

impl AgentRunner {
    /// Assembles a runner for an embedded agent instance
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        agent: Box<dyn Agent>,
        agent_id: String,
        type_name: String,
        cell_id: String,
        capabilities: Vec<String>,
        vfs_root: PathBuf,
        ingress: Option<Binding>,
        egress: Option<Binding>,
        heartbeat_interval: Duration,
        broker: Arc<Broker>,
        support: Arc<SupportRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = AgentContext::new(
            agent_id.clone(),
            type_name.clone(),
            cell_id,
            vfs_root,
            egress,
            Arc::clone(&broker),
            Arc::clone(&support),
        );
        Self {
            agent,
            ctx,
            agent_id,
            type_name,
            capabilities,
            ingress,
            heartbeat_interval,
            broker,
            support,
            cancel,
        }
    }

    /// Runs the agent to completion
    ///
    /// Returns `Err` only for fatal conditions (`init` failure or an error
    /// the agent declared fatal); a cancelled runner exits cleanly.
    #[instrument(name = "agent_run", skip(self), fields(agent_id = %self.agent_id))]
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.support
            .register(&self.agent_id, &self.type_name, &self.capabilities);
        self.publish_event(AgentEvent::Registered);

        let config = self
            .support
            .fetch_config(&self.agent_id)
            .map_err(|e| AgentError::InitFailed {
                reason: e.to_string(),
            })?;
        self.ctx.set_config(config);
        self.update_state(AgentState::Configured);

        if let Err(init_error) = self.agent.init(&self.ctx).await {
            let reason = format!("init failed: {init_error}");
            let _ = self.support.mark_error(&self.agent_id, &reason);
            self.publish_event(AgentEvent::Error);
            error!(agent_id = %self.agent_id, %init_error, "agent init failed");
            return Err(AgentError::InitFailed { reason });
        }

        // The ingress opens before `Ready` goes out: an agent that has
        // announced readiness must not miss messages published right after.
        let mut source = match self.open_ingress() {
            Ok(source) => source,
            Err(open_error) => {
                let _ = self
                    .support
                    .mark_error(&self.agent_id, &open_error.to_string());
                self.publish_event(AgentEvent::Error);
                error!(agent_id = %self.agent_id, %open_error, "failed to open ingress");
                return Err(open_error);
            }
        };

        if self.support.signal_ready(&self.agent_id).is_ok() {
            self.publish_event(AgentEvent::Ready);
            info!(agent_id = %self.agent_id, "agent ready");
        }
        self.update_state(AgentState::Running);
        self.publish_event(AgentEvent::Running);

        let run_result = self.dispatch_loop(&mut source).await;

        // Shutdown: the ingress is stopped before cleanup begins, so the
        // agent cannot observe a message after cleanup has started.
        source.stop().await;
        if let Err(cleanup_error) = self.agent.cleanup(&self.ctx).await {
            warn!(agent_id = %self.agent_id, %cleanup_error, "cleanup failed");
        }

        match &run_result {
            Ok(()) => {
                self.update_state(AgentState::Stopped);
                self.publish_event(AgentEvent::Stopped);
                // Unregister only on a clean stop; a failed agent's record
                // stays in `Error` so health reconciliation can retry it.
                self.support.deregister(&self.agent_id);
                info!(agent_id = %self.agent_id, "agent stopped");
            }
            Err(fatal) => {
                let _ = self.support.mark_error(&self.agent_id, &fatal.to_string());
                self.publish_event(AgentEvent::Error);
            }
        }
        run_result
    }

    /// Waits on ingress, dispatching one envelope at a time
    ///
    /// An envelope in flight when cancellation arrives is drained before
    /// the loop exits.
    async fn dispatch_loop(&mut self, source: &mut IngressSource) -> Result<(), AgentError> {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let _ = self.support.heartbeat(&self.agent_id);
                }
                envelope = source.next(&cancel) => {
                    let Some(envelope) = envelope else {
                        debug!(agent_id = %self.agent_id, "ingress closed, draining");
                        return Ok(());
                    };
                    self.handle_envelope(envelope).await?;
                }
            }
        }
    }

    async fn handle_envelope(&mut self, mut envelope: Envelope) -> Result<(), AgentError> {
        if let Err(invalid) = envelope.validate() {
            warn!(agent_id = %self.agent_id, %invalid, "dropping invalid envelope");
            self.dead_letter(&envelope, "validate", &invalid.to_string());
            return Ok(());
        }

        // Hop recording happens on this private copy before any forwarding.
        envelope.add_hop(&self.agent_id);

        match self.agent.process_message(envelope.clone(), &self.ctx).await {
            Ok(Some(reply)) => {
                match self.ctx.publish_egress(reply).await {
                    Ok(()) => Ok(()),
                    Err(egress_error) => {
                        warn!(agent_id = %self.agent_id, %egress_error, "egress failed");
                        self.support
                            .record_error(&self.agent_id, &egress_error.to_string());
                        self.dead_letter(&envelope, "egress", &egress_error.to_string());
                        if egress_error.is_fatal() {
                            // Transport retries are exhausted by now; stop so
                            // the orchestrator can apply its retry policy.
                            error!(
                                agent_id = %self.agent_id,
                                "egress transport exhausted, stopping agent"
                            );
                            Err(egress_error)
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            Ok(None) => Ok(()),
            Err(processing_error) if processing_error.is_fatal() => {
                error!(
                    agent_id = %self.agent_id,
                    %processing_error,
                    "fatal error, stopping agent"
                );
                self.dead_letter(&envelope, "process", &processing_error.to_string());
                Err(processing_error)
            }
            Err(processing_error) => {
                warn!(agent_id = %self.agent_id, %processing_error, "processing failed");
                self.support
                    .record_error(&self.agent_id, &processing_error.to_string());
                self.dead_letter(&envelope, "process", &processing_error.to_string());
                Ok(())
            }
        }
    }

    /// Publishes the failed envelope on `dlq:<agent_id>`
    ///
    /// The payload is the original envelope; its route (hop already
    /// recorded) is mirrored onto the dead-letter envelope.
    fn dead_letter(&self, original: &Envelope, stage: &str, reason: &str) {
        let topic = dlq_topic(&self.agent_id);
        let payload = match serde_json::to_vec(original) {
            Ok(payload) => payload,
            Err(error) => {
                error!(agent_id = %self.agent_id, %error, "failed to encode dead letter");
                return;
            }
        };
        let mut dead = Envelope::new(
            self.agent_id.clone(),
            topic.clone(),
            "dead_letter",
            payload,
        )
        .with_header(ERROR_MESSAGE_HEADER, reason)
        .with_header(ERROR_STAGE_HEADER, stage);
        dead.correlation_id = Some(original.id);
        dead.route = original.route.clone();
        dead.hop_count = original.hop_count;

        if let Err(error) = self.broker.publish(&topic, dead) {
            warn!(agent_id = %self.agent_id, %error, "failed to publish dead letter");
        }
    }

    fn open_ingress(&self) -> Result<IngressSource, AgentError> {
        let Some(binding) = &self.ingress else {
            return Ok(IngressSource::Idle);
        };
        match binding {
            Binding::Subscribe { pattern } => {
                let subscription = self.broker.subscribe(pattern)?;
                Ok(IngressSource::Subscription(subscription))
            }
            Binding::Pipe { name } => {
                let receiver = self.broker.open_pipe(name)?;
                Ok(IngressSource::Pipe(receiver))
            }
            Binding::File { pattern } => {
                let resolved = self
                    .ctx
                    .resolve_path(pattern)
                    .display()
                    .to_string();
                let poll_interval = self
                    .ctx
                    .config_f64("poll_interval")
                    .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs_f64);
                let mut watcher =
                    FileWatcher::new(self.agent_id.clone(), resolved, poll_interval);
                match self.ctx.config_str("after_dispatch") {
                    Some("delete") => {
                        watcher = watcher.with_post_dispatch(PostDispatch::Delete);
                    }
                    Some("move") => {
                        if let Some(target) = self.ctx.config_str("move_to") {
                            let target = self.ctx.resolve_path(target);
                            watcher = watcher.with_post_dispatch(PostDispatch::MoveTo(target));
                        }
                    }
                    _ => {}
                }
                let poller_cancel = self.cancel.child_token();
                let (events, poller) = watcher.spawn(poller_cancel.clone());
                Ok(IngressSource::File {
                    events,
                    poller,
                    poller_cancel,
                })
            }
            Binding::Publish { .. } => {
                // parse_ingress rejects pub: bindings at config load.
                Err(AgentError::Config {
                    reason: "publish binding cannot be an ingress source".into(),
                })
            }
        }
    }

    fn update_state(&self, state: AgentState) {
        if let Err(error) = self.support.update_state(&self.agent_id, state) {
            warn!(agent_id = %self.agent_id, %error, "state update rejected");
        }
    }

    fn publish_event(&self, event: AgentEvent) {
        let envelope = agent_event_envelope(&self.agent_id, event);
        let topic = event.topic(&self.agent_id);
        if let Err(error) = self.broker.publish(&topic, envelope) {
            debug!(agent_id = %self.agent_id, %error, "failed to publish lifecycle event");
        }
    }
}
