//! Host-side event bridge
//!
//! Exposes broker topics to non-agent consumers: the orchestrator's
//! controller, test harnesses, embedding applications. Also provides the
//! synchronous request/response convenience `publish_and_wait`, correlating
//! replies by envelope id.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::broker::{Broker, BrokerError, Subscription};
use crate::envelope::Envelope;

/// Source id stamped on envelopes the bridge originates.
pub const BRIDGE_SOURCE: &str = "bridge";

/// Bridge failures
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no reply on {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: BrokerError,
    },
}

/// A host-side window onto a cell's broker
#[derive(Clone)]
pub struct EventBridge {
    broker: Arc<Broker>,
}

impl EventBridge {
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Subscribes the host to a topic pattern
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        self.broker.subscribe(pattern)
    }

    /// Publishes an envelope from the host side
    pub fn publish(&self, topic: &str, envelope: Envelope) -> Result<usize, BrokerError> {
        self.broker.publish(topic, envelope)
    }

    /// Publishes a request and blocks until its correlated reply arrives
    ///
    /// The response subscription is created before the request is published
    /// so the reply cannot be missed. Replies whose `correlation_id` does
    /// not match the request id are ignored. The temporary subscription is
    /// dropped on return, timeout included.
    pub async fn publish_and_wait(
        &self,
        request_topic: &str,
        response_topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Envelope, BridgeError> {
        let mut responses = self.broker.subscribe(response_topic)?;
        let request = Envelope::new(BRIDGE_SOURCE, request_topic, "request", payload);
        let request_id = request.id;
        self.broker.publish(request_topic, request)?;

        let wait = async {
            while let Some(reply) = responses.recv().await {
                if reply.correlation_id == Some(request_id) {
                    return Some(reply);
                }
                debug!(
                    reply_id = %reply.id,
                    "ignoring uncorrelated reply on response topic"
                );
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => Err(BridgeError::Timeout {
                topic: response_topic.to_owned(),
                timeout,
            }),
        }
    }
}
