//! The envelope: colony's uniform message wrapper
//!
//! Every message that crosses a broker topic, a pipe, or a file binding is
//! wrapped in an [`Envelope`] carrying identity, correlation, tracing,
//! routing history, and an opaque payload. Envelopes are treated as values:
//! once published they are never mutated; hop recording, replies, and
//! chunking all produce new envelopes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain_types::MessagePriority;

/// Header shared by every chunk of one split envelope (the group id).
pub const CHUNK_ID_HEADER: &str = "X-Chunk-ID";
/// Header carrying a chunk's 0-based position within its group.
pub const CHUNK_INDEX_HEADER: &str = "X-Chunk-Index";
/// Header carrying the declared total number of chunks in the group.
pub const CHUNK_TOTAL_HEADER: &str = "X-Chunk-Total";
/// Header carrying the id of the envelope a chunk group reconstructs.
pub const ORIGINAL_ID_HEADER: &str = "X-Original-ID";
/// Header attached to dead-lettered envelopes describing the failure.
pub const ERROR_MESSAGE_HEADER: &str = "X-Error-Message";
/// Header attached to dead-lettered envelopes naming the failing stage.
pub const ERROR_STAGE_HEADER: &str = "X-Error-Stage";

/// Message type emitted by the file ingress watcher.
pub const FILE_EVENT_MESSAGE_TYPE: &str = "file_event";

/// Unique identifier for an envelope
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Creates a new random envelope ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses an envelope ID from its string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self::new(Uuid::parse_str(s)?))
    }
}

/// Distributed trace identifier, shared along a request chain
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TraceId(Uuid);

impl TraceId {
    /// Creates a new random trace ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Span identifier, fresh per processing step within a trace
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct SpanId(Uuid);

impl SpanId {
    /// Creates a new random span ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Envelope validation and serialization errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// The unit of transport between agents
///
/// `headers` and `properties` use ordered maps so that serialization is
/// deterministic: serializing the same envelope twice yields identical
/// bytes, and correlation-based tests are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id, assigned on creation.
    pub id: EnvelopeId,
    /// Links a reply (or a chunk) to the envelope it answers.
    pub correlation_id: Option<EnvelopeId>,
    /// Distributed trace this envelope participates in.
    pub trace_id: Option<TraceId>,
    /// Processing span within the trace, fresh per step.
    pub span_id: Option<SpanId>,
    /// Producing agent id.
    pub source: String,
    /// Topic, pipe name, or agent id this envelope is addressed to.
    pub destination: String,
    /// Semantic tag describing the payload.
    pub message_type: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Seconds until expiry; 0 means no expiry.
    pub ttl_seconds: u64,
    /// Ordering hint within a stream of envelopes from one source.
    pub sequence: u64,
    /// Opaque payload bytes; JSON-encoded content is the conventional form.
    pub payload: Vec<u8>,
    /// String metadata, deterministically ordered by key.
    pub headers: BTreeMap<String, String>,
    /// Structured metadata, deterministically ordered by key.
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Ordered list of agent ids that have processed this envelope.
    pub route: Vec<String>,
    /// Length of `route`; kept in lockstep by [`Envelope::add_hop`].
    pub hop_count: usize,
    /// Advisory priority, 0 lowest through 9 highest.
    pub priority: MessagePriority,
    /// Hint that the envelope should survive a broker restart.
    pub persistent: bool,
}

impl Envelope {
    /// Creates a new envelope with a generated id and current timestamp
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        message_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: EnvelopeId::generate(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            source: source.into(),
            destination: destination.into(),
            message_type: message_type.into(),
            timestamp: Utc::now(),
            ttl_seconds: 0,
            sequence: 0,
            payload,
            headers: BTreeMap::new(),
            properties: BTreeMap::new(),
            route: Vec::new(),
            hop_count: 0,
            priority: MessagePriority::default(),
            persistent: false,
        }
    }

    /// Builds a reply to this envelope
    ///
    /// The reply is addressed back to this envelope's source, correlated by
    /// this envelope's id, and continues the same trace under a fresh span.
    #[must_use]
    pub fn reply(&self, source: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut reply = Self::new(source, self.source.clone(), self.message_type.clone(), payload);
        reply.correlation_id = Some(self.id);
        reply.trace_id = self.trace_id;
        reply.span_id = Some(SpanId::generate());
        reply
    }

    /// Records a processing hop
    ///
    /// Appends to the route and increments the hop count atomically. Only
    /// ever called on a private, single-owner instance before publication.
    pub fn add_hop(&mut self, agent_id: impl Into<String>) {
        self.route.push(agent_id.into());
        self.hop_count = self.route.len();
    }

    /// Whether this envelope's TTL has elapsed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock, for deterministic tests
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        now > self.timestamp + chrono::Duration::seconds(self.ttl_seconds as i64)
    }

    /// Checks that all required fields are present
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.source.is_empty() {
            return Err(EnvelopeError::MissingField { field: "source" });
        }
        if self.destination.is_empty() {
            return Err(EnvelopeError::MissingField {
                field: "destination",
            });
        }
        if self.message_type.is_empty() {
            return Err(EnvelopeError::MissingField {
                field: "message_type",
            });
        }
        if self.payload.is_empty() {
            return Err(EnvelopeError::MissingField { field: "payload" });
        }
        Ok(())
    }

    /// Byte length of the serialized form
    pub fn serialized_size(&self) -> Result<usize, EnvelopeError> {
        Ok(serde_json::to_vec(self)?.len())
    }

    /// Sets a header, returning self for chaining
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets a property, returning self for chaining
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Sets the TTL, returning self for chaining
    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Sets the priority, returning self for chaining
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// The chunk group id, if this envelope is a chunk
    #[must_use]
    pub fn chunk_group(&self) -> Option<&str> {
        self.headers.get(CHUNK_ID_HEADER).map(String::as_str)
    }

    /// The chunk index, if this envelope is a chunk with a well-formed index
    #[must_use]
    pub fn chunk_index(&self) -> Option<usize> {
        self.headers.get(CHUNK_INDEX_HEADER)?.parse().ok()
    }

    /// The declared chunk total, if well-formed
    #[must_use]
    pub fn chunk_total(&self) -> Option<usize> {
        self.headers.get(CHUNK_TOTAL_HEADER)?.parse().ok()
    }

    /// Whether this envelope carries chunk headers
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        self.headers.contains_key(CHUNK_ID_HEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new("source-agent", "topic:events", "test", b"hello".to_vec())
    }

    #[test]
    fn hop_count_tracks_route_length() {
        let mut env = envelope();
        assert_eq!(env.hop_count, 0);
        env.add_hop("a");
        env.add_hop("b");
        env.add_hop("c");
        assert_eq!(env.route, vec!["a", "b", "c"]);
        assert_eq!(env.hop_count, env.route.len());
    }

    #[test]
    fn reply_correlates_and_reverses_direction() {
        let mut request = envelope();
        request.trace_id = Some(TraceId::generate());
        request.span_id = Some(SpanId::generate());

        let reply = request.reply("responder", b"world".to_vec());
        assert_eq!(reply.destination, "source-agent");
        assert_eq!(reply.source, "responder");
        assert_eq!(reply.correlation_id, Some(request.id));
        assert_eq!(reply.trace_id, request.trace_id);
        assert_ne!(reply.span_id, request.span_id);
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn ttl_zero_never_expires() {
        let env = envelope();
        let far_future = Utc::now() + chrono::Duration::days(365);
        assert!(!env.is_expired_at(far_future));
    }

    #[test]
    fn ttl_expiry_is_computed_from_timestamp() {
        let env = envelope().with_ttl(1);
        assert!(!env.is_expired());
        let late = env.timestamp + chrono::Duration::seconds(2);
        assert!(env.is_expired_at(late));
    }

    #[test]
    fn validate_rejects_missing_required_fields() {
        let mut env = envelope();
        assert!(env.validate().is_ok());
        env.source = String::new();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MissingField { field: "source" })
        ));

        let mut env = envelope();
        env.payload.clear();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MissingField { field: "payload" })
        ));
    }

    #[test]
    fn serialization_is_deterministic() {
        let env = envelope()
            .with_header("Zeta", "1")
            .with_header("Alpha", "2")
            .with_property("key", serde_json::json!({"nested": true}));
        let first = serde_json::to_vec(&env).unwrap();
        let second = serde_json::to_vec(&env).unwrap();
        assert_eq!(first, second);

        let round_tripped: Envelope = serde_json::from_slice(&first).unwrap();
        assert_eq!(round_tripped, env);
    }

    #[test]
    fn clone_is_deep() {
        let mut original = envelope().with_header("k", "v");
        original.add_hop("hop1");
        let copy = original.clone();

        original.add_hop("hop2");
        original.headers.insert("k2".into(), "v2".into());
        original.payload.push(b'!');

        assert_eq!(copy.route, vec!["hop1"]);
        assert_eq!(copy.hop_count, 1);
        assert!(!copy.headers.contains_key("k2"));
        assert_eq!(copy.payload, b"hello");
    }

    #[test]
    fn chunk_header_accessors_parse_decimal_indices() {
        let env = envelope()
            .with_header(CHUNK_ID_HEADER, "group-1")
            .with_header(CHUNK_INDEX_HEADER, "3")
            .with_header(CHUNK_TOTAL_HEADER, "5");
        assert!(env.is_chunk());
        assert_eq!(env.chunk_group(), Some("group-1"));
        assert_eq!(env.chunk_index(), Some(3));
        assert_eq!(env.chunk_total(), Some(5));
        assert!(!envelope().is_chunk());
    }
}
