//! Budget-aware envelope chunking and reassembly
//!
//! Some downstream consumers impose a context budget (model contexts,
//! transport frame limits). The chunker splits an oversized envelope into an
//! ordered group of chunk-envelopes that fit the budget, and merges a
//! complete group back into the original envelope. Chunks correlate to
//! their original through the `X-Chunk-*` headers, so reassembly needs no
//! coordination beyond collecting siblings.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{
    CHUNK_ID_HEADER, CHUNK_INDEX_HEADER, CHUNK_TOTAL_HEADER, Envelope, EnvelopeId,
    ORIGINAL_ID_HEADER, SpanId,
};

/// Fixed token overhead assumed for envelope framing before per-item costs.
const HEADER_BASE_TOKENS: usize = 50;
/// Conservative token estimate per header entry.
const TOKENS_PER_HEADER: usize = 10;
/// Conservative token estimate per property entry.
const TOKENS_PER_PROPERTY: usize = 15;
/// Conservative token estimate per route hop.
const TOKENS_PER_HOP: usize = 10;

/// Chunks smaller than this are not worth the framing overhead.
const MIN_CHUNK_BYTES: usize = 100;
/// How far from the target cut a whitespace boundary is searched for.
const WHITESPACE_WINDOW: usize = 100;

/// Chunking and reassembly failures
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("empty chunk group")]
    EmptyChunkGroup,

    #[error("mismatched chunk groups: expected {expected}, found {found}")]
    MismatchedChunkGroups { expected: String, found: String },

    #[error("missing chunks: expected {expected}, found {actual}")]
    MissingChunks { expected: usize, actual: usize },

    #[error("invalid chunk header {header}: {value:?}")]
    InvalidChunkHeader {
        header: &'static str,
        value: String,
    },

    #[error("budget leaves no room for payload: {available} tokens available per chunk")]
    BudgetTooSmall { available: i64 },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Token budget a consumer imposes on a single envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// Total context window of the consumer.
    pub max_context: usize,
    /// Tokens the consumer reserves for its own output.
    pub max_output: usize,
    /// Safety margin withheld from the window.
    pub reserve: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_context: 128_000,
            max_output: 4_096,
            reserve: 1_024,
        }
    }
}

impl TokenBudget {
    /// Tokens available for an envelope after output and reserve are held back
    #[must_use]
    pub fn input_window(&self) -> i64 {
        self.max_context as i64 - (self.max_output as i64 + self.reserve as i64)
    }
}

/// Estimates token cost of opaque bytes
///
/// The counter is injected so hosts with a real tokenizer can supply exact
/// counts; the default is the common bytes/4 heuristic.
pub trait TokenCounter: Send + Sync {
    /// Estimated token count of the given bytes
    fn count_tokens(&self, bytes: &[u8]) -> usize;
}

/// Default bytes/4 token estimate
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, bytes: &[u8]) -> usize {
        bytes.len().div_ceil(4).max(1)
    }
}

/// Token cost breakdown for one envelope against a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    /// Tokens attributed to the payload bytes.
    pub payload_tokens: usize,
    /// Tokens attributed to headers, properties, and route metadata.
    pub header_tokens: usize,
}

impl TokenEstimate {
    /// Total estimated tokens
    #[must_use]
    pub fn total(&self) -> usize {
        self.payload_tokens + self.header_tokens
    }
}

/// Splits oversized envelopes and merges chunk groups
#[derive(Clone)]
pub struct Chunker {
    counter: Arc<dyn TokenCounter>,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicTokenCounter))
    }
}

impl Chunker {
    /// Creates a chunker over the given token counter
    #[must_use]
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    /// Token cost estimate for an envelope
    #[must_use]
    pub fn estimate(&self, envelope: &Envelope) -> TokenEstimate {
        let header_tokens = HEADER_BASE_TOKENS
            + envelope.headers.len() * TOKENS_PER_HEADER
            + envelope.properties.len() * TOKENS_PER_PROPERTY
            + envelope.route.len() * TOKENS_PER_HOP;
        TokenEstimate {
            payload_tokens: self.counter.count_tokens(&envelope.payload),
            header_tokens,
        }
    }

    /// Whether the envelope exceeds the budget and must be split
    #[must_use]
    pub fn needs_split(&self, envelope: &Envelope, budget: &TokenBudget) -> bool {
        self.estimate(envelope).total() as i64 > budget.input_window()
    }

    /// Number of chunks a split should produce, minimum 2
    pub fn suggested_chunk_count(
        &self,
        envelope: &Envelope,
        budget: &TokenBudget,
    ) -> Result<usize, ChunkError> {
        let estimate = self.estimate(envelope);
        let available = budget.input_window() - estimate.header_tokens as i64;
        if available <= 0 {
            return Err(ChunkError::BudgetTooSmall { available });
        }
        let count = estimate.payload_tokens.div_ceil(available as usize);
        Ok(count.max(2))
    }

    /// Splits the envelope if the budget requires it
    ///
    /// Returns the envelope untouched (as a single-element vec) when it
    /// already fits.
    pub fn split(
        &self,
        envelope: Envelope,
        budget: &TokenBudget,
    ) -> Result<Vec<Envelope>, ChunkError> {
        if !self.needs_split(&envelope, budget) {
            return Ok(vec![envelope]);
        }
        let count = self.suggested_chunk_count(&envelope, budget)?;
        self.split_into(envelope, count)
    }

    /// Splits the envelope into exactly `count` ordered chunk-envelopes
    ///
    /// JSON-array payloads are partitioned element-wise with order
    /// preserved; other payloads are cut into near-equal byte ranges,
    /// preferring whitespace boundaries. The requested count is clamped so
    /// no chunk drops below the minimum chunk size.
    pub fn split_into(&self, envelope: Envelope, count: usize) -> Result<Vec<Envelope>, ChunkError> {
        if count <= 1 {
            return Ok(vec![envelope]);
        }
        let count = clamp_chunk_count(count, envelope.payload.len());
        if count <= 1 {
            return Ok(vec![envelope]);
        }

        let payloads = match parse_json_array(&envelope.payload) {
            Some(elements) => split_json_array(elements, count)?,
            None => split_bytes(&envelope.payload, count),
        };

        let group_id = Uuid::new_v4().to_string();
        let total = payloads.len();
        debug!(
            original_id = %envelope.id,
            chunks = total,
            group_id = %group_id,
            "splitting envelope"
        );

        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| chunk_envelope(&envelope, &group_id, index, total, payload))
            .collect())
    }

    /// Reassembles a complete chunk group into the original envelope
    ///
    /// Requires all chunks of one group: same `X-Chunk-ID`, same
    /// `X-Original-ID`, and distinct indices covering `0..total`.
    /// Reassembly is order-independent; the output is deterministic by
    /// chunk index.
    pub fn merge(&self, mut chunks: Vec<Envelope>) -> Result<Envelope, ChunkError> {
        let first = chunks.first().ok_or(ChunkError::EmptyChunkGroup)?;
        let group_id = require_header(first, CHUNK_ID_HEADER)?.to_owned();
        let original_id = require_header(first, ORIGINAL_ID_HEADER)?.to_owned();

        for chunk in &chunks {
            let chunk_group = require_header(chunk, CHUNK_ID_HEADER)?;
            if chunk_group != group_id {
                return Err(ChunkError::MismatchedChunkGroups {
                    expected: group_id,
                    found: chunk_group.to_owned(),
                });
            }
            let chunk_original = require_header(chunk, ORIGINAL_ID_HEADER)?;
            if chunk_original != original_id {
                return Err(ChunkError::MismatchedChunkGroups {
                    expected: original_id,
                    found: chunk_original.to_owned(),
                });
            }
        }

        chunks.sort_by_key(|c| c.chunk_index().unwrap_or(usize::MAX));

        let total = chunks[0]
            .chunk_total()
            .ok_or(ChunkError::InvalidChunkHeader {
                header: CHUNK_TOTAL_HEADER,
                value: chunks[0]
                    .headers
                    .get(CHUNK_TOTAL_HEADER)
                    .cloned()
                    .unwrap_or_default(),
            })?;
        for (expected_index, chunk) in chunks.iter().enumerate() {
            let index = chunk.chunk_index().ok_or(ChunkError::InvalidChunkHeader {
                header: CHUNK_INDEX_HEADER,
                value: chunk
                    .headers
                    .get(CHUNK_INDEX_HEADER)
                    .cloned()
                    .unwrap_or_default(),
            })?;
            if index != expected_index {
                return Err(ChunkError::MissingChunks {
                    expected: total,
                    actual: chunks.len(),
                });
            }
        }
        if chunks.len() != total {
            return Err(ChunkError::MissingChunks {
                expected: total,
                actual: chunks.len(),
            });
        }

        let payload = merge_payloads(&chunks)?;

        let id = EnvelopeId::parse(&original_id).map_err(|_| ChunkError::InvalidChunkHeader {
            header: ORIGINAL_ID_HEADER,
            value: original_id,
        })?;

        let mut merged = chunks.swap_remove(0);
        merged.id = id;
        // The chunks' correlation id pointed at the original envelope, which
        // is the merge result itself; a self-correlation would be meaningless.
        merged.correlation_id = None;
        merged.span_id = Some(SpanId::generate());
        merged.payload = payload;
        merged.headers.remove(CHUNK_ID_HEADER);
        merged.headers.remove(CHUNK_INDEX_HEADER);
        merged.headers.remove(CHUNK_TOTAL_HEADER);
        merged.headers.remove(ORIGINAL_ID_HEADER);
        Ok(merged)
    }
}

/// A chunk header that must be present and non-empty
fn require_header<'a>(chunk: &'a Envelope, header: &'static str) -> Result<&'a str, ChunkError> {
    match chunk.headers.get(header) {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) | None => Err(ChunkError::InvalidChunkHeader {
            header,
            value: String::new(),
        }),
    }
}

/// Clamps the chunk count so no chunk falls below the minimum size
fn clamp_chunk_count(requested: usize, payload_len: usize) -> usize {
    let max_chunks = (payload_len / MIN_CHUNK_BYTES).max(1);
    requested.min(max_chunks)
}

/// Parses the payload as a JSON array, if it is one
fn parse_json_array(payload: &[u8]) -> Option<Vec<serde_json::Value>> {
    match serde_json::from_slice(payload) {
        Ok(serde_json::Value::Array(elements)) => Some(elements),
        _ => None,
    }
}

/// Partitions array elements into near-equal contiguous sublists
fn split_json_array(
    elements: Vec<serde_json::Value>,
    count: usize,
) -> Result<Vec<Vec<u8>>, ChunkError> {
    let len = elements.len();
    let count = count.min(len.max(1));
    let mut parts = Vec::with_capacity(count);
    let mut elements = elements.into_iter();
    for i in 0..count {
        let start = i * len / count;
        let end = (i + 1) * len / count;
        let part: Vec<serde_json::Value> = elements.by_ref().take(end - start).collect();
        parts.push(serde_json::to_vec(&part)?);
    }
    Ok(parts)
}

/// Cuts the payload into near-equal contiguous byte ranges
///
/// Each cut is adjusted to the nearest whitespace within the configured
/// window of its target offset; without one, the cut lands on the target.
fn split_bytes(payload: &[u8], count: usize) -> Vec<Vec<u8>> {
    let len = payload.len();
    let mut cuts = Vec::with_capacity(count + 1);
    cuts.push(0);
    for i in 1..count {
        let target = i * len / count;
        let floor = *cuts.last().unwrap_or(&0) + 1;
        let cut = adjust_to_whitespace(payload, target).clamp(floor.min(len), len);
        cuts.push(cut);
    }
    cuts.push(len);

    cuts.windows(2)
        .map(|pair| payload[pair[0]..pair[1]].to_vec())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Nearest whitespace boundary within the window around `target`
fn adjust_to_whitespace(payload: &[u8], target: usize) -> usize {
    let lo = target.saturating_sub(WHITESPACE_WINDOW);
    let hi = (target + WHITESPACE_WINDOW).min(payload.len());
    let mut best: Option<usize> = None;
    for pos in lo..hi {
        if payload[pos].is_ascii_whitespace() {
            // Cut after the whitespace so it terminates the earlier chunk.
            let cut = pos + 1;
            let better = match best {
                Some(current) => cut.abs_diff(target) < current.abs_diff(target),
                None => true,
            };
            if better {
                best = Some(cut);
            }
        }
    }
    best.unwrap_or(target)
}

/// Builds one chunk-envelope from the original
fn chunk_envelope(
    original: &Envelope,
    group_id: &str,
    index: usize,
    total: usize,
    payload: Vec<u8>,
) -> Envelope {
    let mut chunk = original.clone();
    chunk.id = EnvelopeId::generate();
    chunk.span_id = Some(SpanId::generate());
    chunk.correlation_id = Some(original.id);
    chunk.payload = payload;
    chunk
        .headers
        .insert(CHUNK_ID_HEADER.into(), group_id.to_owned());
    chunk
        .headers
        .insert(CHUNK_INDEX_HEADER.into(), index.to_string());
    chunk
        .headers
        .insert(CHUNK_TOTAL_HEADER.into(), total.to_string());
    chunk
        .headers
        .insert(ORIGINAL_ID_HEADER.into(), original.id.to_string());
    chunk
}

/// Concatenates chunk payloads, element-wise for JSON array groups
fn merge_payloads(chunks: &[Envelope]) -> Result<Vec<u8>, ChunkError> {
    if parse_json_array(&chunks[0].payload).is_some() {
        let mut merged = Vec::new();
        let mut all_arrays = true;
        for chunk in chunks {
            match parse_json_array(&chunk.payload) {
                Some(elements) => merged.extend(elements),
                None => {
                    all_arrays = false;
                    break;
                }
            }
        }
        if all_arrays {
            return Ok(serde_json::to_vec(&merged)?);
        }
        warn!("chunk group mixes JSON array and raw payloads, falling back to byte concatenation");
    }

    let mut merged = Vec::with_capacity(chunks.iter().map(|c| c.payload.len()).sum());
    for chunk in chunks {
        merged.extend_from_slice(&chunk.payload);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunker() -> Chunker {
        Chunker::default()
    }

    fn text_envelope(payload: &str) -> Envelope {
        Envelope::new("src", "topic:data", "test", payload.as_bytes().to_vec())
    }

    #[test]
    fn estimate_counts_headers_properties_and_hops() {
        let mut env = text_envelope("abcd");
        env = env.with_header("a", "1").with_header("b", "2");
        env = env.with_property("p", serde_json::json!(1));
        env.add_hop("hop1");

        let estimate = chunker().estimate(&env);
        assert_eq!(estimate.payload_tokens, 1);
        assert_eq!(estimate.header_tokens, 50 + 2 * 10 + 15 + 10);
    }

    #[test]
    fn small_envelope_is_not_split() {
        let env = text_envelope("small payload");
        let budget = TokenBudget::default();
        assert!(!chunker().needs_split(&env, &budget));
        let out = chunker().split(env, &budget).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_chunk());
    }

    #[test]
    fn suggested_count_has_floor_of_two() {
        let env = text_envelope(&"word ".repeat(2000));
        let budget = TokenBudget {
            max_context: 2400,
            max_output: 100,
            reserve: 50,
        };
        let count = chunker().suggested_chunk_count(&env, &budget).unwrap();
        assert!(count >= 2);
    }

    #[test]
    fn exhausted_budget_is_an_error() {
        let env = text_envelope("payload");
        let budget = TokenBudget {
            max_context: 60,
            max_output: 50,
            reserve: 20,
        };
        assert!(matches!(
            chunker().suggested_chunk_count(&env, &budget),
            Err(ChunkError::BudgetTooSmall { .. })
        ));
    }

    #[test]
    fn byte_split_prefers_whitespace_cuts() {
        let payload = "word ".repeat(200);
        let env = text_envelope(&payload);
        let chunks = chunker().split_into(env, 4).unwrap();
        assert_eq!(chunks.len(), 4);
        for chunk in &chunks[..3] {
            assert!(
                chunk.payload.last().is_some_and(u8::is_ascii_whitespace),
                "cut should land after whitespace"
            );
        }
    }

    #[test]
    fn chunks_carry_group_headers_and_correlation() {
        let env = text_envelope(&"data ".repeat(200));
        let original_id = env.id;
        let chunks = chunker().split_into(env, 3).unwrap();

        let group = chunks[0].chunk_group().unwrap().to_owned();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_group(), Some(group.as_str()));
            assert_eq!(chunk.chunk_index(), Some(i));
            assert_eq!(chunk.chunk_total(), Some(3));
            assert_eq!(
                chunk.headers.get(ORIGINAL_ID_HEADER),
                Some(&original_id.to_string())
            );
            assert_eq!(chunk.correlation_id, Some(original_id));
            assert_ne!(chunk.id, original_id);
        }
    }

    #[test]
    fn merge_restores_payload_and_strips_chunk_headers() {
        let mut env = text_envelope(&"sentence one. ".repeat(100));
        env = env.with_header("Custom", "Header");
        env.add_hop("hop1");
        let original_id = env.id;
        let original_payload = env.payload.clone();

        let mut chunks = chunker().split_into(env, 5).unwrap();
        // Reassembly is order-independent.
        chunks.reverse();
        let merged = chunker().merge(chunks).unwrap();

        assert_eq!(merged.id, original_id);
        assert_eq!(merged.payload, original_payload);
        assert_eq!(merged.headers.get("Custom").map(String::as_str), Some("Header"));
        assert!(!merged.is_chunk());
        assert!(!merged.headers.contains_key(ORIGINAL_ID_HEADER));
        assert_eq!(merged.route, vec!["hop1"]);
    }

    #[test]
    fn merge_rejects_mixed_groups() {
        let a = chunker()
            .split_into(text_envelope(&"aaaa ".repeat(100)), 2)
            .unwrap();
        let b = chunker()
            .split_into(text_envelope(&"bbbb ".repeat(100)), 2)
            .unwrap();
        let mixed = vec![a[0].clone(), b[1].clone()];
        assert!(matches!(
            chunker().merge(mixed),
            Err(ChunkError::MismatchedChunkGroups { .. })
        ));
    }

    #[test]
    fn merge_rejects_incomplete_groups() {
        let mut chunks = chunker()
            .split_into(text_envelope(&"cccc ".repeat(100)), 3)
            .unwrap();
        chunks.pop();
        assert!(matches!(
            chunker().merge(chunks),
            Err(ChunkError::MissingChunks {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn merge_of_empty_group_fails() {
        assert!(matches!(
            chunker().merge(Vec::new()),
            Err(ChunkError::EmptyChunkGroup)
        ));
    }

    #[test]
    fn json_array_split_preserves_every_element_in_order() {
        let elements: Vec<serde_json::Value> = (0..100)
            .map(|k| serde_json::json!({"id": k, "data": "x".repeat(20)}))
            .collect();
        let payload = serde_json::to_vec(&elements).unwrap();
        let env = Envelope::new("src", "topic:data", "test", payload);

        let chunks = chunker().split_into(env, 4).unwrap();
        assert_eq!(chunks.len(), 4);

        let mut seen = Vec::new();
        for chunk in &chunks {
            let part: Vec<serde_json::Value> = serde_json::from_slice(&chunk.payload).unwrap();
            assert!(!part.is_empty(), "every chunk holds a valid, non-empty array");
            seen.extend(part);
        }
        assert_eq!(seen, elements);
    }

    #[test]
    fn tiny_payload_clamps_chunk_count() {
        let env = text_envelope("tiny");
        let chunks = chunker().split_into(env, 5).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    proptest! {
        #[test]
        fn split_merge_round_trips_arbitrary_bytes(
            payload in proptest::collection::vec(any::<u8>(), 200..4000),
            factor in 2usize..8,
        ) {
            let env = Envelope::new("src", "topic:data", "test", payload.clone());
            let original_id = env.id;
            let chunks = chunker().split_into(env, factor).unwrap();
            let merged = chunker().merge(chunks).unwrap();
            prop_assert_eq!(merged.payload, payload);
            prop_assert_eq!(merged.id, original_id);
        }
    }
}
