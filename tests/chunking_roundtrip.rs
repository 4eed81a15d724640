//! End-to-end chunking round trips over realistic payloads

use colony::chunker::Chunker;
use colony::envelope::{
    CHUNK_ID_HEADER, CHUNK_INDEX_HEADER, CHUNK_TOTAL_HEADER, Envelope, ORIGINAL_ID_HEADER,
};

#[test]
fn text_payload_round_trips_through_five_chunks() {
    let payload = "This is a test sentence. ".repeat(500);
    let mut envelope = Envelope::new(
        "producer",
        "topic:documents",
        "test",
        payload.clone().into_bytes(),
    )
    .with_header("Custom", "Header")
    .with_property("key", serde_json::json!("value"));
    envelope.add_hop("hop1");
    envelope.add_hop("hop2");
    let original_id = envelope.id;

    let chunker = Chunker::default();
    let chunks = chunker.split_into(envelope, 5).unwrap();
    assert_eq!(chunks.len(), 5);

    // All siblings share one group id and carry distinct indices 0..5.
    let group = chunks[0].chunk_group().unwrap().to_owned();
    let mut indices: Vec<usize> = chunks.iter().map(|c| c.chunk_index().unwrap()).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    for chunk in &chunks {
        assert_eq!(chunk.chunk_group(), Some(group.as_str()));
        assert_eq!(chunk.chunk_total(), Some(5));
        assert_eq!(chunk.correlation_id, Some(original_id));
    }

    let merged = chunker.merge(chunks).unwrap();
    assert_eq!(merged.id, original_id);
    assert_eq!(String::from_utf8(merged.payload).unwrap(), payload);
    assert_eq!(
        merged.headers.get("Custom").map(String::as_str),
        Some("Header")
    );
    assert_eq!(merged.properties.get("key"), Some(&serde_json::json!("value")));
    assert_eq!(merged.route, vec!["hop1", "hop2"]);
    assert_eq!(merged.hop_count, 2);

    for header in [
        CHUNK_ID_HEADER,
        CHUNK_INDEX_HEADER,
        CHUNK_TOTAL_HEADER,
        ORIGINAL_ID_HEADER,
    ] {
        assert!(!merged.headers.contains_key(header));
    }
}

#[test]
fn json_array_payload_splits_into_valid_arrays() {
    let elements: Vec<serde_json::Value> = (0..1000)
        .map(|k| serde_json::json!({"id": k, "data": "x".repeat(100)}))
        .collect();
    let payload = serde_json::to_vec(&elements).unwrap();
    let envelope = Envelope::new("producer", "topic:records", "test", payload);
    let original_id = envelope.id;

    let chunker = Chunker::default();
    let chunks = chunker.split_into(envelope, 4).unwrap();
    assert_eq!(chunks.len(), 4);

    // Each chunk is itself a valid JSON array; concatenation in index
    // order reproduces all 1000 elements in their original order.
    let mut reassembled = Vec::new();
    for chunk in &chunks {
        let part: Vec<serde_json::Value> =
            serde_json::from_slice(&chunk.payload).expect("chunk payload is a JSON array");
        assert!(!part.is_empty());
        reassembled.extend(part);
    }
    assert_eq!(reassembled.len(), 1000);
    assert_eq!(reassembled, elements);

    let merged = chunker.merge(chunks).unwrap();
    assert_eq!(merged.id, original_id);
    let merged_elements: Vec<serde_json::Value> = serde_json::from_slice(&merged.payload).unwrap();
    assert_eq!(merged_elements, elements);
}

#[test]
fn budget_driven_split_is_transparent_for_small_payloads() {
    let chunker = Chunker::default();
    let budget = colony::chunker::TokenBudget {
        max_context: 1000,
        max_output: 100,
        reserve: 50,
    };

    let small = Envelope::new("p", "t:x", "test", b"short".to_vec());
    let out = chunker.split(small, &budget).unwrap();
    assert_eq!(out.len(), 1);
    assert!(!out[0].is_chunk());

    let large = Envelope::new("p", "t:x", "test", "word ".repeat(2000).into_bytes());
    let out = chunker.split(large, &budget).unwrap();
    assert!(out.len() >= 2);
    assert!(out.iter().all(Envelope::is_chunk));

    let merged = chunker.merge(out).unwrap();
    assert_eq!(merged.payload, "word ".repeat(2000).into_bytes());
}
