//! Property tests for the invariants a `Backend` must uphold,
//! exercised against the in-process `MemoryBackend`.

use proptest::prelude::*;
use reactorcore::backend::memory::MemoryBackend;
use reactorcore::backend::{Backend, StartFrom};
use reactorcore::message::Message;

fn msg(stream: &str, ty: &str) -> Message {
    Message::new(stream, ty, serde_json::json!({}))
}

proptest! {
    /// Monotonic per-stream sequence: appending `n` messages to a fresh
    /// stream one at a time always yields `seq = 1, 2, ..., n`.
    #[test]
    fn per_stream_sequence_has_no_gaps(n in 1usize..30) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let backend = MemoryBackend::new();
            for i in 0..n {
                let written = backend
                    .append_next_to_stream("s1", vec![msg("s1", "e.A")])
                    .await
                    .unwrap();
                prop_assert_eq!(written[0].seq, Some((i + 1) as u64));
            }
            Ok(())
        })?;
    }

    /// Monotonic global sequence across streams: appends observed in
    /// real-time order always carry strictly increasing `global_seq`.
    #[test]
    fn global_sequence_is_strictly_increasing_across_streams(n in 1usize..30) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let backend = MemoryBackend::new();
            let mut last = None;
            for i in 0..n {
                let stream = if i % 2 == 0 { "s1" } else { "s2" };
                let written = backend
                    .append_next_to_stream(stream, vec![msg(stream, "e.A")])
                    .await
                    .unwrap();
                let gs = written[0].global_seq.unwrap();
                if let Some(prev) = last {
                    prop_assert!(gs > prev);
                }
                last = Some(gs);
            }
            Ok(())
        })?;
    }

    /// `follow` preserves correlation/causation across an arbitrary
    /// chain of replies.
    #[test]
    fn correlation_chain_is_preserved(chain_len in 1usize..10) {
        let mut current = msg("s1", "e.A");
        let root_correlation = current.correlation_id;
        for _ in 0..chain_len {
            let next = current.follow("s1", "e.B", serde_json::json!({}));
            prop_assert_eq!(next.causation_id, Some(current.id));
            prop_assert_eq!(next.correlation_id, root_correlation);
            current = next;
        }
    }
}

#[tokio::test]
async fn append_then_read_round_trips_order_and_values() {
    let backend = MemoryBackend::new();
    let batch = vec![msg("s1", "e.A"), msg("s1", "e.B"), msg("s1", "e.C")];
    let written = backend.append_next_to_stream("s1", batch).await.unwrap();

    let read = backend.read_stream("s1", None).await.unwrap();
    assert_eq!(read.len(), written.len());
    for (a, b) in written.iter().zip(read.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.seq, b.seq);
        assert_eq!(a.r#type, b.r#type);
    }
}

#[tokio::test]
async fn second_ack_at_the_same_offset_is_a_no_op() {
    let backend = MemoryBackend::new();
    backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
    backend.append_next_to_stream("s1", vec![msg("s1", "e.A")]).await.unwrap();

    let claimed = backend
        .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
        .await
        .unwrap()
        .unwrap();
    let gs = claimed.batch[0].message.global_seq.unwrap();

    backend.ack("g1", "s1", gs, "w1").await.unwrap();
    backend.ack("g1", "s1", gs, "w1").await.unwrap();

    let stats = backend.stats().await.unwrap();
    let g = stats.iter().find(|g| g.group_id == "g1").unwrap();
    assert_eq!(g.highest_global_seq, gs);
}

#[tokio::test]
async fn reset_marks_everything_up_to_highest_global_seq_as_replaying() {
    let backend = MemoryBackend::new();
    backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
    backend
        .append_next_to_stream("s1", vec![msg("s1", "e.A"), msg("s1", "e.B")])
        .await
        .unwrap();

    let first = backend
        .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
        .await
        .unwrap()
        .unwrap();
    let last_gs = first.batch.last().unwrap().message.global_seq.unwrap();
    backend.ack("g1", "s1", last_gs, "w1").await.unwrap();

    backend.reset_consumer_group("g1").await.unwrap();

    let replayed = backend
        .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
        .await
        .unwrap()
        .unwrap();
    assert!(replayed.batch.iter().all(|e| e.replaying));
}

#[tokio::test]
async fn stopped_group_never_mutates_offsets() {
    let backend = MemoryBackend::new();
    backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
    backend.append_next_to_stream("s1", vec![msg("s1", "e.A")]).await.unwrap();
    backend.stop_consumer_group("g1", "boom").await.unwrap();

    for _ in 0..3 {
        let claimed = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    let stats = backend.stats().await.unwrap();
    let g = stats.iter().find(|g| g.group_id == "g1").unwrap();
    assert_eq!(g.highest_global_seq, 0);
}

#[tokio::test]
async fn empty_batch_append_is_a_no_op_returning_success() {
    let backend = MemoryBackend::new();
    let written = backend.append_next_to_stream("s1", vec![]).await.unwrap();
    assert!(written.is_empty());
}
