//! Integration tests against a real Postgres instance.
//!
//! Skipped when `DATABASE_URL` isn't set so the suite stays local- and
//! CI-friendly; set it to a scratch database to exercise these.

use reactorcore::backend::{Backend, StartFrom};
use reactorcore::Message;
use reactorcore_postgres::{PostgresBackend, PostgresBackendConfig, PostgresPool};

async fn connect() -> Option<PostgresBackend> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: DATABASE_URL not set");
            return None;
        }
    };
    let config = PostgresBackendConfig::new(url);
    let pool = PostgresPool::connect(&config).await.expect("connect");
    Some(PostgresBackend::new(pool.pool().clone()))
}

fn msg(stream: &str, ty: &str) -> Message {
    Message::new(stream, ty, serde_json::json!({}))
}

#[tokio::test]
async fn append_then_claim_then_ack_round_trips_through_postgres() {
    let Some(backend) = connect().await else { return };
    backend.install().await.unwrap();

    let stream = format!("it-{}", uuid::Uuid::now_v7());
    let group = format!("g-{}", uuid::Uuid::now_v7());

    backend
        .register_consumer_group(&group, StartFrom::Beginning)
        .await
        .unwrap();
    backend
        .append_next_to_stream(&stream, vec![msg(&stream, "it.A")])
        .await
        .unwrap();

    let claimed = backend
        .claim_next_batch(&group, &["it.A".to_string()], 10, false, "w1")
        .await
        .unwrap()
        .expect("work available");
    assert_eq!(claimed.batch.len(), 1);

    let gs = claimed.batch[0].message.global_seq.unwrap();
    backend.ack(&group, &stream, gs, "w1").await.unwrap();

    let stats = backend.stats().await.unwrap();
    let g = stats.iter().find(|g| g.group_id == group).unwrap();
    assert_eq!(g.highest_global_seq, gs);
}

#[tokio::test]
async fn two_workers_cannot_claim_the_same_stream_concurrently() {
    let Some(backend) = connect().await else { return };
    backend.install().await.unwrap();

    let stream = format!("it-{}", uuid::Uuid::now_v7());
    let group = format!("g-{}", uuid::Uuid::now_v7());

    backend
        .register_consumer_group(&group, StartFrom::Beginning)
        .await
        .unwrap();
    backend
        .append_next_to_stream(&stream, vec![msg(&stream, "it.A")])
        .await
        .unwrap();

    let first = backend
        .claim_next_batch(&group, &["it.A".to_string()], 10, false, "w1")
        .await
        .unwrap();
    assert!(first.is_some());

    let second = backend
        .claim_next_batch(&group, &["it.A".to_string()], 10, false, "w2")
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn schedule_then_update_schedule_promotes_due_messages() {
    let Some(backend) = connect().await else { return };
    backend.install().await.unwrap();

    let stream = format!("it-{}", uuid::Uuid::now_v7());
    backend
        .schedule_messages(vec![msg(&stream, "it.Delayed")], chrono::Utc::now())
        .await
        .unwrap();

    let promoted = backend.update_schedule().await.unwrap();
    assert_eq!(promoted, 1);

    let read = backend.read_stream(&stream, None).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].r#type, "it.Delayed");
}
