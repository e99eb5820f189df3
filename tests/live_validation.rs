use std::sync::Arc;
use std::{env, time::Duration};

use reelindex::broker::{AmqpBroker, JobBroker, JobOutcome, JobState, MemoryResults};
use reelindex::ingest::{IndexDocument, JobId, JobPayload, Record, TaskKind, Value};
use reelindex::search::{ElasticsearchClient, IndexingClient, SearchQueries};
use reelindex::status::{AmqpStatusChannel, StatusChannel, StatusEvent, TaskStatus};
use uuid::Uuid;

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::test]
#[ignore = "Requires live Elasticsearch"]
async fn live_elasticsearch_upsert_is_idempotent() {
    let client = ElasticsearchClient::new(&env_or("ES_URL", "http://127.0.0.1:9200"), None, true)
        .expect("client");
    let collection = format!("reelindex-live-{}", Uuid::new_v4().simple());
    client
        .ensure_collection(&collection, Some(4))
        .await
        .expect("ensure collection");

    let mut fields = Record::new();
    fields.insert("id", Value::Text("1".into()));
    fields.insert("actors", Value::List(vec!["A".into(), "B".into()]));
    let document = IndexDocument::new(fields, Some(vec![0.1, 0.2, 0.3, 0.4]));
    for _ in 0..2 {
        client
            .upsert(&collection, "1", &document)
            .await
            .expect("upsert");
    }

    let hits = client
        .term_search(&collection, "actors", "B", 10)
        .await
        .expect("term search");
    assert_eq!(hits.len(), 1, "repeated upsert must keep one document");
    assert!(client.delete_document(&collection, "1").await.expect("delete"));
}

#[tokio::test]
#[ignore = "Requires live RabbitMQ"]
async fn live_status_channel_roundtrip() {
    let url = env_or("STATUS_CHANNEL_URL", "amqp://127.0.0.1:5672/%2f");
    let queue = format!("reelindex-live-{}", Uuid::new_v4().simple());
    let channel = AmqpStatusChannel::connect(&url, &queue)
        .await
        .expect("connect");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _consumer = channel
        .subscribe(Box::new(move |event| {
            let _ = tx.send(event);
        }))
        .await
        .expect("subscribe");

    let sent = StatusEvent::now(JobId::from("live-1"), TaskStatus::Completed);
    channel.publish(&sent).await.expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message within timeout")
        .expect("message");
    assert_eq!(received.job_id, sent.job_id);
    assert_eq!(received.status, TaskStatus::Completed);
    assert_eq!(
        received.timestamp.unix_timestamp(),
        sent.timestamp.unix_timestamp()
    );
}

#[tokio::test]
#[ignore = "Requires live RabbitMQ"]
async fn live_amqp_broker_settles_and_redelivers() {
    let url = env_or("JOB_BROKER_URL", "amqp://127.0.0.1:5672/%2f");
    let queue = format!("reelindex-jobs-{}", Uuid::new_v4().simple());
    let broker = AmqpBroker::connect(
        &url,
        &queue,
        1,
        Duration::from_secs(60),
        Arc::new(MemoryResults::new(Duration::from_secs(60))),
    )
    .await
    .expect("connect");

    let payload =
        JobPayload::from_json(serde_json::json!({"movies": [{"id": "1"}]})).expect("payload");
    let job_id = broker
        .submit(TaskKind::Insert, payload)
        .await
        .expect("submit");
    assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Pending);

    let first = tokio::time::timeout(Duration::from_secs(5), broker.claim())
        .await
        .expect("delivery within timeout")
        .expect("claim");
    assert!(!first.redelivered);
    assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Started);
    broker.nack(first.tag).await.expect("nack");

    let second = tokio::time::timeout(Duration::from_secs(5), broker.claim())
        .await
        .expect("redelivery within timeout")
        .expect("claim");
    assert!(second.redelivered);
    assert_eq!(second.body, first.body);
    broker
        .ack(second.tag, JobOutcome::Success)
        .await
        .expect("ack");
    assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Success);

    broker.close().await;
}
