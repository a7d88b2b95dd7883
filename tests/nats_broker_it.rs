//! Broker round trip against a live NATS server with JetStream.
//!
//! Requires `nats-server -js`; set NATS_URL to point elsewhere.

mod common;

use common::dead_letter;
use payflow::application::broker::{BrokerConfig, MessageBroker};
use payflow::application::dlq::{DlqConfig, DlqManager, ReprocessOptions};
use payflow::domain::message::queue_name;
use payflow::infrastructure::connector::EndpointConnector;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "it_payment_failed";

async fn nats_broker() -> Arc<MessageBroker> {
    let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let config = BrokerConfig {
        endpoints: vec![url],
        exchange: "payflow_it_events".to_string(),
        dead_letter_exchange: "payflow_it_dlx".to_string(),
        dead_letter_queue: "payflow_it_dlq".to_string(),
        topics: vec![TOPIC.to_string()],
        connect_retries: 1,
        ..Default::default()
    };
    let broker = Arc::new(MessageBroker::new(
        config,
        Arc::new(EndpointConnector::default()),
    ));
    broker.connect().await.unwrap();
    broker
}

async fn depth(broker: &MessageBroker, queue: &str) -> u32 {
    for _ in 0..20 {
        let info = broker.queue_info(queue).await.unwrap();
        if info.unacked_count == 0 {
            return info.message_count;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{queue} kept unacked messages");
}

#[tokio::test]
#[ignore = "Requires running NATS with JetStream"]
async fn test_dead_letter_and_redrive_over_jetstream() {
    let broker = nats_broker().await;
    let channel = broker.channel().unwrap();
    let dlq = broker.config().dead_letter_queue.clone();
    let topic_queue = queue_name(TOPIC);
    channel.purge(&dlq).await.unwrap();
    channel.purge(&topic_queue).await.unwrap();

    dead_letter(&broker, TOPIC, json!({ "payment_id": "p1" })).await;
    assert_eq!(depth(&broker, &dlq).await, 1);
    assert_eq!(depth(&broker, &topic_queue).await, 0);

    let manager = DlqManager::new(broker.clone(), DlqConfig::default());
    let entries = manager.peek_messages(5).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_queue.as_deref(), Some(topic_queue.as_str()));
    assert_eq!(entries[0].dead_letter_reason.as_deref(), Some("rejected"));

    let report = manager
        .reprocess_messages(ReprocessOptions::default())
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(depth(&broker, &dlq).await, 0);
    assert_eq!(depth(&broker, &topic_queue).await, 1);

    channel.purge(&topic_queue).await.unwrap();
    broker.disconnect().await.unwrap();
}
