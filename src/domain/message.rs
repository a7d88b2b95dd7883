use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PAYMENT_INITIATED: &str = "payment_initiated";
pub const PAYMENT_COMPLETED: &str = "payment_completed";
pub const PAYMENT_FAILED: &str = "payment_failed";
pub const PAYMENT_CANCELLED: &str = "payment_cancelled";
pub const REFUND_PROCESSED: &str = "refund_processed";

pub const DEFAULT_TOPICS: [&str; 5] = [
    PAYMENT_INITIATED,
    PAYMENT_COMPLETED,
    PAYMENT_FAILED,
    PAYMENT_CANCELLED,
    REFUND_PROCESSED,
];

/// Fixed routing key binding the dead-letter exchange to the DLQ.
pub const DEAD_LETTER_ROUTING_KEY: &str = "dead_letter";

pub fn queue_name(topic: &str) -> String {
    format!("{topic}_queue")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ttl_ms: Option<u64>,
    /// Ready messages the queue accepts before publishes are refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
    pub unacked_count: u32,
}

/// Application headers carried by every envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    #[serde(rename = "x-retry-count", default)]
    pub retry_count: u32,
    #[serde(
        rename = "x-correlation-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(
        rename = "x-original-routing-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_routing_key: Option<String>,
    #[serde(
        rename = "x-reprocessed",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reprocessed: Option<bool>,
    /// Epoch milliseconds of the last redrive.
    #[serde(
        rename = "x-reprocess-timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reprocess_timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Why and where the broker dead-lettered a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: DeadLetterReason,
    pub count: u32,
    pub time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    Rejected,
    Expired,
    Maxlen,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Rejected => write!(f, "rejected"),
            DeadLetterReason::Expired => write!(f, "expired"),
            DeadLetterReason::Maxlen => write!(f, "maxlen"),
        }
    }
}

/// The wire form of a message as the broker stores and routes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub timestamp_ms: i64,
    pub persistent: bool,
    pub content_type: String,
    pub headers: MessageHeaders,
    /// Serialized JSON payload.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub death: Option<DeathRecord>,
}

impl Envelope {
    /// Re-addresses the envelope to a dead-letter exchange. The death count
    /// carries on only when it last died in the same queue.
    pub fn into_dead_letter(
        mut self,
        queue: &str,
        reason: DeadLetterReason,
        exchange: &str,
        routing_key: Option<&str>,
    ) -> Self {
        let count = self
            .death
            .as_ref()
            .filter(|d| d.queue == queue)
            .map_or(0, |d| d.count)
            + 1;
        self.death = Some(DeathRecord {
            queue: queue.to_string(),
            reason,
            count,
            time_ms: now_ms(),
        });
        if let Some(routing_key) = routing_key {
            self.routing_key = routing_key.to_string();
        }
        self.exchange = exchange.to_string();
        self
    }
}

/// An envelope handed to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub redelivered: bool,
    pub envelope: Envelope,
}

/// How a negative acknowledgement should be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Nack {
    pub requeue: bool,
    /// Replaces the envelope headers before the message goes back.
    pub headers: Option<MessageHeaders>,
}

impl Nack {
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            headers: None,
        }
    }

    pub fn requeue_with(headers: MessageHeaders) -> Self {
        Self {
            requeue: true,
            headers: Some(headers),
        }
    }

    pub fn dead_letter() -> Self {
        Self {
            requeue: false,
            headers: None,
        }
    }
}

/// A decoded message as seen by a handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub headers: MessageHeaders,
    pub persistent: bool,
    pub redelivered: bool,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        let envelope = &delivery.envelope;
        let payload = serde_json::from_str(&envelope.body)?;
        let topic = envelope
            .headers
            .original_routing_key
            .clone()
            .unwrap_or_else(|| envelope.routing_key.clone());
        Ok(Self {
            id: envelope.message_id.clone(),
            topic,
            payload,
            headers: envelope.headers.clone(),
            persistent: envelope.persistent,
            redelivered: delivery.redelivered,
            published_at: from_epoch_ms(envelope.timestamp_ms),
        })
    }
}

/// A dead-lettered message together with where it died and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqEntry {
    #[serde(flatten)]
    pub message: Message,
    pub original_queue: Option<String>,
    pub dead_letter_reason: Option<String>,
    pub death_count: u32,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl DlqEntry {
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        let message = Message::from_delivery(delivery)?;
        let death = delivery.envelope.death.as_ref();
        Ok(Self {
            message,
            original_queue: death.map(|d| d.queue.clone()),
            dead_letter_reason: death.map(|d| d.reason.to_string()),
            death_count: death.map(|d| d.count).unwrap_or(0),
            dead_lettered_at: death.map(|d| from_epoch_ms(d.time_ms)),
        })
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(body: &str) -> Envelope {
        Envelope {
            message_id: "m-1".to_string(),
            exchange: "payment_events".to_string(),
            routing_key: PAYMENT_INITIATED.to_string(),
            timestamp_ms: 1_700_000_000_000,
            persistent: true,
            content_type: "application/json".to_string(),
            headers: MessageHeaders {
                original_routing_key: Some(PAYMENT_INITIATED.to_string()),
                ..Default::default()
            },
            body: body.to_string(),
            death: None,
        }
    }

    #[test]
    fn test_headers_use_wire_names() {
        let headers = MessageHeaders {
            retry_count: 2,
            original_routing_key: Some("payment_completed".to_string()),
            reprocessed: Some(true),
            reprocess_timestamp: Some(42),
            ..Default::default()
        };
        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["x-retry-count"], 2);
        assert_eq!(json["x-original-routing-key"], "payment_completed");
        assert_eq!(json["x-reprocessed"], true);
        assert_eq!(json["x-reprocess-timestamp"], 42);
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        let headers: MessageHeaders = serde_json::from_value(json!({})).unwrap();
        assert_eq!(headers.retry_count, 0);
    }

    #[test]
    fn test_dead_letter_counts_deaths_per_queue() {
        let queue = queue_name(PAYMENT_INITIATED);
        let once = envelope("{}").into_dead_letter(
            &queue,
            DeadLetterReason::Rejected,
            "payment_events_dlx",
            Some(DEAD_LETTER_ROUTING_KEY),
        );
        assert_eq!(once.exchange, "payment_events_dlx");
        assert_eq!(once.routing_key, DEAD_LETTER_ROUTING_KEY);
        assert_eq!(once.death.as_ref().unwrap().count, 1);

        let twice = once.into_dead_letter(&queue, DeadLetterReason::Expired, "dlx", None);
        let death = twice.death.as_ref().unwrap();
        assert_eq!(death.count, 2);
        assert_eq!(death.reason, DeadLetterReason::Expired);
        assert_eq!(twice.routing_key, DEAD_LETTER_ROUTING_KEY);

        let elsewhere = twice.into_dead_letter("other_queue", DeadLetterReason::Rejected, "dlx", None);
        assert_eq!(elsewhere.death.unwrap().count, 1);
    }

    #[test]
    fn test_dlq_entry_reads_death_record() {
        let mut env = envelope(r#"{"payment_id":"p1"}"#);
        env.death = Some(DeathRecord {
            queue: queue_name(PAYMENT_INITIATED),
            reason: DeadLetterReason::Rejected,
            count: 1,
            time_ms: 1_700_000_000_500,
        });
        let delivery = Delivery {
            tag: 7,
            queue: "dead_letter_queue".to_string(),
            redelivered: false,
            envelope: env,
        };

        let entry = DlqEntry::from_delivery(&delivery).unwrap();
        assert_eq!(entry.original_queue.as_deref(), Some("payment_initiated_queue"));
        assert_eq!(entry.dead_letter_reason.as_deref(), Some("rejected"));
        assert_eq!(entry.message.topic, PAYMENT_INITIATED);
        assert_eq!(entry.message.payload["payment_id"], "p1");
    }

    #[test]
    fn test_message_rejects_non_json_body() {
        let delivery = Delivery {
            tag: 1,
            queue: "q".to_string(),
            redelivered: false,
            envelope: envelope("not json"),
        };
        assert!(Message::from_delivery(&delivery).is_err());
    }
}
