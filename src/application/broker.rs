//! Connection manager for the event pipeline.
//!
//! `MessageBroker` owns the single channel of a connection and everything tied
//! to it: endpoint failover, topology declaration, publish with one
//! reconnect-and-retry on channel faults, and subscriptions that route failed
//! deliveries to the dead-letter queue after `max_retries` requeues.

use crate::application::resilience::retry::RetryPolicy;
use crate::domain::message::{
    DEAD_LETTER_ROUTING_KEY, DEFAULT_TOPICS, Delivery, Envelope, ExchangeKind, Message,
    MessageHeaders, Nack, QueueInfo, QueueOptions, now_ms, queue_name,
};
use crate::domain::ports::{BrokerChannel, ConnectorRef, Consumer, EventPublisher};
use crate::error::{BrokerError, PaymentError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Tried in order on every connection round.
    pub endpoints: Vec<String>,
    /// Topic exchange for domain events.
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub topics: Vec<String>,
    /// TTL on every topic queue. Expired messages are dead-lettered.
    pub message_ttl: Option<Duration>,
    /// Ready messages a topic queue holds before publishes are refused.
    pub max_queue_length: Option<usize>,
    pub connect_retries: u32,
    pub connect_base_delay: Duration,
    pub prefetch: u16,
    /// Requeues a failing delivery gets before it is dead-lettered.
    pub max_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["memory://payflow".to_string()],
            exchange: "payment_events".to_string(),
            dead_letter_exchange: "payment_events_dlx".to_string(),
            dead_letter_queue: "dead_letter_queue".to_string(),
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            message_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            max_queue_length: None,
            connect_retries: 5,
            connect_base_delay: Duration::from_secs(1),
            prefetch: 10,
            max_retries: 3,
        }
    }
}

impl BrokerConfig {
    pub fn topic_queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: true,
            dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
            dead_letter_routing_key: Some(DEAD_LETTER_ROUTING_KEY.to_string()),
            message_ttl_ms: self.message_ttl.map(|ttl| ttl.as_millis() as u64),
            max_length: self.max_queue_length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    /// Overrides the events exchange.
    pub exchange: Option<String>,
    pub headers: BTreeMap<String, Value>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            correlation_id: None,
            message_id: None,
            exchange: None,
            headers: BTreeMap::new(),
        }
    }
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: Value) -> Self {
        self.headers.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Defaults to the broker's configured prefetch.
    pub prefetch: Option<u16>,
    /// Defaults to the broker's configured `max_retries`.
    pub max_retries: Option<u32>,
    /// Consume from this queue instead of `<topic>_queue`.
    pub queue: Option<String>,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivered message. An `Err` triggers requeue or dead-letter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError> {
        self(message).await
    }
}

/// Handle to a running consumer task.
pub struct Subscription {
    topic: String,
    queue: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stops consuming. Deliveries still unacked are requeued by the broker.
    pub async fn unsubscribe(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(topic = %self.topic, error = %e, "Subscription task ended abnormally");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub connected: bool,
    pub endpoint: Option<String>,
    pub reconnects: u32,
    pub exchange: String,
    pub topics: Vec<String>,
}

struct Connection {
    endpoint: String,
    channel: Arc<dyn BrokerChannel>,
}

pub struct MessageBroker {
    config: BrokerConfig,
    connector: ConnectorRef,
    connection: RwLock<Option<Connection>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    shutdown: Mutex<CancellationToken>,
    reconnects: AtomicU32,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig, connector: ConnectorRef) -> Self {
        Self {
            config,
            connector,
            connection: RwLock::new(None),
            reconnect_lock: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(CancellationToken::new()),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Connects using the configured retry budget.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(self.config.connect_retries, self.config.connect_base_delay)
            .await
    }

    /// Tries every endpoint per round, backing off exponentially between
    /// rounds. Fails with `BrokerError::Unavailable` once `retries` rounds
    /// are spent.
    pub async fn connect_with(&self, retries: u32, base_delay: Duration) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.establish(retries, base_delay).await
    }

    async fn establish(&self, retries: u32, base_delay: Duration) -> Result<()> {
        let rounds = retries.max(1);
        let backoff = RetryPolicy::new(rounds, base_delay, 2.0, false);
        let mut last_error = "no endpoints configured".to_string();

        for round in 1..=rounds {
            for endpoint in &self.config.endpoints {
                match self.open(endpoint).await {
                    Ok(channel) => {
                        let previous = self.connection.write().replace(Connection {
                            endpoint: endpoint.clone(),
                            channel,
                        });
                        if let Some(previous) = previous
                            && previous.channel.is_open()
                        {
                            let _ = previous.channel.close().await;
                        }
                        info!(endpoint = %endpoint, round, "Connected to broker");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, round, error = %e, "Broker connection attempt failed");
                        last_error = e.to_string();
                    }
                }
            }
            if round < rounds {
                tokio::time::sleep(backoff.delay_for(round)).await;
            }
        }

        error!(attempts = rounds, "Broker unavailable on every endpoint");
        Err(BrokerError::Unavailable {
            attempts: rounds,
            endpoints: self.config.endpoints.clone(),
            last_error,
        }
        .into())
    }

    async fn open(&self, endpoint: &str) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connector.connect(endpoint).await?;
        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Declares exchanges, the DLQ and one queue per topic. Safe to repeat.
    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let config = &self.config;
        channel
            .declare_exchange(&config.exchange, ExchangeKind::Topic, true)
            .await?;
        channel
            .declare_exchange(&config.dead_letter_exchange, ExchangeKind::Direct, true)
            .await?;
        channel
            .declare_queue(
                &config.dead_letter_queue,
                QueueOptions {
                    durable: true,
                    ..Default::default()
                },
            )
            .await?;
        channel
            .bind_queue(
                &config.dead_letter_queue,
                &config.dead_letter_exchange,
                DEAD_LETTER_ROUTING_KEY,
            )
            .await?;

        let options = config.topic_queue_options();
        for topic in &config.topics {
            let queue = queue_name(topic);
            channel.declare_queue(&queue, options.clone()).await?;
            channel.bind_queue(&queue, &config.exchange, topic).await?;
        }
        debug!(topics = config.topics.len(), "Broker topology declared");
        Ok(())
    }

    /// Re-establishes the connection unless another task already has.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.shutdown.lock().is_cancelled() {
            return Err(BrokerError::NotConnected.into());
        }
        let healthy = self
            .connection
            .read()
            .as_ref()
            .is_some_and(|c| c.channel.is_open());
        if healthy {
            return Ok(());
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        warn!("Broker channel lost, reconnecting");
        self.establish(self.config.connect_retries, self.config.connect_base_delay)
            .await
    }

    /// The current channel. Fails with `NotConnected` before `connect`.
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.channel.clone())
            .ok_or_else(|| BrokerError::NotConnected.into())
    }

    pub fn status(&self) -> BrokerStatus {
        let connection = self.connection.read();
        BrokerStatus {
            connected: connection.as_ref().is_some_and(|c| c.channel.is_open()),
            endpoint: connection.as_ref().map(|c| c.endpoint.clone()),
            reconnects: self.reconnects.load(Ordering::SeqCst),
            exchange: self.config.exchange.clone(),
            topics: self.config.topics.clone(),
        }
    }

    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        self.channel()?.queue_info(queue).await
    }

    /// Serializes `payload` and publishes it with `topic` as routing key.
    /// Returns the message id.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String> {
        let body = serde_json::to_string(payload)?;
        let message_id = options
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let envelope = Envelope {
            message_id: message_id.clone(),
            exchange: options
                .exchange
                .unwrap_or_else(|| self.config.exchange.clone()),
            routing_key: topic.to_string(),
            timestamp_ms: now_ms(),
            persistent: options.persistent,
            content_type: CONTENT_TYPE_JSON.to_string(),
            headers: MessageHeaders {
                retry_count: 0,
                correlation_id: options.correlation_id,
                original_routing_key: Some(topic.to_string()),
                reprocessed: None,
                reprocess_timestamp: None,
                extra: options.headers,
            },
            body,
            death: None,
        };
        self.publish_envelope(envelope).await?;
        debug!(topic, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    /// Publishes a prepared envelope. A closed channel triggers one reconnect
    /// and one retry; backpressure is returned to the caller.
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<()> {
        match self.channel()?.publish(envelope.clone()).await {
            Err(PaymentError::Broker(BrokerError::ChannelClosed)) => {
                self.reconnect().await?;
                self.channel()?.publish(envelope).await
            }
            other => other,
        }
    }

    /// Starts consuming `<topic>_queue` with `handler`.
    ///
    /// Failed deliveries are requeued with `x-retry-count` incremented until it
    /// reaches `max_retries`, then rejected into the dead-letter queue.
    pub async fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let queue = options.queue.unwrap_or_else(|| queue_name(topic));
        let prefetch = options.prefetch.unwrap_or(self.config.prefetch);
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);

        let channel = self.channel()?;
        let consumer = channel.consume(&queue, prefetch).await?;
        let token = self.shutdown.lock().child_token();
        info!(topic, queue = %queue, prefetch, max_retries, "Subscribed");

        let broker = Arc::clone(self);
        let task_token = token.clone();
        let task_queue = queue.clone();
        let task = tokio::spawn(async move {
            let mut current = Some((channel, consumer));
            loop {
                let (channel, mut consumer) = match current.take() {
                    Some(active) => active,
                    None => match broker.resubscribe(&task_queue, prefetch).await {
                        Ok(active) => active,
                        Err(e) => {
                            error!(queue = %task_queue, error = %e, "Resubscribe failed, consumer stopped");
                            return;
                        }
                    },
                };

                loop {
                    tokio::select! {
                        _ = task_token.cancelled() => {
                            let _ = channel.cancel(&consumer.tag).await;
                            return;
                        }
                        delivery = consumer.deliveries.recv() => match delivery {
                            Some(delivery) => {
                                tokio::spawn(process_delivery(
                                    channel.clone(),
                                    handler.clone(),
                                    delivery,
                                    max_retries,
                                ));
                            }
                            None => break,
                        },
                    }
                }

                if task_token.is_cancelled() {
                    return;
                }
                warn!(queue = %task_queue, "Delivery stream ended, resubscribing");
            }
        });

        Ok(Subscription {
            topic: topic.to_string(),
            queue,
            token,
            task,
        })
    }

    async fn resubscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<(Arc<dyn BrokerChannel>, Consumer)> {
        self.reconnect().await?;
        let channel = self.channel()?;
        let consumer = channel.consume(queue, prefetch).await?;
        Ok((channel, consumer))
    }

    /// Stops every subscription and closes the channel.
    pub async fn disconnect(&self) -> Result<()> {
        self.shutdown.lock().cancel();
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.channel.close().await?;
            info!(endpoint = %connection.endpoint, "Disconnected from broker");
        }
        Ok(())
    }
}

async fn process_delivery(
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn MessageHandler>,
    delivery: Delivery,
    max_retries: u32,
) {
    let tag = delivery.tag;
    let retry_count = delivery.envelope.headers.retry_count;
    let message = match Message::from_delivery(&delivery) {
        Ok(message) => message,
        Err(e) => {
            warn!(tag, error = %e, "Undecodable message, dead-lettering");
            settle(&channel, tag, Some(Nack::dead_letter())).await;
            return;
        }
    };
    let topic = message.topic.clone();
    let message_id = message.id.clone();

    match handler.handle(message).await {
        Ok(()) => settle(&channel, tag, None).await,
        Err(e) if retry_count < max_retries => {
            warn!(topic = %topic, message_id = %message_id, retry_count, error = %e, "Handler failed, requeueing");
            let mut headers = delivery.envelope.headers;
            headers.retry_count += 1;
            settle(&channel, tag, Some(Nack::requeue_with(headers))).await;
        }
        Err(e) => {
            error!(topic = %topic, message_id = %message_id, retry_count, error = %e, "Retries exhausted, dead-lettering");
            settle(&channel, tag, Some(Nack::dead_letter())).await;
        }
    }
}

/// Acks when `nack` is `None`. A failure here means the channel went away and
/// the broker has already requeued the delivery.
async fn settle(channel: &Arc<dyn BrokerChannel>, tag: u64, nack: Option<Nack>) {
    let result = match nack {
        None => channel.ack(tag).await,
        Some(nack) => channel.nack(tag, nack).await,
    };
    if let Err(e) = result {
        warn!(tag, error = %e, "Could not settle delivery");
    }
}

#[async_trait]
impl EventPublisher for MessageBroker {
    async fn publish_event(&self, topic: &str, payload: Value) -> Result<String> {
        self.publish(topic, &payload, PublishOptions::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::PAYMENT_INITIATED;
    use crate::infrastructure::in_memory_broker::InMemoryConnector;
    use serde_json::json;

    fn config(endpoints: &[&str]) -> BrokerConfig {
        BrokerConfig {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            connect_retries: 3,
            connect_base_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_declares_topology() {
        let connector = Arc::new(InMemoryConnector::new());
        let broker = MessageBroker::new(config(&["memory://topology"]), connector);
        broker.connect().await.unwrap();

        for topic in DEFAULT_TOPICS {
            assert!(broker.queue_info(&queue_name(topic)).await.is_ok());
        }
        assert!(broker.queue_info("dead_letter_queue").await.is_ok());
        assert!(broker.status().connected);

        // declaring again on reconnect must not conflict
        broker.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_over_to_next_endpoint() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.set_endpoint_down("memory://primary", true);
        let broker = MessageBroker::new(
            config(&["memory://primary", "memory://secondary"]),
            connector.clone(),
        );
        broker.connect().await.unwrap();
        assert_eq!(
            broker.status().endpoint.as_deref(),
            Some("memory://secondary")
        );
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhaustion_is_unavailable() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.set_endpoint_down("memory://a", true);
        connector.set_endpoint_down("memory://b", true);
        let broker = MessageBroker::new(config(&["memory://a", "memory://b"]), connector.clone());

        let started = tokio::time::Instant::now();
        let err = broker.connect().await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Broker(BrokerError::Unavailable { attempts: 3, .. })
        ));
        assert_eq!(connector.connect_attempts(), 6);
        // 100ms + 200ms between the three rounds
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let broker = MessageBroker::new(config(&["memory://x"]), Arc::new(InMemoryConnector::new()));
        let err = broker
            .publish(PAYMENT_INITIATED, &json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Broker(BrokerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_publish_sets_headers() {
        let connector = Arc::new(InMemoryConnector::new());
        let broker = MessageBroker::new(config(&["memory://headers"]), connector);
        broker.connect().await.unwrap();

        let id = broker
            .publish(
                PAYMENT_INITIATED,
                &json!({"payment_id": "p1"}),
                PublishOptions::default()
                    .with_correlation_id("req-9")
                    .with_header("x-tenant", json!("acme")),
            )
            .await
            .unwrap();

        let channel = broker.channel().unwrap();
        let delivery = channel
            .get(&queue_name(PAYMENT_INITIATED))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.message_id, id);
        assert!(delivery.envelope.persistent);
        let headers = &delivery.envelope.headers;
        assert_eq!(headers.retry_count, 0);
        assert_eq!(headers.correlation_id.as_deref(), Some("req-9"));
        assert_eq!(headers.original_routing_key.as_deref(), Some(PAYMENT_INITIATED));
        assert_eq!(headers.extra["x-tenant"], "acme");
    }

    #[tokio::test]
    async fn test_publish_recovers_from_channel_fault() {
        let connector = Arc::new(InMemoryConnector::new());
        let broker = MessageBroker::new(config(&["memory://fault"]), connector.clone());
        broker.connect().await.unwrap();
        connector.broker("memory://fault").unwrap().fault_channels();

        broker
            .publish(PAYMENT_INITIATED, &json!({"n": 1}), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.status().reconnects, 1);
        let info = broker.queue_info(&queue_name(PAYMENT_INITIATED)).await.unwrap();
        assert_eq!(info.message_count, 1);
    }

    #[tokio::test]
    async fn test_backpressure_reaches_caller() {
        let connector = Arc::new(InMemoryConnector::new());
        let broker = MessageBroker::new(
            BrokerConfig {
                max_queue_length: Some(1),
                ..config(&["memory://full"])
            },
            connector,
        );
        broker.connect().await.unwrap();
        broker
            .publish(PAYMENT_INITIATED, &json!({}), PublishOptions::default())
            .await
            .unwrap();
        let err = broker
            .publish(PAYMENT_INITIATED, &json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BROKER_BACKPRESSURE");
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel() {
        let connector = Arc::new(InMemoryConnector::new());
        let broker = MessageBroker::new(config(&["memory://bye"]), connector);
        broker.connect().await.unwrap();
        broker.disconnect().await.unwrap();
        assert!(!broker.status().connected);
        assert!(broker.channel().is_err());
    }
}
