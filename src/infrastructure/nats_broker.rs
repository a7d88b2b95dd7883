//! NATS JetStream adapter for the broker port.
//!
//! Exchanges are subject prefixes: exchange `E` with routing key `K` publishes
//! to subject `E.K`, and the default exchange `""` publishes to `K` directly.
//! Every queue is a work-queue stream whose subjects are its bindings plus its
//! own name, read through one durable pull consumer that all processes share.
//! Dead-lettering republishes to the queue's dead-letter exchange and then
//! acks the original.
//!
//! JetStream drops messages older than `max_age` itself, so TTL expiry never
//! reaches the dead-letter queue on this transport.

use crate::domain::message::{
    DeadLetterReason, Delivery, Envelope, ExchangeKind, Nack, QueueInfo, QueueOptions,
};
use crate::domain::ports::{BrokerChannel, Connector, Consumer};
use crate::error::{BrokerError, PaymentError, Result};
use async_nats::connection::State;
use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::stream::{
    Config as StreamConfig, DiscardPolicy, RetentionPolicy, StorageType,
};
use async_nats::jetstream::{self, AckKind};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NATS_SCHEME: &str = "nats://";

/// Durable consumer name on every queue stream.
const DURABLE: &str = "payflow";
/// Unacked deliveries come back after this long.
const ACK_WAIT: Duration = Duration::from_secs(60);

/// Subject a message published to `exchange` with `routing_key` lands on.
pub fn subject(exchange: &str, routing_key: &str) -> String {
    if exchange.is_empty() {
        routing_key.to_string()
    } else {
        format!("{exchange}.{routing_key}")
    }
}

/// Translates an AMQP binding key into a subject filter.
///
/// `*` keeps its meaning. `#` becomes `>`, which needs at least one word and
/// is only valid as the last one.
pub fn binding_subject(exchange: &str, binding: &str) -> Result<String> {
    let words: Vec<&str> = binding.split('.').collect();
    let mut tokens = Vec::with_capacity(words.len() + 1);
    if !exchange.is_empty() {
        tokens.push(exchange);
    }
    for (i, word) in words.iter().enumerate() {
        match *word {
            "" => {
                return Err(
                    BrokerError::Topology(format!("empty word in binding {binding}")).into(),
                );
            }
            "#" if i + 1 == words.len() => tokens.push(">"),
            "#" => {
                return Err(BrokerError::Topology(format!(
                    "binding {binding}: '#' is only supported as the last word"
                ))
                .into());
            }
            word => tokens.push(word),
        }
    }
    Ok(tokens.join("."))
}

/// Stream names may not contain subject separators, wildcards or whitespace.
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn validate_exchange(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['.', '*', '>']) || name.contains(char::is_whitespace) {
        return Err(BrokerError::Topology(format!("{name:?} is not a valid exchange name")).into());
    }
    Ok(())
}

fn stream_config(queue: &str, options: &QueueOptions) -> StreamConfig {
    StreamConfig {
        name: stream_name(queue),
        subjects: vec![queue.to_string()],
        retention: RetentionPolicy::WorkQueue,
        storage: if options.durable {
            StorageType::File
        } else {
            StorageType::Memory
        },
        max_messages: options
            .max_length
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX)),
        discard: if options.max_length.is_some() {
            DiscardPolicy::New
        } else {
            DiscardPolicy::Old
        },
        max_age: options
            .message_ttl_ms
            .map_or(Duration::ZERO, Duration::from_millis),
        ..Default::default()
    }
}

fn transport(e: impl Display) -> PaymentError {
    BrokerError::Transport(e.to_string()).into()
}

struct Pending {
    queue: String,
    message: jetstream::Message,
    /// Held while a consumer delivery counts against its prefetch.
    _permit: Option<OwnedSemaphorePermit>,
}

struct ConsumerTask {
    queue: String,
    token: CancellationToken,
}

struct Shared {
    context: jetstream::Context,
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    queues: Mutex<HashMap<String, QueueOptions>>,
    pending: Mutex<HashMap<u64, Pending>>,
    consumers: Mutex<HashMap<String, ConsumerTask>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    /// Tracks `message` under a fresh delivery tag. Undecodable messages are
    /// terminated so they are never redelivered.
    async fn admit(
        &self,
        queue: &str,
        message: jetstream::Message,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Option<Delivery> {
        let envelope = match serde_json::from_slice::<Envelope>(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue, error = %e, "Terminating undecodable message");
                if let Err(e) = message.ack_with(AckKind::Term).await {
                    warn!(queue, error = %e, "Failed to terminate message");
                }
                return None;
            }
        };
        let redelivered = message.info().map(|i| i.delivered > 1).unwrap_or(false);
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.lock().insert(
            tag,
            Pending {
                queue: queue.to_string(),
                message,
                _permit: permit,
            },
        );
        Some(Delivery {
            tag,
            queue: queue.to_string(),
            redelivered,
            envelope,
        })
    }

    async fn requeue(&self, tag: u64) {
        let pending = self.pending.lock().remove(&tag);
        if let Some(pending) = pending
            && let Err(e) = pending.message.ack_with(AckKind::Nak(None)).await
        {
            warn!(tag, error = %e, "Failed to return message");
        }
    }
}

/// A connection to one NATS server with JetStream enabled.
pub struct NatsChannel {
    client: Client,
    shared: Arc<Shared>,
}

impl NatsChannel {
    pub fn new(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            shared: Arc::new(Shared {
                context,
                exchanges: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed.into())
        }
    }

    /// Queues are only reachable once declared on this channel.
    fn known_queue(&self, queue: &str) -> Result<QueueOptions> {
        self.shared
            .queues
            .lock()
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()).into())
    }

    async fn durable(&self, queue: &str) -> Result<PullConsumer> {
        self.known_queue(queue)?;
        let stream = self
            .shared
            .context
            .get_stream(stream_name(queue))
            .await
            .map_err(transport)?;
        stream
            .get_or_create_consumer(
                DURABLE,
                PullConsumerConfig {
                    durable_name: Some(DURABLE.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: ACK_WAIT,
                    ..Default::default()
                },
            )
            .await
            .map_err(transport)
    }

    fn take_pending(&self, tag: u64) -> Result<Pending> {
        self.shared
            .pending
            .lock()
            .remove(&tag)
            .ok_or_else(|| BrokerError::UnknownDeliveryTag(tag).into())
    }

    fn decode(pending: &Pending) -> Result<Envelope> {
        Ok(serde_json::from_slice(&pending.message.payload)?)
    }
}

#[async_trait]
impl BrokerChannel for NatsChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        self.ensure_open()?;
        validate_exchange(name)?;
        let mut exchanges = self.shared.exchanges.lock();
        match exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Topology(format!(
                "exchange {name} already declared as {existing:?}"
            ))
            .into()),
            Some(_) => Ok(()),
            None => {
                exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo> {
        self.ensure_open()?;
        let wanted = stream_config(name, &options);
        let mut stream = self
            .shared
            .context
            .get_or_create_stream(wanted.clone())
            .await
            .map_err(transport)?;
        let existing = &stream.info().await.map_err(transport)?.config;
        if existing.max_messages != wanted.max_messages || existing.max_age != wanted.max_age {
            return Err(BrokerError::Topology(format!(
                "queue {name} already declared with different arguments"
            ))
            .into());
        }
        self.shared.queues.lock().insert(name.to_string(), options);
        debug!(queue = name, stream = %wanted.name, "Queue stream ready");
        self.queue_info(name).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.known_queue(queue)?;
        if !self.shared.exchanges.lock().contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()).into());
        }
        let filter = binding_subject(exchange, routing_key)?;

        let mut stream = self
            .shared
            .context
            .get_stream(stream_name(queue))
            .await
            .map_err(transport)?;
        let mut config = stream.info().await.map_err(transport)?.config.clone();
        if config.subjects.contains(&filter) {
            return Ok(());
        }
        config.subjects.push(filter.clone());
        self.shared
            .context
            .update_stream(&config)
            .await
            .map_err(|e| BrokerError::Topology(format!("binding {queue} to {filter}: {e}")))?;
        debug!(queue, subject = %filter, "Queue bound");
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        if !envelope.exchange.is_empty()
            && !self.shared.exchanges.lock().contains_key(&envelope.exchange)
        {
            return Err(BrokerError::UnknownExchange(envelope.exchange.clone()).into());
        }
        let subject = subject(&envelope.exchange, &envelope.routing_key);
        let payload = serde_json::to_vec(&envelope)?;

        let acked = match self
            .shared
            .context
            .publish(subject.clone(), payload.into())
            .await
        {
            Ok(ack) => ack.await,
            Err(e) => Err(e),
        };
        match acked {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == PublishErrorKind::StreamNotFound => {
                debug!(subject = %subject, "Message unroutable, dropped");
                Ok(())
            }
            Err(e) if e.to_string().contains("maximum messages") => {
                Err(BrokerError::Backpressure { queue: subject }.into())
            }
            Err(e) => Err(transport(e)),
        }
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Consumer> {
        self.ensure_open()?;
        let consumer = self.durable(queue).await?;
        let mut messages = consumer.messages().await.map_err(transport)?;

        let tag = format!("nats-{}", uuid::Uuid::new_v4());
        let token = CancellationToken::new();
        self.shared.consumers.lock().insert(
            tag.clone(),
            ConsumerTask {
                queue: queue.to_string(),
                token: token.clone(),
            },
        );

        let (sender, deliveries) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let window = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let queue = queue.to_string();
        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = token.cancelled() => break,
                    permit = window.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = messages.next() => next,
                };
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(queue = %queue, error = %e, "Pull consumer error");
                        continue;
                    }
                    None => break,
                };
                let Some(delivery) = shared.admit(&queue, message, Some(permit)).await else {
                    continue;
                };
                let tag = delivery.tag;
                if sender.send(delivery).is_err() {
                    shared.requeue(tag).await;
                    break;
                }
            }
            shared.consumers.lock().remove(&consumer_tag);
            debug!(queue = %queue, consumer = %consumer_tag, "Pull consumer stopped");
        });

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(task) = self.shared.consumers.lock().remove(consumer_tag) {
            task.token.cancel();
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        let consumer = self.durable(queue).await?;
        loop {
            let mut batch = consumer
                .fetch()
                .max_messages(1)
                .messages()
                .await
                .map_err(transport)?;
            let Some(next) = batch.next().await else {
                return Ok(None);
            };
            let message = next.map_err(transport)?;
            if let Some(delivery) = self.shared.admit(queue, message, None).await {
                return Ok(Some(delivery));
            }
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.ensure_open()?;
        let pending = self.take_pending(tag)?;
        pending.message.ack().await.map_err(transport)
    }

    async fn nack(&self, tag: u64, nack: Nack) -> Result<()> {
        self.ensure_open()?;
        let pending = self.take_pending(tag)?;

        if nack.requeue {
            let Some(headers) = nack.headers else {
                return pending
                    .message
                    .ack_with(AckKind::Nak(None))
                    .await
                    .map_err(transport);
            };
            // headers travel in the payload, so a changed copy replaces it
            let mut envelope = Self::decode(&pending)?;
            envelope.headers = headers;
            let payload = serde_json::to_vec(&envelope)?;
            self.shared
                .context
                .publish(pending.message.subject.to_string(), payload.into())
                .await
                .map_err(transport)?
                .await
                .map_err(transport)?;
            return pending.message.ack().await.map_err(transport);
        }

        let options = self.known_queue(&pending.queue)?;
        let Some(exchange) = options.dead_letter_exchange else {
            debug!(queue = %pending.queue, "Queue has no dead-letter exchange, dropping message");
            return pending
                .message
                .ack_with(AckKind::Term)
                .await
                .map_err(transport);
        };
        let mut envelope = Self::decode(&pending)?;
        if let Some(headers) = nack.headers {
            envelope.headers = headers;
        }
        let dead = envelope.into_dead_letter(
            &pending.queue,
            DeadLetterReason::Rejected,
            &exchange,
            options.dead_letter_routing_key.as_deref(),
        );
        self.publish(dead).await?;
        debug!(queue = %pending.queue, dead_letter_exchange = %exchange, "Message dead-lettered");
        pending.message.ack().await.map_err(transport)
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        self.known_queue(queue)?;
        let stream = self
            .shared
            .context
            .get_stream(stream_name(queue))
            .await
            .map_err(transport)?;
        let response = stream.purge().await.map_err(transport)?;
        Ok(u32::try_from(response.purged).unwrap_or(u32::MAX))
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        self.ensure_open()?;
        let mut stream = self
            .shared
            .context
            .get_stream(stream_name(queue))
            .await
            .map_err(transport)?;
        let stored = stream.info().await.map_err(transport)?.state.messages;
        let mut consumer = self.durable(queue).await?;
        let info = consumer.info().await.map_err(transport)?;
        let unacked = u64::try_from(info.num_ack_pending).unwrap_or(u64::MAX);
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: u32::try_from(stored.saturating_sub(unacked)).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(info.num_waiting).unwrap_or(u32::MAX),
            unacked_count: u32::try_from(unacked).unwrap_or(u32::MAX),
        })
    }

    /// Stops every consumer and hands unacked messages back to the server.
    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let consumers: Vec<ConsumerTask> = self
            .shared
            .consumers
            .lock()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in consumers {
            debug!(queue = %task.queue, "Cancelling pull consumer");
            task.token.cancel();
        }
        let tags: Vec<u64> = self.shared.pending.lock().keys().copied().collect();
        for tag in tags {
            self.shared.requeue(tag).await;
        }
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }
}

/// Opens JetStream channels on `nats://` endpoints.
pub struct NatsConnector {
    connect_timeout: Duration,
}

impl Default for NatsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerChannel>> {
        if !endpoint.starts_with(NATS_SCHEME) {
            return Err(BrokerError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                reason: "unsupported scheme, expected nats://".to_string(),
            }
            .into());
        }
        let options = ConnectOptions::new()
            .name("payflow")
            .connection_timeout(self.connect_timeout);
        let client = async_nats::connect_with_options(endpoint, options)
            .await
            .map_err(|e| BrokerError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        info!(endpoint, "Connected to NATS JetStream");
        Ok(Arc::new(NatsChannel::new(client)))
    }
}
