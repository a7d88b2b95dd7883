//! In-process AMQP-style broker.
//!
//! `memory://<name>` endpoints share one volatile broker per name inside the
//! process. `file://<path>` endpoints load their queues from a JSON snapshot on
//! first connect and write it back whenever a channel closes, which is how the
//! admin CLI sees the same DLQ across processes.

use crate::domain::message::{
    DeadLetterReason, Delivery, Envelope, ExchangeKind, MessageHeaders, Nack,
    QueueInfo, QueueOptions, now_ms,
};
use crate::domain::ports::{BrokerChannel, Connector, Consumer};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const MEMORY_SCHEME: &str = "memory://";
pub const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    envelope: Envelope,
    redelivered: bool,
    enqueued_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(Debug, Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<String>,
    next_consumer: usize,
}

struct ConsumerState {
    channel: u64,
    queue: String,
    prefetch: u16,
    in_flight: u16,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    channel: u64,
    queue: String,
    consumer: Option<String>,
    message: StoredMessage,
}

/// Durable part of the broker: durable queues and their persistent messages.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    exchanges: BTreeMap<String, ExchangeState>,
    queues: BTreeMap<String, QueueSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    options: QueueOptions,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
    unacked: BTreeMap<u64, Unacked>,
    open_channels: HashSet<u64>,
    next_tag: u64,
    next_channel: u64,
    next_consumer: u64,
}

/// Matches an AMQP topic pattern: `*` is one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|i| go(rest, &key[i..])),
            Some((&"*", rest)) => !key.is_empty() && go(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && go(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    go(&pattern, &key)
}

impl BrokerState {
    fn ensure_open(&self, channel: u64) -> Result<()> {
        if self.open_channels.contains(&channel) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed.into())
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        // the nameless default exchange routes straight to the queue of that name
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }
        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let mut targets: Vec<String> = ex
            .bindings
            .iter()
            .filter(|b| match ex.kind {
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Direct => b.routing_key == routing_key,
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    fn expire(&mut self) {
        let now = now_ms();
        let mut expired = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let Some(ttl) = queue.options.message_ttl_ms else {
                continue;
            };
            let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
            let mut i = 0;
            while i < queue.ready.len() {
                if now.saturating_sub(queue.ready[i].enqueued_ms) >= ttl {
                    if let Some(message) = queue.ready.remove(i) {
                        expired.push((name.clone(), message));
                    }
                } else {
                    i += 1;
                }
            }
        }
        for (queue, message) in expired {
            self.dead_letter(&queue, message, DeadLetterReason::Expired);
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage, reason: DeadLetterReason) {
        let (dlx, dlrk) = match self.queues.get(queue) {
            Some(q) => (
                q.options.dead_letter_exchange.clone(),
                q.options.dead_letter_routing_key.clone(),
            ),
            None => (None, None),
        };
        let Some(dlx) = dlx else {
            debug!(queue, %reason, "Queue has no dead-letter exchange, dropping message");
            return;
        };

        let envelope = message.envelope;
        message.envelope = envelope.into_dead_letter(queue, reason, &dlx, dlrk.as_deref());
        let routing_key = message.envelope.routing_key.clone();
        message.redelivered = false;
        message.enqueued_ms = now_ms();

        match self.route(&dlx, &routing_key) {
            Ok(targets) => {
                for target in targets {
                    if let Some(q) = self.queues.get_mut(&target) {
                        q.ready.push_back(message.clone());
                    }
                }
                debug!(queue, %reason, dead_letter_exchange = %dlx, "Message dead-lettered");
            }
            Err(e) => warn!(queue, error = %e, "Dead-letter routing failed, dropping message"),
        }
    }

    fn requeue(&mut self, unacked: Unacked, headers: Option<MessageHeaders>) {
        self.release_in_flight(unacked.consumer.as_deref());
        let mut message = unacked.message;
        if let Some(headers) = headers {
            message.envelope.headers = headers;
        }
        message.redelivered = true;
        message.enqueued_ms = now_ms();
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_back(message);
        }
    }

    fn release_in_flight(&mut self, consumer: Option<&str>) {
        if let Some(c) = consumer.and_then(|tag| self.consumers.get_mut(tag)) {
            c.in_flight = c.in_flight.saturating_sub(1);
        }
    }

    fn take_unacked(&mut self, channel: u64, tag: u64) -> Result<Unacked> {
        match self.unacked.get(&tag) {
            Some(u) if u.channel == channel => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(tag).into()),
        }
        self.unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::UnknownDeliveryTag(tag).into())
    }

    fn remove_consumer(&mut self, tag: &str) -> bool {
        let Some(consumer) = self.consumers.remove(tag) else {
            return false;
        };
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.consumers.retain(|t| t != tag);
        }
        for unacked in self.unacked.values_mut() {
            if unacked.consumer.as_deref() == Some(tag) {
                unacked.consumer = None;
            }
        }
        true
    }

    /// Drops the channel's consumers and requeues everything it left unacked.
    fn release_channel(&mut self, channel: u64) {
        let consumer_tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in consumer_tags {
            self.remove_consumer(&tag);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked, None);
            }
        }
    }

    fn dispatch(&mut self) {
        self.expire();
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch_queue(&name);
        }
    }

    fn dispatch_queue(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let n = queue.consumers.len();
            let mut chosen = None;
            for i in 0..n {
                let idx = (queue.next_consumer + i) % n;
                if let Some(c) = self.consumers.get(&queue.consumers[idx])
                    && (c.prefetch == 0 || c.in_flight < c.prefetch)
                {
                    chosen = Some((idx, queue.consumers[idx].clone()));
                    break;
                }
            }
            let Some((idx, consumer_tag)) = chosen else {
                return;
            };
            queue.next_consumer = (idx + 1) % n;
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let Some(consumer) = self.consumers.get_mut(&consumer_tag) else {
                queue.ready.push_front(message);
                return;
            };
            let delivery = Delivery {
                tag,
                queue: name.to_string(),
                redelivered: message.redelivered,
                envelope: message.envelope.clone(),
            };
            if consumer.sender.send(delivery).is_err() {
                // receiver dropped without cancelling
                queue.ready.push_front(message);
                self.remove_consumer(&consumer_tag);
                continue;
            }
            consumer.in_flight += 1;
            let channel = consumer.channel;
            self.unacked.insert(
                tag,
                Unacked {
                    channel,
                    queue: name.to_string(),
                    consumer: Some(consumer_tag),
                    message,
                },
            );
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        let mut queues = BTreeMap::new();
        for (name, queue) in &self.queues {
            if !queue.options.durable {
                continue;
            }
            let in_flight = self
                .unacked
                .values()
                .filter(|u| &u.queue == name)
                .map(|u| StoredMessage {
                    redelivered: true,
                    ..u.message.clone()
                });
            let messages = queue
                .ready
                .iter()
                .cloned()
                .chain(in_flight)
                .filter(|m| m.envelope.persistent)
                .collect();
            queues.insert(
                name.clone(),
                QueueSnapshot {
                    options: queue.options.clone(),
                    messages,
                },
            );
        }
        BrokerSnapshot {
            exchanges: self
                .exchanges
                .iter()
                .filter(|(_, e)| e.durable)
                .map(|(name, e)| (name.clone(), e.clone()))
                .collect(),
            queues,
        }
    }
}

/// Broker shared by every channel opened on it.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: BrokerSnapshot) -> Self {
        let mut state = BrokerState {
            exchanges: snapshot.exchanges.into_iter().collect(),
            ..Default::default()
        };
        for (name, queue) in snapshot.queues {
            state.queues.insert(
                name,
                QueueState {
                    options: queue.options,
                    ready: queue.messages.into(),
                    ..Default::default()
                },
            );
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Loads a snapshot file. A missing file yields an empty broker.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(BrokerError::Snapshot(format!("{}: {e}", path.display())).into()),
        };
        let snapshot: BrokerSnapshot = serde_json::from_str(&json)
            .map_err(|e| BrokerError::Snapshot(format!("{}: {e}", path.display())))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        self.state.lock().snapshot()
    }

    pub fn open_channel(self: &Arc<Self>, persist_to: Option<PathBuf>) -> InMemoryChannel {
        let mut state = self.state.lock();
        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id);
        InMemoryChannel {
            id,
            broker: Arc::clone(self),
            persist_to,
        }
    }

    /// Closes every open channel as if the connection had dropped. Returns how
    /// many were closed.
    pub fn fault_channels(&self) -> usize {
        let mut state = self.state.lock();
        let channels: Vec<u64> = state.open_channels.drain().collect();
        for channel in &channels {
            state.release_channel(*channel);
        }
        state.dispatch();
        warn!(channels = channels.len(), "Simulated channel fault");
        channels.len()
    }

    /// Ready messages in a queue, after expiring stale ones.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let mut state = self.state.lock();
        state.dispatch();
        state.queues.get(queue).map(|q| q.ready.len())
    }
}

pub struct InMemoryChannel {
    id: u64,
    broker: Arc<InMemoryBroker>,
    persist_to: Option<PathBuf>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Topology(format!(
                "exchange {name} already declared as {:?}",
                existing.kind
            ))
            .into()),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        match state.queues.get(name) {
            Some(existing) if existing.options != options => {
                return Err(BrokerError::Topology(format!(
                    "queue {name} already declared with different arguments"
                ))
                .into());
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        ..Default::default()
                    },
                );
            }
        }
        queue_info(&state, name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()).into());
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        state.expire();
        let targets = state.route(&envelope.exchange, &envelope.routing_key)?;
        for target in &targets {
            if let Some(q) = state.queues.get(target)
                && let Some(max) = q.options.max_length
                && q.ready.len() >= max
            {
                return Err(BrokerError::Backpressure {
                    queue: target.clone(),
                }
                .into());
            }
        }
        if targets.is_empty() {
            debug!(
                exchange = %envelope.exchange,
                routing_key = %envelope.routing_key,
                "Message unroutable, dropped"
            );
        }
        let now = now_ms();
        for target in targets {
            if let Some(q) = state.queues.get_mut(&target) {
                q.ready.push_back(StoredMessage {
                    envelope: envelope.clone(),
                    redelivered: false,
                    enqueued_ms: now,
                });
            }
        }
        state.dispatch();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Consumer> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()).into());
        }
        state.next_consumer += 1;
        let tag = format!("ctag-{}.{}", self.id, state.next_consumer);
        let (sender, deliveries) = mpsc::unbounded_channel();
        state.consumers.insert(
            tag.clone(),
            ConsumerState {
                channel: self.id,
                queue: queue.to_string(),
                prefetch,
                in_flight: 0,
                sender,
            },
        );
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(tag.clone());
        }
        state.dispatch();
        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        state.remove_consumer(consumer_tag);
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        state.expire();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::UnknownQueue(queue.to_string()).into());
        };
        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            redelivered: message.redelivered,
            envelope: message.envelope.clone(),
        };
        state.unacked.insert(
            tag,
            Unacked {
                channel: self.id,
                queue: queue.to_string(),
                consumer: None,
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let unacked = state.take_unacked(self.id, tag)?;
        state.release_in_flight(unacked.consumer.as_deref());
        state.dispatch();
        Ok(())
    }

    async fn nack(&self, tag: u64, nack: Nack) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let unacked = state.take_unacked(self.id, tag)?;
        if nack.requeue {
            state.requeue(unacked, nack.headers);
        } else {
            state.release_in_flight(unacked.consumer.as_deref());
            let mut message = unacked.message;
            if let Some(headers) = nack.headers {
                message.envelope.headers = headers;
            }
            state.dead_letter(&unacked.queue, message, DeadLetterReason::Rejected);
        }
        state.dispatch();
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let purged = q.ready.len();
        q.ready.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        state.dispatch();
        queue_info(&state, queue)
    }

    async fn close(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.broker.state.lock();
            if !state.open_channels.remove(&self.id) {
                return Ok(());
            }
            state.release_channel(self.id);
            state.dispatch();
            self.persist_to.as_ref().map(|_| state.snapshot())
        };
        if let (Some(path), Some(snapshot)) = (&self.persist_to, snapshot) {
            let json = serde_json::to_string_pretty(&snapshot)?;
            tokio::fs::write(path, json)
                .await
                .map_err(|e| BrokerError::Snapshot(format!("{}: {e}", path.display())))?;
            debug!(path = %path.display(), "Broker snapshot written");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().open_channels.contains(&self.id)
    }
}

fn queue_info(state: &BrokerState, name: &str) -> Result<QueueInfo> {
    let queue = state
        .queues
        .get(name)
        .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))?;
    let unacked = state.unacked.values().filter(|u| u.queue == name).count();
    Ok(QueueInfo {
        name: name.to_string(),
        message_count: u32::try_from(queue.ready.len()).unwrap_or(u32::MAX),
        consumer_count: u32::try_from(queue.consumers.len()).unwrap_or(u32::MAX),
        unacked_count: u32::try_from(unacked).unwrap_or(u32::MAX),
    })
}

/// Hands out channels on `memory://` and `file://` brokers.
#[derive(Default)]
pub struct InMemoryConnector {
    brokers: Mutex<HashMap<String, Arc<InMemoryBroker>>>,
    down: Mutex<HashSet<String>>,
    attempts: AtomicU32,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connections to `endpoint` fail until the flag is cleared.
    pub fn set_endpoint_down(&self, endpoint: &str, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self, endpoint: &str) -> Option<Arc<InMemoryBroker>> {
        self.brokers.lock().get(endpoint).cloned()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.down.lock().contains(endpoint) {
            return Err(BrokerError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                reason: "endpoint unreachable".to_string(),
            }
            .into());
        }

        if endpoint.starts_with(MEMORY_SCHEME) {
            let broker = self
                .brokers
                .lock()
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(InMemoryBroker::new()))
                .clone();
            return Ok(Arc::new(broker.open_channel(None)));
        }

        if let Some(path) = endpoint.strip_prefix(FILE_SCHEME) {
            let path = PathBuf::from(path);
            let existing = self.brokers.lock().get(endpoint).cloned();
            let broker = match existing {
                Some(broker) => broker,
                None => {
                    let loaded = Arc::new(InMemoryBroker::load(&path).await?);
                    self.brokers
                        .lock()
                        .entry(endpoint.to_string())
                        .or_insert(loaded)
                        .clone()
                }
            };
            return Ok(Arc::new(broker.open_channel(Some(path))));
        }

        Err(BrokerError::ConnectionRefused {
            endpoint: endpoint.to_string(),
            reason: "unsupported scheme, expected memory:// or file://".to_string(),
        }
        .into())
    }
}
