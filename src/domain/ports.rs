use super::gateway::{GatewayResponse, PaymentIntent};
use super::message::{Delivery, Envelope, ExchangeKind, Nack, QueueInfo, QueueOptions};
use super::payment::{PaymentHistoryEntry, PaymentRequest, StatusUpdate};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Durable record of payments, keyed by id and unique on idempotency key.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts a payment and its first history entry atomically.
    ///
    /// Fails with `LedgerError::Conflict` when the idempotency key is taken.
    async fn create_payment_with_history(&self, payment: PaymentRequest) -> Result<Uuid>;
    async fn get_payment_by_id(&self, id: Uuid) -> Result<Option<PaymentRequest>>;
    async fn get_payment_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentRequest>>;
    /// Applies a status change, refusing transitions the state machine forbids.
    async fn update_payment_status(&self, id: Uuid, update: StatusUpdate)
    -> Result<PaymentRequest>;
    async fn history(&self, id: Uuid) -> Result<Vec<PaymentHistoryEntry>>;
}

/// Client for the external payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        intent: &PaymentIntent,
        idempotency_key: &str,
    ) -> Result<GatewayResponse>;
    async fn confirm_payment_intent(
        &self,
        reference: &str,
        idempotency_key: &str,
    ) -> Result<GatewayResponse>;
    async fn cancel_payment_intent(
        &self,
        reference: &str,
        idempotency_key: &str,
    ) -> Result<GatewayResponse>;
    async fn retrieve_payment_intent(&self, reference: &str) -> Result<GatewayResponse>;
}

/// Sink for domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, topic: &str, payload: Value) -> Result<String>;
}

/// Stream of deliveries for one consumer. Closes when the channel does.
pub struct Consumer {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// An AMQP-style channel: topology, routing and acknowledgement.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;
    /// Routes an envelope. Fails with `BrokerError::Backpressure` when a
    /// target queue is full.
    async fn publish(&self, envelope: Envelope) -> Result<()>;
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Consumer>;
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;
    /// Pulls a single message without a consumer. It stays unacked until
    /// `ack` or `nack`.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;
    async fn ack(&self, tag: u64) -> Result<()>;
    async fn nack(&self, tag: u64, nack: Nack) -> Result<()>;
    async fn purge(&self, queue: &str) -> Result<u32>;
    async fn queue_info(&self, queue: &str) -> Result<QueueInfo>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerChannel>>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;
pub type ConnectorRef = Arc<dyn Connector>;
