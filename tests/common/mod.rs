#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use payflow::application::broker::{BrokerConfig, MessageBroker, PublishOptions};
use payflow::application::orchestrator::PaymentOrchestrator;
use payflow::application::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use payflow::application::resilience::gateway_policy;
use payflow::application::resilience::retry::RetryPolicy;
use payflow::domain::gateway::{GatewayResponse, PaymentIntent};
use payflow::domain::message::{Nack, queue_name};
use payflow::domain::payment::NewPayment;
use payflow::domain::ports::{ConnectorRef, EventPublisherRef, PaymentGateway};
use payflow::error::{GatewayError, Result};
use payflow::infrastructure::in_memory::InMemoryLedgerStore;
use payflow::infrastructure::in_memory_broker::InMemoryConnector;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A failure the scripted gateway returns instead of its normal answer.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Transient,
    Declined,
    DuplicateReference,
}

struct Intent {
    reference: String,
    status: String,
}

/// In-process gateway whose answers are scripted by the test.
///
/// Intents are indexed by idempotency key; lookups accept either the key or
/// the assigned reference.
pub struct ScriptedGateway {
    faults: Mutex<VecDeque<Fault>>,
    intents: Mutex<HashMap<String, Intent>>,
    create_status: Mutex<String>,
    create_delay: Mutex<Duration>,
    create_calls: AtomicU32,
    retrieve_calls: AtomicU32,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            faults: Mutex::new(VecDeque::new()),
            intents: Mutex::new(HashMap::new()),
            create_status: Mutex::new("succeeded".to_string()),
            create_delay: Mutex::new(Duration::ZERO),
            create_calls: AtomicU32::new(0),
            retrieve_calls: AtomicU32::new(0),
        }
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, faults: impl IntoIterator<Item = Fault>) {
        self.faults.lock().extend(faults);
    }

    pub fn set_create_status(&self, status: &str) {
        *self.create_status.lock() = status.to_string();
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Changes what the gateway holds for `key`, as a webhook race would.
    pub fn set_remote_status(&self, key: &str, status: &str) {
        self.intents
            .lock()
            .entry(key.to_string())
            .and_modify(|intent| intent.status = status.to_string())
            .or_insert_with(|| Intent {
                reference: reference_for(key),
                status: status.to_string(),
            });
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> u32 {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    fn set_status_by_reference(&self, reference: &str, status: &str) -> Result<GatewayResponse> {
        let mut intents = self.intents.lock();
        let intent = intents
            .values_mut()
            .find(|intent| intent.reference == reference)
            .ok_or_else(|| GatewayError::NotFound(reference.to_string()))?;
        intent.status = status.to_string();
        Ok(response(&intent.reference, &intent.status))
    }
}

fn reference_for(key: &str) -> String {
    format!("pi_{key}")
}

fn response(reference: &str, status: &str) -> GatewayResponse {
    GatewayResponse {
        reference: reference.to_string(),
        status: status.to_string(),
        raw: json!({ "id": reference, "status": status }),
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment_intent(
        &self,
        _intent: &PaymentIntent,
        idempotency_key: &str,
    ) -> Result<GatewayResponse> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::Transient) => {
                return Err(GatewayError::Transient("502 bad gateway".to_string()).into());
            }
            Some(Fault::Declined) => {
                return Err(GatewayError::Declined {
                    code: "card_declined".to_string(),
                    message: "insufficient funds".to_string(),
                }
                .into());
            }
            Some(Fault::DuplicateReference) => {
                return Err(GatewayError::DuplicateReference {
                    idempotency_key: idempotency_key.to_string(),
                }
                .into());
            }
            None => {}
        }

        let status = self.create_status.lock().clone();
        let reference = reference_for(idempotency_key);
        self.intents.lock().insert(
            idempotency_key.to_string(),
            Intent {
                reference: reference.clone(),
                status: status.clone(),
            },
        );
        Ok(response(&reference, &status))
    }

    async fn confirm_payment_intent(
        &self,
        reference: &str,
        _idempotency_key: &str,
    ) -> Result<GatewayResponse> {
        self.set_status_by_reference(reference, "succeeded")
    }

    async fn cancel_payment_intent(
        &self,
        reference: &str,
        _idempotency_key: &str,
    ) -> Result<GatewayResponse> {
        self.set_status_by_reference(reference, "canceled")
    }

    async fn retrieve_payment_intent(&self, reference: &str) -> Result<GatewayResponse> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let intents = self.intents.lock();
        intents
            .iter()
            .find(|(key, intent)| intent.reference == reference || key.as_str() == reference)
            .map(|(_, intent)| response(&intent.reference, &intent.status))
            .ok_or_else(|| GatewayError::NotFound(reference.to_string()).into())
    }
}

pub struct Fixture {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub gateway: Arc<ScriptedGateway>,
    pub ledger: InMemoryLedgerStore,
    pub breaker: Arc<CircuitBreaker>,
}

/// Orchestrator over an in-memory ledger and a scripted gateway.
///
/// Retries three times from a 100ms base; the breaker opens after
/// `failure_threshold` dependency failures and stays open for 30s.
pub fn orchestrator(events: EventPublisherRef, failure_threshold: u32) -> Fixture {
    let gateway = Arc::new(ScriptedGateway::new());
    let ledger = InMemoryLedgerStore::new();
    let breaker = Arc::new(CircuitBreaker::with_config(
        "payment_gateway",
        CircuitBreakerConfig {
            failure_threshold,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        },
    ));
    let policy = gateway_policy(
        RetryPolicy::new(3, Duration::from_millis(100), 2.0, false),
        breaker.clone(),
    );
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        Arc::new(ledger.clone()),
        gateway.clone(),
        events,
        policy,
    ));
    Fixture {
        orchestrator,
        gateway,
        ledger,
        breaker,
    }
}

pub fn payment(user: &str) -> NewPayment {
    NewPayment::new(user, "order-42", dec!(99.95), "eur").expect("valid payment")
}

/// A connected broker on its own named in-memory endpoint.
pub async fn memory_broker(name: &str) -> Arc<MessageBroker> {
    let config = BrokerConfig {
        endpoints: vec![format!("memory://{name}")],
        ..Default::default()
    };
    let connector: ConnectorRef = Arc::new(InMemoryConnector::new());
    let broker = Arc::new(MessageBroker::new(config, connector));
    broker.connect().await.expect("memory broker connects");
    broker
}

/// Publishes to `topic`, then rejects the delivery into the DLQ.
pub async fn dead_letter(broker: &MessageBroker, topic: &str, payload: Value) -> String {
    let id = broker
        .publish(topic, &payload, PublishOptions::default())
        .await
        .expect("publish");
    let channel = broker.channel().expect("channel");
    let delivery = channel
        .get(&queue_name(topic))
        .await
        .expect("get")
        .expect("message present");
    channel
        .nack(delivery.tag, Nack::dead_letter())
        .await
        .expect("nack");
    id
}
