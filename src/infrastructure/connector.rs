use super::in_memory_broker::{FILE_SCHEME, InMemoryConnector, MEMORY_SCHEME};
use super::nats_broker::{NATS_SCHEME, NatsConnector};
use crate::domain::ports::{BrokerChannel, Connector};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Picks the adapter for each endpoint by its URL scheme, so one endpoint
/// list can fail over between transports.
pub struct EndpointConnector {
    memory: Arc<InMemoryConnector>,
    nats: NatsConnector,
}

impl Default for EndpointConnector {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryConnector::new()), NatsConnector::default())
    }
}

impl EndpointConnector {
    pub fn new(memory: Arc<InMemoryConnector>, nats: NatsConnector) -> Self {
        Self { memory, nats }
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerChannel>> {
        if endpoint.starts_with(NATS_SCHEME) {
            self.nats.connect(endpoint).await
        } else if endpoint.starts_with(MEMORY_SCHEME) || endpoint.starts_with(FILE_SCHEME) {
            self.memory.connect(endpoint).await
        } else {
            Err(BrokerError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                reason: format!(
                    "unsupported scheme, expected {NATS_SCHEME}, {MEMORY_SCHEME} or {FILE_SCHEME}"
                ),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::broker::{BrokerConfig, MessageBroker};
    use crate::error::PaymentError;
    use std::time::Duration;

    fn connector(memory: Arc<InMemoryConnector>) -> EndpointConnector {
        EndpointConnector::new(memory, NatsConnector::new(Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn test_memory_endpoints_reach_the_in_process_broker() {
        let memory = Arc::new(InMemoryConnector::new());
        let channel = connector(memory.clone())
            .connect("memory://routing")
            .await
            .unwrap();
        assert!(channel.is_open());
        assert_eq!(memory.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_refused() {
        let memory = Arc::new(InMemoryConnector::new());
        let err = connector(memory.clone())
            .connect("amqp://localhost:5672")
            .await
            .err()
            .unwrap();
        let PaymentError::Broker(BrokerError::ConnectionRefused { reason, .. }) = err else {
            panic!("expected a refused connection");
        };
        assert!(reason.contains(NATS_SCHEME));
        assert_eq!(memory.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_nats_fails_over_to_memory() {
        let memory = Arc::new(InMemoryConnector::new());
        let config = BrokerConfig {
            endpoints: vec![
                "nats://127.0.0.1:1".to_string(),
                "memory://failover".to_string(),
            ],
            connect_retries: 1,
            connect_base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let broker = MessageBroker::new(config, Arc::new(connector(memory.clone())));
        broker.connect().await.unwrap();

        let status = broker.status();
        assert!(status.connected);
        assert_eq!(status.endpoint.as_deref(), Some("memory://failover"));
        assert_eq!(memory.connect_attempts(), 1);
    }
}
