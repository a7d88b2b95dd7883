use crate::domain::payment::{PaymentHistoryEntry, PaymentRequest, StatusUpdate};
use crate::domain::ports::LedgerStore;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Ledger {
    payments: HashMap<Uuid, PaymentRequest>,
    by_key: HashMap<String, Uuid>,
    history: HashMap<Uuid, Vec<PaymentHistoryEntry>>,
}

/// A thread-safe in-memory payment ledger.
///
/// Uses `Arc<RwLock<..>>` for shared concurrent access. The idempotency-key
/// check and the insert happen under one write lock, so concurrent inserts for
/// the same key resolve to exactly one row.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    ledger: Arc<RwLock<Ledger>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.ledger.read().await.payments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_payment_with_history(&self, payment: PaymentRequest) -> Result<Uuid> {
        let mut ledger = self.ledger.write().await;
        if ledger.by_key.contains_key(&payment.idempotency_key) {
            return Err(LedgerError::Conflict {
                idempotency_key: payment.idempotency_key,
            }
            .into());
        }
        let id = payment.id;
        ledger.by_key.insert(payment.idempotency_key.clone(), id);
        ledger.history.insert(id, vec![payment.created_entry()]);
        ledger.payments.insert(id, payment);
        Ok(id)
    }

    async fn get_payment_by_id(&self, id: Uuid) -> Result<Option<PaymentRequest>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.payments.get(&id).cloned())
    }

    async fn get_payment_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentRequest>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .by_key
            .get(key)
            .and_then(|id| ledger.payments.get(id))
            .cloned())
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<PaymentRequest> {
        let mut ledger = self.ledger.write().await;
        let payment = ledger
            .payments
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        let entry = payment.apply(update)?;
        let updated = payment.clone();
        ledger.history.entry(id).or_default().push(entry);
        Ok(updated)
    }

    async fn history(&self, id: Uuid) -> Result<Vec<PaymentHistoryEntry>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.history.get(&id).cloned().unwrap_or_default())
    }
}
