use crate::domain::payment::{PaymentHistoryEntry, PaymentRequest, StatusUpdate};
use crate::domain::ports::LedgerStore;
use crate::error::{LedgerError, PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for payment records, keyed by payment id.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family mapping idempotency keys to payment ids.
pub const CF_IDEMPOTENCY_KEYS: &str = "idempotency_keys";
/// Column Family for status history, keyed by payment id plus sequence.
pub const CF_PAYMENT_HISTORY: &str = "payment_history";

/// A persistent payment ledger using RocksDB.
///
/// Writes go through a `WriteBatch` while holding a process-wide write lock,
/// so the idempotency-key check and the insert are atomic for every handle
/// sharing this store. `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDbLedgerStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbLedgerStore {
    /// Opens or creates a ledger at `path`, creating missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_PAYMENTS, CF_IDEMPOTENCY_KEYS, CF_PAYMENT_HISTORY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::Ledger(LedgerError::Storage(format!(
                "column family {name} not found"
            )))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn history_len(&self, id: Uuid) -> Result<u32> {
        let prefix = id.as_bytes();
        let mut count = 0;
        let iter = self.db.iterator_cf(
            self.cf(CF_PAYMENT_HISTORY)?,
            IteratorMode::From(prefix, Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| PaymentError::Ledger(LedgerError::Storage(format!("encode: {e}"))))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PaymentError::Ledger(LedgerError::Storage(format!("decode: {e}"))))
}

fn history_key(id: Uuid, seq: u32) -> Vec<u8> {
    let mut key = id.as_bytes().to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

#[async_trait]
impl LedgerStore for RocksDbLedgerStore {
    async fn create_payment_with_history(&self, payment: PaymentRequest) -> Result<Uuid> {
        let _guard = self.write_lock.lock().await;
        let keys = self.cf(CF_IDEMPOTENCY_KEYS)?;
        if self
            .db
            .get_pinned_cf(keys, payment.idempotency_key.as_bytes())?
            .is_some()
        {
            return Err(LedgerError::Conflict {
                idempotency_key: payment.idempotency_key,
            }
            .into());
        }

        let id = payment.id;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PAYMENTS)?, id.as_bytes(), encode(&payment)?);
        batch.put_cf(keys, payment.idempotency_key.as_bytes(), id.as_bytes());
        batch.put_cf(
            self.cf(CF_PAYMENT_HISTORY)?,
            history_key(id, 0),
            encode(&payment.created_entry())?,
        );
        self.db.write(batch)?;
        Ok(id)
    }

    async fn get_payment_by_id(&self, id: Uuid) -> Result<Option<PaymentRequest>> {
        self.read(CF_PAYMENTS, id.as_bytes())
    }

    async fn get_payment_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentRequest>> {
        let Some(id) = self.db.get_cf(self.cf(CF_IDEMPOTENCY_KEYS)?, key.as_bytes())? else {
            return Ok(None);
        };
        self.read(CF_PAYMENTS, &id)
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<PaymentRequest> {
        let _guard = self.write_lock.lock().await;
        let mut payment: PaymentRequest = self
            .read(CF_PAYMENTS, id.as_bytes())?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        let entry = payment.apply(update)?;
        let seq = self.history_len(id)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PAYMENTS)?, id.as_bytes(), encode(&payment)?);
        batch.put_cf(
            self.cf(CF_PAYMENT_HISTORY)?,
            history_key(id, seq),
            encode(&entry)?,
        );
        self.db.write(batch)?;
        Ok(payment)
    }

    async fn history(&self, id: Uuid) -> Result<Vec<PaymentHistoryEntry>> {
        let prefix = id.as_bytes();
        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_PAYMENT_HISTORY)?,
            IteratorMode::From(prefix, Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }
}
