use crate::application::resilience::circuit_breaker::CircuitOpenError;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

/// Failures reported by the external payment gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The gateway already holds an operation for this idempotency key.
    #[error("duplicate gateway reference for idempotency key {idempotency_key}")]
    DuplicateReference { idempotency_key: String },
    /// Terminal business failure such as a card decline. Never retried.
    #[error("payment declined ({code}): {message}")]
    Declined { code: String, message: String },
    /// Timeouts, 5xx responses, connection resets.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    #[error("gateway has no payment intent for reference {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn details(&self) -> Value {
        match self {
            GatewayError::DuplicateReference { idempotency_key } => {
                json!({ "kind": "duplicate_reference", "idempotency_key": idempotency_key })
            }
            GatewayError::Declined { code, message } => {
                json!({ "kind": "declined", "decline_code": code, "message": message })
            }
            GatewayError::Transient(message) => json!({ "kind": "transient", "message": message }),
            GatewayError::NotFound(reference) => {
                json!({ "kind": "not_found", "reference": reference })
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Every endpoint failed on every connection round.
    #[error("broker unavailable after {attempts} attempts across {endpoints:?}: {last_error}")]
    Unavailable {
        attempts: u32,
        endpoints: Vec<String>,
        last_error: String,
    },
    #[error("broker is not connected")]
    NotConnected,
    #[error("broker channel is closed")]
    ChannelClosed,
    /// The channel refused the write because its buffer is full.
    #[error("publish buffer full for queue {queue}")]
    Backpressure { queue: String },
    #[error("connection to {endpoint} refused: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },
    #[error("unknown exchange {0}")]
    UnknownExchange(String),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("topology mismatch: {0}")]
    Topology(String),
    #[error("broker snapshot error: {0}")]
    Snapshot(String),
    /// A request to a networked broker failed in transit.
    #[error("broker request failed: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Unique constraint on the idempotency key rejected an insert.
    #[error("payment with idempotency key {idempotency_key} already exists")]
    Conflict { idempotency_key: String },
    #[error("payment {0} not found")]
    NotFound(String),
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("ledger storage error: {0}")]
    Storage(String),
}

#[derive(Error, Debug, Diagnostic)]
pub enum PaymentError {
    #[error(transparent)]
    #[diagnostic(code(payflow::circuit_open))]
    CircuitOpen(#[from] CircuitOpenError),
    #[error("Gateway error: {0}")]
    #[diagnostic(code(payflow::gateway))]
    Gateway(#[from] GatewayError),
    #[error("Broker error: {0}")]
    #[diagnostic(code(payflow::broker))]
    Broker(#[from] BrokerError),
    #[error("Ledger error: {0}")]
    #[diagnostic(code(payflow::ledger))]
    Ledger(#[from] LedgerError),
    #[error("Validation error: {0}")]
    #[diagnostic(code(payflow::validation))]
    ValidationError(String),
    #[error("Confirmation required: {0}")]
    #[diagnostic(
        code(payflow::confirmation_required),
        help("re-run with the confirmation flag")
    )]
    ConfirmationRequired(String),
    #[error("Serialization error: {0}")]
    #[diagnostic(code(payflow::serialization))]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    #[diagnostic(code(payflow::csv))]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    #[diagnostic(code(payflow::io))]
    IoError(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    #[diagnostic(code(payflow::internal))]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(e: rocksdb::Error) -> Self {
        PaymentError::Ledger(LedgerError::Storage(e.into_string()))
    }
}

/// Stable error shape handed to callers outside the crate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl PaymentError {
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::CircuitOpen(_) => "CIRCUIT_OPEN",
            PaymentError::Gateway(GatewayError::DuplicateReference { .. }) => "DUPLICATE_REFERENCE",
            PaymentError::Gateway(GatewayError::Declined { .. }) => "PAYMENT_DECLINED",
            PaymentError::Gateway(GatewayError::Transient(_)) => "GATEWAY_UNAVAILABLE",
            PaymentError::Gateway(GatewayError::NotFound(_)) => "GATEWAY_NOT_FOUND",
            PaymentError::Broker(BrokerError::Unavailable { .. }) => "BROKER_UNAVAILABLE",
            PaymentError::Broker(BrokerError::Backpressure { .. }) => "BROKER_BACKPRESSURE",
            PaymentError::Broker(_) => "BROKER_ERROR",
            PaymentError::Ledger(LedgerError::Conflict { .. }) => "PERSISTENCE_CONFLICT",
            PaymentError::Ledger(LedgerError::NotFound(_)) => "NOT_FOUND",
            PaymentError::Ledger(LedgerError::InvalidTransition { .. }) => "INVALID_TRANSITION",
            PaymentError::Ledger(LedgerError::Storage(_)) => "PERSISTENCE_ERROR",
            PaymentError::ValidationError(_) => "VALIDATION_ERROR",
            PaymentError::ConfirmationRequired(_) => "CONFIRMATION_REQUIRED",
            PaymentError::Serialization(_) => "SERIALIZATION_ERROR",
            PaymentError::CsvError(_) | PaymentError::IoError(_) => "IO_ERROR",
            PaymentError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            PaymentError::CircuitOpen(e) => json!({
                "circuit": e.circuit,
                "state": e.state.to_string(),
                "retry_after_ms": e.retry_after.map(|d| d.as_millis() as u64),
            }),
            PaymentError::Gateway(e) => e.details(),
            PaymentError::Ledger(LedgerError::Conflict { idempotency_key }) => {
                json!({ "idempotency_key": idempotency_key })
            }
            _ => Value::Null,
        };
        ErrorEnvelope {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }

    /// Whether a retry policy may attempt the operation again.
    ///
    /// Circuit-open rejections are retryable: each one consumes an attempt and
    /// its backoff delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::CircuitOpen(_) => true,
            PaymentError::Gateway(GatewayError::Transient(_)) => true,
            PaymentError::Broker(
                BrokerError::ChannelClosed
                | BrokerError::NotConnected
                | BrokerError::Backpressure { .. }
                | BrokerError::Transport(_),
            ) => true,
            _ => false,
        }
    }

    /// Whether the error says the remote dependency itself is unhealthy.
    ///
    /// A decline or duplicate reference proves the gateway answered, so it must
    /// not push a breaker towards OPEN.
    pub fn counts_as_dependency_failure(&self) -> bool {
        match self {
            PaymentError::CircuitOpen(_) => false,
            PaymentError::Gateway(GatewayError::Transient(_)) => true,
            PaymentError::Gateway(_) => false,
            PaymentError::ValidationError(_) | PaymentError::ConfirmationRequired(_) => false,
            _ => true,
        }
    }

    pub fn is_duplicate_reference(&self) -> bool {
        matches!(
            self,
            PaymentError::Gateway(GatewayError::DuplicateReference { .. })
        )
    }
}
