use crate::error::{LedgerError, PaymentError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Represents a positive monetary amount for a payment.
///
/// Wraps `rust_decimal::Decimal` so that zero or negative charges cannot be
/// constructed.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// ISO 4217 currency code, stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, PaymentError> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(PaymentError::ValidationError(format!(
                "Invalid currency code '{code}'"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Succeeded,
    Failed,
    Refunded,
    PartiallyRefunded,
    Cancelled,
}

impl PaymentStatus {
    /// PENDING and FAILED are the only states a client retry may act on.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Failed)
    }

    /// Closed states are replayed unchanged without touching the gateway.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded
                | PaymentStatus::Refunded
                | PaymentStatus::Cancelled
                | PaymentStatus::PartiallyRefunded
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded | PaymentStatus::Authorized)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Authorized | Succeeded | Failed | Cancelled),
            // reconciliation may discover the gateway went on to succeed
            Failed => matches!(next, Authorized | Succeeded | Cancelled),
            Authorized => matches!(next, Succeeded | Failed | Cancelled),
            Succeeded => matches!(next, Refunded | PartiallyRefunded),
            PartiallyRefunded => matches!(next, Refunded),
            Refunded | Cancelled => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Authorized => "AUTHORIZED",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
            PaymentStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Caller input for a new payment. Validated before it reaches the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: String,
    pub order_id: String,
    pub amount: Amount,
    pub currency: Currency,
}

impl NewPayment {
    pub fn new(
        user_id: impl Into<String>,
        order_id: impl Into<String>,
        amount: Decimal,
        currency: &str,
    ) -> Result<Self, PaymentError> {
        let user_id = user_id.into();
        let order_id = order_id.into();
        if user_id.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "user_id must not be empty".to_string(),
            ));
        }
        if order_id.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "order_id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            user_id,
            order_id,
            amount: Amount::new(amount)?,
            currency: Currency::new(currency)?,
        })
    }
}

/// A payment as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub idempotency_key: String,
    pub user_id: String,
    pub order_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub status: PaymentStatus,
    /// Reference assigned by the gateway, once it has seen the payment.
    pub gateway_reference: Option<String>,
    /// Last raw gateway response, or the error payload for failures.
    pub gateway_response: Option<Value>,
    /// Sum of refunds applied against a succeeded payment.
    #[serde(default)]
    pub refunded_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRequest {
    pub fn pending(idempotency_key: impl Into<String>, request: NewPayment) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            user_id: request.user_id,
            order_id: request.order_id,
            amount: request.amount,
            currency: request.currency,
            status: PaymentStatus::Pending,
            gateway_reference: None,
            gateway_response: None,
            refunded_amount: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reference used to query the gateway. Falls back to the idempotency key,
    /// which the gateway indexes too.
    pub fn gateway_lookup_reference(&self) -> &str {
        self.gateway_reference
            .as_deref()
            .unwrap_or(&self.idempotency_key)
    }

    pub fn remaining_refundable(&self) -> Decimal {
        self.amount.value() - self.refunded_amount
    }

    /// First history entry, written together with the record.
    pub fn created_entry(&self) -> PaymentHistoryEntry {
        PaymentHistoryEntry {
            payment_id: self.id,
            status: self.status,
            note: "created".to_string(),
            at: self.created_at,
        }
    }

    /// Applies `update` in place and returns the history entry to record.
    ///
    /// Gateway fields are only overwritten when the update carries them.
    pub fn apply(&mut self, update: StatusUpdate) -> Result<PaymentHistoryEntry, PaymentError> {
        if !self.status.can_transition_to(update.status) {
            return Err(LedgerError::InvalidTransition {
                from: self.status.to_string(),
                to: update.status.to_string(),
            }
            .into());
        }
        let now = Utc::now();
        self.status = update.status;
        if let Some(reference) = update.gateway_reference {
            self.gateway_reference = Some(reference);
        }
        if let Some(response) = update.gateway_response {
            self.gateway_response = Some(response);
        }
        if let Some(refunded) = update.refunded_amount {
            self.refunded_amount = refunded;
        }
        self.updated_at = now;
        Ok(PaymentHistoryEntry {
            payment_id: self.id,
            status: update.status,
            note: update.note,
            at: now,
        })
    }
}

/// A status change applied to a stored payment.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: PaymentStatus,
    pub gateway_reference: Option<String>,
    pub gateway_response: Option<Value>,
    pub refunded_amount: Option<Decimal>,
    pub note: String,
}

impl StatusUpdate {
    pub fn new(status: PaymentStatus, note: impl Into<String>) -> Self {
        Self {
            status,
            gateway_reference: None,
            gateway_response: None,
            refunded_amount: None,
            note: note.into(),
        }
    }

    pub fn with_gateway(mut self, reference: Option<String>, response: Value) -> Self {
        self.gateway_reference = reference;
        self.gateway_response = Some(response);
        self
    }

    pub fn with_refunded_amount(mut self, refunded: Decimal) -> Self {
        self.refunded_amount = Some(refunded);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentHistoryEntry {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub note: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PaymentError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[test]
    fn test_currency_normalised_to_uppercase() {
        assert_eq!(Currency::new("eur").unwrap().as_str(), "EUR");
        assert!(Currency::new("EURO").is_err());
        assert!(Currency::new("E1R").is_err());
    }

    #[test]
    fn test_new_payment_rejects_blank_user() {
        assert!(matches!(
            NewPayment::new(" ", "order-1", dec!(10), "USD"),
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[test]
    fn test_state_machine() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Authorized));
        assert!(Pending.can_transition_to(Succeeded));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Succeeded.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));
        assert!(Failed.can_transition_to(Succeeded));

        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Refunded.can_transition_to(Succeeded));
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(PaymentStatus::Pending.is_retry_eligible());
        assert!(PaymentStatus::Failed.is_retry_eligible());
        assert!(!PaymentStatus::Authorized.is_retry_eligible());
        assert!(!PaymentStatus::Authorized.is_closed());
        assert!(PaymentStatus::PartiallyRefunded.is_closed());
    }

    #[test]
    fn test_payment_request_serializes_status_in_wire_case() {
        let request = NewPayment::new("u1", "o1", dec!(12.50), "usd").unwrap();
        let payment = PaymentRequest::pending("k1", request);
        let json = serde_json::to_value(&payment).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["currency"], "USD");
        assert_eq!(payment.gateway_lookup_reference(), "k1");
    }

    #[test]
    fn test_apply_refuses_illegal_transition() {
        let request = NewPayment::new("u1", "o1", dec!(20), "EUR").unwrap();
        let mut payment = PaymentRequest::pending("k2", request);
        payment
            .apply(StatusUpdate::new(PaymentStatus::Succeeded, "captured"))
            .unwrap();
        let entry = payment
            .apply(
                StatusUpdate::new(PaymentStatus::PartiallyRefunded, "refund")
                    .with_refunded_amount(dec!(5)),
            )
            .unwrap();
        assert_eq!(entry.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(payment.remaining_refundable(), dec!(15));

        let err = payment
            .apply(StatusUpdate::new(PaymentStatus::Pending, "rewind"))
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Ledger(LedgerError::InvalidTransition { .. })
        ));
    }
}
