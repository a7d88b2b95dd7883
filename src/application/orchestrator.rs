use crate::application::resilience::circuit_breaker::CircuitBreaker;
use crate::application::resilience::{CallMeta, GatewayPolicy, Policy};
use crate::domain::gateway::{GatewayResponse, PaymentIntent, map_gateway_status};
use crate::domain::message::{
    PAYMENT_CANCELLED, PAYMENT_COMPLETED, PAYMENT_FAILED, PAYMENT_INITIATED, REFUND_PROCESSED,
};
use crate::domain::payment::{
    NewPayment, PaymentHistoryEntry, PaymentRequest, PaymentStatus, StatusUpdate,
};
use crate::domain::ports::{EventPublisherRef, LedgerStoreRef, PaymentGatewayRef};
use crate::error::{GatewayError, LedgerError, PaymentError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of comparing the ledger with what the gateway reports.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSync {
    /// The gateway agrees with the local status.
    InSync(GatewayResponse),
    /// The gateway reports a different status that should be persisted.
    Corrected {
        from: PaymentStatus,
        to: PaymentStatus,
        response: GatewayResponse,
    },
    /// The gateway has never seen the payment.
    Unknown,
}

/// Drives payments through the gateway while keeping the ledger authoritative.
///
/// `PaymentOrchestrator` owns the ledger, the gateway client and the event
/// sink. Every gateway call goes through the retry-around-breaker policy, and
/// every status change goes through the ledger's transition check.
pub struct PaymentOrchestrator {
    ledger: LedgerStoreRef,
    gateway: PaymentGatewayRef,
    events: EventPublisherRef,
    policy: GatewayPolicy,
}

impl PaymentOrchestrator {
    /// Creates a new `PaymentOrchestrator`.
    ///
    /// # Arguments
    ///
    /// * `ledger` - The durable payment ledger.
    /// * `gateway` - Client for the external payment gateway.
    /// * `events` - Sink for domain events, usually the `MessageBroker`.
    /// * `policy` - Retry and circuit-breaker stack applied to gateway calls.
    pub fn new(
        ledger: LedgerStoreRef,
        gateway: PaymentGatewayRef,
        events: EventPublisherRef,
        policy: GatewayPolicy,
    ) -> Self {
        Self {
            ledger,
            gateway,
            events,
            policy,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.policy.inner()
    }

    /// Creates a payment, or replays the one already recorded for
    /// `idempotency_key`.
    ///
    /// With `retry` set, a PENDING or FAILED record is reconciled against the
    /// gateway instead of being charged again.
    pub async fn create_payment(
        &self,
        request: NewPayment,
        idempotency_key: &str,
        retry: bool,
    ) -> Result<PaymentRequest> {
        if idempotency_key.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "idempotency key must not be empty".to_string(),
            ));
        }

        if let Some(existing) = self
            .ledger
            .get_payment_by_idempotency_key(idempotency_key)
            .await?
        {
            return self.resume(existing, &request, retry).await;
        }

        let pending = PaymentRequest::pending(idempotency_key, request.clone());
        match self.ledger.create_payment_with_history(pending.clone()).await {
            Ok(id) => debug!(payment_id = %id, idempotency_key, "Payment recorded as pending"),
            Err(PaymentError::Ledger(LedgerError::Conflict { .. })) => {
                info!(idempotency_key, "Lost insert race, resuming existing payment");
                let existing = self.require(idempotency_key).await?;
                return self.resume(existing, &request, retry).await;
            }
            Err(e) => return Err(e),
        }

        self.emit(PAYMENT_INITIATED, &pending).await;
        self.charge(pending).await
    }

    /// Queries the gateway for `reference` and reports whether the local
    /// status needs correcting.
    pub async fn sync_payment_status_with_gateway(
        &self,
        reference: &str,
        current_status: PaymentStatus,
    ) -> Result<StatusSync> {
        let meta = CallMeta::operation("retrieve_payment_intent");
        match self
            .policy
            .invoke(&meta, || self.gateway.retrieve_payment_intent(reference))
            .await
        {
            Ok(response) => {
                let reported = response.payment_status();
                if reported == current_status {
                    Ok(StatusSync::InSync(response))
                } else {
                    info!(
                        reference,
                        local = %current_status,
                        gateway = %reported,
                        "Gateway status differs from ledger"
                    );
                    Ok(StatusSync::Corrected {
                        from: current_status,
                        to: reported,
                        response,
                    })
                }
            }
            Err(PaymentError::Gateway(GatewayError::NotFound(_))) => Ok(StatusSync::Unknown),
            Err(e) => Err(e),
        }
    }

    /// Cancels a payment that has not been captured yet.
    pub async fn cancel_payment(&self, idempotency_key: &str) -> Result<PaymentRequest> {
        let payment = self.require(idempotency_key).await?;
        if payment.status == PaymentStatus::Cancelled {
            return Ok(payment);
        }
        if !payment.status.can_transition_to(PaymentStatus::Cancelled) {
            return Err(LedgerError::InvalidTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Cancelled.to_string(),
            }
            .into());
        }

        let reference = payment.gateway_lookup_reference().to_string();
        let meta = CallMeta::operation("cancel_payment_intent").with_key(idempotency_key);
        let update = match self
            .policy
            .invoke(&meta, || {
                self.gateway.cancel_payment_intent(&reference, idempotency_key)
            })
            .await
        {
            Ok(response) => StatusUpdate::new(response.payment_status(), "cancelled at gateway")
                .with_gateway(Some(response.reference.clone()), response.to_record()),
            Err(PaymentError::Gateway(GatewayError::NotFound(_))) => {
                debug!(idempotency_key, "Gateway never saw payment, cancelling locally");
                StatusUpdate::new(PaymentStatus::Cancelled, "cancelled before reaching gateway")
            }
            Err(e) => return Err(e),
        };

        let updated = self.ledger.update_payment_status(payment.id, update).await?;
        self.emit_outcome(&updated).await;
        Ok(updated)
    }

    /// Records a refund reported by the gateway against a captured payment.
    pub async fn apply_refund(&self, idempotency_key: &str, amount: Decimal) -> Result<PaymentRequest> {
        if amount <= Decimal::ZERO {
            return Err(PaymentError::ValidationError(
                "refund amount must be positive".to_string(),
            ));
        }
        let payment = self.require(idempotency_key).await?;
        if !matches!(
            payment.status,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded
        ) {
            return Err(LedgerError::InvalidTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Refunded.to_string(),
            }
            .into());
        }
        if amount > payment.remaining_refundable() {
            return Err(PaymentError::ValidationError(format!(
                "refund of {amount} exceeds refundable {}",
                payment.remaining_refundable()
            )));
        }

        let refunded = payment.refunded_amount + amount;
        let status = if refunded == payment.amount.value() {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        let updated = self
            .ledger
            .update_payment_status(
                payment.id,
                StatusUpdate::new(status, format!("refunded {amount}")).with_refunded_amount(refunded),
            )
            .await?;

        let mut payload = event_payload(&updated);
        payload["refund_amount"] = json!(amount);
        self.publish(REFUND_PROCESSED, payload).await;
        Ok(updated)
    }

    /// Applies a status pushed by a gateway webhook.
    ///
    /// Illegal transitions are logged and ignored: the ledger keeps its state
    /// and the unchanged record is returned.
    pub async fn apply_gateway_update(
        &self,
        idempotency_key: &str,
        native_status: &str,
    ) -> Result<PaymentRequest> {
        let payment = self.require(idempotency_key).await?;
        let reported = map_gateway_status(native_status);
        if reported == payment.status {
            return Ok(payment);
        }
        if !payment.status.can_transition_to(reported) {
            warn!(
                idempotency_key,
                local = %payment.status,
                gateway = %reported,
                "Ignoring webhook with illegal transition"
            );
            return Ok(payment);
        }

        let updated = self
            .ledger
            .update_payment_status(
                payment.id,
                StatusUpdate::new(reported, format!("gateway webhook: {native_status}")),
            )
            .await?;
        self.emit_outcome(&updated).await;
        Ok(updated)
    }

    pub async fn get_payment(&self, idempotency_key: &str) -> Result<Option<PaymentRequest>> {
        self.ledger.get_payment_by_idempotency_key(idempotency_key).await
    }

    pub async fn history(&self, payment_id: Uuid) -> Result<Vec<PaymentHistoryEntry>> {
        self.ledger.history(payment_id).await
    }

    async fn require(&self, idempotency_key: &str) -> Result<PaymentRequest> {
        self.ledger
            .get_payment_by_idempotency_key(idempotency_key)
            .await?
            .ok_or_else(|| LedgerError::NotFound(idempotency_key.to_string()).into())
    }

    /// Handles a request whose idempotency key is already in the ledger.
    async fn resume(
        &self,
        existing: PaymentRequest,
        request: &NewPayment,
        retry: bool,
    ) -> Result<PaymentRequest> {
        if existing.user_id != request.user_id {
            return Err(PaymentError::ValidationError(
                "idempotency key belongs to another user".to_string(),
            ));
        }
        if existing.status.is_closed() {
            debug!(idempotency_key = %existing.idempotency_key, status = %existing.status, "Replaying closed payment");
            return Ok(existing);
        }
        if retry && existing.status.is_retry_eligible() {
            return self.reconcile(existing).await;
        }
        Ok(existing)
    }

    /// Brings `payment` in line with the gateway without charging twice.
    ///
    /// A fresh charge is only attempted for a FAILED record the gateway has
    /// no trace of. A PENDING record may still have its first charge in
    /// flight, so it is returned as stored.
    async fn reconcile(&self, payment: PaymentRequest) -> Result<PaymentRequest> {
        let sync = self
            .sync_payment_status_with_gateway(payment.gateway_lookup_reference(), payment.status)
            .await?;
        if sync == StatusSync::Unknown {
            if payment.status != PaymentStatus::Failed {
                debug!(idempotency_key = %payment.idempotency_key, status = %payment.status, "Gateway has no record yet, not charging");
                return Ok(payment);
            }
            info!(idempotency_key = %payment.idempotency_key, "Gateway has no record, charging");
            return self.charge(payment).await;
        }
        self.apply_sync(payment, sync).await
    }

    async fn apply_sync(&self, payment: PaymentRequest, sync: StatusSync) -> Result<PaymentRequest> {
        let StatusSync::Corrected { from, to, response } = sync else {
            return Ok(payment);
        };
        if !from.can_transition_to(to) {
            warn!(
                idempotency_key = %payment.idempotency_key,
                local = %from,
                gateway = %to,
                "Gateway status cannot be applied to ledger"
            );
            return Ok(payment);
        }
        let updated = self
            .ledger
            .update_payment_status(
                payment.id,
                StatusUpdate::new(to, "reconciled with gateway")
                    .with_gateway(Some(response.reference.clone()), response.to_record()),
            )
            .await?;
        self.emit_outcome(&updated).await;
        Ok(updated)
    }

    async fn charge(&self, payment: PaymentRequest) -> Result<PaymentRequest> {
        let key = payment.idempotency_key.as_str();
        let intent = PaymentIntent {
            amount: payment.amount,
            currency: payment.currency.clone(),
            order_id: payment.order_id.clone(),
            user_id: payment.user_id.clone(),
        };

        let outcome = async {
            let meta = CallMeta::operation("create_payment_intent").with_key(key);
            let response = self
                .policy
                .invoke(&meta, || self.gateway.create_payment_intent(&intent, key))
                .await?;
            if !response.requires_confirmation() {
                return Ok(response);
            }
            let reference = response.reference.as_str();
            let meta = CallMeta::operation("confirm_payment_intent").with_key(key);
            self.policy
                .invoke(&meta, || self.gateway.confirm_payment_intent(reference, key))
                .await
        }
        .await;

        match outcome {
            Ok(response) => {
                let updated = self
                    .ledger
                    .update_payment_status(
                        payment.id,
                        StatusUpdate::new(response.payment_status(), "gateway response")
                            .with_gateway(Some(response.reference.clone()), response.to_record()),
                    )
                    .await?;
                info!(payment_id = %updated.id, status = %updated.status, "Payment processed");
                self.emit_outcome(&updated).await;
                Ok(updated)
            }
            Err(e) if e.is_duplicate_reference() => {
                warn!(idempotency_key = key, "Gateway reports duplicate reference, reconciling");
                let current = self.require(key).await?;
                if current.status.is_closed() {
                    return Ok(current);
                }
                let sync = self
                    .sync_payment_status_with_gateway(
                        current.gateway_lookup_reference(),
                        current.status,
                    )
                    .await?;
                self.apply_sync(current, sync).await
            }
            Err(e) => {
                let envelope = e.envelope();
                warn!(idempotency_key = key, code = envelope.code, error = %e, "Payment failed");
                let failed = self
                    .ledger
                    .update_payment_status(
                        payment.id,
                        StatusUpdate::new(PaymentStatus::Failed, envelope.code)
                            .with_gateway(None, serde_json::to_value(&envelope)?),
                    )
                    .await?;
                self.emit(PAYMENT_FAILED, &failed).await;
                Err(e)
            }
        }
    }

    async fn emit_outcome(&self, payment: &PaymentRequest) {
        let topic = match payment.status {
            PaymentStatus::Succeeded => PAYMENT_COMPLETED,
            PaymentStatus::Failed => PAYMENT_FAILED,
            PaymentStatus::Cancelled => PAYMENT_CANCELLED,
            _ => return,
        };
        self.emit(topic, payment).await;
    }

    async fn emit(&self, topic: &str, payment: &PaymentRequest) {
        self.publish(topic, event_payload(payment)).await;
    }

    // The ledger is already written; a lost event must not fail the payment.
    async fn publish(&self, topic: &str, payload: Value) {
        if let Err(e) = self.events.publish_event(topic, payload).await {
            error!(topic, error = %e, "Failed to publish payment event");
        }
    }
}

fn event_payload(payment: &PaymentRequest) -> Value {
    json!({
        "payment_id": payment.id,
        "idempotency_key": payment.idempotency_key,
        "user_id": payment.user_id,
        "order_id": payment.order_id,
        "amount": payment.amount.value(),
        "currency": payment.currency.as_str(),
        "status": payment.status,
        "gateway_reference": payment.gateway_reference,
        "occurred_at": Utc::now(),
    })
}
