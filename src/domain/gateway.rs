use super::payment::{Amount, Currency, PaymentStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the gateway is asked to charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub amount: Amount,
    pub currency: Currency,
    pub order_id: String,
    pub user_id: String,
}

/// A gateway reply, still carrying the gateway-native status string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub reference: String,
    pub status: String,
    #[serde(default)]
    pub raw: Value,
}

impl GatewayResponse {
    pub fn payment_status(&self) -> PaymentStatus {
        map_gateway_status(&self.status)
    }

    pub fn requires_confirmation(&self) -> bool {
        self.status == "requires_confirmation"
    }

    /// Response body as persisted on the payment record.
    pub fn to_record(&self) -> Value {
        serde_json::json!({
            "reference": self.reference,
            "status": self.status,
            "raw": self.raw,
        })
    }
}

/// Maps gateway-native statuses to the internal lifecycle.
///
/// Unrecognised statuses are treated as still pending, so reconciliation can
/// pick them up later.
pub fn map_gateway_status(native: &str) -> PaymentStatus {
    match native {
        "succeeded" | "paid" | "captured" => PaymentStatus::Succeeded,
        "requires_capture" | "authorized" => PaymentStatus::Authorized,
        "canceled" | "cancelled" | "voided" => PaymentStatus::Cancelled,
        "failed" | "payment_failed" | "declined" => PaymentStatus::Failed,
        "refunded" => PaymentStatus::Refunded,
        "partially_refunded" => PaymentStatus::PartiallyRefunded,
        "requires_payment_method" | "requires_confirmation" | "requires_action"
        | "processing" => PaymentStatus::Pending,
        other => {
            tracing::warn!(status = other, "unmapped gateway status, treating as pending");
            PaymentStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_gateway_status("succeeded"), PaymentStatus::Succeeded);
        assert_eq!(map_gateway_status("requires_capture"), PaymentStatus::Authorized);
        assert_eq!(map_gateway_status("canceled"), PaymentStatus::Cancelled);
        assert_eq!(map_gateway_status("processing"), PaymentStatus::Pending);
        assert_eq!(map_gateway_status("something_new"), PaymentStatus::Pending);
    }

    #[test]
    fn test_requires_confirmation() {
        let response = GatewayResponse {
            reference: "pi_1".to_string(),
            status: "requires_confirmation".to_string(),
            raw: Value::Null,
        };
        assert!(response.requires_confirmation());
        assert_eq!(response.payment_status(), PaymentStatus::Pending);
    }
}
