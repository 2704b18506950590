//! Payment gateway boundary
//!
//! The runner only needs one capability from the card processor: charge a
//! stored billing key. Implementations must treat `order_id` as the
//! idempotency key of the charge.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Code recorded for failures that carry no provider error code
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";
pub const INVALID_RESPONSE_CODE: &str = "INVALID_RESPONSE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeRequest {
    #[serde(skip_serializing)]
    pub billing_key: String,
    pub customer_key: String,
    pub amount: i64,
    pub order_id: String,
    pub order_name: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    /// Provider's identifier for the captured payment
    pub payment_key: String,
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Structured rejection from the provider (declined card, expired key, ...)
    #[error("{code}: {message}")]
    Provider { code: String, message: String },

    /// The request may not have reached the provider, or the response was lost
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Known failures carry the provider's own code and message
    pub fn is_known(&self) -> bool {
        matches!(self, GatewayError::Provider { .. })
    }

    /// Whether resending the same request (same idempotency key) can help
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }

    pub fn code(&self) -> &str {
        match self {
            GatewayError::Provider { code, .. } => code,
            GatewayError::Transport(_) => UNKNOWN_ERROR_CODE,
            GatewayError::InvalidResponse(_) => INVALID_RESPONSE_CODE,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::Provider { message, .. } => message,
            GatewayError::Transport(message) | GatewayError::InvalidResponse(message) => message,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge_with_billing_key(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let declined = GatewayError::Provider {
            code: "REJECT_CARD_COMPANY".to_string(),
            message: "Card declined".to_string(),
        };
        assert!(declined.is_known());
        assert!(!declined.is_transient());
        assert_eq!(declined.code(), "REJECT_CARD_COMPANY");
        assert_eq!(declined.to_string(), "REJECT_CARD_COMPANY: Card declined");

        let timeout = GatewayError::Transport("operation timed out".to_string());
        assert!(!timeout.is_known());
        assert!(timeout.is_transient());
        assert_eq!(timeout.code(), UNKNOWN_ERROR_CODE);
        assert_eq!(timeout.message(), "operation timed out");

        let garbled = GatewayError::InvalidResponse("missing paymentKey".to_string());
        assert!(!garbled.is_transient());
        assert_eq!(garbled.code(), INVALID_RESPONSE_CODE);
    }
}
