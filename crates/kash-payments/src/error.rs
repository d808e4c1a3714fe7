//! Payment Error Types

use kash_core::StoreError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Token exchange with the provider failed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Collection request creation failed
    #[error("Payment request error: {0}")]
    PaymentRequest(String),

    /// Collection status query failed
    #[error("Payment status error: {0}")]
    PaymentStatus(String),

    /// Unknown payment, plan or request id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Plan, subscription or license step failed after the payment was settled
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Caller does not own the resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Authentication(_)
            | PaymentError::PaymentRequest(_)
            | PaymentError::PaymentStatus(_) => true,
            PaymentError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::Authentication(_) => "PROVIDER_AUTH_FAILED",
            PaymentError::PaymentRequest(_) => "PAYMENT_REQUEST_FAILED",
            PaymentError::PaymentStatus(_) => "PAYMENT_STATUS_FAILED",
            PaymentError::NotFound(_) => "NOT_FOUND",
            PaymentError::Provisioning(_) => "PROVISIONING_FAILED",
            PaymentError::Forbidden(_) => "FORBIDDEN",
            PaymentError::WebhookSignature(_) => "INVALID_SIGNATURE",
            PaymentError::WebhookParse(_) => "INVALID_PAYLOAD",
            PaymentError::Config(_) => "PAYMENTS_DISABLED",
            PaymentError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            PaymentError::Authentication(_) | PaymentError::PaymentRequest(_) => {
                "The payment service could not start your payment. Please try again."
            }
            PaymentError::PaymentStatus(_) => {
                "We could not check your payment status. Please try again in a moment."
            }
            PaymentError::NotFound(_) => "Payment not found.",
            PaymentError::Forbidden(_) => "You do not have access to this payment.",
            PaymentError::Config(_) => "Payments are not available right now.",
            _ => "An error occurred processing your request.",
        }
    }
}

#[cfg(feature = "axum-handlers")]
mod response {
    use axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    };

    use super::PaymentError;

    impl PaymentError {
        pub fn status_code(&self) -> StatusCode {
            match self {
                PaymentError::Authentication(_)
                | PaymentError::PaymentRequest(_)
                | PaymentError::PaymentStatus(_) => StatusCode::BAD_GATEWAY,
                PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
                PaymentError::Forbidden(_) => StatusCode::FORBIDDEN,
                PaymentError::WebhookSignature(_) | PaymentError::WebhookParse(_) => {
                    StatusCode::BAD_REQUEST
                }
                PaymentError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
                PaymentError::Provisioning(_) | PaymentError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
    }

    impl IntoResponse for PaymentError {
        fn into_response(self) -> Response {
            let status = self.status_code();
            if status.is_server_error() {
                tracing::error!(error = %self, "Payment request failed");
            } else {
                tracing::warn!(error = %self, "Payment request rejected");
            }
            let body = serde_json::json!({
                "error": self.user_message(),
                "code": self.code(),
            });
            (status, Json(body)).into_response()
        }
    }
}
